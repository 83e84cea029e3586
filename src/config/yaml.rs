use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration; anything left
/// out falls back to the environment-derived value or the built-in
/// default.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 5000
///   tls:
///     enabled: true
///     cert_path: "/etc/callbridge/tls/cert.pem"
///     key_path: "/etc/callbridge/tls/key.pem"
///
/// security:
///   cors_allowed_origins: "https://dashboard.example.com"
///   rate_limit_requests_per_second: 60
///   rate_limit_burst_size: 10
///   max_websocket_connections: 1000
///   max_connections_per_ip: 100
///
/// relay:
///   attach_grace_ms: 3000
///   record_outbound_track: false
///
/// transcription:
///   url: "https://transcribe.example.com/v1/batch"
///   api_key: "your-api-key"
///   language: "fr-FR"
///   flush_bytes: 320000
///   flush_interval_ms: 10000
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub security: Option<SecurityYaml>,
    pub relay: Option<RelayYaml>,
    pub transcription: Option<TranscriptionYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Security configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    /// CORS allowed origins (comma-separated list or "*" for all)
    pub cors_allowed_origins: Option<String>,
    /// Maximum requests per second per IP address
    pub rate_limit_requests_per_second: Option<u32>,
    /// Maximum burst size for rate limiting
    pub rate_limit_burst_size: Option<u32>,
    /// Maximum concurrent WebSocket connections
    pub max_websocket_connections: Option<usize>,
    /// Maximum connections per IP address
    pub max_connections_per_ip: Option<usize>,
}

/// Relay behavior configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RelayYaml {
    /// How long a client attach waits for the provider's start event (ms)
    pub attach_grace_ms: Option<u64>,
    /// Whether the local party's own voice (outbound track) is also fed
    /// to transcription
    pub record_outbound_track: Option<bool>,
}

/// Transcription backend configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TranscriptionYaml {
    /// Backend endpoint; transcription is disabled when unset
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// Language hint passed through to the backend
    pub language: Option<String>,
    /// Flush when a call's buffer reaches this many PCM bytes
    pub flush_bytes: Option<usize>,
    /// Flush any non-empty buffer older than this (ms)
    pub flush_interval_ms: Option<u64>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &PathBuf) -> Result<Self, super::ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            super::ConfigError::Invalid(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| super::ConfigError::Invalid(format!("Failed to parse YAML config: {e}")))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 8080
  tls:
    enabled: true
    cert_path: "/tmp/cert.pem"
    key_path: "/tmp/key.pem"

security:
  cors_allowed_origins: "*"
  rate_limit_requests_per_second: 120
  max_websocket_connections: 500

relay:
  attach_grace_ms: 1500
  record_outbound_track: true

transcription:
  url: "https://transcribe.example.com/v1/batch"
  api_key: "key-123"
  language: "fr-FR"
  flush_bytes: 64000
  flush_interval_ms: 5000
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        let server = config.server.as_ref().unwrap();
        assert_eq!(server.host, Some("127.0.0.1".to_string()));
        assert_eq!(server.port, Some(8080));
        assert_eq!(server.tls.as_ref().unwrap().enabled, Some(true));

        let security = config.security.as_ref().unwrap();
        assert_eq!(security.cors_allowed_origins, Some("*".to_string()));
        assert_eq!(security.rate_limit_requests_per_second, Some(120));
        assert_eq!(security.max_websocket_connections, Some(500));

        let relay = config.relay.as_ref().unwrap();
        assert_eq!(relay.attach_grace_ms, Some(1500));
        assert_eq!(relay.record_outbound_track, Some(true));

        let transcription = config.transcription.as_ref().unwrap();
        assert_eq!(transcription.flush_bytes, Some(64000));
        assert_eq!(transcription.flush_interval_ms, Some(5000));
    }

    #[test]
    fn test_yaml_config_partial() {
        let yaml = r#"
server:
  port: 9000

relay:
  record_outbound_track: true
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        assert!(config.server.as_ref().unwrap().host.is_none());
        assert_eq!(config.server.as_ref().unwrap().port, Some(9000));
        assert!(config.security.is_none());
        assert!(config.transcription.is_none());
        assert_eq!(
            config.relay.as_ref().unwrap().record_outbound_track,
            Some(true)
        );
    }

    #[test]
    fn test_yaml_config_empty() {
        let config: YamlConfig = serde_yaml::from_str("").unwrap();

        assert!(config.server.is_none());
        assert!(config.security.is_none());
        assert!(config.relay.is_none());
        assert!(config.transcription.is_none());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        fs::write(&config_path, "server:\n  host: \"localhost\"\n  port: 3000\n").unwrap();

        let config = YamlConfig::from_file(&config_path).unwrap();

        assert_eq!(
            config.server.as_ref().unwrap().host,
            Some("localhost".to_string())
        );
        assert_eq!(config.server.as_ref().unwrap().port, Some(3000));
    }

    #[test]
    fn test_from_file_not_found() {
        let path = PathBuf::from("/nonexistent/config.yaml");
        let result = YamlConfig::from_file(&path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");

        fs::write(&config_path, "server: [unclosed").unwrap();

        let result = YamlConfig::from_file(&config_path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }
}
