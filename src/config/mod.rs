//! Configuration module for the Callbridge Gateway
//!
//! Server configuration is assembled from several sources with the
//! priority: YAML > ENV vars > .env values > defaults. The `.env` file is
//! loaded by `main` before any of this runs, so here the environment is
//! the single source below YAML.
//!
//! # Example
//! ```rust,no_run
//! use callbridge_gateway::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable fallback
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

mod yaml;

pub use yaml::YamlConfig;

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Server configuration
///
/// Contains everything needed to run the gateway: listener settings,
/// security limits, relay behavior and the transcription backend.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // Security configuration
    /// CORS allowed origins (comma-separated list or "*" for all)
    /// Default: None (CORS disabled, same-origin only)
    pub cors_allowed_origins: Option<String>,
    /// Maximum requests per second per IP address
    pub rate_limit_requests_per_second: u32,
    /// Maximum burst size for rate limiting
    pub rate_limit_burst_size: u32,
    /// Maximum concurrent WebSocket connections (None = unlimited)
    pub max_websocket_connections: Option<usize>,
    /// Maximum connections per IP address
    pub max_connections_per_ip: usize,

    // Relay behavior
    /// How long a client attach waits for the provider's start event
    pub attach_grace: Duration,
    /// Whether the local party's own voice (outbound track) is also fed
    /// to transcription. Most deployments only transcribe the remote
    /// party; this makes the choice explicit instead of hard-coding it.
    pub record_outbound_track: bool,

    // Transcription backend
    /// Backend endpoint; transcription is disabled when unset
    pub transcription_url: Option<String>,
    pub transcription_api_key: Option<String>,
    /// Language hint passed through to the backend
    pub transcription_language: Option<String>,
    /// Flush when a call's buffer reaches this many PCM bytes
    pub transcription_flush_bytes: usize,
    /// Flush any non-empty buffer older than this
    pub transcription_flush_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 5000,
            tls: None,
            cors_allowed_origins: None,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            max_websocket_connections: None,
            max_connections_per_ip: 100,
            attach_grace: Duration::from_millis(3000),
            record_outbound_track: false,
            transcription_url: None,
            transcription_api_key: None,
            transcription_language: None,
            transcription_flush_bytes: 320_000,
            transcription_flush_interval: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Build configuration from environment variables and defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ServerConfig::default();

        if let Some(host) = env_string("HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse::<u16>("PORT")? {
            config.port = port;
        }

        let cert_path = env_string("TLS_CERT_PATH");
        let key_path = env_string("TLS_KEY_PATH");
        config.tls = match (cert_path, key_path) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Invalid(
                    "TLS_CERT_PATH and TLS_KEY_PATH must both be set to enable TLS".to_string(),
                ));
            }
        };

        config.cors_allowed_origins = env_string("CORS_ALLOWED_ORIGINS");
        if let Some(rps) = env_parse::<u32>("RATE_LIMIT_REQUESTS_PER_SECOND")? {
            config.rate_limit_requests_per_second = rps;
        }
        if let Some(burst) = env_parse::<u32>("RATE_LIMIT_BURST_SIZE")? {
            config.rate_limit_burst_size = burst;
        }
        config.max_websocket_connections = env_parse::<usize>("MAX_WEBSOCKET_CONNECTIONS")?;
        if let Some(per_ip) = env_parse::<usize>("MAX_CONNECTIONS_PER_IP")? {
            config.max_connections_per_ip = per_ip;
        }

        if let Some(grace_ms) = env_parse::<u64>("ATTACH_GRACE_MS")? {
            config.attach_grace = Duration::from_millis(grace_ms);
        }
        if let Some(record) = env_parse::<bool>("RECORD_OUTBOUND_TRACK")? {
            config.record_outbound_track = record;
        }

        config.transcription_url = env_string("TRANSCRIPTION_URL");
        config.transcription_api_key = env_string("TRANSCRIPTION_API_KEY");
        config.transcription_language = env_string("TRANSCRIPTION_LANGUAGE");
        if let Some(bytes) = env_parse::<usize>("TRANSCRIPTION_FLUSH_BYTES")? {
            config.transcription_flush_bytes = bytes;
        }
        if let Some(interval_ms) = env_parse::<u64>("TRANSCRIPTION_FLUSH_INTERVAL_MS")? {
            config.transcription_flush_interval = Duration::from_millis(interval_ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, with environment variables
    /// filling any field the file leaves out.
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let yaml = YamlConfig::from_file(path)?;
        let mut config = ServerConfig::from_env()?;
        config.merge_yaml(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay YAML values onto this configuration.
    fn merge_yaml(&mut self, yaml: YamlConfig) -> Result<(), ConfigError> {
        if let Some(server) = yaml.server {
            if let Some(host) = server.host {
                self.host = host;
            }
            if let Some(port) = server.port {
                self.port = port;
            }
            if let Some(tls) = server.tls {
                if tls.enabled.unwrap_or(false) {
                    match (tls.cert_path, tls.key_path) {
                        (Some(cert), Some(key)) => {
                            self.tls = Some(TlsConfig {
                                cert_path: PathBuf::from(cert),
                                key_path: PathBuf::from(key),
                            });
                        }
                        _ => {
                            return Err(ConfigError::Invalid(
                                "tls.cert_path and tls.key_path are required when tls.enabled"
                                    .to_string(),
                            ));
                        }
                    }
                } else {
                    self.tls = None;
                }
            }
        }

        if let Some(security) = yaml.security {
            if let Some(origins) = security.cors_allowed_origins {
                self.cors_allowed_origins = Some(origins);
            }
            if let Some(rps) = security.rate_limit_requests_per_second {
                self.rate_limit_requests_per_second = rps;
            }
            if let Some(burst) = security.rate_limit_burst_size {
                self.rate_limit_burst_size = burst;
            }
            if let Some(max) = security.max_websocket_connections {
                self.max_websocket_connections = Some(max);
            }
            if let Some(per_ip) = security.max_connections_per_ip {
                self.max_connections_per_ip = per_ip;
            }
        }

        if let Some(relay) = yaml.relay {
            if let Some(grace_ms) = relay.attach_grace_ms {
                self.attach_grace = Duration::from_millis(grace_ms);
            }
            if let Some(record) = relay.record_outbound_track {
                self.record_outbound_track = record;
            }
        }

        if let Some(transcription) = yaml.transcription {
            if let Some(url) = transcription.url {
                self.transcription_url = Some(url);
            }
            if let Some(key) = transcription.api_key {
                self.transcription_api_key = Some(key);
            }
            if let Some(language) = transcription.language {
                self.transcription_language = Some(language);
            }
            if let Some(bytes) = transcription.flush_bytes {
                self.transcription_flush_bytes = bytes;
            }
            if let Some(interval_ms) = transcription.flush_interval_ms {
                self.transcription_flush_interval = Duration::from_millis(interval_ms);
            }
        }

        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.transcription_flush_bytes == 0 {
            return Err(ConfigError::Invalid(
                "transcription flush_bytes must be greater than zero".to_string(),
            ));
        }
        if self.transcription_flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "transcription flush_interval must be greater than zero".to_string(),
            ));
        }
        if self.attach_grace.is_zero() {
            return Err(ConfigError::Invalid(
                "attach_grace must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket address string for the listener
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether TLS is configured
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Whether a transcription backend is configured
    pub fn has_transcription(&self) -> bool {
        self.transcription_url.is_some()
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("{name}={value}: {e}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.address(), "0.0.0.0:5000");
        assert!(!config.is_tls_enabled());
        assert!(!config.has_transcription());
        assert!(!config.record_outbound_track);
        assert_eq!(config.attach_grace, Duration::from_millis(3000));
        assert_eq!(config.transcription_flush_bytes, 320_000);
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(
            &config_path,
            r#"
server:
  host: "127.0.0.1"
  port: 6001

relay:
  attach_grace_ms: 500
  record_outbound_track: true

transcription:
  url: "https://transcribe.example.com/v1/batch"
  flush_bytes: 64000
  flush_interval_ms: 2500
"#,
        )
        .unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();

        assert_eq!(config.address(), "127.0.0.1:6001");
        assert_eq!(config.attach_grace, Duration::from_millis(500));
        assert!(config.record_outbound_track);
        assert!(config.has_transcription());
        assert_eq!(config.transcription_flush_bytes, 64000);
        assert_eq!(
            config.transcription_flush_interval,
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_tls_requires_both_paths() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(
            &config_path,
            "server:\n  tls:\n    enabled: true\n    cert_path: \"/tmp/cert.pem\"\n",
        )
        .unwrap();

        let result = ServerConfig::from_file(&config_path);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_flush_bytes_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "transcription:\n  flush_bytes: 0\n").unwrap();

        let result = ServerConfig::from_file(&config_path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("flush_bytes"));
    }
}
