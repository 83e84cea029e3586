//! Provider media-stream wire protocol
//!
//! The telephony provider speaks JSON frames over WebSocket, one event per
//! frame: `connected`, `start`, `media`, `stop` and `error`. Some provider
//! builds also push media as raw binary WebSocket frames instead of
//! JSON-wrapped base64; the ingress handler accepts both transports for
//! the same logical event, so only the JSON shapes live here.

use serde::{Deserialize, Deserializer, Serialize};

use super::OutgoingMediaPayload;

/// Protocol version echoed in the handshake acknowledgment
pub const HANDSHAKE_VERSION: &str = "1.0.0";

// =============================================================================
// Incoming Frames (Provider -> Server)
// =============================================================================

/// Incoming provider events, validated at the parse boundary
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ProviderEvent {
    /// Handshake echo from the provider
    Connected {
        #[serde(default)]
        version: Option<String>,
    },

    /// Stream start: carries the call identifier and negotiated format
    Start {
        /// Call identifier; some providers put it at the top level,
        /// others inside the start payload
        #[serde(default)]
        call_control_id: Option<String>,
        #[serde(default)]
        stream_id: Option<String>,
        start: StartPayload,
    },

    /// One chunk of companded audio
    Media {
        #[serde(default, deserialize_with = "sequence_number")]
        sequence_number: Option<u64>,
        media: MediaPayload,
    },

    /// Stream end
    Stop {
        #[serde(default, deserialize_with = "sequence_number")]
        sequence_number: Option<u64>,
        #[serde(default)]
        stop: Option<StopPayload>,
    },

    /// Stream-level error report from the provider
    Error {
        #[serde(default)]
        payload: Option<ProviderErrorPayload>,
    },

    /// Any event name this relay does not understand
    #[serde(other)]
    Unknown,
}

/// Start event payload
#[derive(Debug, Deserialize)]
pub struct StartPayload {
    #[serde(default)]
    pub call_control_id: Option<String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

/// Negotiated media format reported in the start event
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MediaFormat {
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

fn default_encoding() -> String {
    "PCMU".to_string()
}

fn default_sample_rate() -> u32 {
    8000
}

fn default_channels() -> u16 {
    1
}

impl Default for MediaFormat {
    fn default() -> Self {
        MediaFormat {
            encoding: default_encoding(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
        }
    }
}

/// Media event payload
#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// Direction label; absent on providers that predate track support
    #[serde(default, deserialize_with = "media_track")]
    pub track: Option<MediaTrack>,
    #[serde(default)]
    pub chunk: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Base64-encoded companded audio
    pub payload: String,
}

/// Logical direction of a media frame
///
/// `inbound` is the remote party's voice; `outbound` is the local party's
/// own voice echoed back by the provider. Anything unrecognized maps to
/// `Unspecified`, which the ingress handler treats as inbound for
/// compatibility with providers that omit the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaTrack {
    Inbound,
    Outbound,
    Unspecified,
}

impl MediaTrack {
    /// Map the wire label onto a track, folding unknown labels into
    /// `Unspecified` rather than rejecting the frame.
    pub fn from_wire(label: &str) -> MediaTrack {
        match label {
            "inbound" => MediaTrack::Inbound,
            "outbound" => MediaTrack::Outbound,
            _ => MediaTrack::Unspecified,
        }
    }
}

fn media_track<'de, D>(deserializer: D) -> Result<Option<MediaTrack>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .map(|label| MediaTrack::from_wire(&label)))
}

/// Stop event payload
#[derive(Debug, Deserialize)]
pub struct StopPayload {
    #[serde(default)]
    pub call_control_id: Option<String>,
}

/// Provider-reported stream error
#[derive(Debug, Deserialize)]
pub struct ProviderErrorPayload {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Providers disagree on whether `sequence_number` is a JSON number or a
/// decimal string; accept both.
fn sequence_number<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SeqRepr {
        Num(u64),
        Str(String),
    }

    Ok(match Option::<SeqRepr>::deserialize(deserializer)? {
        Some(SeqRepr::Num(n)) => Some(n),
        Some(SeqRepr::Str(s)) => s.parse().ok(),
        None => None,
    })
}

// =============================================================================
// Outgoing Frames (Server -> Provider)
// =============================================================================

/// Outgoing frames toward the provider
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ProviderOutgoing {
    /// Handshake acknowledgment sent as soon as the socket opens
    Connected { version: &'static str },

    /// Reverse-path audio (browser voice), base64 in the negotiated codec
    Media { media: OutgoingMediaPayload },
}

impl ProviderOutgoing {
    /// Handshake frame sent on connection open
    pub fn handshake() -> Self {
        ProviderOutgoing::Connected {
            version: HANDSHAKE_VERSION,
        }
    }
}

// =============================================================================
// Message Routing
// =============================================================================

/// Routing envelope for the provider-socket writer task
pub enum ProviderMessageRoute {
    /// JSON frame
    Outgoing(ProviderOutgoing),
    /// Close the socket
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_event_deserialization() {
        let json = r#"{
            "event": "start",
            "sequence_number": "1",
            "call_control_id": "v3:call-abc",
            "start": {
                "media_format": {
                    "encoding": "PCMA",
                    "sample_rate": 8000,
                    "channels": 1
                }
            }
        }"#;

        let event: ProviderEvent = serde_json::from_str(json).expect("Should deserialize");
        match event {
            ProviderEvent::Start {
                call_control_id,
                start,
                ..
            } => {
                assert_eq!(call_control_id.as_deref(), Some("v3:call-abc"));
                let format = start.media_format.expect("Should have media_format");
                assert_eq!(format.encoding, "PCMA");
                assert_eq!(format.sample_rate, 8000);
            }
            _ => panic!("Expected Start variant"),
        }
    }

    #[test]
    fn test_start_call_id_nested_in_payload() {
        let json = r#"{
            "event": "start",
            "start": {"call_control_id": "v3:nested", "media_format": {"encoding": "PCMU"}}
        }"#;

        let event: ProviderEvent = serde_json::from_str(json).expect("Should deserialize");
        match event {
            ProviderEvent::Start {
                call_control_id,
                start,
                ..
            } => {
                assert!(call_control_id.is_none());
                assert_eq!(start.call_control_id.as_deref(), Some("v3:nested"));
            }
            _ => panic!("Expected Start variant"),
        }
    }

    #[test]
    fn test_media_event_with_numeric_sequence() {
        let json = r#"{
            "event": "media",
            "sequence_number": 42,
            "media": {"track": "inbound", "payload": "AAECAw=="}
        }"#;

        let event: ProviderEvent = serde_json::from_str(json).expect("Should deserialize");
        match event {
            ProviderEvent::Media {
                sequence_number,
                media,
            } => {
                assert_eq!(sequence_number, Some(42));
                assert_eq!(media.track, Some(MediaTrack::Inbound));
                assert_eq!(media.payload, "AAECAw==");
            }
            _ => panic!("Expected Media variant"),
        }
    }

    #[test]
    fn test_media_event_with_string_sequence_and_no_track() {
        let json = r#"{
            "event": "media",
            "sequence_number": "7",
            "media": {"payload": "//8="}
        }"#;

        let event: ProviderEvent = serde_json::from_str(json).expect("Should deserialize");
        match event {
            ProviderEvent::Media {
                sequence_number,
                media,
            } => {
                assert_eq!(sequence_number, Some(7));
                assert!(media.track.is_none());
            }
            _ => panic!("Expected Media variant"),
        }
    }

    #[test]
    fn test_unknown_track_maps_to_unspecified() {
        let json = r#"{
            "event": "media",
            "media": {"track": "both_tracks", "payload": "AA=="}
        }"#;

        let event: ProviderEvent = serde_json::from_str(json).expect("Should deserialize");
        match event {
            ProviderEvent::Media { media, .. } => {
                assert_eq!(media.track, Some(MediaTrack::Unspecified));
            }
            _ => panic!("Expected Media variant"),
        }
    }

    #[test]
    fn test_unknown_event_is_explicit_variant() {
        let json = r#"{"event": "dtmf", "digit": "5"}"#;
        let event: ProviderEvent = serde_json::from_str(json).expect("Should deserialize");
        assert!(matches!(event, ProviderEvent::Unknown));
    }

    #[test]
    fn test_stop_event_deserialization() {
        let json = r#"{"event": "stop", "stop": {"call_control_id": "v3:call-abc"}}"#;
        let event: ProviderEvent = serde_json::from_str(json).expect("Should deserialize");
        match event {
            ProviderEvent::Stop { stop, .. } => {
                assert_eq!(
                    stop.unwrap().call_control_id.as_deref(),
                    Some("v3:call-abc")
                );
            }
            _ => panic!("Expected Stop variant"),
        }
    }

    #[test]
    fn test_handshake_serialization() {
        let json = serde_json::to_string(&ProviderOutgoing::handshake()).expect("Should serialize");
        assert!(json.contains(r#""event":"connected""#));
        assert!(json.contains(r#""version":"1.0.0""#));
    }

    #[test]
    fn test_outgoing_media_serialization() {
        let msg = ProviderOutgoing::Media {
            media: OutgoingMediaPayload {
                payload: "AAECAw==".to_string(),
            },
        };
        let json = serde_json::to_string(&msg).expect("Should serialize");
        assert!(json.contains(r#""event":"media""#));
        assert!(json.contains(r#""payload":"AAECAw==""#));
    }
}
