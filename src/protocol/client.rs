//! Browser client wire protocol
//!
//! The browser always speaks one fixed format regardless of what the
//! provider negotiated: JSON frames carrying base64 μ-law at 8 kHz mono.
//! The relay performs whatever conversion is required, so browser audio
//! code only ever implements PCMU.

use serde::{Deserialize, Serialize};

use super::OutgoingMediaPayload;

/// Error code for malformed client frames
pub const ERROR_CODE_PROTOCOL: u32 = 100_001;
/// Error code for connection-level failures
pub const ERROR_CODE_CONNECTION: u32 = 100_002;
/// Error code sent when no session appears within the attach grace window
pub const ERROR_CODE_SESSION_NOT_FOUND: u32 = 100_003;
/// Error code sent when the provider leg ends the session
pub const ERROR_CODE_SESSION_ENDED: u32 = 100_004;

// =============================================================================
// Incoming Messages (Client -> Server)
// =============================================================================

/// Incoming client messages
///
/// Raw binary WebSocket frames are also accepted as μ-law audio and never
/// reach this enum; only JSON frames are parsed here.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ClientEvent {
    /// Bind this socket to a call, as an alternative to the `call_id`
    /// query parameter
    Attach { call_id: String },

    /// Microphone audio from the browser, base64 μ-law
    Media { media: ClientMediaPayload },

    /// Any event name this relay does not understand
    #[serde(other)]
    Unknown,
}

/// Client media payload
#[derive(Debug, Deserialize)]
pub struct ClientMediaPayload {
    pub payload: String,
}

// =============================================================================
// Outgoing Messages (Server -> Client)
// =============================================================================

/// Outgoing frames toward the browser client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ClientOutgoing {
    /// Sent once on socket establishment with the fixed audio config
    Connected { config: ClientAudioConfig },

    /// Call audio toward the browser, base64 μ-law
    Media { media: OutgoingMediaPayload },

    /// Session-fatal condition; transient provider anomalies never
    /// produce one of these
    Error { payload: ErrorPayload },
}

/// Fixed audio configuration advertised to every client
#[derive(Debug, Clone, Serialize)]
pub struct ClientAudioConfig {
    pub codec: &'static str,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for ClientAudioConfig {
    fn default() -> Self {
        ClientAudioConfig {
            codec: "PCMU",
            sample_rate: 8000,
            channels: 1,
        }
    }
}

/// Error payload toward the client
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: u32,
    pub title: String,
    pub detail: String,
}

impl ClientOutgoing {
    /// Connection acknowledgment with the fixed audio config
    pub fn connected() -> Self {
        ClientOutgoing::Connected {
            config: ClientAudioConfig::default(),
        }
    }

    /// Protocol error for clients that never identify a call
    pub fn protocol_error(detail: impl Into<String>) -> Self {
        ClientOutgoing::Error {
            payload: ErrorPayload {
                code: ERROR_CODE_PROTOCOL,
                title: "Protocol error".to_string(),
                detail: detail.into(),
            },
        }
    }

    /// Session-not-found error after the attach grace window expires
    pub fn session_not_found(call_id: &str) -> Self {
        ClientOutgoing::Error {
            payload: ErrorPayload {
                code: ERROR_CODE_SESSION_NOT_FOUND,
                title: "Session not found".to_string(),
                detail: format!("no media session appeared for call {call_id}"),
            },
        }
    }

    /// Session-ended notification sent before the socket is closed
    pub fn session_ended(call_id: &str) -> Self {
        ClientOutgoing::Error {
            payload: ErrorPayload {
                code: ERROR_CODE_SESSION_ENDED,
                title: "Session ended".to_string(),
                detail: format!("media stream for call {call_id} has ended"),
            },
        }
    }
}

// =============================================================================
// Message Routing
// =============================================================================

/// Routing envelope for the client-socket writer task
pub enum ClientMessageRoute {
    /// JSON frame
    Outgoing(ClientOutgoing),
    /// Close the socket
    Close,
}
