//! Error types for the media relay
//!
//! The taxonomy mirrors the failure domains of the relay: protocol-level
//! anomalies survive the connection, session lookups degrade to counted
//! drops, transport failures drive teardown, and transcription flush
//! failures stay contained inside the accumulator.

use thiserror::Error;

/// Result alias used throughout the relay
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors produced by the relay core
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or unexpected frame. Logged and skipped; the connection
    /// stays alive.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Media or attach request referenced an unknown call. Counted and
    /// dropped, never fatal to the handler.
    #[error("no session registered for call {0}")]
    SessionNotFound(String),

    /// A provider connection tried to register a call that already has one.
    #[error("session already registered for call {0}")]
    SessionExists(String),

    /// The bounded pending-attach queue rejected a new entry.
    #[error("attach queue full for call {0}")]
    AttachQueueFull(String),

    /// Socket closed or reset. Always drives session teardown.
    #[error("transport error: {0}")]
    Transport(String),

    /// Transcription backend rejected a flushed batch. Retried on the next
    /// flush interval; never surfaced to the relay path.
    #[error("transcription flush failed: {0}")]
    Flush(String),

    /// WAV containerization of a flushed batch failed.
    #[error("wav encoding failed: {0}")]
    Wav(#[from] hound::Error),

    /// HTTP transport to the transcription backend failed.
    #[error("transcription request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl RelayError {
    /// True for errors that are isolated to the accumulator's flush path.
    pub fn is_flush_domain(&self) -> bool {
        matches!(
            self,
            RelayError::Flush(_) | RelayError::Wav(_) | RelayError::Http(_)
        )
    }
}
