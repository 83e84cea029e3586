//! Wire protocol types
//!
//! Tagged-union frame definitions for both WebSocket legs. All parsing and
//! validation happens at this boundary: unknown event names deserialize
//! into a single explicit `Unknown` variant instead of silently falling
//! through, and handlers only ever match on typed frames.

pub mod client;
pub mod provider;

pub use client::{
    ClientAudioConfig, ClientEvent, ClientMessageRoute, ClientOutgoing, ErrorPayload,
};
pub use provider::{
    MediaFormat, MediaTrack, ProviderEvent, ProviderMessageRoute, ProviderOutgoing,
};

/// Base64 media payload shared by both outgoing wire formats
#[derive(Debug, Clone, serde::Serialize)]
pub struct OutgoingMediaPayload {
    /// Base64-encoded companded audio bytes
    pub payload: String,
}
