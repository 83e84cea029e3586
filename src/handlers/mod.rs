//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `provider` - Provider media stream ingress/egress (one socket per call)
//! - `client` - Browser client media relay
pub mod api;
pub mod client;
pub mod provider;

// Re-export commonly used handlers for convenient access
pub use client::client_stream_handler;
pub use provider::{provider_stream_handler, send_to_provider};
