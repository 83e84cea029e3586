//! HTTP middleware
//!
//! - `connection_limit` - WebSocket connection caps (global and per-IP)

mod connection_limit;

pub use connection_limit::connection_limit_middleware;
