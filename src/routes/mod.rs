//! Route configuration
//!
//! Two WebSocket endpoints carry all media:
//!
//! - `GET /audio-stream` - provider media stream, one connection per
//!   active call. Speaks the provider's framed JSON event protocol
//!   (`connected`/`start`/`media`/`stop`) plus raw binary media frames.
//! - `GET /client-stream` - browser client relay. Attach with the
//!   `?call_id=` query parameter or a first `attach` frame; audio toward
//!   the browser is always base64 μ-law regardless of the provider codec.

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::{client_stream_handler, provider_stream_handler};
use crate::state::AppState;

/// Create the WebSocket router
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/audio-stream", get(provider_stream_handler))
        .route("/client-stream", get(client_stream_handler))
        .layer(TraceLayer::new_for_http())
}
