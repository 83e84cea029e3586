//! Health check endpoint

use std::sync::Arc;

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::state::AppState;

/// Report process health and relay configuration booleans.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "active_sessions": state.registry.active_session_count(),
        "active_connections": state.active_connection_count(),
        "configuration": {
            "transcription_configured": state.config.has_transcription(),
            "record_outbound_track": state.config.record_outbound_track,
        }
    }))
}
