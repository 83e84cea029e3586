//! Shared application state
//!
//! One `AppState` per process, shared by every handler through `Arc`. It
//! owns the session registry, the transcription accumulator, the
//! session-lifecycle event bus consumed by outer layers, and the
//! WebSocket connection-limit counters enforced by the middleware.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::ServerConfig;
use crate::protocol::client::{ClientMessageRoute, ClientOutgoing};
use crate::session::CallSessionRegistry;
use crate::transcription::{
    AccumulatorConfig, HttpTranscriptionSink, NullTranscriptionSink, TranscriptionAccumulator,
    TranscriptionSink,
};

/// Buffer size for the session-lifecycle broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Why a connection was rejected by the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLimitError {
    GlobalLimitReached,
    PerIpLimitReached,
}

/// Session-lifecycle notifications for outer layers (call records,
/// dashboards). Delivery is best-effort: a slow subscriber lags, it never
/// backpressures the relay.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started { call_id: String },
    Ended { call_id: String },
}

/// Application state shared across all handlers
pub struct AppState {
    pub config: ServerConfig,
    pub registry: CallSessionRegistry,
    pub accumulator: TranscriptionAccumulator,
    events: broadcast::Sender<SessionEvent>,
    active_connections: AtomicUsize,
    connections_per_ip: DashMap<IpAddr, usize>,
}

impl AppState {
    /// Build the application state and start the accumulator's flush
    /// scheduler. Must run inside a tokio runtime.
    pub async fn new(config: ServerConfig) -> Arc<Self> {
        let sink: Arc<dyn TranscriptionSink> = match &config.transcription_url {
            Some(url) => {
                info!(endpoint = %url, "Transcription backend configured");
                Arc::new(HttpTranscriptionSink::new(
                    url.clone(),
                    config.transcription_api_key.clone(),
                    config.transcription_language.clone(),
                ))
            }
            None => {
                info!("No transcription backend configured, flushed audio is discarded");
                Arc::new(NullTranscriptionSink)
            }
        };

        let accumulator = TranscriptionAccumulator::new(
            AccumulatorConfig {
                max_bytes: config.transcription_flush_bytes,
                max_interval: config.transcription_flush_interval,
            },
            sink,
        );
        accumulator.spawn_flush_task();

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(AppState {
            config,
            registry: CallSessionRegistry::new(),
            accumulator,
            events,
            active_connections: AtomicUsize::new(0),
            connections_per_ip: DashMap::new(),
        })
    }

    /// Subscribe to session-lifecycle notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Publish a session-lifecycle event. Dropped when nobody listens.
    pub fn emit_session_event(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Tear down a call session end to end. Safe to call more than once:
    /// only the call that actually removes the session performs the
    /// notifications and the final flush.
    ///
    /// This is the authoritative teardown path: it closes attached client
    /// sockets with a session-ended notification, forces a final
    /// accumulator flush, and publishes the lifecycle event.
    pub async fn end_session(&self, call_id: &str) {
        let Some(teardown) = self.registry.unregister(call_id) else {
            return;
        };

        for client in teardown.clients {
            let _ = client
                .tx
                .send(ClientMessageRoute::Outgoing(ClientOutgoing::session_ended(
                    call_id,
                )))
                .await;
            let _ = client.tx.send(ClientMessageRoute::Close).await;
        }

        self.accumulator.force_flush(call_id).await;
        self.emit_session_event(SessionEvent::Ended {
            call_id: call_id.to_string(),
        });
        info!(call_id = %call_id, "Call session ended");
    }

    /// Reserve a WebSocket connection slot for this IP.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        if let Some(max) = self.config.max_websocket_connections {
            if self.active_connections.load(Ordering::Relaxed) >= max {
                return Err(ConnectionLimitError::GlobalLimitReached);
            }
        }

        let mut per_ip = self.connections_per_ip.entry(ip).or_insert(0);
        if *per_ip >= self.config.max_connections_per_ip {
            return Err(ConnectionLimitError::PerIpLimitReached);
        }
        *per_ip += 1;
        drop(per_ip);

        self.active_connections.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release a previously acquired connection slot.
    pub fn release_connection(&self, ip: IpAddr) {
        if let Some(mut entry) = self.connections_per_ip.get_mut(&ip) {
            *entry = entry.saturating_sub(1);
            let empty = *entry == 0;
            drop(entry);
            if empty {
                self.connections_per_ip.remove_if(&ip, |_, count| *count == 0);
            }
        }
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Currently held WebSocket connection slots.
    pub fn active_connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}
