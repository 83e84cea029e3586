//! Browser client relay handler
//!
//! One WebSocket per browser client. The socket identifies its call via
//! the `call_id` query parameter or a first `attach` frame. If the
//! provider's start event has not arrived yet, the attach parks in the
//! registry's bounded queue and waits out a grace window; a session that
//! never materializes gets an explicit error frame before the close.
//!
//! Toward the browser everything is μ-law base64 JSON regardless of the
//! provider codec. Audio from the browser is decoded, transcoded to the
//! negotiated provider codec and pushed onto the provider leg. Closing
//! this socket never ends the call: the session keeps streaming into the
//! accumulator in a recording-only degraded mode.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ConnectInfo, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use base64::prelude::*;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::client::{ClientEvent, ClientMessageRoute, ClientOutgoing};
use crate::session::{ClientHandle, PendingAttach};
use crate::state::AppState;

use super::provider::send_to_provider;

/// Optimized channel buffer size for audio workloads
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// How long the writer task gets to drain queued frames at shutdown
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Query parameters accepted on the client stream endpoint
#[derive(Debug, Deserialize)]
pub struct ClientStreamQuery {
    #[serde(default)]
    pub call_id: Option<String>,
}

/// Outcome of the attach negotiation
enum AttachOutcome {
    Attached,
    TimedOut,
    Disconnected,
}

/// Browser client WebSocket handler
pub async fn client_stream_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ClientStreamQuery>,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
) -> Response {
    info!(call_id = ?query.call_id, peer = %addr, "Client audio stream upgrade requested");
    ws.on_upgrade(move |socket| handle_client_socket(socket, state, query.call_id, addr.ip()))
}

async fn handle_client_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    query_call_id: Option<String>,
    client_ip: std::net::IpAddr,
) {
    let client_id = Uuid::new_v4();
    info!(client_id = %client_id, "Client audio stream connected");

    let (mut sender, mut receiver) = socket.split();
    let (message_tx, mut message_rx) = mpsc::channel::<ClientMessageRoute>(CHANNEL_BUFFER_SIZE);

    let mut sender_task = tokio::spawn(async move {
        while let Some(route) = message_rx.recv().await {
            let should_close = matches!(route, ClientMessageRoute::Close);

            let result = match route {
                ClientMessageRoute::Outgoing(frame) => match serde_json::to_string(&frame) {
                    Ok(json) => sender.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!("Failed to serialize client frame: {}", e);
                        continue;
                    }
                },
                ClientMessageRoute::Close => sender.send(Message::Close(None)).await,
            };

            if result.is_err() || should_close {
                break;
            }
        }
    });

    run_client_session(&state, client_id, query_call_id, &mut receiver, message_tx).await;

    // Let the writer flush any queued error/close frames before it dies.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut sender_task)
        .await
        .is_err()
    {
        sender_task.abort();
    }

    state.release_connection(client_ip);
    info!(client_id = %client_id, "Client audio stream terminated");
}

/// Attach, then relay until the socket goes away. Owns `message_tx` so
/// dropping it on return closes the writer task's channel.
async fn run_client_session(
    state: &Arc<AppState>,
    client_id: Uuid,
    query_call_id: Option<String>,
    receiver: &mut SplitStream<WebSocket>,
    message_tx: mpsc::Sender<ClientMessageRoute>,
) {
    // Fixed-format handshake goes out before attach resolves, so the
    // browser can set up its audio pipeline while we wait.
    let _ = message_tx
        .send(ClientMessageRoute::Outgoing(ClientOutgoing::connected()))
        .await;

    let call_id = match query_call_id {
        Some(id) => Some(id),
        None => await_attach_frame(receiver, state.config.attach_grace).await,
    };
    let Some(call_id) = call_id else {
        warn!(client_id = %client_id, "Client never identified a call, closing");
        let _ = message_tx
            .send(ClientMessageRoute::Outgoing(ClientOutgoing::protocol_error(
                "expected a call_id query parameter or an attach frame",
            )))
            .await;
        let _ = message_tx.send(ClientMessageRoute::Close).await;
        return;
    };

    let handle = ClientHandle {
        id: client_id,
        tx: message_tx.clone(),
    };
    match attach_with_grace(state, &call_id, handle, receiver).await {
        AttachOutcome::Attached => {
            info!(call_id = %call_id, client_id = %client_id, "Client attached to call session");
        }
        AttachOutcome::TimedOut => {
            let _ = message_tx
                .send(ClientMessageRoute::Outgoing(
                    ClientOutgoing::session_not_found(&call_id),
                ))
                .await;
            let _ = message_tx.send(ClientMessageRoute::Close).await;
            return;
        }
        AttachOutcome::Disconnected => return,
    }

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(msg) => {
                if !process_client_message(msg, state, &call_id).await {
                    break;
                }
            }
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Client WebSocket error");
                break;
            }
        }
    }

    // Detaching never tears the session down: with no clients left the
    // call keeps feeding the accumulator until the provider leg ends.
    state.registry.detach_client(&call_id, client_id);
    debug!(call_id = %call_id, client_id = %client_id, "Client detached");
}

/// Process one WebSocket message. Returns false to stop the read loop.
async fn process_client_message(msg: Message, state: &Arc<AppState>, call_id: &str) -> bool {
    match msg {
        Message::Text(text) => {
            match serde_json::from_str::<ClientEvent>(&text) {
                Ok(ClientEvent::Media { media }) => {
                    match BASE64_STANDARD.decode(media.payload.as_bytes()) {
                        Ok(mulaw) => send_to_provider(state, call_id, &mulaw).await,
                        Err(e) => {
                            warn!(call_id = %call_id, error = %e, "Undecodable client audio payload, skipping");
                        }
                    }
                }
                Ok(ClientEvent::Attach { call_id: other }) => {
                    if other != call_id {
                        warn!(
                            attached = %call_id,
                            requested = %other,
                            "Client attempted re-attach to a different call, ignoring"
                        );
                    }
                }
                Ok(ClientEvent::Unknown) => warn!("Unknown client event, skipping"),
                Err(e) => warn!(error = %e, "Malformed client frame, skipping"),
            }
            true
        }
        // Raw binary transport: μ-law audio without the JSON envelope.
        Message::Binary(data) => {
            send_to_provider(state, call_id, &data).await;
            true
        }
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => {
            info!(call_id = %call_id, "Client WebSocket close received");
            false
        }
    }
}

/// Wait for the first attach frame when no query parameter was given.
async fn await_attach_frame(
    receiver: &mut SplitStream<WebSocket>,
    deadline: Duration,
) -> Option<String> {
    let result = tokio::time::timeout(deadline, async {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(ClientEvent::Attach { call_id }) => return Some(call_id),
                    Ok(_) => debug!("Ignoring client frame before attach"),
                    Err(e) => warn!(error = %e, "Malformed client frame before attach"),
                },
                Message::Binary(_) => debug!("Ignoring client audio before attach"),
                Message::Close(_) => return None,
                _ => {}
            }
        }
        None
    })
    .await;
    result.ok().flatten()
}

/// Attach to the session, parking in the registry's pending queue for the
/// grace window when the provider's start event has not arrived yet.
async fn attach_with_grace(
    state: &Arc<AppState>,
    call_id: &str,
    client: ClientHandle,
    receiver: &mut SplitStream<WebSocket>,
) -> AttachOutcome {
    // Fast path: session already registered.
    if state.registry.attach_client(call_id, client.clone()).is_ok() {
        return AttachOutcome::Attached;
    }

    let (ready_tx, ready_rx) = oneshot::channel();
    if state
        .registry
        .enqueue_attach(
            call_id,
            PendingAttach {
                client: client.clone(),
                ready: ready_tx,
            },
        )
        .is_err()
    {
        warn!(call_id = %call_id, "Attach queue full, rejecting client");
        return AttachOutcome::TimedOut;
    }

    // The session may have registered between the failed attach and the
    // enqueue, in which case the queued entry would never drain.
    if state.registry.attach_client(call_id, client.clone()).is_ok() {
        state.registry.cancel_pending(call_id, client.id);
        return AttachOutcome::Attached;
    }

    let grace = state.config.attach_grace;
    tokio::select! {
        result = ready_rx => match result {
            Ok(_) => {
                debug!(call_id = %call_id, "Queued attach resolved");
                AttachOutcome::Attached
            }
            Err(_) => AttachOutcome::TimedOut,
        },
        _ = tokio::time::sleep(grace) => {
            state.registry.cancel_pending(call_id, client.id);
            info!(
                call_id = %call_id,
                grace_ms = grace.as_millis() as u64,
                "No session appeared within the attach grace window"
            );
            AttachOutcome::TimedOut
        }
        _ = drain_until_close(receiver) => {
            state.registry.cancel_pending(call_id, client.id);
            debug!(call_id = %call_id, "Client disconnected while waiting for session");
            AttachOutcome::Disconnected
        }
    }
}

/// Consume and discard frames until the socket closes. Used while an
/// attach is parked so a departing client releases its queue slot.
async fn drain_until_close(receiver: &mut SplitStream<WebSocket>) {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Close(_) => return,
            _ => debug!("Ignoring client frame while attach is pending"),
        }
    }
}
