//! Provider media stream handler
//!
//! One WebSocket per active call, connected by the telephony provider
//! once call-control starts streaming. The handler drives a small state
//! machine per connection:
//!
//! `WaitStart -> Streaming -> Stopped`
//!
//! On upgrade the handler immediately sends the `connected` handshake and
//! waits for the provider's `start` event, which registers the session.
//! While streaming, inbound-track audio is transcoded to μ-law and fanned
//! out to attached clients, and a linear-PCM copy feeds the transcription
//! accumulator. The provider connection is the authoritative lifetime of
//! the whole session: `stop`, socket close and socket errors all drive
//! the same idempotent teardown.

use std::sync::Arc;

use axum::{
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use base64::prelude::*;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::audio::{self, CompandingLaw};
use crate::protocol::OutgoingMediaPayload;
use crate::protocol::client::{ClientMessageRoute, ClientOutgoing};
use crate::protocol::provider::{
    MediaFormat, MediaTrack, ProviderEvent, ProviderMessageRoute, ProviderOutgoing,
};
use crate::session::{EgressRoute, NegotiatedFormat};
use crate::state::{AppState, SessionEvent};

/// Optimized channel buffer size for audio workloads
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Per-connection phase of the provider protocol
enum StreamPhase {
    /// Handshake sent, waiting for the start event
    WaitStart,
    /// Session registered, media flowing
    Streaming {
        call_id: String,
        codec: CompandingLaw,
    },
    /// Stop processed; nothing further is expected on this socket
    Stopped,
}

/// Provider media stream WebSocket handler
pub async fn provider_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
) -> Response {
    info!(peer = %addr, "Provider media stream upgrade requested");
    ws.on_upgrade(move |socket| handle_provider_socket(socket, state, addr.ip()))
}

async fn handle_provider_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    client_ip: std::net::IpAddr,
) {
    let (mut sender, mut receiver) = socket.split();
    let (message_tx, mut message_rx) = mpsc::channel::<ProviderMessageRoute>(CHANNEL_BUFFER_SIZE);

    // Writer task: the only place this socket is written from.
    let sender_task = tokio::spawn(async move {
        while let Some(route) = message_rx.recv().await {
            let should_close = matches!(route, ProviderMessageRoute::Close);

            let result = match route {
                ProviderMessageRoute::Outgoing(frame) => match serde_json::to_string(&frame) {
                    Ok(json) => sender.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!("Failed to serialize provider frame: {}", e);
                        continue;
                    }
                },
                ProviderMessageRoute::Close => sender.send(Message::Close(None)).await,
            };

            if result.is_err() || should_close {
                break;
            }
        }
    });

    // Handshake acknowledgment, sent before anything else.
    let _ = message_tx
        .send(ProviderMessageRoute::Outgoing(ProviderOutgoing::handshake()))
        .await;

    let mut phase = StreamPhase::WaitStart;
    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(msg) => {
                if !process_provider_message(msg, &mut phase, &message_tx, &state).await {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Provider WebSocket error");
                break;
            }
        }
    }

    // Socket gone or protocol finished: a still-streaming session means
    // the provider dropped without a stop event, tear down regardless.
    if let StreamPhase::Streaming { call_id, .. } = &phase {
        state.end_session(call_id).await;
    }

    sender_task.abort();
    state.release_connection(client_ip);
    info!("Provider media stream terminated");
}

/// Process one WebSocket message. Returns false to stop the read loop.
async fn process_provider_message(
    msg: Message,
    phase: &mut StreamPhase,
    message_tx: &mpsc::Sender<ProviderMessageRoute>,
    state: &Arc<AppState>,
) -> bool {
    match msg {
        Message::Text(text) => {
            let event: ProviderEvent = match serde_json::from_str(&text) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Malformed provider frame, skipping");
                    return true;
                }
            };
            handle_provider_event(event, phase, message_tx, state).await
        }
        Message::Binary(data) => {
            // Raw binary transport: same logical event as a JSON media
            // frame with no track label.
            if let StreamPhase::Streaming { call_id, codec } = phase {
                forward_inbound(state, call_id, *codec, None, &data);
            } else {
                debug!("Binary media before start event, ignoring");
            }
            true
        }
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => {
            info!("Provider WebSocket close received");
            false
        }
    }
}

async fn handle_provider_event(
    event: ProviderEvent,
    phase: &mut StreamPhase,
    message_tx: &mpsc::Sender<ProviderMessageRoute>,
    state: &Arc<AppState>,
) -> bool {
    match event {
        ProviderEvent::Connected { version } => {
            debug!(version = ?version, "Provider handshake echo");
            true
        }

        ProviderEvent::Start {
            call_control_id,
            stream_id,
            start,
        } => {
            match phase {
                StreamPhase::WaitStart => {}
                StreamPhase::Streaming { call_id, .. } => {
                    warn!(call_id = %call_id, "Duplicate start event, ignoring");
                    return true;
                }
                StreamPhase::Stopped => {
                    warn!("Start event after stop, ignoring");
                    return true;
                }
            }

            let Some(call_id) = call_control_id.or(start.call_control_id) else {
                warn!("Start event without a call identifier, ignoring");
                return true;
            };

            let format = negotiated_format(start.media_format.as_ref());
            match state
                .registry
                .register(&call_id, message_tx.clone(), format)
            {
                Ok(()) => {
                    state.accumulator.open(&call_id);
                    state.registry.mark_streaming(&call_id);
                    state.emit_session_event(SessionEvent::Started {
                        call_id: call_id.clone(),
                    });
                    info!(
                        call_id = %call_id,
                        stream_id = ?stream_id,
                        codec = format.codec.as_str(),
                        sample_rate = format.sample_rate,
                        "Media stream started"
                    );
                    *phase = StreamPhase::Streaming {
                        call_id,
                        codec: format.codec,
                    };
                    true
                }
                Err(err) => {
                    // At most one provider connection per call. The
                    // newcomer loses; the established stream keeps going.
                    warn!(call_id = %call_id, error = %err, "Rejecting duplicate provider connection");
                    let _ = message_tx.send(ProviderMessageRoute::Close).await;
                    false
                }
            }
        }

        ProviderEvent::Media {
            sequence_number,
            media,
        } => {
            let StreamPhase::Streaming { call_id, codec } = phase else {
                debug!("Media frame before start event, dropping");
                return true;
            };

            let payload = match BASE64_STANDARD.decode(media.payload.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(call_id = %call_id, error = %e, "Undecodable media payload, skipping");
                    return true;
                }
            };

            match media.track.unwrap_or(MediaTrack::Unspecified) {
                // No track label means a provider that predates track
                // support; treat it as the remote party's voice.
                MediaTrack::Inbound | MediaTrack::Unspecified => {
                    forward_inbound(state, call_id, *codec, sequence_number, &payload);
                }
                // The local party's own voice echoed back by the
                // provider. Never forwarded to clients; transcribed only
                // when the deployment opts in.
                MediaTrack::Outbound => {
                    state.registry.note_outbound(call_id, sequence_number);
                    if state.config.record_outbound_track {
                        state
                            .accumulator
                            .feed(call_id, &audio::expand_to_linear16(&payload, *codec));
                    }
                }
            }
            true
        }

        ProviderEvent::Stop { .. } => {
            match phase {
                StreamPhase::Streaming { call_id, .. } => {
                    let call_id = call_id.clone();
                    info!(call_id = %call_id, "Media stream stopped");
                    state.end_session(&call_id).await;
                    *phase = StreamPhase::Stopped;
                }
                StreamPhase::WaitStart => {
                    // Nothing to tear down; anomaly, not an error.
                    warn!("Stop event before any start event");
                }
                StreamPhase::Stopped => debug!("Duplicate stop event"),
            }
            true
        }

        ProviderEvent::Error { payload } => {
            warn!(payload = ?payload, "Provider reported a stream error");
            true
        }

        ProviderEvent::Unknown => {
            warn!("Unknown provider event, skipping");
            true
        }
    }
}

/// Fan one inbound frame out to every attached client and tap the
/// accumulator. Runs on the provider read task; nothing here blocks.
fn forward_inbound(
    state: &Arc<AppState>,
    call_id: &str,
    codec: CompandingLaw,
    seq: Option<u64>,
    payload: &[u8],
) {
    let Some(targets) = state.registry.inbound_targets(call_id, seq) else {
        debug!(call_id = %call_id, "Inbound media for unregistered call, dropping");
        return;
    };

    if !targets.is_empty() {
        // The browser wire format is fixed at μ-law whatever the
        // provider negotiated.
        let mulaw = audio::transcode_frame(payload, codec, CompandingLaw::MuLaw);
        let frame = ClientOutgoing::Media {
            media: OutgoingMediaPayload {
                payload: BASE64_STANDARD.encode(&mulaw),
            },
        };
        for tx in &targets {
            if tx
                .try_send(ClientMessageRoute::Outgoing(frame.clone()))
                .is_err()
            {
                let drops = state.registry.note_client_drop(call_id);
                if drops == 1 || drops % 100 == 0 {
                    warn!(call_id = %call_id, drops, "Client channel full, dropping frame");
                }
            }
        }
    }

    // Accumulator tap, off the hot path: feed appends under a short
    // entry lock and never performs I/O.
    state
        .accumulator
        .feed(call_id, &audio::expand_to_linear16(payload, codec));
}

/// Push transcoded browser audio onto a call's provider connection.
///
/// Used by the client relay handler. Frames for calls whose provider leg
/// is not streaming yet are dropped with a counted warning; the provider
/// is not ready to accept media.
pub async fn send_to_provider(state: &Arc<AppState>, call_id: &str, mulaw: &[u8]) {
    match state.registry.egress_route(call_id) {
        EgressRoute::Ready { tx, codec } => {
            let transcoded = audio::transcode_frame(mulaw, CompandingLaw::MuLaw, codec);
            let frame = ProviderOutgoing::Media {
                media: OutgoingMediaPayload {
                    payload: BASE64_STANDARD.encode(&transcoded),
                },
            };
            if tx
                .send(ProviderMessageRoute::Outgoing(frame))
                .await
                .is_err()
            {
                debug!(call_id = %call_id, "Provider connection gone, dropping client audio");
            }
        }
        EgressRoute::NotReady { dropped } => {
            if dropped == 1 || dropped % 100 == 0 {
                warn!(
                    call_id = %call_id,
                    dropped,
                    "Dropping client audio: provider stream not ready"
                );
            }
        }
        EgressRoute::NotFound { dropped } => {
            debug!(call_id = %call_id, dropped, "Dropping client audio: no session");
        }
    }
}

fn negotiated_format(format: Option<&MediaFormat>) -> NegotiatedFormat {
    let Some(format) = format else {
        return NegotiatedFormat::default();
    };
    let codec = CompandingLaw::from_encoding(&format.encoding).unwrap_or_else(|| {
        warn!(encoding = %format.encoding, "Unknown media encoding, assuming PCMU");
        CompandingLaw::MuLaw
    });
    NegotiatedFormat {
        codec,
        sample_rate: format.sample_rate,
        channels: format.channels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiated_format_defaults_to_mulaw() {
        let format = negotiated_format(None);
        assert_eq!(format.codec, CompandingLaw::MuLaw);
        assert_eq!(format.sample_rate, 8000);
    }

    #[test]
    fn test_negotiated_format_parses_alaw() {
        let wire = MediaFormat {
            encoding: "PCMA".to_string(),
            sample_rate: 8000,
            channels: 1,
        };
        let format = negotiated_format(Some(&wire));
        assert_eq!(format.codec, CompandingLaw::ALaw);
    }

    #[test]
    fn test_negotiated_format_unknown_encoding_falls_back() {
        let wire = MediaFormat {
            encoding: "OPUS".to_string(),
            sample_rate: 48000,
            channels: 2,
        };
        let format = negotiated_format(Some(&wire));
        assert_eq!(format.codec, CompandingLaw::MuLaw);
        assert_eq!(format.sample_rate, 48000);
    }
}
