//! Call session registry
//!
//! Concurrency-safe directory mapping a call identifier to its
//! provider-side connection handle, its attached client handles and its
//! lifecycle state. A single mutex guards the map and is never held across
//! network I/O: handlers clone the `mpsc` senders they need out of the
//! lock and perform all sends outside it.
//!
//! The registry also owns the bounded pending-attach queue that resolves
//! the race between "stream started" and "client attached": a client that
//! arrives before the provider's start event parks here and is drained by
//! `register`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::audio::CompandingLaw;
use crate::errors::RelayError;
use crate::protocol::client::ClientMessageRoute;
use crate::protocol::provider::ProviderMessageRoute;

/// Maximum queued attach requests for a single call
pub const MAX_PENDING_ATTACH_PER_CALL: usize = 4;

/// Maximum queued attach requests across all calls
pub const MAX_PENDING_ATTACH_TOTAL: usize = 64;

/// Lifecycle state of a call session
///
/// Transitions are monotonic: a session never moves backwards, and
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Streaming,
    Draining,
    Closed,
}

impl SessionState {
    /// Advance to `next` if that is a forward transition. Returns whether
    /// the state changed.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Media format negotiated by the provider at stream start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub codec: CompandingLaw,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for NegotiatedFormat {
    fn default() -> Self {
        NegotiatedFormat {
            codec: CompandingLaw::MuLaw,
            sample_rate: 8000,
            channels: 1,
        }
    }
}

/// Handle to an attached browser client connection
#[derive(Clone)]
pub struct ClientHandle {
    pub id: Uuid,
    pub tx: mpsc::Sender<ClientMessageRoute>,
}

/// Attach request parked until the session registers
pub struct PendingAttach {
    pub client: ClientHandle,
    /// Fired with the negotiated format once the session appears
    pub ready: oneshot::Sender<NegotiatedFormat>,
}

/// Client handles handed back by `unregister` so the caller can notify and
/// close them outside the lock
pub struct SessionTeardown {
    pub clients: Vec<ClientHandle>,
}

/// Read-only view of a session for diagnostics and tests
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub format: NegotiatedFormat,
    pub client_count: usize,
    pub inbound_seq: u64,
    pub outbound_seq: u64,
}

/// Result of resolving the reverse (client -> provider) path
pub enum EgressRoute {
    /// Session is streaming; send through this handle
    Ready {
        tx: mpsc::Sender<ProviderMessageRoute>,
        codec: CompandingLaw,
    },
    /// Session exists but the provider is not accepting media yet;
    /// the frame was counted as dropped
    NotReady { dropped: u64 },
    /// No session for this call; counted at the registry level
    NotFound { dropped: u64 },
}

struct CallSession {
    provider_tx: mpsc::Sender<ProviderMessageRoute>,
    clients: Vec<ClientHandle>,
    format: NegotiatedFormat,
    state: SessionState,
    inbound_seq: u64,
    outbound_seq: u64,
    egress_drops: u64,
    client_drops: u64,
}

#[derive(Default)]
struct PendingQueues {
    queues: HashMap<String, Vec<PendingAttach>>,
    total: usize,
}

/// Concurrency-safe session directory
#[derive(Default)]
pub struct CallSessionRegistry {
    sessions: Mutex<HashMap<String, CallSession>>,
    pending: Mutex<PendingQueues>,
    unknown_drops: AtomicU64,
}

impl CallSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the provider connection for a call.
    ///
    /// Creates the session in `Connecting` state and drains any attach
    /// requests that were queued while the call had no session yet. At
    /// most one provider connection may own a call at a time.
    pub fn register(
        &self,
        call_id: &str,
        provider_tx: mpsc::Sender<ProviderMessageRoute>,
        format: NegotiatedFormat,
    ) -> Result<(), RelayError> {
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(call_id) {
                return Err(RelayError::SessionExists(call_id.to_string()));
            }
            sessions.insert(
                call_id.to_string(),
                CallSession {
                    provider_tx,
                    clients: Vec::new(),
                    format,
                    state: SessionState::Connecting,
                    inbound_seq: 0,
                    outbound_seq: 0,
                    egress_drops: 0,
                    client_drops: 0,
                },
            );
        }

        // Drain attaches parked before the start event arrived. Ready
        // notifications fire outside both locks.
        let drained = {
            let mut guard = self.pending.lock();
            let pending = &mut *guard;
            match pending.queues.remove(call_id) {
                Some(queue) => {
                    pending.total -= queue.len();
                    queue
                }
                None => Vec::new(),
            }
        };

        if !drained.is_empty() {
            debug!(
                call_id = %call_id,
                count = drained.len(),
                "Draining queued client attaches into new session"
            );
            let mut ready = Vec::with_capacity(drained.len());
            {
                let mut sessions = self.sessions.lock();
                if let Some(session) = sessions.get_mut(call_id) {
                    for attach in drained {
                        if !session.clients.iter().any(|c| c.id == attach.client.id) {
                            session.clients.push(attach.client.clone());
                        }
                        ready.push(attach.ready);
                    }
                }
            }
            for tx in ready {
                let _ = tx.send(format);
            }
        }

        Ok(())
    }

    /// Mark a registered session as actively streaming.
    pub fn mark_streaming(&self, call_id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        sessions
            .get_mut(call_id)
            .map(|s| s.state.advance(SessionState::Streaming))
            .unwrap_or(false)
    }

    /// Attach a client connection to an existing session.
    ///
    /// Duplicate attaches of the same client id are tolerated. A session
    /// that is already draining counts as not found: there is nothing left
    /// to attach to.
    pub fn attach_client(
        &self,
        call_id: &str,
        client: ClientHandle,
    ) -> Result<NegotiatedFormat, RelayError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(call_id)
            .filter(|s| s.state < SessionState::Draining)
            .ok_or_else(|| RelayError::SessionNotFound(call_id.to_string()))?;

        if !session.clients.iter().any(|c| c.id == client.id) {
            session.clients.push(client);
        }
        Ok(session.format)
    }

    /// Queue an attach request for a call that has no session yet.
    ///
    /// The queue is bounded per call and globally; a full queue rejects
    /// the attach rather than parking it silently.
    pub fn enqueue_attach(&self, call_id: &str, attach: PendingAttach) -> Result<(), RelayError> {
        let mut guard = self.pending.lock();
        let pending = &mut *guard;
        if pending.total >= MAX_PENDING_ATTACH_TOTAL {
            return Err(RelayError::AttachQueueFull(call_id.to_string()));
        }
        let queue = pending.queues.entry(call_id.to_string()).or_default();
        if queue.len() >= MAX_PENDING_ATTACH_PER_CALL {
            return Err(RelayError::AttachQueueFull(call_id.to_string()));
        }
        queue.push(attach);
        pending.total += 1;
        Ok(())
    }

    /// Remove a queued attach, typically after its grace window expired or
    /// the client disconnected while waiting.
    pub fn cancel_pending(&self, call_id: &str, client_id: Uuid) {
        let mut guard = self.pending.lock();
        let pending = &mut *guard;
        if let Some(queue) = pending.queues.get_mut(call_id) {
            let before = queue.len();
            queue.retain(|a| a.client.id != client_id);
            let removed = before - queue.len();
            let now_empty = queue.is_empty();
            pending.total -= removed;
            if now_empty {
                pending.queues.remove(call_id);
            }
        }
    }

    /// Detach a client connection. The session itself stays alive: a call
    /// with no attached clients keeps streaming into the accumulator.
    pub fn detach_client(&self, call_id: &str, client_id: Uuid) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(call_id) {
            session.clients.retain(|c| c.id != client_id);
        }
    }

    /// Resolve forwarding targets for an inbound media frame and record
    /// its sequence number. Returns `None` (counted) when the session is
    /// gone, which can happen in the window between stop and socket close.
    pub fn inbound_targets(
        &self,
        call_id: &str,
        seq: Option<u64>,
    ) -> Option<Vec<mpsc::Sender<ClientMessageRoute>>> {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(call_id) {
            Some(session) => {
                session.inbound_seq = seq.unwrap_or(session.inbound_seq + 1);
                Some(session.clients.iter().map(|c| c.tx.clone()).collect())
            }
            None => {
                self.unknown_drops.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Record the sequence number of an outbound-track frame.
    pub fn note_outbound(&self, call_id: &str, seq: Option<u64>) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(call_id) {
            session.outbound_seq = seq.unwrap_or(session.outbound_seq + 1);
        }
    }

    /// Count a frame dropped because a client channel was full.
    pub fn note_client_drop(&self, call_id: &str) -> u64 {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(call_id) {
            Some(session) => {
                session.client_drops += 1;
                session.client_drops
            }
            None => 0,
        }
    }

    /// Resolve the reverse path for browser audio toward the provider.
    pub fn egress_route(&self, call_id: &str) -> EgressRoute {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(call_id) {
            Some(session) if session.state == SessionState::Streaming => EgressRoute::Ready {
                tx: session.provider_tx.clone(),
                codec: session.format.codec,
            },
            Some(session) => {
                session.egress_drops += 1;
                EgressRoute::NotReady {
                    dropped: session.egress_drops,
                }
            }
            None => {
                let dropped = self.unknown_drops.fetch_add(1, Ordering::Relaxed) + 1;
                EgressRoute::NotFound { dropped }
            }
        }
    }

    /// Remove a session. Idempotent: the second call for the same id is a
    /// no-op returning `None`. The attached client handles are handed back
    /// so the caller can notify and close them outside the lock.
    pub fn unregister(&self, call_id: &str) -> Option<SessionTeardown> {
        let mut sessions = self.sessions.lock();
        sessions.remove(call_id).map(|mut session| {
            session.state.advance(SessionState::Closed);
            SessionTeardown {
                clients: session.clients,
            }
        })
    }

    /// Read-only view of one session.
    pub fn lookup(&self, call_id: &str) -> Option<SessionSnapshot> {
        let sessions = self.sessions.lock();
        sessions.get(call_id).map(|s| SessionSnapshot {
            state: s.state,
            format: s.format,
            client_count: s.clients.len(),
            inbound_seq: s.inbound_seq,
            outbound_seq: s.outbound_seq,
        })
    }

    /// Number of live sessions.
    pub fn active_session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Frames dropped because no session existed for their call.
    pub fn unknown_drop_count(&self) -> u64 {
        self.unknown_drops.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_chan() -> (
        mpsc::Sender<ProviderMessageRoute>,
        mpsc::Receiver<ProviderMessageRoute>,
    ) {
        mpsc::channel(8)
    }

    fn client_handle() -> (ClientHandle, mpsc::Receiver<ClientMessageRoute>) {
        let (tx, rx) = mpsc::channel(8);
        (
            ClientHandle {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    #[test]
    fn test_register_unregister_lookup() {
        let registry = CallSessionRegistry::new();
        let (tx, _rx) = provider_chan();

        registry
            .register("call-1", tx, NegotiatedFormat::default())
            .unwrap();
        assert!(registry.lookup("call-1").is_some());
        assert_eq!(registry.active_session_count(), 1);

        let teardown = registry.unregister("call-1");
        assert!(teardown.is_some());
        assert!(registry.lookup("call-1").is_none());

        // Second unregister is a no-op, not a panic or error.
        assert!(registry.unregister("call-1").is_none());
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let registry = CallSessionRegistry::new();
        let (tx1, _rx1) = provider_chan();
        let (tx2, _rx2) = provider_chan();

        registry
            .register("call-1", tx1, NegotiatedFormat::default())
            .unwrap();
        let err = registry
            .register("call-1", tx2, NegotiatedFormat::default())
            .unwrap_err();
        assert!(matches!(err, RelayError::SessionExists(_)));
    }

    #[test]
    fn test_attach_to_missing_session() {
        let registry = CallSessionRegistry::new();
        let (client, _rx) = client_handle();

        let err = registry.attach_client("call-1", client).unwrap_err();
        assert!(matches!(err, RelayError::SessionNotFound(_)));
    }

    #[test]
    fn test_attach_and_detach() {
        let registry = CallSessionRegistry::new();
        let (tx, _rx) = provider_chan();
        let format = NegotiatedFormat {
            codec: CompandingLaw::ALaw,
            ..NegotiatedFormat::default()
        };
        registry.register("call-1", tx, format).unwrap();

        let (client, _crx) = client_handle();
        let client_id = client.id;
        let got = registry.attach_client("call-1", client).unwrap();
        assert_eq!(got.codec, CompandingLaw::ALaw);
        assert_eq!(registry.lookup("call-1").unwrap().client_count, 1);

        registry.detach_client("call-1", client_id);
        assert_eq!(registry.lookup("call-1").unwrap().client_count, 0);

        // Detach is idempotent and the session survives without clients.
        registry.detach_client("call-1", client_id);
        assert!(registry.lookup("call-1").is_some());
    }

    #[test]
    fn test_duplicate_attach_tolerated() {
        let registry = CallSessionRegistry::new();
        let (tx, _rx) = provider_chan();
        registry
            .register("call-1", tx, NegotiatedFormat::default())
            .unwrap();

        let (client, _crx) = client_handle();
        registry.attach_client("call-1", client.clone()).unwrap();
        registry.attach_client("call-1", client).unwrap();
        assert_eq!(registry.lookup("call-1").unwrap().client_count, 1);
    }

    #[test]
    fn test_pending_attach_drained_on_register() {
        let registry = CallSessionRegistry::new();
        let (client, _crx) = client_handle();
        let (ready_tx, mut ready_rx) = oneshot::channel();

        registry
            .enqueue_attach(
                "call-1",
                PendingAttach {
                    client,
                    ready: ready_tx,
                },
            )
            .unwrap();
        assert!(ready_rx.try_recv().is_err());

        let (tx, _rx) = provider_chan();
        let format = NegotiatedFormat {
            codec: CompandingLaw::ALaw,
            ..NegotiatedFormat::default()
        };
        registry.register("call-1", tx, format).unwrap();

        let got = ready_rx.try_recv().expect("ready should have fired");
        assert_eq!(got.codec, CompandingLaw::ALaw);
        assert_eq!(registry.lookup("call-1").unwrap().client_count, 1);
    }

    #[test]
    fn test_pending_attach_queue_bounded() {
        let registry = CallSessionRegistry::new();

        for _ in 0..MAX_PENDING_ATTACH_PER_CALL {
            let (client, _crx) = client_handle();
            let (ready, _) = oneshot::channel();
            registry
                .enqueue_attach("call-1", PendingAttach { client, ready })
                .unwrap();
        }

        let (client, _crx) = client_handle();
        let (ready, _) = oneshot::channel();
        let err = registry
            .enqueue_attach("call-1", PendingAttach { client, ready })
            .unwrap_err();
        assert!(matches!(err, RelayError::AttachQueueFull(_)));
    }

    #[test]
    fn test_cancel_pending_removes_entry() {
        let registry = CallSessionRegistry::new();
        let (client, _crx) = client_handle();
        let client_id = client.id;
        let (ready, _) = oneshot::channel();
        registry
            .enqueue_attach("call-1", PendingAttach { client, ready })
            .unwrap();

        registry.cancel_pending("call-1", client_id);

        // Register drains nothing, so no client ends up attached.
        let (tx, _rx) = provider_chan();
        registry
            .register("call-1", tx, NegotiatedFormat::default())
            .unwrap();
        assert_eq!(registry.lookup("call-1").unwrap().client_count, 0);
    }

    #[test]
    fn test_egress_route_lifecycle() {
        let registry = CallSessionRegistry::new();

        assert!(matches!(
            registry.egress_route("call-1"),
            EgressRoute::NotFound { dropped: 1 }
        ));

        let (tx, _rx) = provider_chan();
        registry
            .register("call-1", tx, NegotiatedFormat::default())
            .unwrap();

        // Registered but not yet streaming: dropped with a count.
        assert!(matches!(
            registry.egress_route("call-1"),
            EgressRoute::NotReady { dropped: 1 }
        ));
        assert!(matches!(
            registry.egress_route("call-1"),
            EgressRoute::NotReady { dropped: 2 }
        ));

        registry.mark_streaming("call-1");
        assert!(matches!(
            registry.egress_route("call-1"),
            EgressRoute::Ready { .. }
        ));
    }

    #[test]
    fn test_inbound_targets_counts_unknown_calls() {
        let registry = CallSessionRegistry::new();
        assert!(registry.inbound_targets("call-x", Some(1)).is_none());
        assert_eq!(registry.unknown_drop_count(), 1);
    }

    #[test]
    fn test_inbound_seq_tracked() {
        let registry = CallSessionRegistry::new();
        let (tx, _rx) = provider_chan();
        registry
            .register("call-1", tx, NegotiatedFormat::default())
            .unwrap();

        registry.inbound_targets("call-1", Some(5));
        assert_eq!(registry.lookup("call-1").unwrap().inbound_seq, 5);

        // Missing sequence numbers fall back to a local increment.
        registry.inbound_targets("call-1", None);
        assert_eq!(registry.lookup("call-1").unwrap().inbound_seq, 6);
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        let mut state = SessionState::Connecting;
        assert!(state.advance(SessionState::Streaming));
        assert!(!state.advance(SessionState::Connecting));
        assert_eq!(state, SessionState::Streaming);

        assert!(state.advance(SessionState::Draining));
        assert!(state.advance(SessionState::Closed));
        assert!(!state.advance(SessionState::Streaming));
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn test_unregister_returns_attached_clients() {
        let registry = CallSessionRegistry::new();
        let (tx, _rx) = provider_chan();
        registry
            .register("call-1", tx, NegotiatedFormat::default())
            .unwrap();

        let (client, _crx) = client_handle();
        registry.attach_client("call-1", client).unwrap();

        let teardown = registry.unregister("call-1").unwrap();
        assert_eq!(teardown.clients.len(), 1);
    }
}
