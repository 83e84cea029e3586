//! Call session tracking
//!
//! One `CallSession` per active phone call, owned by the
//! [`CallSessionRegistry`]. All cross-task coordination between the
//! provider leg, the browser leg(s) and teardown goes through the
//! registry's synchronized API; there is no ambient shared state.

mod registry;

pub use registry::{
    CallSessionRegistry, ClientHandle, EgressRoute, NegotiatedFormat, PendingAttach,
    SessionSnapshot, SessionState, SessionTeardown, MAX_PENDING_ATTACH_PER_CALL,
    MAX_PENDING_ATTACH_TOTAL,
};
