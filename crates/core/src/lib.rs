//! Charla Core
//!
//! Platform-independent pieces of a realtime voice session: the session broker
//! client, the peer connection controller, the control channel protocol, the
//! tool dispatcher and the session state machine that composes them.
//!
//! WebRTC and audio devices are reached only through the traits in [`peer`] and
//! [`media`], so the state machine can be driven by any backend (or by test
//! fakes).

pub mod broker;
pub mod error;
pub mod events;
pub mod jokes;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod tools;

#[cfg(test)]
mod test_support;

pub use broker::{HttpSessionBroker, SessionBroker, SessionCredential};
pub use events::{EventSink, SessionEvent, TransportState};
pub use session::{SessionManager, SessionPhase, SessionState, StopHandle};
pub use tools::{Tool, ToolCall, ToolDispatcher};
