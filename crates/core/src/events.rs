//! Events delivered into the session state machine.
//!
//! Every callback a transport or media backend fires (channel open/close,
//! inbound messages, connection state, remote tracks, playback end) is turned
//! into a [`SessionEvent`] and pushed through an [`EventSink`]. The session
//! manager consumes them one at a time through `apply`.

use crate::media::RemoteAudio;
use tokio::sync::mpsc;
use tracing::trace;

/// Health of the underlying peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Returns `true` for the states that require tearing the session down.
    pub fn is_fault(self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }
}

/// Something that happened to the current session attempt.
#[derive(Debug)]
pub enum SessionEvent {
    /// The control channel reached its open state.
    ChannelOpened,
    /// The control channel closed.
    ChannelClosed,
    /// A raw text message arrived on the control channel.
    ChannelMessage(String),
    /// The peer transport changed state.
    TransportStateChanged(TransportState),
    /// The remote side attached its audio stream.
    RemoteTrack(RemoteAudio),
    /// Playback of the remote stream reached its end.
    PlaybackEnded,
    /// A [`StopHandle`](crate::session::StopHandle) asked for teardown.
    StopRequested,
}

/// Sending half of one attempt's event queue.
///
/// Cheap to clone; safe to use from tokio tasks and from plain OS threads.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    /// Creates a fresh, unbounded event queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues an event. Events for an attempt that has already been torn down
    /// are discarded.
    pub fn emit(&self, event: SessionEvent) {
        if let Err(rejected) = self.tx.send(event) {
            trace!(event = ?rejected.0, "Dropping event for a finished session attempt.");
        }
    }
}
