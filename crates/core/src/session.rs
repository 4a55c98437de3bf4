//! Session Manager
//!
//! The root state machine of a realtime voice session. It sequences startup
//! (credential, microphone, peer connection, negotiation), applies every
//! asynchronous event through a single [`SessionManager::apply`] entry point,
//! and tears the attempt down on stop, on channel close and on transport
//! failure.
//!
//! All mutation goes through `&mut self`, so there is no locking here; backends
//! talk to the manager only through the attempt's [`EventSink`].

use crate::{
    broker::{SessionBroker, SessionCredential},
    error::StartError,
    events::{EventSink, SessionEvent},
    media::{LocalAudio, MediaEndpoint, Playback, RemoteAudio},
    peer::PeerController,
    protocol::{self, ChannelEvent, OutboundEvent},
    tools::ToolDispatcher,
};
use std::{future::Future, sync::Arc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// Marks tool output in [`SessionState::last_response`] so it reads apart from model text.
pub const TOOL_RESPONSE_PREFIX: &str = "Respuesta de la herramienta: ";

/// Lifecycle phase of the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed,
    Stopped,
}

impl SessionPhase {
    /// `true` while an attempt is being set up or is live.
    pub fn is_active(self) -> bool {
        matches!(self, SessionPhase::Connecting | SessionPhase::Connected)
    }

    fn rank(self) -> u8 {
        match self {
            SessionPhase::Idle => 0,
            SessionPhase::Connecting => 1,
            SessionPhase::Connected => 2,
            SessionPhase::Failed => 3,
            SessionPhase::Stopped => 4,
        }
    }

    /// Phases only move forward within one attempt.
    fn can_advance_to(self, next: SessionPhase) -> bool {
        next.rank() > self.rank()
    }
}

/// Observable status of the session. The single source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// The microphone is being streamed to the peer.
    pub recording: bool,
    /// Remote audio is being played back.
    pub speaking: bool,
    pub last_transcript: String,
    pub last_response: String,
    /// Human-readable reason of the last failed attempt.
    pub error: Option<String>,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.phase == SessionPhase::Connected
    }
}

/// Requests teardown of a [`SessionManager`] from another task.
///
/// A request interrupts a pending `start()` at its current await point (or, while
/// the connection is being opened, right after it exists); when
/// the session is already connected it is delivered through
/// [`SessionManager::next_event`] as [`SessionEvent::StopRequested`].
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<u64>>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

/// Resources owned by one `start()` cycle.
struct Attempt {
    sink: EventSink,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    credential: Option<SessionCredential>,
    local_audio: Option<Box<dyn LocalAudio>>,
    playback: Option<Box<dyn Playback>>,
}

/// Runs `fut` unless a stop is requested first.
async fn interruptible<F: Future>(cancel: &mut watch::Receiver<u64>, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.changed() => None,
        output = fut => Some(output),
    }
}

pub struct SessionManager {
    broker: Arc<dyn SessionBroker>,
    media: Arc<dyn MediaEndpoint>,
    controller: PeerController,
    dispatcher: ToolDispatcher,
    state: SessionState,
    status_tx: watch::Sender<SessionState>,
    stop_tx: Arc<watch::Sender<u64>>,
    stop_rx: watch::Receiver<u64>,
    attempt: Option<Attempt>,
}

impl SessionManager {
    /// Creates an idle manager. The tool registry is fixed for its lifetime.
    pub fn new(
        broker: Arc<dyn SessionBroker>,
        media: Arc<dyn MediaEndpoint>,
        controller: PeerController,
        dispatcher: ToolDispatcher,
    ) -> Self {
        let state = SessionState::default();
        let (status_tx, _) = watch::channel(state.clone());
        let (stop_tx, stop_rx) = watch::channel(0);
        Self {
            broker,
            media,
            controller,
            dispatcher,
            state,
            status_tx,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            attempt: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Receives a snapshot of [`SessionState`] after every observable change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.status_tx.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    /// Connects a new session.
    ///
    /// Does nothing while an attempt is connecting or connected. On success
    /// the phase is `Connected`; on failure every acquired resource is released
    /// and the phase is `Failed` with [`SessionState::error`] set.
    #[instrument(name = "session_start", skip_all)]
    pub async fn start(&mut self) {
        if self.state.phase.is_active() {
            debug!(phase = ?self.state.phase, "Start ignored: an attempt is already in progress.");
            return;
        }

        // The previous attempt is destroyed completely before a new one is built.
        self.release_resources().await;
        self.stop_rx.borrow_and_update();
        self.state = SessionState::default();
        self.advance(SessionPhase::Connecting);
        self.publish();

        let (sink, events) = EventSink::channel();
        self.attempt = Some(Attempt {
            sink: sink.clone(),
            events,
            credential: None,
            local_audio: None,
            playback: None,
        });

        let mut cancel = self.stop_rx.clone();
        let outcome = match self.establish(sink, &mut cancel).await {
            Ok(()) if self.stop_rx.has_changed().unwrap_or(false) => Err(StartError::Cancelled),
            other => other,
        };
        self.stop_rx.borrow_and_update();

        match outcome {
            Ok(()) => {
                self.state.recording = true;
                self.advance(SessionPhase::Connected);
                self.publish();
                info!("Session connected.");
            }
            Err(StartError::Cancelled) => {
                info!("Stop requested during startup; tearing down.");
                self.teardown(SessionPhase::Stopped).await;
            }
            Err(e) => {
                error!(error = %e, "Session startup failed.");
                self.release_resources().await;
                self.state.error = Some(e.to_string());
                self.settle(SessionPhase::Failed);
            }
        }
    }

    async fn establish(
        &mut self,
        sink: EventSink,
        cancel: &mut watch::Receiver<u64>,
    ) -> Result<(), StartError> {
        let broker = Arc::clone(&self.broker);
        let credential = interruptible(cancel, broker.acquire_session())
            .await
            .ok_or(StartError::Cancelled)??;

        let media = Arc::clone(&self.media);
        // If the capture future is dropped here, the endpoint releases the device.
        let mut local_audio = interruptible(cancel, media.capture_local_audio())
            .await
            .ok_or(StartError::Cancelled)??;
        let frames = local_audio.take_frames();
        self.hold_local_audio(local_audio);

        // Not raced against a stop: the controller must own whatever connection
        // `open` creates so that teardown can close it.
        self.controller.open(sink).await?;
        if cancel.has_changed().unwrap_or(false) {
            return Err(StartError::Cancelled);
        }

        match frames {
            Some(frames) => self.controller.attach_local_audio(frames).await?,
            None => warn!("Captured stream has no frames to attach."),
        }

        interruptible(cancel, self.controller.negotiate(&credential))
            .await
            .ok_or(StartError::Cancelled)??;

        if let Some(attempt) = self.attempt.as_mut() {
            attempt.credential = Some(credential);
        }
        Ok(())
    }

    fn hold_local_audio(&mut self, mut local_audio: Box<dyn LocalAudio>) {
        match self.attempt.as_mut() {
            Some(attempt) => attempt.local_audio = Some(local_audio),
            None => local_audio.stop(),
        }
    }

    /// Tears the session down. Idempotent; a no-op from `Idle` and `Stopped`.
    pub async fn stop(&mut self) {
        match self.state.phase {
            SessionPhase::Idle | SessionPhase::Stopped => {
                debug!(phase = ?self.state.phase, "Stop ignored: nothing to tear down.");
            }
            _ => {
                self.teardown(SessionPhase::Stopped).await;
                info!("Session stopped.");
            }
        }
    }

    /// Sends a user text message. A no-op unless connected.
    pub async fn send_text(&self, text: &str) {
        if !self.state.is_connected() {
            debug!("Send ignored: session is not connected.");
            return;
        }
        if let Some(channel) = self.controller.control_channel() {
            protocol::send(channel, &OutboundEvent::text(text)).await;
        }
    }

    /// Waits for the next event of the live attempt.
    ///
    /// Returns `None` when there is no attempt (never started, stopped or
    /// failed), which ends an event loop.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let attempt = self.attempt.as_mut()?;
        tokio::select! {
            biased;
            _ = self.stop_rx.changed() => Some(SessionEvent::StopRequested),
            event = attempt.events.recv() => event,
        }
    }

    /// Applies events until the attempt ends.
    pub async fn run(&mut self) {
        while let Some(event) = self.next_event().await {
            self.apply(event).await;
        }
    }

    /// The single entry point for asynchronous session events.
    pub async fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StopRequested => self.stop().await,
            SessionEvent::ChannelOpened => debug!("Control channel open."),
            SessionEvent::ChannelClosed => {
                if self.state.phase.is_active() {
                    info!("Control channel closed; tearing down.");
                    self.teardown(SessionPhase::Stopped).await;
                }
            }
            SessionEvent::ChannelMessage(raw) => self.handle_message(&raw),
            SessionEvent::TransportStateChanged(transport) => {
                if self.controller.observe_transition(transport)
                    && transport.is_fault()
                    && self.state.phase.is_active()
                {
                    warn!(state = ?transport, "Peer transport lost; tearing down.");
                    self.teardown(SessionPhase::Stopped).await;
                }
            }
            SessionEvent::RemoteTrack(stream) => self.attach_remote(stream),
            SessionEvent::PlaybackEnded => {
                if self.state.speaking {
                    self.state.speaking = false;
                    self.publish();
                }
            }
        }
    }

    fn handle_message(&mut self, raw: &str) {
        if !self.state.is_connected() {
            debug!("Dropping channel message received outside a connected session.");
            return;
        }
        match protocol::parse_inbound(raw) {
            Ok(Some(event)) => self.apply_channel_event(event),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Dropping malformed channel message."),
        }
    }

    fn apply_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Transcript { text } => {
                self.state.last_transcript = text;
                self.publish();
            }
            ChannelEvent::LlmResponse { text } => {
                self.state.last_response = text;
                self.publish();
            }
            ChannelEvent::Text { .. } => debug!("Ignoring inbound text message."),
            ChannelEvent::ToolCalls { calls } => {
                for call in &calls {
                    let response = self.dispatcher.dispatch(call);
                    self.state.last_response = format!("{}{}", TOOL_RESPONSE_PREFIX, response);
                    self.publish();
                }
            }
        }
    }

    fn attach_remote(&mut self, stream: RemoteAudio) {
        if !self.state.is_connected() {
            debug!("Ignoring remote track outside a connected session.");
            return;
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let playback = self.media.render_remote_stream(stream, attempt.sink.clone());
        if let Some(mut previous) = attempt.playback.replace(playback) {
            previous.stop();
        }
        self.state.speaking = true;
        self.publish();
        info!("Remote audio attached.");
    }

    async fn teardown(&mut self, phase: SessionPhase) {
        self.release_resources().await;
        self.settle(phase);
    }

    /// Closes the connection and stops every media resource of the attempt.
    async fn release_resources(&mut self) {
        let mut attempt = self.attempt.take();
        if let Some(mut playback) = attempt.as_mut().and_then(|a| a.playback.take()) {
            playback.stop();
        }
        self.controller.close().await;
        if let Some(mut local_audio) = attempt.as_mut().and_then(|a| a.local_audio.take()) {
            local_audio.stop();
        }
        // Dropping the attempt discards the credential and its event queue.
        drop(attempt);
    }

    /// Moves to a non-connected phase, clearing the flags that only hold while connected.
    fn settle(&mut self, phase: SessionPhase) {
        self.state.recording = false;
        self.state.speaking = false;
        self.advance(phase);
        self.publish();
    }

    fn advance(&mut self, next: SessionPhase) {
        let current = self.state.phase;
        if current == next {
            return;
        }
        if !current.can_advance_to(next) {
            warn!(from = ?current, to = ?next, "Rejected backwards phase transition.");
            return;
        }
        debug!(from = ?current, to = ?next, "Phase transition.");
        self.state.phase = next;
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.state.clone());
    }
}
