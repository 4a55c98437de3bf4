//! Peer Connection Controller
//!
//! Drives one offer/answer negotiation and reports transport health. The
//! controller itself is library-agnostic; the WebRTC implementation sits behind
//! [`PeerConnector`] / [`PeerConnection`], and the HTTP leg of the exchange
//! behind [`SdpExchange`].

use crate::{
    broker::SessionCredential,
    error::NegotiationError,
    events::{EventSink, TransportState},
    media::AudioFrame,
    protocol::{CONTROL_CHANNEL_LABEL, ControlChannel},
};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description (SDP) together with its role in the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One transport object created by a [`PeerConnector`].
///
/// Backends report asynchronous happenings (channel open/close, messages,
/// state changes, remote tracks) through the [`EventSink`] they were opened
/// with, never by calling back into the session.
#[async_trait]
pub trait PeerConnection: Send {
    /// Binds captured audio to the outbound media path.
    async fn attach_local_audio(
        &mut self,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<(), NegotiationError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError>;

    /// Installs `offer` and returns the description to transmit, which may
    /// carry gathered candidates the original offer did not.
    async fn set_local_description(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn set_remote_description(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError>;

    fn control_channel(&self) -> &dyn ControlChannel;

    /// Releases the transport, stops outbound tracks and closes the channel.
    async fn close(&mut self);
}

/// Factory for [`PeerConnection`]s.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Creates a transport with a control channel named `channel_label` and
    /// a handler for remote media.
    async fn open(
        &self,
        channel_label: &str,
        events: EventSink,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError>;
}

/// Transmits a local offer and returns the remote answer SDP.
#[async_trait]
pub trait SdpExchange: Send + Sync {
    async fn exchange(
        &self,
        credential: &SessionCredential,
        offer_sdp: String,
    ) -> Result<String, NegotiationError>;
}

/// [`SdpExchange`] over HTTP: `POST` of the raw offer, bearer-authenticated.
pub struct HttpSdpExchange {
    client: reqwest::Client,
}

impl HttpSdpExchange {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SdpExchange for HttpSdpExchange {
    async fn exchange(
        &self,
        credential: &SessionCredential,
        offer_sdp: String,
    ) -> Result<String, NegotiationError> {
        let response = self
            .client
            .post(&credential.negotiation_url)
            .bearer_auth(credential.token.expose_secret())
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer_sdp)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(NegotiationError::TransportRejected {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Err(NegotiationError::InvalidAnswer(
                "empty answer body".to_string(),
            ));
        }
        Ok(body)
    }
}

/// Owns the connection handle of the current attempt.
pub struct PeerController {
    connector: Arc<dyn PeerConnector>,
    exchange: Arc<dyn SdpExchange>,
    handle: Option<Box<dyn PeerConnection>>,
    last_transport_state: Option<TransportState>,
}

impl PeerController {
    pub fn new(connector: Arc<dyn PeerConnector>, exchange: Arc<dyn SdpExchange>) -> Self {
        Self {
            connector,
            exchange,
            handle: None,
            last_transport_state: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Creates a fresh transport. Any previous handle is closed first.
    pub async fn open(&mut self, events: EventSink) -> Result<(), NegotiationError> {
        self.close().await;
        let connection = self.connector.open(CONTROL_CHANNEL_LABEL, events).await?;
        debug!("Peer connection created.");
        self.handle = Some(connection);
        self.last_transport_state = None;
        Ok(())
    }

    pub async fn attach_local_audio(
        &mut self,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<(), NegotiationError> {
        let connection = self.handle.as_mut().ok_or(NegotiationError::NotOpen)?;
        connection.attach_local_audio(frames).await
    }

    /// Runs the offer/answer exchange against `credential.negotiation_url`.
    #[instrument(name = "negotiate", skip_all, fields(url = %credential.negotiation_url))]
    pub async fn negotiate(
        &mut self,
        credential: &SessionCredential,
    ) -> Result<(), NegotiationError> {
        let connection = self.handle.as_mut().ok_or(NegotiationError::NotOpen)?;

        let offer = connection.create_offer().await?;
        let local = connection.set_local_description(offer).await?;
        debug!(sdp_bytes = local.sdp.len(), "Local description installed.");

        let answer = self.exchange.exchange(credential, local.sdp).await?;
        connection
            .set_remote_description(SessionDescription::answer(answer))
            .await?;
        info!("Negotiation complete.");
        Ok(())
    }

    /// Records a transport state report. Returns `true` only when it differs
    /// from the previous report, so each transition is surfaced once.
    pub fn observe_transition(&mut self, state: TransportState) -> bool {
        if self.last_transport_state == Some(state) {
            return false;
        }
        debug!(?state, "Transport state changed.");
        self.last_transport_state = Some(state);
        true
    }

    pub fn control_channel(&self) -> Option<&dyn ControlChannel> {
        self.handle.as_ref().map(|connection| connection.control_channel())
    }

    /// Closes the current handle, if any. A second call is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut connection) = self.handle.take() {
            connection.close().await;
            info!("Peer connection closed.");
        }
        self.last_transport_state = None;
    }
}
