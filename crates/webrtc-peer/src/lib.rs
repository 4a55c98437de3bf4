//! WebRTC transport for realtime voice sessions, built on `webrtc-rs`.
//!
//! [`WebRtcConnector`] creates peer connections that negotiate a single PCMU
//! audio track in both directions plus the reliable control data channel.
//! Every callback the library fires is forwarded into the session as a
//! [`SessionEvent`].

pub mod g711;

use async_trait::async_trait;
use bytes::Bytes;
use charla_core::{
    error::{ControlChannelError, NegotiationError},
    events::{EventSink, SessionEvent, TransportState},
    media::{AudioFrame, RemoteAudio},
    peer::{PeerConnection, PeerConnector, SdpKind, SessionDescription},
    protocol::ControlChannel,
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use webrtc::{
    api::{
        APIBuilder, interceptor_registry::register_default_interceptors,
        media_engine::{MIME_TYPE_PCMU, MediaEngine},
    },
    data_channel::{
        RTCDataChannel, data_channel_message::DataChannelMessage,
        data_channel_state::RTCDataChannelState,
    },
    ice_transport::ice_server::RTCIceServer,
    interceptor::registry::Registry,
    media::Sample,
    peer_connection::{
        RTCPeerConnection, configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
    rtp_transceiver::{
        RTCRtpTransceiver,
        rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
    },
    track::{
        track_local::{TrackLocal, track_local_static_sample::TrackLocalStaticSample},
        track_remote::TrackRemote,
    },
};

/// Clock rate of the PCMU codec; local frames must be captured at this rate.
pub const PCMU_SAMPLE_RATE: u32 = 8_000;

const PCMU_PAYLOAD_TYPE: u8 = 0;
const REMOTE_FRAME_BUFFER: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct WebRtcConfig {
    /// STUN/TURN URLs, e.g. `stun:stun.l.google.com:19302`.
    pub ice_servers: Vec<String>,
}

fn peer_error(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Peer(e.to_string())
}

fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: PCMU_SAMPLE_RATE,
        channels: 1,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

fn transport_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

/// Creates [`WebRtcConnection`]s.
pub struct WebRtcConnector {
    config: WebRtcConfig,
}

impl WebRtcConnector {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    async fn new_peer_connection(&self) -> Result<RTCPeerConnection, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: pcmu_capability(),
                payload_type: PCMU_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.config.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        api.new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn open(
        &self,
        channel_label: &str,
        events: EventSink,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError> {
        let pc = Arc::new(self.new_peer_connection().await.map_err(peer_error)?);

        match prepare(&pc, channel_label, events).await {
            Ok((channel, track)) => {
                debug!(label = %channel_label, "WebRTC peer connection created.");
                Ok(Box::new(WebRtcConnection {
                    pc,
                    channel: DataChannelHandle { channel },
                    track,
                    pump: None,
                }))
            }
            Err(e) => {
                // Closing stops the sender, which also ends the RTCP drain task.
                if let Err(close_err) = pc.close().await {
                    debug!(error = %close_err, "Peer connection close after setup failure failed.");
                }
                Err(peer_error(e))
            }
        }
    }
}

/// Registers the callbacks, the outbound audio track and the control channel.
async fn prepare(
    pc: &Arc<RTCPeerConnection>,
    channel_label: &str,
    events: EventSink,
) -> Result<(Arc<RTCDataChannel>, Arc<TrackLocalStaticSample>), webrtc::Error> {
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        sink.emit(SessionEvent::TransportStateChanged(transport_state(state)));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let (tx, frames) = mpsc::channel(REMOTE_FRAME_BUFFER);
            sink.emit(SessionEvent::RemoteTrack(RemoteAudio { frames }));
            tokio::spawn(receive_remote_audio(track, tx));
            Box::pin(async {})
        },
    ));

    let track = Arc::new(TrackLocalStaticSample::new(
        pcmu_capability(),
        "audio".to_owned(),
        "charla".to_owned(),
    ));
    let sender = pc
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    // RTCP has to be drained for the interceptors to make progress.
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });

    let channel = pc.create_data_channel(channel_label, None).await?;
    wire_data_channel(&channel, events);
    Ok((channel, track))
}

fn wire_data_channel(channel: &Arc<RTCDataChannel>, events: EventSink) {
    let sink = events.clone();
    channel.on_open(Box::new(move || {
        sink.emit(SessionEvent::ChannelOpened);
        Box::pin(async {})
    }));

    let sink = events.clone();
    channel.on_close(Box::new(move || {
        sink.emit(SessionEvent::ChannelClosed);
        Box::pin(async {})
    }));

    channel.on_message(Box::new(move |message: DataChannelMessage| {
        match String::from_utf8(message.data.to_vec()) {
            Ok(text) => events.emit(SessionEvent::ChannelMessage(text)),
            Err(e) => warn!(error = %e, "Dropping non UTF-8 data channel message."),
        }
        Box::pin(async {})
    }));
}

/// Decodes inbound RTP into PCM frames until the track ends.
async fn receive_remote_audio(track: Arc<TrackRemote>, frames: mpsc::Sender<AudioFrame>) {
    info!(ssrc = track.ssrc(), "Remote audio track started.");
    while let Ok((packet, _)) = track.read_rtp().await {
        let frame = AudioFrame {
            samples: g711::decode(&packet.payload),
            sample_rate: PCMU_SAMPLE_RATE,
        };
        if frames.send(frame).await.is_err() {
            break;
        }
    }
    debug!("Remote audio track ended.");
}

/// Encodes local PCM frames onto the outbound track.
async fn send_local_audio(track: Arc<TrackLocalStaticSample>, mut frames: mpsc::Receiver<AudioFrame>) {
    while let Some(frame) = frames.recv().await {
        if frame.sample_rate != PCMU_SAMPLE_RATE {
            warn!(rate = frame.sample_rate, "Dropping local frame with a non-PCMU sample rate.");
            continue;
        }
        let duration =
            Duration::from_secs_f64(frame.samples.len() as f64 / f64::from(PCMU_SAMPLE_RATE));
        let sample = Sample {
            data: Bytes::from(g711::encode(&frame.samples)),
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            warn!(error = %e, "Failed to write local audio sample.");
        }
    }
    debug!("Local audio stream ended.");
}

/// The control data channel of a [`WebRtcConnection`].
pub struct DataChannelHandle {
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl ControlChannel for DataChannelHandle {
    fn is_open(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, payload: String) -> Result<(), ControlChannelError> {
        self.channel
            .send_text(payload)
            .await
            .map(|_| ())
            .map_err(|e| ControlChannelError(e.to_string()))
    }
}

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    channel: DataChannelHandle,
    track: Arc<TrackLocalStaticSample>,
    pump: Option<JoinHandle<()>>,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn attach_local_audio(
        &mut self,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<(), NegotiationError> {
        if let Some(previous) = self.pump.replace(tokio::spawn(send_local_audio(
            Arc::clone(&self.track),
            frames,
        ))) {
            previous.abort();
        }
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(peer_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let description = RTCSessionDescription::offer(offer.sdp).map_err(peer_error)?;

        // Non-trickle: the offer sent to the server must carry every candidate.
        let mut gathering = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(description)
            .await
            .map_err(peer_error)?;
        let _ = gathering.recv().await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| NegotiationError::Peer("no local description".to_string()))?;
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn set_remote_description(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if answer.kind != SdpKind::Answer {
            return Err(NegotiationError::InvalidAnswer(
                "remote description is not an answer".to_string(),
            ));
        }
        let description = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| NegotiationError::InvalidAnswer(e.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| NegotiationError::InvalidAnswer(e.to_string()))
    }

    fn control_channel(&self) -> &dyn ControlChannel {
        &self.channel
    }

    async fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Err(e) = self.channel.channel.close().await {
            debug!(error = %e, "Data channel close failed.");
        }
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Peer connection close failed.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_carries_pcmu_audio_and_data_channel() {
        let (sink, _events) = EventSink::channel();
        let connector = WebRtcConnector::new(WebRtcConfig::default());
        let mut connection = connector.open("oai-events", sink).await.unwrap();

        let offer = connection.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("PCMU/8000"));
        assert!(offer.sdp.contains("m=application"));

        // Not negotiated yet, so nothing can be written.
        assert!(!connection.control_channel().is_open());
        connection.close().await;
    }

    #[tokio::test]
    async fn test_offer_is_rejected_as_answer() {
        let (sink, _events) = EventSink::channel();
        let connector = WebRtcConnector::new(WebRtcConfig::default());
        let mut connection = connector.open("oai-events", sink).await.unwrap();

        let err = connection
            .set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidAnswer(_)));
        connection.close().await;
    }

    #[test]
    fn test_transport_state_mapping() {
        assert_eq!(
            transport_state(RTCPeerConnectionState::Disconnected),
            TransportState::Disconnected
        );
        assert_eq!(
            transport_state(RTCPeerConnectionState::Unspecified),
            TransportState::New
        );
    }
}
