//! Media endpoint contract: local audio capture and remote audio rendering.

use crate::{error::MediaCaptureError, events::EventSink};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A block of mono, signed 16-bit PCM samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// A live microphone stream owned by the current session attempt.
pub trait LocalAudio: Send {
    /// Hands out the frame stream. Returns `None` once it has been taken.
    fn take_frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>>;

    /// Stops capturing and releases the device. Calling it again is a no-op.
    fn stop(&mut self);
}

/// Audio arriving from the remote peer.
#[derive(Debug)]
pub struct RemoteAudio {
    pub frames: mpsc::Receiver<AudioFrame>,
}

/// An active render of a [`RemoteAudio`] stream.
pub trait Playback: Send {
    /// Stops rendering. Calling it again is a no-op.
    fn stop(&mut self);
}

/// The host platform's audio capabilities.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Opens the default microphone.
    async fn capture_local_audio(&self) -> Result<Box<dyn LocalAudio>, MediaCaptureError>;

    /// Starts rendering `stream`. When the stream runs dry the renderer emits
    /// [`SessionEvent::PlaybackEnded`](crate::events::SessionEvent::PlaybackEnded)
    /// through `events`.
    fn render_remote_stream(&self, stream: RemoteAudio, events: EventSink) -> Box<dyn Playback>;
}
