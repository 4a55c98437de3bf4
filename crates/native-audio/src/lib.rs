//! Host audio for realtime sessions: microphone capture and speaker playback
//! through `cpal`, with `rubato` resampling between device and wire rates.

pub mod capture;
pub mod playback;
pub mod resample;

use async_trait::async_trait;
use capture::CpalCapture;
use charla_core::{
    error::MediaCaptureError,
    events::EventSink,
    media::{LocalAudio, MediaEndpoint, Playback, RemoteAudio},
};
use playback::CpalPlayback;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// [`MediaEndpoint`] backed by the default input and output devices.
pub struct CpalMediaEndpoint {
    capture_rate: u32,
}

impl CpalMediaEndpoint {
    /// `capture_rate` is the sample rate of the frames handed to the transport.
    pub fn new(capture_rate: u32) -> Self {
        Self { capture_rate }
    }
}

#[async_trait]
impl MediaEndpoint for CpalMediaEndpoint {
    async fn capture_local_audio(&self) -> Result<Box<dyn LocalAudio>, MediaCaptureError> {
        let capture = CpalCapture::start(self.capture_rate).await?;
        Ok(Box::new(capture))
    }

    fn render_remote_stream(&self, stream: RemoteAudio, events: EventSink) -> Box<dyn Playback> {
        Box::new(CpalPlayback::start(stream, events))
    }
}

/// Waits for an audio thread to exit after its stop flag was raised.
///
/// Inside a tokio runtime the join runs on the blocking pool so teardown never
/// stalls an async worker; outside one it happens inline.
pub(crate) fn join_worker(thread: JoinHandle<()>, name: &'static str) {
    let join = move || match thread.join() {
        Ok(()) => debug!(worker = name, "Audio thread exited."),
        Err(_) => warn!(worker = name, "Audio thread panicked."),
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}
