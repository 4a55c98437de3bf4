//! Microphone capture.
//!
//! `cpal::Stream` is not `Send`, so each capture owns a dedicated OS thread
//! that opens the device, drains the callback's ring buffer, resamples to the
//! target rate and hands out fixed-size frames.

use crate::resample::{StreamResampler, convert_f32_to_i16};
use charla_core::{
    error::MediaCaptureError,
    media::{AudioFrame, LocalAudio},
};
use cpal::{
    FromSample, Sample, SampleFormat, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Frames handed to the transport are 20 ms long.
const FRAMES_PER_SECOND: u32 = 50;
const FRAME_QUEUE: usize = 50;

/// A running microphone capture.
pub struct CpalCapture {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    frames: Option<mpsc::Receiver<AudioFrame>>,
}

impl CpalCapture {
    /// Opens the default input device and starts producing mono frames at
    /// `target_rate`.
    pub async fn start(target_rate: u32) -> Result<Self, MediaCaptureError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("charla-capture".to_string())
            .spawn(move || capture_thread(target_rate, thread_stop, frames_tx, ready_tx))
            .map_err(|e| MediaCaptureError::Device(e.to_string()))?;

        // Dropping `capture` stops the thread, also when this future is cancelled.
        let mut capture = Self {
            stop,
            thread: Some(thread),
            frames: Some(frames_rx),
        };
        match ready_rx.await {
            Ok(Ok(())) => Ok(capture),
            Ok(Err(e)) => {
                capture.stop();
                Err(e)
            }
            Err(_) => {
                capture.stop();
                Err(MediaCaptureError::Device(
                    "capture thread exited during setup".to_string(),
                ))
            }
        }
    }
}

impl LocalAudio for CpalCapture {
    fn take_frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.take()
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            crate::join_worker(thread, "capture");
            info!("Microphone capture stopped.");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        LocalAudio::stop(self);
    }
}

fn open_input(producer: HeapProd<f32>) -> Result<(cpal::Stream, u32), MediaCaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaCaptureError::NoInputDevice)?;
    let supported = device
        .default_input_config()
        .map_err(|e| MediaCaptureError::Device(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    debug!(
        device = %device.name().unwrap_or_default(),
        rate = config.sample_rate.0,
        channels = config.channels,
        format = %sample_format,
        "Opening input device."
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_input::<f32>(&device, &config, producer),
        SampleFormat::I16 => build_input::<i16>(&device, &config, producer),
        SampleFormat::U16 => build_input::<u16>(&device, &config, producer),
        other => return Err(MediaCaptureError::UnsupportedFormat(other.to_string())),
    }
    .map_err(|e| MediaCaptureError::Device(e.to_string()))?;
    stream
        .play()
        .map_err(|e| MediaCaptureError::Device(e.to_string()))?;
    Ok((stream, config.sample_rate.0))
}

/// Downmixes interleaved input to mono and feeds the ring buffer.
fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: HeapProd<f32>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels);
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                let sum: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
                // A full buffer means the reader fell behind; drop the newest audio.
                let _ = producer.try_push(sum / channels as f32);
            }
        },
        |e| warn!(error = %e, "Input stream error."),
        None,
    )
}

fn capture_thread(
    target_rate: u32,
    stop: Arc<AtomicBool>,
    frames: mpsc::Sender<AudioFrame>,
    ready: oneshot::Sender<Result<(), MediaCaptureError>>,
) {
    // One second of mono audio at any common device rate.
    let (producer, consumer) = HeapRb::<f32>::new(96_000).split();
    let (stream, device_rate) = match open_input(producer) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let resampler = match StreamResampler::new(device_rate, target_rate, (device_rate / 100) as usize) {
        Ok(resampler) => resampler,
        Err(e) => {
            let _ = ready.send(Err(MediaCaptureError::UnsupportedFormat(e.to_string())));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }
    info!(device_rate, target_rate, "Microphone capture started.");

    pump_frames(consumer, resampler, target_rate, &stop, &frames);
    drop(stream);
}

fn pump_frames(
    mut consumer: HeapCons<f32>,
    mut resampler: StreamResampler,
    target_rate: u32,
    stop: &AtomicBool,
    frames: &mpsc::Sender<AudioFrame>,
) {
    let frame_len = (target_rate / FRAMES_PER_SECOND) as usize;
    let mut scratch = vec![0.0f32; 8_192];
    let mut pending: Vec<i16> = Vec::with_capacity(frame_len * 2);

    while !stop.load(Ordering::Acquire) {
        let read = consumer.pop_slice(&mut scratch);
        if read == 0 {
            std::thread::sleep(POLL_INTERVAL);
            continue;
        }
        pending.extend(convert_f32_to_i16(&resampler.process(&scratch[..read])));

        while pending.len() >= frame_len {
            let frame = AudioFrame {
                samples: pending.drain(..frame_len).collect(),
                sample_rate: target_rate,
            };
            if let Err(e) = frames.try_send(frame) {
                trace!(error = %e, "Dropping microphone frame.");
            }
        }
    }
}
