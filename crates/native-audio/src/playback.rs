//! Speaker playback of remote audio.

use crate::resample::{StreamResampler, convert_i16_to_f32};
use charla_core::{
    events::{EventSink, SessionEvent},
    media::{AudioFrame, Playback, RemoteAudio},
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
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A running render of one remote stream.
pub struct CpalPlayback {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalPlayback {
    /// Plays `stream` on the default output device. [`SessionEvent::PlaybackEnded`]
    /// is emitted once the stream has closed and every buffered sample was played,
    /// or right away when no output device can be opened.
    pub fn start(stream: RemoteAudio, events: EventSink) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("charla-playback".to_string())
            .spawn(move || playback_thread(stream, events, thread_stop));

        match thread {
            Ok(thread) => Self {
                stop,
                thread: Some(thread),
            },
            Err(e) => {
                error!(error = %e, "Failed to spawn playback thread.");
                Self { stop, thread: None }
            }
        }
    }
}

impl Playback for CpalPlayback {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            crate::join_worker(thread, "playback");
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        Playback::stop(self);
    }
}

fn open_output(
    consumer: HeapCons<f32>,
    played: Arc<AtomicUsize>,
) -> Result<(cpal::Stream, u32), String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no audio output device is available".to_string())?;
    let supported = device.default_output_config().map_err(|e| e.to_string())?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let stream = match sample_format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, consumer, played),
        SampleFormat::I16 => build_output::<i16>(&device, &config, consumer, played),
        SampleFormat::U16 => build_output::<u16>(&device, &config, consumer, played),
        other => return Err(format!("unsupported sample format: {}", other)),
    }
    .map_err(|e| e.to_string())?;
    stream.play().map_err(|e| e.to_string())?;
    Ok((stream, config.sample_rate.0))
}

/// Copies mono samples to every output channel, padding underruns with silence.
fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: HeapCons<f32>,
    played: Arc<AtomicUsize>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels);
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut popped = 0;
            for frame in data.chunks_mut(channels) {
                let sample = consumer.try_pop().inspect(|_| popped += 1);
                frame.fill(T::from_sample(sample.unwrap_or(0.0)));
            }
            played.fetch_add(popped, Ordering::Release);
        },
        |e| warn!(error = %e, "Output stream error."),
        None,
    )
}

fn playback_thread(stream: RemoteAudio, events: EventSink, stop: Arc<AtomicBool>) {
    // Two seconds at 48 kHz.
    let (producer, consumer) = HeapRb::<f32>::new(96_000).split();
    let played = Arc::new(AtomicUsize::new(0));
    let (output, device_rate) = match open_output(consumer, Arc::clone(&played)) {
        Ok(opened) => opened,
        Err(e) => {
            error!(error = %e, "Cannot play remote audio.");
            events.emit(SessionEvent::PlaybackEnded);
            return;
        }
    };
    info!(device_rate, "Remote audio playback started.");

    if render(stream, producer, &played, device_rate, &stop) {
        debug!("Remote stream ended.");
        events.emit(SessionEvent::PlaybackEnded);
    }
    drop(output);
}

/// Moves remote frames into the output buffer. Returns `true` when the remote
/// stream ended and `played` caught up with everything pushed, `false` when
/// stopped.
fn render(
    mut stream: RemoteAudio,
    mut producer: HeapProd<f32>,
    played: &AtomicUsize,
    device_rate: u32,
    stop: &AtomicBool,
) -> bool {
    let mut resampler: Option<(u32, StreamResampler)> = None;
    let mut pushed = 0;

    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        match stream.frames.try_recv() {
            Ok(frame) => {
                let samples = resample(&mut resampler, &frame, device_rate);
                if !push_all(&mut producer, &samples, stop) {
                    return false;
                }
                pushed += samples.len();
            }
            Err(TryRecvError::Empty) => std::thread::sleep(POLL_INTERVAL),
            Err(TryRecvError::Disconnected) => break,
        }
    }

    while played.load(Ordering::Acquire) < pushed {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    true
}

fn resample(
    resampler: &mut Option<(u32, StreamResampler)>,
    frame: &AudioFrame,
    device_rate: u32,
) -> Vec<f32> {
    let input = convert_i16_to_f32(&frame.samples);
    if !matches!(resampler, Some((rate, _)) if *rate == frame.sample_rate) {
        let chunk_size = (frame.sample_rate / 50).max(1) as usize;
        match StreamResampler::new(frame.sample_rate, device_rate, chunk_size) {
            Ok(created) => *resampler = Some((frame.sample_rate, created)),
            Err(e) => {
                warn!(error = %e, rate = frame.sample_rate, "Cannot resample remote frame.");
                return Vec::new();
            }
        }
    }
    match resampler {
        Some((_, resampler)) => resampler.process(&input),
        None => Vec::new(),
    }
}

/// Waits for room in the output buffer. Returns `false` if stopped meanwhile.
fn push_all(producer: &mut HeapProd<f32>, mut samples: &[f32], stop: &AtomicBool) -> bool {
    while !samples.is_empty() {
        let written = producer.push_slice(samples);
        samples = &samples[written..];
        if !samples.is_empty() {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_render_drains_buffer_and_reports_end() {
        let (tx, frames) = mpsc::channel(4);
        tx.try_send(AudioFrame {
            samples: vec![1_000; 160],
            sample_rate: 8_000,
        })
        .unwrap();
        drop(tx);

        let (producer, mut consumer) = HeapRb::<f32>::new(1_024).split();
        let stop = Arc::new(AtomicBool::new(false));
        let played = Arc::new(AtomicUsize::new(0));

        // Stand-in for the output callback.
        let reader_stop = Arc::clone(&stop);
        let reader_played = Arc::clone(&played);
        let reader = std::thread::spawn(move || {
            while !reader_stop.load(Ordering::Acquire) {
                if consumer.try_pop().is_some() {
                    reader_played.fetch_add(1, Ordering::Release);
                } else {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        });

        assert!(render(RemoteAudio { frames }, producer, &played, 8_000, &stop));
        stop.store(true, Ordering::Release);
        reader.join().unwrap();
        assert_eq!(played.load(Ordering::Acquire), 160);
    }

    #[test]
    fn test_render_stops_on_request() {
        let (_tx, frames) = mpsc::channel::<AudioFrame>(4);
        let (producer, _consumer) = HeapRb::<f32>::new(16).split();
        let stop = AtomicBool::new(true);
        let played = AtomicUsize::new(0);

        assert!(!render(RemoteAudio { frames }, producer, &played, 8_000, &stop));
    }

    #[test]
    fn test_push_all_gives_up_when_stopped() {
        let (mut producer, _consumer) = HeapRb::<f32>::new(4).split();
        let stop = AtomicBool::new(true);
        assert!(!push_all(&mut producer, &[0.0; 8], &stop));
    }
}
