//! Host audio output behind the [`AudioOutput`] seam.
//!
//! The playback queue only needs three things from the host: a clock, a way
//! to place samples at a point on that clock, and a way to drop everything
//! not yet played.  [`SpeakerOutput`] provides them on top of a `cpal`
//! output stream; [`SilentOutput`] is the no-device fallback.
//!
//! # Clock
//!
//! The timeline is laid out in 24 kHz source frames.  The output callback
//! pulls source frames off it in 10 ms steps and runs them through one
//! long-lived [`StreamResampler`] to reach the device rate.  The clock counts
//! source frames pulled, so it advances with the hardware and back-to-back
//! chunks land on adjacent frames whatever the device rate is:
//!
//! ```text
//! now() = pulled_source_frames / 24 000
//!
//! timeline: [seg A: frames 0..2400][seg B: 2400..4800] ...
//!                  ▲ pull position ─▶ StreamResampler ─▶ device buffer
//! ```

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc, Arc, Mutex,
};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use thiserror::Error;

use crate::audio::{ResamplerError, StreamResampler, PCM_SAMPLE_RATE};

// ---------------------------------------------------------------------------
// PlaybackError
// ---------------------------------------------------------------------------

/// Errors that can occur while opening the output device.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("no output device found on the default audio host")]
    NoDevice,

    #[error("failed to query default output config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("unsupported output sample format: {0:?}")]
    UnsupportedFormat(cpal::SampleFormat),

    #[error("output thread failed: {0}")]
    Thread(String),

    #[error(transparent)]
    Resampler(#[from] ResamplerError),
}

// ---------------------------------------------------------------------------
// AudioOutput trait
// ---------------------------------------------------------------------------

/// Scheduling surface of the host audio output.
pub trait AudioOutput: Send {
    /// Current position of the output clock.
    fn now(&self) -> Duration;

    /// Render `samples` (24 kHz mono) starting at `start` on the output clock.
    ///
    /// A `start` already in the past plays from the corresponding offset.
    fn schedule(&mut self, start: Duration, samples: &[f32]);

    /// Drop every scheduled sample, including the segment currently playing.
    fn cancel(&mut self);
}

// ---------------------------------------------------------------------------
// SilentOutput
// ---------------------------------------------------------------------------

/// Wall-clock output that discards audio.  Used when no speaker is present
/// so the session can still run (turn-taking still works, nothing is heard).
pub struct SilentOutput {
    origin: Instant,
}

impl SilentOutput {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SilentOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for SilentOutput {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn schedule(&mut self, _start: Duration, _samples: &[f32]) {}

    fn cancel(&mut self) {}
}

// ---------------------------------------------------------------------------
// SpeakerOutput
// ---------------------------------------------------------------------------

/// Source frames pulled per resampler step (10 ms at 24 kHz).
const SOURCE_STEP: usize = (PCM_SAMPLE_RATE / 100) as usize;

struct Segment {
    start_frame: u64,
    samples: Vec<f32>,
}

impl Segment {
    /// Place `samples` at `start` on the 24 kHz timeline.
    fn at(start: Duration, samples: &[f32]) -> Self {
        Self {
            start_frame: duration_to_frames(start, PCM_SAMPLE_RATE),
            samples: samples.to_vec(),
        }
    }

    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// State shared between the controller side and the cpal callback.
struct OutputShared {
    /// 24 kHz source frames pulled off the timeline.
    pulled: AtomicU64,
    timeline: Mutex<VecDeque<Segment>>,
    /// Set by `cancel`; the callback drops converted audio it still holds.
    flushed: AtomicBool,
}

impl OutputShared {
    fn new() -> Self {
        Self {
            pulled: AtomicU64::new(0),
            timeline: Mutex::new(VecDeque::new()),
            flushed: AtomicBool::new(false),
        }
    }

    fn now(&self) -> Duration {
        frames_to_duration(self.pulled.load(Ordering::Acquire), PCM_SAMPLE_RATE)
    }

    fn schedule(&self, start: Duration, samples: &[f32]) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.push_back(Segment::at(start, samples));
        }
    }

    fn cancel(&self) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.clear();
        }
        self.flushed.store(true, Ordering::Release);
    }

    /// Append the next `count` source frames to `out` and advance the clock.
    fn pull(&self, count: usize, out: &mut Vec<f32>) {
        let base = self.pulled.load(Ordering::Acquire);
        match self.timeline.lock() {
            Ok(mut timeline) => {
                for i in 0..count as u64 {
                    let pos = base + i;
                    while timeline.front().is_some_and(|seg| seg.end_frame() <= pos) {
                        timeline.pop_front();
                    }
                    out.push(match timeline.front() {
                        Some(seg) if pos >= seg.start_frame => {
                            seg.samples[(pos - seg.start_frame) as usize]
                        }
                        _ => 0.0,
                    });
                }
            }
            Err(_) => out.extend(std::iter::repeat(0.0).take(count)),
        }
        self.pulled.fetch_add(count as u64, Ordering::Release);
    }
}

/// Callback-side state: the 24 kHz → device-rate resampler and whatever
/// it has produced that the device has not taken yet.
struct Renderer {
    resampler: StreamResampler,
    ready: VecDeque<f32>,
    scratch: Vec<f32>,
}

impl Renderer {
    fn new(device_rate: u32) -> Result<Self, ResamplerError> {
        Self::with_step(device_rate, SOURCE_STEP)
    }

    fn with_step(device_rate: u32, step: usize) -> Result<Self, ResamplerError> {
        let resampler = StreamResampler::new(PCM_SAMPLE_RATE, device_rate, step)?;
        Ok(Self {
            scratch: Vec::with_capacity(resampler.input_frames_next()),
            resampler,
            ready: VecDeque::new(),
        })
    }
}

/// `cpal` speaker output owned by a dedicated `speaker-output` thread.
///
/// Scheduled chunks stay at 24 kHz; the callback converts them to the device
/// rate as it plays and fans mono out to every output channel.
pub struct SpeakerOutput {
    shared: Arc<OutputShared>,
    stop_tx: mpsc::Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SpeakerOutput {
    /// Open the named output device (or the host default) and start the
    /// stream.  The stream renders silence until something is scheduled.
    pub fn open(device_name: Option<String>) -> Result<Self, PlaybackError> {
        let shared = Arc::new(OutputShared::new());

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), PlaybackError>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_shared = Arc::clone(&shared);

        let thread = std::thread::Builder::new()
            .name("speaker-output".into())
            .spawn(move || {
                let stream = match open_output_stream(device_name.as_deref(), thread_shared) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| PlaybackError::Thread(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shared,
                stop_tx,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(PlaybackError::Thread(
                    "speaker-output thread exited during start-up".into(),
                ))
            }
        }
    }
}

impl AudioOutput for SpeakerOutput {
    fn now(&self) -> Duration {
        self.shared.now()
    }

    fn schedule(&mut self, start: Duration, samples: &[f32]) {
        self.shared.schedule(start, samples);
    }

    fn cancel(&mut self) {
        self.shared.cancel();
    }
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn frames_to_duration(frames: u64, rate: u32) -> Duration {
    Duration::from_nanos((frames as u128 * 1_000_000_000 / rate.max(1) as u128) as u64)
}

/// Nearest whole frame, so durations truncated to nanoseconds map back to
/// the frame they came from.
fn duration_to_frames(at: Duration, rate: u32) -> u64 {
    ((at.as_nanos() * rate as u128 + 500_000_000) / 1_000_000_000) as u64
}

// ---------------------------------------------------------------------------
// cpal plumbing (runs on the speaker-output thread)
// ---------------------------------------------------------------------------

fn find_output_device(host: &cpal::Host, name: Option<&str>) -> Option<cpal::Device> {
    if let Some(wanted) = name {
        let found = host.output_devices().ok().and_then(|mut devices| {
            devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
        });
        if found.is_some() {
            return found;
        }
        log::warn!("Output device {wanted:?} not found; falling back to default");
    }
    host.default_output_device()
}

fn open_output_stream(
    device_name: Option<&str>,
    shared: Arc<OutputShared>,
) -> Result<cpal::Stream, PlaybackError> {
    let host = cpal::default_host();
    let device = find_output_device(&host, device_name).ok_or(PlaybackError::NoDevice)?;

    let supported = device.default_output_config()?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let rate = config.sample_rate.0;

    log::info!(
        "Output device: {} ({} Hz, {} ch, {:?})",
        device.name().unwrap_or_else(|_| "unknown".into()),
        rate,
        config.channels,
        sample_format
    );

    let renderer = Renderer::new(rate)?;
    match sample_format {
        cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, shared, renderer),
        cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, shared, renderer),
        cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, shared, renderer),
        other => Err(PlaybackError::UnsupportedFormat(other)),
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<OutputShared>,
    mut renderer: Renderer,
) -> Result<cpal::Stream, PlaybackError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            render(data, channels, &shared, &mut renderer);
        },
        |err: cpal::StreamError| {
            log::error!("cpal output stream error: {err}");
        },
        None,
    )?;
    Ok(stream)
}

/// Fill one device buffer, pulling and converting source frames as needed.
fn render<T>(data: &mut [T], channels: usize, shared: &OutputShared, renderer: &mut Renderer)
where
    T: Sample + FromSample<f32>,
{
    if shared.flushed.swap(false, Ordering::AcqRel) {
        renderer.ready.clear();
        renderer.resampler.reset();
    }

    let frames = data.len() / channels;
    while renderer.ready.len() < frames {
        let step = renderer.resampler.input_frames_next();
        renderer.scratch.clear();
        shared.pull(step, &mut renderer.scratch);
        match renderer.resampler.process(&renderer.scratch) {
            Ok(converted) if !converted.is_empty() => renderer.ready.extend(converted),
            Ok(_) => break,
            Err(e) => {
                log::warn!("Output resampling failed: {e}");
                break;
            }
        }
    }

    for frame in data.chunks_mut(channels) {
        let out = T::from_sample(renderer.ready.pop_front().unwrap_or(0.0));
        for s in frame.iter_mut() {
            *s = out;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
