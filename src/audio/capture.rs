//! Microphone capture → PCM16 frame encoding.
//!
//! [`CaptureEncoder`] is the seam the session controller talks to; the
//! production implementation is [`MicEncoder`], built on `cpal`.
//!
//! # Threading
//!
//! `cpal::Stream` is not `Send` on every platform, so [`MicEncoder`] opens
//! and owns the stream on a dedicated `mic-capture` OS thread.  Neither
//! `start` nor `stop` waits for that thread, so both are safe to call from an
//! async task:
//!
//! ```text
//! start() ──spawn──▶ mic-capture thread             (returns at once)
//!                      join the previous capture thread
//!                      open device, build + play stream
//!                      failure ──▶ FaultCallback(CaptureError)
//!                      block on stop channel
//! stop()  ──signal──▶  drop stream, thread exits     (not joined here)
//! ```
//!
//! The cpal callback feeds a [`FrameAssembler`], which downmixes, resamples
//! to 24 kHz and cuts fixed-size [`AudioFrame`]s.  Frames go straight to the
//! registered [`FrameCallback`]; there is no queue behind it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use thiserror::Error;

use super::pcm::encode_pcm16;
use super::resample::{downmix, ResamplerError, StreamResampler};
use super::{samples_to_duration, PCM_SAMPLE_RATE};

// ---------------------------------------------------------------------------
// AudioFrame
// ---------------------------------------------------------------------------

/// One fixed-length block of 24 kHz mono PCM16, already base64-encoded for
/// the wire.
///
/// Immutable once built; the transmit channel takes it by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    payload: String,
    samples: usize,
}

impl AudioFrame {
    /// Quantise and encode `samples` (24 kHz mono, `[-1.0, 1.0]`).
    pub fn encode(samples: &[f32]) -> Self {
        Self {
            payload: encode_pcm16(samples),
            samples: samples.len(),
        }
    }

    /// Base64 PCM16LE payload.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn sample_count(&self) -> usize {
        self.samples
    }

    /// Playback length of this frame at 24 kHz.
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples)
    }
}

/// Receives each encoded frame.  Runs on the audio thread, so it must not
/// block.
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// Receives a device failure that happened after `start` returned.  Called at
/// most once, from the capture thread.
pub type FaultCallback = Box<dyn FnOnce(CaptureError) + Send + 'static>;

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

/// Errors that can occur while acquiring the microphone.
///
/// Every variant is a device error: the controller reports it to the user
/// and does not retry.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No input device, or the platform denied access.
    #[error("microphone unavailable: {0}")]
    MicUnavailable(String),

    #[error("failed to query default input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("unsupported input sample format: {0:?}")]
    UnsupportedFormat(cpal::SampleFormat),

    #[error("capture thread failed: {0}")]
    Thread(String),

    #[error(transparent)]
    Resampler(#[from] ResamplerError),
}

// ---------------------------------------------------------------------------
// CaptureEncoder trait
// ---------------------------------------------------------------------------

/// Owns the microphone and emits encoded frames while active.
pub trait CaptureEncoder: Send {
    /// Acquire the microphone and start delivering frames to `on_frame`.
    ///
    /// Must not block.  Failures known immediately are returned; failures
    /// discovered while the device is being opened go to `on_fault`.
    /// Calling `start` on an already-active encoder restarts it with the new
    /// callbacks.
    fn start(
        &mut self,
        on_frame: FrameCallback,
        on_fault: FaultCallback,
    ) -> Result<(), CaptureError>;

    /// Release the microphone.  Idempotent.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

// ---------------------------------------------------------------------------
// FrameAssembler
// ---------------------------------------------------------------------------

/// Turns arbitrary device blocks into fixed-size 24 kHz mono frames.
///
/// One [`StreamResampler`] lives for the whole stream, so rate conversion
/// carries state across callbacks.  At most `frame_samples - 1` converted
/// samples are carried between frames.
pub struct FrameAssembler {
    channels: u16,
    resampler: StreamResampler,
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(
        channels: u16,
        source_rate: u32,
        frame_samples: usize,
    ) -> Result<Self, ResamplerError> {
        let frame_samples = frame_samples.max(1);
        // Convert in 10 ms steps of the device rate.
        let chunk = (source_rate / 100).max(1) as usize;
        Ok(Self {
            channels,
            resampler: StreamResampler::new(source_rate, PCM_SAMPLE_RATE, chunk)?,
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        })
    }

    /// Feed one interleaved device block; `emit` is called once per
    /// completed frame, in capture order.
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(AudioFrame)) {
        let mono = downmix(interleaved, self.channels);
        let resampled = match self.resampler.process(&mono) {
            Ok(resampled) => resampled,
            Err(e) => {
                log::warn!("Dropping capture block: {e}");
                return;
            }
        };

        let mut rest = resampled.as_slice();
        while !rest.is_empty() {
            let take = (self.frame_samples - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_samples {
                emit(AudioFrame::encode(&self.pending));
                self.pending.clear();
            }
        }
    }

    /// Samples waiting for the next frame boundary.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// MicEncoder
// ---------------------------------------------------------------------------

struct ActiveCapture {
    /// Checked by the cpal callback so no frame escapes after `stop`.
    halted: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

/// `cpal` microphone capture running on its own OS thread.
///
/// ```rust,no_run
/// use voice_assistant::audio::{CaptureEncoder, MicEncoder};
///
/// let mut mic = MicEncoder::new(None, 4096);
/// mic.start(
///     Box::new(|frame| println!("{} samples", frame.sample_count())),
///     Box::new(|e| eprintln!("microphone failed: {e}")),
/// )
/// .unwrap();
/// mic.stop();
/// mic.stop(); // no-op
/// ```
pub struct MicEncoder {
    /// Input device name; `None` selects the host default.
    device_name: Option<String>,
    frame_samples: usize,
    active: Option<ActiveCapture>,
    /// Thread of the last stopped capture, joined by the next capture thread.
    retired: Option<std::thread::JoinHandle<()>>,
}

impl MicEncoder {
    pub fn new(device_name: Option<String>, frame_samples: usize) -> Self {
        Self {
            device_name,
            frame_samples,
            active: None,
            retired: None,
        }
    }
}

impl CaptureEncoder for MicEncoder {
    fn start(
        &mut self,
        mut on_frame: FrameCallback,
        on_fault: FaultCallback,
    ) -> Result<(), CaptureError> {
        self.stop();

        let halted = Arc::new(AtomicBool::new(false));
        let halted_cb = Arc::clone(&halted);
        let gated: FrameCallback = Box::new(move |frame| {
            if !halted_cb.load(Ordering::Acquire) {
                on_frame(frame);
            }
        });
        let halted_fault = Arc::clone(&halted);
        let report = move |e: CaptureError| {
            if halted_fault.load(Ordering::Acquire) {
                log::debug!("Capture failed after stop: {e}");
            } else {
                on_fault(e);
            }
        };

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let device_name = self.device_name.clone();
        let frame_samples = self.frame_samples;
        let previous = self.retired.take();

        let thread = std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                // The old stream must be gone before the device is reopened.
                if let Some(previous) = previous {
                    if previous.join().is_err() {
                        log::warn!("Previous mic-capture thread panicked during shutdown");
                    }
                }

                let stream = match open_input_stream(device_name.as_deref(), frame_samples, gated)
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        report(e);
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    report(e.into());
                    return;
                }
                log::info!("Microphone capture started");

                // Returns on stop() or when the encoder is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                log::info!("Microphone released");
            })
            .map_err(|e| CaptureError::Thread(e.to_string()))?;

        self.active = Some(ActiveCapture {
            halted,
            stop_tx,
            thread,
        });
        Ok(())
    }

    fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.halted.store(true, Ordering::Release);
        let _ = active.stop_tx.send(());
        self.retired = Some(active.thread);
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for MicEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// cpal plumbing (runs on the mic-capture thread)
// ---------------------------------------------------------------------------

fn find_input_device(host: &cpal::Host, name: Option<&str>) -> Option<cpal::Device> {
    if let Some(wanted) = name {
        let found = host.input_devices().ok().and_then(|mut devices| {
            devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
        });
        if found.is_some() {
            return found;
        }
        log::warn!("Input device {wanted:?} not found; falling back to default");
    }
    host.default_input_device()
}

fn open_input_stream(
    device_name: Option<&str>,
    frame_samples: usize,
    on_frame: FrameCallback,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = find_input_device(&host, device_name)
        .ok_or_else(|| CaptureError::MicUnavailable("no input device present".into()))?;

    let supported = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            CaptureError::MicUnavailable("input device not available".into())
        }
        other => other.into(),
    })?;

    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    log::info!(
        "Input device: {} ({} Hz, {} ch, {:?})",
        device.name().unwrap_or_else(|_| "unknown".into()),
        config.sample_rate.0,
        config.channels,
        sample_format
    );

    let assembler = FrameAssembler::new(config.channels, config.sample_rate.0, frame_samples)?;

    match sample_format {
        cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, assembler, on_frame),
        cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, assembler, on_frame),
        cpal::SampleFormat::U16 => build_input::<u16>(&device, &config, assembler, on_frame),
        other => Err(CaptureError::UnsupportedFormat(other)),
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut assembler: FrameAssembler,
    mut on_frame: FrameCallback,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| f32::from_sample(s)));
            assembler.push(&scratch, &mut on_frame);
        },
        |err: cpal::StreamError| {
            log::error!("cpal input stream error: {err}");
        },
        None,
    )?;
    Ok(stream)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
