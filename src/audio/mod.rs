//! Audio front end: microphone capture, PCM16 wire encoding, resampling.
//!
//! # Capture path
//!
//! ```text
//! Microphone → cpal callback → FrameAssembler
//!     (downmix → StreamResampler(→24 kHz) → fixed-size cut)
//!           → AudioFrame (base64 PCM16LE) → FrameCallback
//! ```
//!
//! The playback path lives in [`crate::playback`] and reuses [`decode_pcm16`]
//! and [`StreamResampler`] from here.

pub mod capture;
pub mod pcm;
pub mod resample;

use std::time::Duration;

pub use capture::{
    AudioFrame, CaptureEncoder, CaptureError, FaultCallback, FrameAssembler, FrameCallback,
    MicEncoder,
};
pub use pcm::{decode_pcm16, encode_pcm16, CodecError};
pub use resample::{downmix, needs_resampling, ResamplerError, StreamResampler};

/// Wire sample rate, both directions (mono).
pub const PCM_SAMPLE_RATE: u32 = 24_000;

/// Length of `samples` mono samples at [`PCM_SAMPLE_RATE`], truncated to
/// whole nanoseconds.
pub fn samples_to_duration(samples: usize) -> Duration {
    Duration::from_nanos(samples as u64 * 1_000_000_000 / PCM_SAMPLE_RATE as u64)
}
