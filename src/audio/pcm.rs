//! Linear PCM16 conversion and base64 wire encoding.
//!
//! The remote voice service speaks **24 kHz mono PCM16 little-endian**,
//! base64-encoded inside JSON text messages.  This module owns both
//! directions of that conversion:
//!
//! ```text
//! capture:  f32 [-1,1] ─clamp─▶ ×0x7FFF ─round─▶ i16 ─LE─▶ bytes ─▶ base64
//! playback: base64 ─▶ bytes ─LE─▶ i16 ─▶ ÷0x7FFF ─▶ f32 [-1,1]
//! ```
//!
//! Quantising and dequantising with the same 0x7FFF scale keeps the round
//! trip error below half a step (≤ 1/65534).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

/// Errors raised while decoding an inbound audio payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// PCM16 needs two bytes per sample.
    #[error("PCM16 payload has odd length ({0} bytes)")]
    OddLength(usize),
}

// ---------------------------------------------------------------------------
// Sample conversion
// ---------------------------------------------------------------------------

/// Quantise one `f32` sample to `i16`.
///
/// Out-of-range input is clamped first; rounding is to nearest with ties
/// away from zero (`f32::round`).  NaN maps to silence.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// Dequantise one `i16` sample back to `[-1.0, 1.0]`.
///
/// `i16::MIN` lands slightly below -1.0 and is clamped.
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    (sample as f32 / i16::MAX as f32).max(-1.0)
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

/// Encode `samples` as base64 PCM16LE.
///
/// ```rust
/// use voice_assistant::audio::encode_pcm16;
///
/// // 1.0 → 0x7FFF → [0xFF, 0x7F]
/// assert_eq!(encode_pcm16(&[1.0]), "/38=");
/// ```
pub fn encode_pcm16(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&f32_to_i16(s).to_le_bytes());
    }
    BASE64.encode(bytes)
}

/// Decode a base64 PCM16LE payload into `f32` samples.
///
/// # Errors
///
/// [`CodecError::Base64`] for malformed base64, [`CodecError::OddLength`]
/// when the byte count is not a whole number of samples.
pub fn decode_pcm16(payload: &str) -> Result<Vec<f32>, CodecError> {
    let bytes = BASE64.decode(payload.trim())?;
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
