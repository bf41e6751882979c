//! Sample-rate conversion and channel mixing.
//!
//! The wire format is fixed at **24 kHz mono**, but neither the microphone
//! nor the speaker is guaranteed to run at that rate.  Capture runs
//! [`downmix`] then a [`StreamResampler`] (device rate → 24 kHz); playback
//! keeps its own [`StreamResampler`] (24 kHz → device rate) inside the output
//! callback.
//!
//! A [`StreamResampler`] is stateful: it is fed arbitrarily sized blocks,
//! processes whole chunks only and carries the remainder (and the filter
//! history) into the next call, so the long-run output/input ratio is exact.

use rubato::{FftFixedIn, Resampler};
use thiserror::Error;

/// FFT sub-chunks per resampler chunk.
const RESAMPLER_SUB_CHUNKS: usize = 1;

// ---------------------------------------------------------------------------
// downmix
// ---------------------------------------------------------------------------

/// Mix interleaved multi-channel audio down to mono by averaging all channels.
///
/// * `channels == 1` copies the input unchanged.
/// * `channels == 0` yields an empty vector.
///
/// ```rust
/// use voice_assistant::audio::downmix;
///
/// let stereo = vec![0.5_f32, -0.5, 0.2, 0.4]; // L R L R
/// let mono = downmix(&stereo, 2);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[1] - 0.3).abs() < 1e-6);
/// ```
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// StreamResampler
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ResamplerError {
    #[error("invalid resampling rates {from} Hz -> {to} Hz")]
    ZeroRate { from: u32, to: u32 },

    #[error("failed to build resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),

    #[error("resampling failed: {0}")]
    Process(#[from] rubato::ResampleError),
}

/// `true` when audio at `rate` must be converted to reach `target`.
pub fn needs_resampling(rate: u32, target: u32) -> bool {
    rate != target
}

/// Mono resampler for one continuous stream.
///
/// Equal rates are a passthrough.  Otherwise input is buffered until a full
/// chunk (`input_frames_next`) is available; whatever is left over waits for
/// the next call.
///
/// ```rust
/// use voice_assistant::audio::StreamResampler;
///
/// let mut r = StreamResampler::new(48_000, 24_000, 480).unwrap();
/// let mut produced = 0;
/// for _ in 0..10 {
///     produced += r.process(&vec![0.0_f32; 300]).unwrap().len();
/// }
/// // 3000 in → 6 whole chunks of 480 → 1440 out, 120 still buffered
/// assert_eq!(produced, 1440);
/// assert_eq!(r.pending_len(), 120);
/// ```
pub struct StreamResampler {
    source_rate: u32,
    target_rate: u32,
    chunk: usize,
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// Build a resampler that consumes `chunk` source samples per step
    /// (rounded up by rubato to a whole FFT block).
    pub fn new(source_rate: u32, target_rate: u32, chunk: usize) -> Result<Self, ResamplerError> {
        if source_rate == 0 || target_rate == 0 {
            return Err(ResamplerError::ZeroRate {
                from: source_rate,
                to: target_rate,
            });
        }
        let chunk = chunk.max(1);
        let inner = if needs_resampling(source_rate, target_rate) {
            Some(FftFixedIn::<f32>::new(
                source_rate as usize,
                target_rate as usize,
                chunk,
                RESAMPLER_SUB_CHUNKS,
                1,
            )?)
        } else {
            None
        };
        Ok(Self {
            source_rate,
            target_rate,
            chunk,
            inner,
            pending: Vec::with_capacity(chunk * 2),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Source samples consumed by the next processing step.
    pub fn input_frames_next(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.input_frames_next(),
            None => self.chunk,
        }
    }

    /// Source samples buffered and not yet converted.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed `samples` and return every converted sample now available.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, ResamplerError> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let processed = inner.process(&[&self.pending[..needed]], None)?;
            self.pending.drain(..needed);
            if let Some(mono) = processed.into_iter().next() {
                out.extend(mono);
            }
        }
        Ok(out)
    }

    /// Forget buffered input and filter history (after playback is cancelled).
    pub fn reset(&mut self) {
        self.pending.clear();
        match Self::new(self.source_rate, self.target_rate, self.chunk) {
            Ok(fresh) => *self = fresh,
            Err(e) => log::warn!("Resampler reset failed: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ---- downmix -----------------------------------------------------------

    #[test]
    fn downmix_mono_is_copy() {
        let input = vec![0.1_f32, 0.2, 0.3];
        assert_eq!(downmix(&input, 1), input);
    }

    #[test]
    fn downmix_two_channel() {
        let out = downmix(&[1.0_f32, -1.0, 0.5, 0.5], 2);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn downmix_drops_incomplete_trailing_frame() {
        let out = downmix(&[0.2_f32, 0.4, 0.9], 2);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn downmix_zero_channels() {
        assert!(downmix(&[1.0_f32, 2.0], 0).is_empty());
    }

    // ---- StreamResampler ---------------------------------------------------

    #[test]
    fn same_rate_is_passthrough() {
        let mut r = StreamResampler::new(24_000, 24_000, 240).unwrap();
        assert!(r.is_passthrough());
        let input: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        assert_eq!(r.process(&input).unwrap(), input);
        assert_eq!(r.pending_len(), 0);
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(matches!(
            StreamResampler::new(0, 24_000, 240),
            Err(ResamplerError::ZeroRate { .. })
        ));
    }

    #[test]
    fn short_input_is_buffered_until_a_chunk_is_full() {
        let mut r = StreamResampler::new(48_000, 24_000, 480).unwrap();
        assert!(r.process(&vec![0.0_f32; 100]).unwrap().is_empty());
        assert_eq!(r.pending_len(), 100);
    }

    #[test]
    fn odd_block_sizes_do_not_drift() {
        // 10 s of 44.1 kHz in 512-sample callbacks.
        let mut r = StreamResampler::new(44_100, 24_000, 441).unwrap();
        let block = vec![0.0_f32; 512];
        let mut produced = 0usize;
        let mut fed = 0usize;
        while fed < 441_000 {
            let n = block.len().min(441_000 - fed);
            produced += r.process(&block[..n]).unwrap().len();
            fed += n;
        }
        let expected = 240_000usize;
        let chunk_out = r.input_frames_next() * 24_000 / 44_100;
        assert!(
            produced.abs_diff(expected) <= chunk_out,
            "expected ~{expected}, got {produced}"
        );
    }

    #[test]
    fn constant_signal_settles_at_its_amplitude() {
        for &(from, to) in &[(48_000, 24_000), (16_000, 24_000), (24_000, 44_100)] {
            let mut r = StreamResampler::new(from, to, (from / 100) as usize).unwrap();
            let mut out = Vec::new();
            for _ in 0..20 {
                out.extend(r.process(&vec![0.5_f32; 160]).unwrap());
            }
            let tail = &out[out.len() / 2..];
            for &s in tail {
                assert!((s - 0.5).abs() < 0.02, "{from}->{to} amplitude drift: {s}");
            }
        }
    }

    #[test]
    fn reset_drops_buffered_input() {
        let mut r = StreamResampler::new(24_000, 48_000, 240).unwrap();
        r.process(&vec![0.3_f32; 100]).unwrap();
        r.reset();
        assert_eq!(r.pending_len(), 0);
        assert!(!r.is_passthrough());
    }
}
