//! Gapless scheduling of synthesized audio chunks.
//!
//! Every chunk is placed at `max(now, next_start_time)` on the output clock
//! and `next_start_time` advances by the chunk's duration:
//!
//! ```text
//! output clock ─────────────────────────────────────────────▶
//!   now
//!    │[ A ][ B ][ C ]            chunks arriving faster than real time
//!    │               ▲ next_start_time
//!
//!   now (producer fell behind)
//!    │[ A ]   gap   [ B ]        B starts at `now`, never waits
//! ```
//!
//! The queue never blocks and never reorders.  Entries stay listed until
//! their playback window has elapsed on the output clock.

use std::collections::VecDeque;
use std::time::Duration;

use crate::audio::{decode_pcm16, samples_to_duration, CodecError};

use super::output::AudioOutput;

// ---------------------------------------------------------------------------
// PlaybackChunk
// ---------------------------------------------------------------------------

/// One decoded `response.audio.delta` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    /// Arrival order within the session.
    pub seq: u64,
    /// 24 kHz mono samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
}

impl PlaybackChunk {
    /// Decode a base64 PCM16LE payload.
    pub fn decode(seq: u64, payload: &str) -> Result<Self, CodecError> {
        Ok(Self {
            seq,
            samples: decode_pcm16(payload)?,
        })
    }

    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len())
    }
}

// ---------------------------------------------------------------------------
// ScheduledEntry
// ---------------------------------------------------------------------------

/// Where a chunk landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEntry {
    pub seq: u64,
    pub start: Duration,
    pub duration: Duration,
}

impl ScheduledEntry {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

// ---------------------------------------------------------------------------
// PlaybackQueue
// ---------------------------------------------------------------------------

/// Ordered, gapless playback on top of an [`AudioOutput`].
pub struct PlaybackQueue {
    output: Box<dyn AudioOutput>,
    entries: VecDeque<ScheduledEntry>,
    next_start_time: Duration,
}

impl PlaybackQueue {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        let next_start_time = output.now();
        Self {
            output,
            entries: VecDeque::new(),
            next_start_time,
        }
    }

    /// Schedule `chunk` right after everything already queued (or now, if
    /// the queue has run dry) and return its placement.
    pub fn enqueue(&mut self, chunk: PlaybackChunk) -> ScheduledEntry {
        self.prune();

        let start = self.next_start_time.max(self.output.now());
        let entry = ScheduledEntry {
            seq: chunk.seq,
            start,
            duration: chunk.duration(),
        };

        self.output.schedule(start, &chunk.samples);
        self.next_start_time = entry.end();
        self.entries.push_back(entry);
        entry
    }

    /// `true` while scheduled audio extends past the current output time.
    pub fn is_rendering(&self) -> bool {
        self.next_start_time > self.output.now()
    }

    /// Cancel everything scheduled and rewind `next_start_time` to now.
    ///
    /// The chunk currently audible is cut off too, so audio from a torn-down
    /// session never overlaps the next one.
    pub fn clear(&mut self) {
        self.output.cancel();
        if !self.entries.is_empty() {
            log::debug!("Cleared {} scheduled playback chunk(s)", self.entries.len());
        }
        self.entries.clear();
        self.next_start_time = self.output.now();
    }

    /// Forget entries whose playback window has fully elapsed.
    pub fn prune(&mut self) {
        let now = self.output.now();
        while self.entries.front().is_some_and(|e| e.end() <= now) {
            self.entries.pop_front();
        }
    }

    /// Entries still pending or playing, in arrival order.
    pub fn entries(&self) -> impl Iterator<Item = &ScheduledEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_start_time(&self) -> Duration {
        self.next_start_time
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
