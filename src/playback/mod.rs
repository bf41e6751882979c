//! Playback path: decoded PCM chunks → gapless schedule → speaker.
//!
//! ```text
//! response.audio.delta ─▶ PlaybackChunk::decode ─▶ PlaybackQueue::enqueue
//!                                                   │ max(now, next_start)
//!                                                   ▼
//!                                  AudioOutput (SpeakerOutput / SilentOutput)
//! ```

pub mod output;
pub mod queue;

pub use output::{AudioOutput, PlaybackError, SilentOutput, SpeakerOutput};
pub use queue::{PlaybackChunk, PlaybackQueue, ScheduledEntry};
