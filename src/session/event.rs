//! Everything the session controller reacts to.
//!
//! Producers never mutate controller state; they post a [`SessionEvent`]
//! and the controller handles it on its own task:
//!
//! ```text
//! UI ─────────── SessionCommand ──▶ ┐
//! mic callback ─ Frame ───────────▶ │
//! mic thread ── CaptureFailed ────▶ │
//! socket task ── Inbound ─────────▶ ├─▶ SessionController::handle
//! reconnect timer ─ ReconnectDue ─▶ │
//! interval ───── PlaybackTick ────▶ ┘
//! ```

use crate::audio::AudioFrame;
use crate::transport::InboundEvent;

use super::state::SessionId;

/// User intent forwarded by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Start a session with `voice`, tearing down any current one first.
    Open { voice: String },
    /// Switch voice: teardown, then immediate re-open when a session is
    /// live; otherwise just remembered for the next open.
    ChangeVoice { voice: String },
    /// Keep the microphone open but stop forwarding frames.
    SetMuted(bool),
    DismissNotice,
    Close,
}

/// A single input to the controller's event intake.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Command(SessionCommand),
    /// A captured frame from the microphone of session `session`.
    Frame { session: SessionId, frame: AudioFrame },
    /// The microphone of `session` failed after `start` had returned.
    CaptureFailed { session: SessionId, message: String },
    /// A parsed message (or socket failure) from the connection of `session`.
    Inbound {
        session: SessionId,
        event: InboundEvent,
    },
    /// The fixed reconnect delay for `session` has elapsed.
    ReconnectDue { session: SessionId },
    /// Periodic wake-up to refresh playback status.
    PlaybackTick,
}

impl From<SessionCommand> for SessionEvent {
    fn from(cmd: SessionCommand) -> Self {
        SessionEvent::Command(cmd)
    }
}
