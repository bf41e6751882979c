//! Session state machine values and the shared UI snapshot.
//!
//! [`SessionState`] is the controller's explicit finite state.  The UI never
//! touches it directly; after every event the controller publishes a
//! [`SessionView`] into [`SharedView`], which the egui loop reads each frame.

use std::fmt;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Generation number of one connection attempt.
///
/// Every open (including each reconnect) gets a fresh id; producers tag
/// their events with it so late events from a torn-down connection can be
/// recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn next(self) -> Self {
        SessionId(self.0 + 1)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// States of the voice session.
///
/// ```text
/// Idle ──open──▶ Connecting ──session.created/updated──▶ Connected
/// Connected ◀──speech_stopped── Listening ◀──speech_started── Connected/Speaking
/// Connected/Listening ──audio.delta──▶ Speaking ──audio.done──▶ Connected
/// Connecting/Connected/Listening/Speaking ──disconnect──▶ Reconnecting
/// Reconnecting ──delay──▶ Connecting
/// any ──close──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session resources held.
    #[default]
    Idle,

    /// Socket requested; waiting for the service to acknowledge the session.
    Connecting,

    /// Session acknowledged; nobody is talking.
    Connected,

    /// The service detected user speech.
    Listening,

    /// Synthesized audio is arriving.
    Speaking,

    /// Connection lost; a re-open is scheduled.
    Reconnecting,

    /// Explicitly closed.
    Closed,
}

impl SessionState {
    /// States in which a socket is (or is being) held.
    ///
    /// ```
    /// use voice_assistant::session::SessionState;
    ///
    /// assert!(SessionState::Connecting.is_open());
    /// assert!(SessionState::Speaking.is_open());
    /// assert!(!SessionState::Reconnecting.is_open());
    /// assert!(!SessionState::Idle.is_open());
    /// ```
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Connected
                | SessionState::Listening
                | SessionState::Speaking
        )
    }

    /// States past the service acknowledgement.
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Listening | SessionState::Speaking
        )
    }

    /// A short human-readable label for the UI status line.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting…",
            SessionState::Connected => "Connected",
            SessionState::Listening => "Listening",
            SessionState::Speaking => "Speaking",
            SessionState::Reconnecting => "Reconnecting…",
            SessionState::Closed => "Closed",
        }
    }
}

// ---------------------------------------------------------------------------
// Notice
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Microphone could not be acquired.
    Device,
    /// `error` event from the voice service.
    Remote,
    /// Requested voice is not in the catalog.
    Voice,
}

/// A user-facing, dismissible message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionView
// ---------------------------------------------------------------------------

/// Snapshot of the session published for the UI.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionView {
    pub state: SessionState,
    /// Voice of the current (or next) session.
    pub voice: String,
    pub muted: bool,
    /// The service reports the user is speaking.
    pub recording: bool,
    /// Assistant audio is arriving for the current turn.
    pub speaking: bool,
    /// Scheduled audio is still playing out.
    pub rendering: bool,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    /// Reconnects since the last successful acknowledgement.
    pub reconnect_attempts: u32,
    pub notice: Option<Notice>,
}

/// Thread-safe handle to [`SessionView`].
///
/// Lock for a short critical section only; never across `.await`.
pub type SharedView = Arc<Mutex<SessionView>>;

pub fn new_shared_view(voice: &str) -> SharedView {
    Arc::new(Mutex::new(SessionView {
        voice: voice.to_string(),
        ..SessionView::default()
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
