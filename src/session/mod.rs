//! Voice session: the explicit state machine and everything it exchanges
//! with its producers and the UI.
//!
//! ```text
//! AssistantApp ─SessionCommand─▶ SessionController ─SessionView─▶ AssistantApp
//!                                  ▲        │
//!        MicEncoder / WsChannel ───┘        └─▶ PlaybackQueue
//!        (SessionEvent, tagged with SessionId)
//! ```

pub mod controller;
pub mod event;
pub mod state;
pub mod voices;

pub use controller::SessionController;
pub use event::{SessionCommand, SessionEvent};
pub use state::{
    new_shared_view, Notice, NoticeKind, SessionId, SessionState, SessionView, SharedView,
};
pub use voices::{find_voice, is_known_voice, VoiceInfo, FALLBACK_VOICE, VOICES};
