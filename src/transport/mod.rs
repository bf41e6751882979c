//! Realtime socket transport: wire protocol, WebSocket channel, tokens.
//!
//! ```text
//! SessionController ──open/send/close──▶ WsChannel
//!                                         │ tokio task per connection
//!                                         ├─ (TokenSource) → handshake
//!                                         ├─ start_session{voice}
//!                                         ├─ outbound queue → socket
//!                                         └─ socket → parse_event → SessionEvent::Inbound
//! ```

pub mod channel;
pub mod protocol;
pub mod token;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub use channel::{TransmitChannel, WsChannel};
pub use protocol::{parse_event, InboundEvent, OutboundMessage, ProtocolError, RemoteError};
pub use token::{HttpTokenSource, TokenSource};

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

/// Socket-level failures.  These never escape the channel: they are turned
/// into an [`InboundEvent::TransportError`] for the controller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    Socket(#[from] tungstenite::Error),

    #[error("invalid authorization header: {0}")]
    Header(#[from] tungstenite::http::header::InvalidHeaderValue),

    #[error("session token request failed: {0}")]
    Token(String),

    #[error("connection attempt timed out")]
    Timeout,

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Token(e.to_string())
        }
    }
}
