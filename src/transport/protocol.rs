//! Wire protocol of the realtime voice relay.
//!
//! JSON text messages, tagged by `type`.
//!
//! | Direction | `type`                               | Payload                         |
//! |-----------|--------------------------------------|---------------------------------|
//! | out       | `start_session`                      | `voice`                         |
//! | out       | `input_audio_buffer.append`          | `audio` (base64 PCM16LE 24 kHz) |
//! | in        | `session.created` / `session.updated`| ignored                         |
//! | in        | `input_audio_buffer.speech_started`  | -                               |
//! | in        | `input_audio_buffer.speech_stopped`  | -                               |
//! | in        | `response.audio.delta`               | `delta` (base64 PCM16LE)        |
//! | in        | `response.audio.done`                | -                               |
//! | in        | `response.done`                      | -                               |
//! | in        | `error`                              | `error`: string or `{message}`  |
//! | in        | `connection_closed`                  | -                               |
//!
//! [`parse_event`] is the only way text becomes an [`InboundEvent`]; any
//! other `type` is rejected there.  Extra fields on known types are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Every inbound `type` accepted by [`parse_event`].
pub const INBOUND_TYPES: &[&str] = &[
    "session.created",
    "session.updated",
    "input_audio_buffer.speech_started",
    "input_audio_buffer.speech_stopped",
    "response.audio.delta",
    "response.audio.done",
    "response.done",
    "error",
    "connection_closed",
];

// ---------------------------------------------------------------------------
// ProtocolError
// ---------------------------------------------------------------------------

/// A message that could not be turned into an [`InboundEvent`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message has no string `type` field")]
    MissingType,

    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// Payload of an `error` event; the relay sends either shape.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RemoteError {
    Text(String),
    Detailed {
        #[serde(default)]
        message: String,
    },
}

impl RemoteError {
    pub fn message(&self) -> &str {
        match self {
            RemoteError::Text(m) | RemoteError::Detailed { message: m } => m,
        }
    }
}

// ---------------------------------------------------------------------------
// InboundEvent
// ---------------------------------------------------------------------------

/// A parsed inbound message, or a socket failure reported in-band.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    /// One chunk of synthesized audio, base64 PCM16LE.
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio.done")]
    AudioDone,

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<RemoteError>,
    },

    /// Server-initiated closure.
    #[serde(rename = "connection_closed")]
    ConnectionClosed,

    /// Socket-level failure raised by the transport itself.  Never parsed.
    #[serde(skip)]
    TransportError { message: String },
}

impl InboundEvent {
    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::SessionCreated => "session.created",
            InboundEvent::SessionUpdated => "session.updated",
            InboundEvent::SpeechStarted => "input_audio_buffer.speech_started",
            InboundEvent::SpeechStopped => "input_audio_buffer.speech_stopped",
            InboundEvent::AudioDelta { .. } => "response.audio.delta",
            InboundEvent::AudioDone => "response.audio.done",
            InboundEvent::ResponseDone => "response.done",
            InboundEvent::Error { .. } => "error",
            InboundEvent::ConnectionClosed => "connection_closed",
            InboundEvent::TransportError { .. } => "transport_error",
        }
    }

    /// `true` for events that end the connection.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            InboundEvent::ConnectionClosed | InboundEvent::TransportError { .. }
        )
    }
}

/// Parse one inbound text message.
pub fn parse_event(text: &str) -> Result<InboundEvent, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    if !INBOUND_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    Ok(serde_json::from_value(value)?)
}

// ---------------------------------------------------------------------------
// OutboundMessage
// ---------------------------------------------------------------------------

/// Messages the client sends.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage<'a> {
    #[serde(rename = "start_session")]
    StartSession { voice: &'a str },

    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: &'a str },
}

impl OutboundMessage<'_> {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
