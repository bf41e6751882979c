//! [`TransmitChannel`] over a tokio-tungstenite WebSocket.
//!
//! Each [`TransmitChannel::open`] spawns one connection task that owns the
//! socket for its whole life:
//!
//! ```text
//! connect (token → handshake, bounded by connect_timeout)
//!   └─▶ send start_session{voice}   ── channel now "open"
//!         loop select! {
//!           shutdown signal   → close frame, exit quietly
//!           outbound queue    → socket
//!           socket message    → parse_event → SessionEvent::Inbound
//!         }
//!   exit by server close  → InboundEvent::ConnectionClosed
//!   exit by socket error  → InboundEvent::TransportError
//! ```
//!
//! Every event the task posts carries the [`SessionId`] it was opened with.
//! A locally requested close posts nothing.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::audio::AudioFrame;
use crate::config::TransportConfig;
use crate::session::{SessionEvent, SessionId};

use super::protocol::{parse_event, InboundEvent, OutboundMessage};
use super::token::TokenSource;
use super::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// TransmitChannel trait
// ---------------------------------------------------------------------------

/// Owns the socket lifecycle and outbound message framing.
///
/// None of the methods block or fail: connection problems arrive later as
/// [`InboundEvent::TransportError`] / [`InboundEvent::ConnectionClosed`] on
/// the `events` sender given to `open`.
pub trait TransmitChannel: Send {
    /// Connect and announce `voice`.  Any previous connection is closed
    /// first.
    fn open(&mut self, session: SessionId, voice: &str, events: mpsc::Sender<SessionEvent>);

    /// Queue one `input_audio_buffer.append`.  Returns `false` (and counts a
    /// drop) when the channel is not open or the outbound queue is full.
    fn send(&mut self, frame: AudioFrame) -> bool;

    /// Close the socket.  Idempotent.
    fn close(&mut self);

    /// `start_session` has been sent and the socket is still up.
    fn is_open(&self) -> bool;

    fn frames_sent(&self) -> u64;

    fn frames_dropped(&self) -> u64;
}

// ---------------------------------------------------------------------------
// WsChannel
// ---------------------------------------------------------------------------

/// Controller-side handle of one live connection task.
struct Link {
    session: SessionId,
    outbound: mpsc::Sender<String>,
    open: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
}

/// WebSocket implementation of [`TransmitChannel`].
pub struct WsChannel {
    url: String,
    connect_timeout: Duration,
    outbound_queue: usize,
    tokens: Option<Arc<dyn TokenSource>>,
    link: Option<Link>,
    sent: u64,
    dropped: u64,
}

impl WsChannel {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            url: config.url.clone(),
            connect_timeout: config.connect_timeout(),
            outbound_queue: config.outbound_queue.max(1),
            tokens: None,
            link: None,
            sent: 0,
            dropped: 0,
        }
    }

    /// Fetch a bearer token from `tokens` before every handshake.
    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    fn count_drop(&mut self, why: &str) -> bool {
        self.dropped += 1;
        log::debug!("Dropping outbound frame ({why}); {} dropped so far", self.dropped);
        false
    }
}

impl TransmitChannel for WsChannel {
    fn open(&mut self, session: SessionId, voice: &str, events: mpsc::Sender<SessionEvent>) {
        self.close();

        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_queue);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let open = Arc::new(AtomicBool::new(false));

        let task = LinkTask {
            session,
            voice: voice.to_string(),
            url: self.url.clone(),
            connect_timeout: self.connect_timeout,
            tokens: self.tokens.clone(),
            outbound: outbound_rx,
            shutdown: shutdown_rx,
            open: Arc::clone(&open),
            events,
        };
        tokio::spawn(task.drive());

        log::info!("Opening realtime socket {} (session {session}, voice {voice})", self.url);
        self.link = Some(Link {
            session,
            outbound: outbound_tx,
            open,
            shutdown: Some(shutdown_tx),
        });
    }

    fn send(&mut self, frame: AudioFrame) -> bool {
        let Some(link) = self.link.as_ref() else {
            return self.count_drop("no connection");
        };
        if !link.open.load(Ordering::Acquire) {
            return self.count_drop("session not started");
        }

        let text = match (OutboundMessage::AppendAudio {
            audio: frame.payload(),
        })
        .to_json()
        {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Failed to encode audio frame: {e}");
                return self.count_drop("encode failure");
            }
        };

        match link.outbound.try_send(text) {
            Ok(()) => {
                self.sent += 1;
                true
            }
            Err(_) => self.count_drop("outbound queue full"),
        }
    }

    fn close(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        link.open.store(false, Ordering::Release);
        if let Some(shutdown) = link.shutdown.take() {
            let _ = shutdown.send(());
        }
        log::info!("Closed realtime socket (session {})", link.session);
    }

    fn is_open(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|l| l.open.load(Ordering::Acquire))
    }

    fn frames_sent(&self) -> u64 {
        self.sent
    }

    fn frames_dropped(&self) -> u64 {
        self.dropped
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

enum LinkExit {
    /// `close()` was called; nothing to report.
    Local,
    /// The server closed the socket.
    Remote,
}

struct LinkTask {
    session: SessionId,
    voice: String,
    url: String,
    connect_timeout: Duration,
    tokens: Option<Arc<dyn TokenSource>>,
    outbound: mpsc::Receiver<String>,
    shutdown: oneshot::Receiver<()>,
    open: Arc<AtomicBool>,
    events: mpsc::Sender<SessionEvent>,
}

impl LinkTask {
    async fn drive(mut self) {
        let result = self.run().await;
        self.open.store(false, Ordering::Release);

        let event = match result {
            Ok(LinkExit::Local) => return,
            Ok(LinkExit::Remote) => {
                log::warn!("Realtime socket closed by server (session {})", self.session);
                InboundEvent::ConnectionClosed
            }
            Err(e) => {
                log::warn!("Realtime socket failed (session {}): {e}", self.session);
                InboundEvent::TransportError {
                    message: e.to_string(),
                }
            }
        };

        let _ = self
            .events
            .send(SessionEvent::Inbound {
                session: self.session,
                event,
            })
            .await;
    }

    async fn run(&mut self) -> Result<LinkExit, TransportError> {
        let ws = tokio::select! {
            _ = &mut self.shutdown => return Ok(LinkExit::Local),
            ws = connect(&self.url, self.tokens.clone(), self.connect_timeout) => ws?,
        };
        let (mut sink, mut stream) = ws.split();

        let hello = OutboundMessage::StartSession { voice: &self.voice }.to_json()?;
        sink.send(Message::Text(hello.into())).await?;
        self.open.store(true, Ordering::Release);
        log::info!("start_session sent (session {}, voice {})", self.session, self.voice);

        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    let _ = sink.close().await;
                    return Ok(LinkExit::Local);
                }
                out = self.outbound.recv() => match out {
                    Some(text) => sink.send(Message::Text(text.into())).await?,
                    None => {
                        let _ = sink.close().await;
                        return Ok(LinkExit::Local);
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => match parse_event(&text) {
                        Ok(event) => {
                            let posted = self
                                .events
                                .send(SessionEvent::Inbound { session: self.session, event })
                                .await;
                            if posted.is_err() {
                                // Controller gone.
                                return Ok(LinkExit::Local);
                            }
                        }
                        Err(e) => log::debug!("Dropping inbound message: {e}"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        log::debug!("Close frame received: {frame:?}");
                        return Ok(LinkExit::Remote);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(LinkExit::Remote),
                },
            }
        }
    }
}

/// Token fetch + WebSocket handshake, bounded by `timeout`.
async fn connect(
    url: &str,
    tokens: Option<Arc<dyn TokenSource>>,
    timeout: Duration,
) -> Result<WsStream, TransportError> {
    let attempt = async {
        let mut request = url.into_client_request()?;
        if let Some(tokens) = tokens {
            let token = tokens.fetch().await?;
            let value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (ws, _response) = connect_async(request).await?;
        Ok::<_, TransportError>(ws)
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| TransportError::Timeout)?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
