//! Session controller: the single owner of the voice session.
//!
//! [`SessionController`] owns the [`CaptureEncoder`], the [`TransmitChannel`]
//! and the [`PlaybackQueue`].  Everything else talks to it by posting a
//! [`SessionEvent`]; [`SessionController::handle`] is the only place state
//! changes.
//!
//! # Lifecycle
//!
//! ```text
//! open(voice)
//!   └─▶ channel.open(voice) ─▶ capture.start(frame → intake)      [Connecting]
//!         capture fault (sync or CaptureFailed) ─▶ teardown       [Idle]
//!         session.created / session.updated                       [Connected]
//!         speech_started                                          [Listening]
//!         audio.delta ─▶ decode ─▶ playback.enqueue               [Speaking]
//!         audio.done                                              [Connected]
//!
//! connection_closed / transport_error
//!   └─▶ teardown ─▶ timer(reconnect_delay) ─▶ open(same voice)  [Reconnecting]
//!
//! close()
//!   └─▶ teardown                                                 [Closed]
//!
//! teardown = capture.stop → channel.close → playback.clear
//! ```
//!
//! Every open (including each reconnect) gets a fresh [`SessionId`].  Frames
//! and inbound events carry the id of the session that produced them, and
//! anything tagged with an older id is discarded on arrival.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::audio::{AudioFrame, CaptureEncoder, FaultCallback, FrameCallback};
use crate::config::SessionConfig;
use crate::playback::{PlaybackChunk, PlaybackQueue};
use crate::transport::{InboundEvent, TransmitChannel};

use super::event::{SessionCommand, SessionEvent};
use super::state::{Notice, NoticeKind, SessionId, SessionState, SessionView, SharedView};
use super::voices::{is_known_voice, FALLBACK_VOICE};

/// Capacity of the intake queue shared by all producers.
///
/// Microphone frames use `try_send` and are dropped when it is full; socket
/// events and timers wait for space.
const INTAKE_CAPACITY: usize = 256;

/// How often playback status is refreshed while the loop is idle.
const PLAYBACK_POLL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// SessionController
// ---------------------------------------------------------------------------

/// Explicit state machine for one duplex voice session.
///
/// Create with [`SessionController::new`], then spawn [`run`](Self::run) on
/// the tokio runtime.
///
/// ```rust,no_run
/// use voice_assistant::audio::MicEncoder;
/// use voice_assistant::config::AppConfig;
/// use voice_assistant::playback::{PlaybackQueue, SilentOutput};
/// use voice_assistant::session::{new_shared_view, SessionCommand, SessionController};
/// use voice_assistant::transport::WsChannel;
///
/// # async fn example() {
/// let config = AppConfig::default();
/// let view = new_shared_view(&config.session.default_voice);
/// let controller = SessionController::new(
///     config.session.clone(),
///     Box::new(MicEncoder::new(None, config.audio.frame_samples)),
///     Box::new(WsChannel::new(&config.transport)),
///     PlaybackQueue::new(Box::new(SilentOutput::new())),
///     view,
/// );
///
/// let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(16);
/// tokio::spawn(controller.run(cmd_rx));
/// cmd_tx.send(SessionCommand::Open { voice: "nova".into() }).await.ok();
/// # }
/// ```
pub struct SessionController {
    config: SessionConfig,
    capture: Box<dyn CaptureEncoder>,
    channel: Box<dyn TransmitChannel>,
    playback: PlaybackQueue,
    view: SharedView,

    intake_tx: mpsc::Sender<SessionEvent>,
    intake_rx: Option<mpsc::Receiver<SessionEvent>>,

    state: SessionState,
    session: SessionId,
    voice: String,
    /// Set while a reconnect timer for `session` is outstanding.
    reconnect_pending: bool,
    reconnect_attempts: u32,
    muted: bool,
    recording: bool,
    speaking: bool,
    next_chunk_seq: u64,
    notice: Option<Notice>,
}

impl SessionController {
    /// Create an idle controller.
    ///
    /// An unknown `config.default_voice` falls back to [`FALLBACK_VOICE`].
    pub fn new(
        config: SessionConfig,
        capture: Box<dyn CaptureEncoder>,
        channel: Box<dyn TransmitChannel>,
        playback: PlaybackQueue,
        view: SharedView,
    ) -> Self {
        let voice = if is_known_voice(&config.default_voice) {
            config.default_voice.clone()
        } else {
            log::warn!(
                "Unknown default voice {:?}; using {FALLBACK_VOICE}",
                config.default_voice
            );
            FALLBACK_VOICE.to_string()
        };

        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);

        let controller = Self {
            config,
            capture,
            channel,
            playback,
            view,
            intake_tx,
            intake_rx: Some(intake_rx),
            state: SessionState::Idle,
            session: SessionId::default(),
            voice,
            reconnect_pending: false,
            reconnect_attempts: 0,
            muted: false,
            recording: false,
            speaking: false,
            next_chunk_seq: 0,
            notice: None,
        };
        controller.publish();
        controller
    }

    // -----------------------------------------------------------------------
    // Main async loop
    // -----------------------------------------------------------------------

    /// Run until `commands` is closed, then close the session.
    ///
    /// Commands, producer events and the playback poll are all funnelled
    /// into [`handle`](Self::handle), one at a time.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let Some(mut intake) = self.intake_rx.take() else {
            log::error!("session: run() called twice");
            return;
        };

        let mut poll = tokio::time::interval(PLAYBACK_POLL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let event = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => SessionEvent::Command(cmd),
                    None => break,
                },
                Some(event) = intake.recv() => event,
                _ = poll.tick() => SessionEvent::PlaybackTick,
            };
            self.handle(event);
        }

        log::info!("session: command channel closed, shutting down");
        self.close();
        self.publish();
    }

    // -----------------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------------

    /// Apply one event and publish the resulting [`SessionView`].
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command(cmd) => self.on_command(cmd),
            SessionEvent::Frame { session, frame } => self.on_frame(session, frame),
            SessionEvent::CaptureFailed { session, message } => {
                self.on_capture_failed(session, &message)
            }
            SessionEvent::Inbound { session, event } => self.on_inbound(session, event),
            SessionEvent::ReconnectDue { session } => self.on_reconnect_due(session),
            SessionEvent::PlaybackTick => self.playback.prune(),
        }
        self.publish();
    }

    fn on_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Open { voice } => self.open(&voice),
            SessionCommand::ChangeVoice { voice } => self.change_voice(&voice),
            SessionCommand::SetMuted(muted) => {
                if self.muted != muted {
                    log::info!("session: microphone {}", if muted { "muted" } else { "unmuted" });
                }
                self.muted = muted;
            }
            SessionCommand::DismissNotice => self.notice = None,
            SessionCommand::Close => self.close(),
        }
    }

    fn on_frame(&mut self, session: SessionId, frame: AudioFrame) {
        if session != self.session || !self.state.is_open() || self.muted {
            return;
        }
        // The channel counts the frame as dropped if it is not open yet.
        self.channel.send(frame);
    }

    fn on_capture_failed(&mut self, session: SessionId, message: &str) {
        if session != self.session || !self.state.is_open() {
            log::debug!("session: ignoring capture failure of {session}: {message}");
            return;
        }
        self.fail_device(message);
    }

    fn on_inbound(&mut self, session: SessionId, event: InboundEvent) {
        if session != self.session || !self.state.is_open() {
            // Every torn-down socket reports its own end; only log strays.
            if event.is_disconnect() {
                log::trace!("session: socket of {session} finished ({})", event.kind());
            } else if session != self.session {
                log::debug!(
                    "session: discarding {} from stale session {session}",
                    event.kind()
                );
            } else {
                log::debug!("session: ignoring {} while {:?}", event.kind(), self.state);
            }
            return;
        }

        match event {
            InboundEvent::SessionCreated | InboundEvent::SessionUpdated => {
                if self.state == SessionState::Connecting {
                    self.reconnect_attempts = 0;
                    self.set_state(SessionState::Connected);
                }
            }

            InboundEvent::SpeechStarted => {
                if self.state.is_established() {
                    // The user talking over the assistant ends its turn.
                    self.recording = true;
                    self.speaking = false;
                    self.set_state(SessionState::Listening);
                }
            }

            InboundEvent::SpeechStopped => {
                self.recording = false;
                if self.state == SessionState::Listening {
                    self.set_state(SessionState::Connected);
                }
            }

            InboundEvent::AudioDelta { delta } => {
                if !self.state.is_established() {
                    return;
                }
                match PlaybackChunk::decode(self.next_chunk_seq, &delta) {
                    Ok(chunk) => {
                        self.next_chunk_seq += 1;
                        let entry = self.playback.enqueue(chunk);
                        log::trace!(
                            "session: chunk {} at {:?} for {:?}",
                            entry.seq,
                            entry.start,
                            entry.duration
                        );
                        self.speaking = true;
                        self.set_state(SessionState::Speaking);
                    }
                    Err(e) => log::debug!("session: dropping undecodable audio delta: {e}"),
                }
            }

            InboundEvent::AudioDone => {
                self.speaking = false;
                if self.state == SessionState::Speaking {
                    self.set_state(SessionState::Connected);
                }
            }

            InboundEvent::ResponseDone => log::debug!("session: response done"),

            InboundEvent::Error { error } => {
                let message = error
                    .as_ref()
                    .map(|e| e.message())
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or("The voice service reported an error")
                    .to_string();
                log::warn!("session: remote error: {message}");
                self.notice = Some(Notice::new(NoticeKind::Remote, message));
            }

            InboundEvent::ConnectionClosed => self.on_disconnect("closed by server"),
            InboundEvent::TransportError { message } => self.on_disconnect(&message),
        }
    }

    fn on_disconnect(&mut self, reason: &str) {
        let delay = self.config.reconnect_delay();
        log::warn!(
            "session: connection {} lost ({reason}); reconnecting in {delay:?}",
            self.session
        );

        self.teardown();
        self.set_state(SessionState::Reconnecting);

        self.reconnect_pending = true;
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);

        let intake = self.intake_tx.clone();
        let session = self.session;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = intake.send(SessionEvent::ReconnectDue { session }).await;
        });
    }

    fn on_reconnect_due(&mut self, session: SessionId) {
        if session != self.session
            || self.state != SessionState::Reconnecting
            || !self.reconnect_pending
        {
            log::debug!("session: ignoring reconnect timer for {session}");
            return;
        }
        log::info!(
            "session: reconnecting with voice {} (attempt {})",
            self.voice,
            self.reconnect_attempts
        );
        self.connect();
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Start a session with `voice`.  A live session is torn down first.
    ///
    /// An unknown voice leaves everything untouched and raises a
    /// [`NoticeKind::Voice`] notice.
    pub fn open(&mut self, voice: &str) {
        if !self.accept_voice(voice) {
            return;
        }
        if !matches!(self.state, SessionState::Idle | SessionState::Closed) {
            self.teardown();
        }
        self.voice = voice.to_string();
        self.reconnect_attempts = 0;
        self.connect();
    }

    /// Switch to `voice`: teardown then immediate re-open when a session is
    /// live or reconnecting, otherwise remember it for the next open.
    pub fn change_voice(&mut self, voice: &str) {
        if !self.accept_voice(voice) {
            return;
        }
        match self.state {
            SessionState::Idle | SessionState::Closed => {
                log::info!("session: voice set to {voice}");
                self.voice = voice.to_string();
            }
            _ => {
                log::info!("session: switching voice {} → {voice}", self.voice);
                self.teardown();
                self.voice = voice.to_string();
                self.reconnect_attempts = 0;
                self.connect();
            }
        }
    }

    /// End the session and release every resource.  Idempotent; cancels any
    /// pending reconnect.
    pub fn close(&mut self) {
        self.teardown();
        self.reconnect_pending = false;
        if self.state != SessionState::Closed {
            log::info!("session: {} closed", self.session);
        }
        self.set_state(SessionState::Closed);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn voice(&self) -> &str {
        &self.voice
    }

    pub fn playback(&self) -> &PlaybackQueue {
        &self.playback
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn accept_voice(&mut self, voice: &str) -> bool {
        if is_known_voice(voice) {
            return true;
        }
        log::warn!("session: unknown voice {voice:?}");
        self.notice = Some(Notice::new(
            NoticeKind::Voice,
            format!("Unknown voice \"{voice}\""),
        ));
        false
    }

    /// Open the channel and the microphone under a fresh session id.
    fn connect(&mut self) {
        self.session = self.session.next();
        self.reconnect_pending = false;
        self.recording = false;
        self.speaking = false;
        self.next_chunk_seq = 0;
        self.set_state(SessionState::Connecting);

        self.channel
            .open(self.session, &self.voice, self.intake_tx.clone());

        let intake = self.intake_tx.clone();
        let session = self.session;
        let on_frame: FrameCallback = Box::new(move |frame| {
            let _ = intake.try_send(SessionEvent::Frame { session, frame });
        });
        let intake = self.intake_tx.clone();
        let on_fault: FaultCallback = Box::new(move |e| {
            let _ = intake.blocking_send(SessionEvent::CaptureFailed {
                session,
                message: e.to_string(),
            });
        });

        if let Err(e) = self.capture.start(on_frame, on_fault) {
            self.fail_device(&e.to_string());
        }
    }

    /// The microphone is gone: release everything and wait for the user.
    fn fail_device(&mut self, message: &str) {
        log::error!("session: {message}");
        self.teardown();
        self.notice = Some(Notice::new(NoticeKind::Device, message.to_string()));
        self.set_state(SessionState::Idle);
    }

    /// Release resources in a fixed order: microphone, socket, playback.
    fn teardown(&mut self) {
        self.capture.stop();
        self.channel.close();
        self.playback.clear();
        self.recording = false;
        self.speaking = false;
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            log::info!("session: {:?} → {:?}", self.state, next);
            self.state = next;
        }
    }

    fn publish(&self) {
        let snapshot = SessionView {
            state: self.state,
            voice: self.voice.clone(),
            muted: self.muted,
            recording: self.recording,
            speaking: self.speaking,
            rendering: self.playback.is_rendering(),
            frames_sent: self.channel.frames_sent(),
            frames_dropped: self.channel.frames_dropped(),
            reconnect_attempts: self.reconnect_attempts,
            notice: self.notice.clone(),
        };
        if let Ok(mut view) = self.view.lock() {
            *view = snapshot;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{encode_pcm16, CaptureError};
    use crate::playback::AudioOutput;
    use crate::session::state::new_shared_view;
    use crate::transport::RemoteError;
    use std::sync::{Arc, Mutex};

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    /// Ordered record of resource calls across all doubles.
    type CallLog = Arc<Mutex<Vec<String>>>;

    struct MockCapture {
        log: CallLog,
        fail: bool,
        callback: Arc<Mutex<Option<FrameCallback>>>,
        fault: Arc<Mutex<Option<FaultCallback>>>,
    }

    impl CaptureEncoder for MockCapture {
        fn start(
            &mut self,
            on_frame: FrameCallback,
            on_fault: FaultCallback,
        ) -> Result<(), CaptureError> {
            if self.fail {
                self.log.lock().unwrap().push("capture.start failed".into());
                return Err(CaptureError::MicUnavailable("permission denied".into()));
            }
            self.log.lock().unwrap().push("capture.start".into());
            *self.callback.lock().unwrap() = Some(on_frame);
            *self.fault.lock().unwrap() = Some(on_fault);
            Ok(())
        }

        fn stop(&mut self) {
            if self.callback.lock().unwrap().take().is_some() {
                self.log.lock().unwrap().push("capture.stop".into());
            }
        }

        fn is_active(&self) -> bool {
            self.callback.lock().unwrap().is_some()
        }
    }

    #[derive(Default)]
    struct ChannelRecord {
        open: bool,
        opens: Vec<(SessionId, String)>,
        sent: Vec<AudioFrame>,
        dropped: u64,
    }

    struct MockChannel {
        log: CallLog,
        record: Arc<Mutex<ChannelRecord>>,
    }

    impl TransmitChannel for MockChannel {
        fn open(&mut self, session: SessionId, voice: &str, _events: mpsc::Sender<SessionEvent>) {
            self.log.lock().unwrap().push(format!("channel.open({voice})"));
            let mut p = self.record.lock().unwrap();
            p.open = true;
            p.opens.push((session, voice.to_string()));
        }

        fn send(&mut self, frame: AudioFrame) -> bool {
            let mut p = self.record.lock().unwrap();
            if p.open {
                p.sent.push(frame);
                true
            } else {
                p.dropped += 1;
                false
            }
        }

        fn close(&mut self) {
            let mut p = self.record.lock().unwrap();
            if p.open {
                p.open = false;
                self.log.lock().unwrap().push("channel.close".into());
            }
        }

        fn is_open(&self) -> bool {
            self.record.lock().unwrap().open
        }

        fn frames_sent(&self) -> u64 {
            self.record.lock().unwrap().sent.len() as u64
        }

        fn frames_dropped(&self) -> u64 {
            self.record.lock().unwrap().dropped
        }
    }

    /// Hand-driven output clock that logs cancellations.
    struct MockOutput {
        log: CallLog,
        now: Arc<Mutex<Duration>>,
    }

    impl AudioOutput for MockOutput {
        fn now(&self) -> Duration {
            *self.now.lock().unwrap()
        }

        fn schedule(&mut self, _start: Duration, _samples: &[f32]) {}

        fn cancel(&mut self) {
            self.log.lock().unwrap().push("playback.clear".into());
        }
    }

    struct Rig {
        controller: SessionController,
        log: CallLog,
        mic: Arc<Mutex<Option<FrameCallback>>>,
        fault: Arc<Mutex<Option<FaultCallback>>>,
        record: Arc<Mutex<ChannelRecord>>,
        clock: Arc<Mutex<Duration>>,
        view: SharedView,
    }

    const DELAY: Duration = Duration::from_millis(2_000);

    fn rig() -> Rig {
        build_rig(false)
    }

    fn build_rig(mic_fails: bool) -> Rig {
        let log: CallLog = Arc::default();
        let mic: Arc<Mutex<Option<FrameCallback>>> = Arc::default();
        let fault: Arc<Mutex<Option<FaultCallback>>> = Arc::default();
        let record: Arc<Mutex<ChannelRecord>> = Arc::default();
        let clock: Arc<Mutex<Duration>> = Arc::default();
        let view = new_shared_view("alloy");

        let config = SessionConfig {
            reconnect_delay_ms: DELAY.as_millis() as u64,
            ..SessionConfig::default()
        };
        let controller = SessionController::new(
            config,
            Box::new(MockCapture {
                log: Arc::clone(&log),
                fail: mic_fails,
                callback: Arc::clone(&mic),
                fault: Arc::clone(&fault),
            }),
            Box::new(MockChannel {
                log: Arc::clone(&log),
                record: Arc::clone(&record),
            }),
            PlaybackQueue::new(Box::new(MockOutput {
                log: Arc::clone(&log),
                now: Arc::clone(&clock),
            })),
            Arc::clone(&view),
        );

        Rig {
            controller,
            log,
            mic,
            fault,
            record,
            clock,
            view,
        }
    }

    impl Rig {
        fn command(&mut self, cmd: SessionCommand) {
            self.controller.handle(cmd.into());
        }

        fn inbound(&mut self, event: InboundEvent) {
            let session = self.controller.session_id();
            self.controller.handle(SessionEvent::Inbound { session, event });
        }

        /// Feed everything the producers have posted so far.
        fn pump(&mut self) {
            while let Ok(event) = self.controller.intake_rx.as_mut().unwrap().try_recv() {
                self.controller.handle(event);
            }
        }

        /// Invoke the microphone callback as the audio thread would.
        fn speak(&mut self, samples: usize) {
            let mut mic = self.mic.lock().unwrap();
            let callback = mic.as_mut().expect("microphone not started");
            callback(AudioFrame::encode(&vec![0.25; samples]));
        }

        /// Report a device failure as the capture thread would.
        fn mic_fails_late(&mut self, message: &str) {
            let fault = self.fault.lock().unwrap().take();
            let fault = fault.expect("microphone not started");
            fault(CaptureError::MicUnavailable(message.into()));
        }

        fn state(&self) -> SessionState {
            self.controller.state()
        }

        fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn clear_calls(&self) {
            self.log.lock().unwrap().clear();
        }

        fn count(&self, call: &str) -> usize {
            self.calls().iter().filter(|c| *c == call).count()
        }

        fn mic_active(&self) -> bool {
            self.mic.lock().unwrap().is_some()
        }

        fn socket_open(&self) -> bool {
            self.record.lock().unwrap().open
        }

        fn opens(&self) -> Vec<(SessionId, String)> {
            self.record.lock().unwrap().opens.clone()
        }

        fn advance_clock(&self, by: Duration) {
            *self.clock.lock().unwrap() += by;
        }

        fn to_speaking(&mut self, voice: &str) {
            self.command(SessionCommand::Open {
                voice: voice.into(),
            });
            self.inbound(InboundEvent::SessionCreated);
            self.inbound(delta(100));
            assert_eq!(self.state(), SessionState::Speaking);
        }
    }

    /// `millis` of 24 kHz audio as an `audio.delta` event.
    fn delta(millis: usize) -> InboundEvent {
        InboundEvent::AudioDelta {
            delta: encode_pcm16(&vec![0.1; millis * 24]),
        }
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    #[test]
    fn nova_turn_walks_the_state_machine() {
        let mut r = rig();
        assert_eq!(r.state(), SessionState::Idle);

        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        assert_eq!(r.state(), SessionState::Connecting);
        assert_eq!(r.calls(), vec!["channel.open(nova)", "capture.start"]);
        assert_eq!(r.opens()[0].1, "nova");

        r.inbound(InboundEvent::SessionCreated);
        assert_eq!(r.state(), SessionState::Connected);

        r.inbound(InboundEvent::SpeechStarted);
        assert_eq!(r.state(), SessionState::Listening);
        assert!(r.view.lock().unwrap().recording);

        r.inbound(delta(100));
        r.inbound(delta(60));
        assert_eq!(r.state(), SessionState::Speaking);

        let entries: Vec<_> = r.controller.playback().entries().copied().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 0);
        assert_eq!(entries[1].seq, 1);
        assert_eq!(entries[1].start, entries[0].end());

        r.inbound(InboundEvent::AudioDone);
        assert_eq!(r.state(), SessionState::Connected);
        // Already-scheduled audio keeps playing out.
        assert_eq!(r.controller.playback().len(), 2);
        assert!(r.view.lock().unwrap().rendering);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_speaking_reconnects_with_same_voice() {
        let mut r = rig();
        r.to_speaking("nova");
        let first = r.controller.session_id();
        r.clear_calls();

        r.inbound(InboundEvent::ConnectionClosed);

        assert_eq!(r.state(), SessionState::Reconnecting);
        assert_eq!(
            r.calls(),
            vec!["capture.stop", "channel.close", "playback.clear"]
        );
        assert!(r.controller.playback().is_empty());
        assert!(!r.mic_active());
        assert!(!r.socket_open());

        tokio::time::sleep(DELAY - Duration::from_millis(1)).await;
        r.pump();
        assert_eq!(r.state(), SessionState::Reconnecting);
        assert_eq!(r.opens().len(), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        r.pump();
        assert_eq!(r.state(), SessionState::Connecting);
        let opens = r.opens();
        assert_eq!(opens.len(), 2);
        assert_eq!(opens[1].1, "nova");
        assert!(opens[1].0 > first);
        assert!(r.mic_active());
    }

    #[tokio::test(start_paused = true)]
    async fn one_reconnect_per_disconnect() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "echo".into(),
        });
        r.inbound(InboundEvent::SessionCreated);

        r.inbound(InboundEvent::TransportError {
            message: "reset by peer".into(),
        });
        r.inbound(InboundEvent::ConnectionClosed);
        assert_eq!(r.view.lock().unwrap().reconnect_attempts, 1);

        tokio::time::sleep(DELAY * 3).await;
        r.pump();

        assert_eq!(r.opens().len(), 2);
        assert_eq!(r.state(), SessionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_retrying_until_closed() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "sage".into(),
        });

        for attempt in 1..=5u32 {
            r.inbound(InboundEvent::TransportError {
                message: "connection refused".into(),
            });
            assert_eq!(r.view.lock().unwrap().reconnect_attempts, attempt);
            tokio::time::sleep(DELAY + Duration::from_millis(1)).await;
            r.pump();
            assert_eq!(r.state(), SessionState::Connecting);
        }
        assert_eq!(r.opens().len(), 6);

        r.inbound(InboundEvent::SessionCreated);
        assert_eq!(r.view.lock().unwrap().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_reconnect() {
        let mut r = rig();
        r.to_speaking("nova");
        r.inbound(InboundEvent::ConnectionClosed);
        r.command(SessionCommand::Close);
        assert_eq!(r.state(), SessionState::Closed);

        tokio::time::sleep(DELAY * 2).await;
        r.pump();

        assert_eq!(r.state(), SessionState::Closed);
        assert_eq!(r.opens().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Close / teardown
    // -----------------------------------------------------------------------

    #[test]
    fn close_from_each_open_state_releases_everything() {
        let drivers: Vec<(SessionState, Vec<InboundEvent>)> = vec![
            (SessionState::Connecting, vec![]),
            (SessionState::Connected, vec![InboundEvent::SessionCreated]),
            (
                SessionState::Listening,
                vec![InboundEvent::SessionCreated, InboundEvent::SpeechStarted],
            ),
            (
                SessionState::Speaking,
                vec![InboundEvent::SessionCreated, delta(40)],
            ),
        ];

        for (expected, events) in drivers {
            let mut r = rig();
            r.command(SessionCommand::Open {
                voice: "coral".into(),
            });
            for e in events {
                r.inbound(e);
            }
            assert_eq!(r.state(), expected);
            r.clear_calls();

            r.command(SessionCommand::Close);

            assert_eq!(r.state(), SessionState::Closed, "from {expected:?}");
            assert_eq!(
                r.calls(),
                vec!["capture.stop", "channel.close", "playback.clear"],
                "from {expected:?}"
            );
            assert!(!r.mic_active());
            assert!(!r.socket_open());
            assert!(r.controller.playback().is_empty());
        }
    }

    #[test]
    fn close_from_idle_is_allowed() {
        let mut r = rig();
        r.command(SessionCommand::Close);
        assert_eq!(r.state(), SessionState::Closed);
        assert_eq!(r.count("capture.stop"), 0);
        assert_eq!(r.count("channel.close"), 0);
    }

    #[test]
    fn close_twice_releases_once() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        r.command(SessionCommand::Close);
        r.command(SessionCommand::Close);

        assert_eq!(r.state(), SessionState::Closed);
        assert_eq!(r.count("capture.stop"), 1);
        assert_eq!(r.count("channel.close"), 1);
    }

    #[test]
    fn events_after_close_are_ignored() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        r.command(SessionCommand::Close);

        r.inbound(InboundEvent::SessionCreated);
        r.inbound(delta(50));

        assert_eq!(r.state(), SessionState::Closed);
        assert!(r.controller.playback().is_empty());
    }

    #[test]
    fn open_after_close_starts_a_new_session() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        let first = r.controller.session_id();
        r.command(SessionCommand::Close);

        r.command(SessionCommand::Open {
            voice: "verse".into(),
        });

        assert_eq!(r.state(), SessionState::Connecting);
        assert!(r.controller.session_id() > first);
        assert_eq!(r.opens().last().unwrap().1, "verse");
    }

    // -----------------------------------------------------------------------
    // Voice changes
    // -----------------------------------------------------------------------

    #[test]
    fn change_voice_tears_down_then_reopens() {
        let mut r = rig();
        r.to_speaking("nova");
        r.clear_calls();

        r.command(SessionCommand::ChangeVoice {
            voice: "echo".into(),
        });

        assert_eq!(
            r.calls(),
            vec![
                "capture.stop",
                "channel.close",
                "playback.clear",
                "channel.open(echo)",
                "capture.start",
            ]
        );
        assert_eq!(r.state(), SessionState::Connecting);
        assert_eq!(r.controller.voice(), "echo");
        assert!(r.controller.playback().is_empty());
    }

    #[test]
    fn change_voice_while_idle_is_remembered() {
        let mut r = rig();
        r.command(SessionCommand::ChangeVoice {
            voice: "shimmer".into(),
        });

        assert_eq!(r.state(), SessionState::Idle);
        assert!(r.opens().is_empty());
        assert_eq!(r.view.lock().unwrap().voice, "shimmer");
    }

    #[test]
    fn unknown_voice_raises_notice_without_transition() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        r.inbound(InboundEvent::SessionCreated);

        r.command(SessionCommand::ChangeVoice {
            voice: "darth".into(),
        });

        assert_eq!(r.state(), SessionState::Connected);
        assert_eq!(r.controller.voice(), "nova");
        let notice = r.view.lock().unwrap().notice.clone().unwrap();
        assert_eq!(notice.kind, NoticeKind::Voice);
        assert!(notice.message.contains("darth"));
    }

    #[test]
    fn stale_session_events_are_discarded() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        let old = r.controller.session_id();
        r.command(SessionCommand::ChangeVoice {
            voice: "echo".into(),
        });

        r.controller.handle(SessionEvent::Inbound {
            session: old,
            event: InboundEvent::SessionCreated,
        });
        r.controller.handle(SessionEvent::Inbound {
            session: old,
            event: delta(30),
        });
        assert_eq!(r.state(), SessionState::Connecting);
        assert!(r.controller.playback().is_empty());

        r.inbound(InboundEvent::SessionCreated);
        assert_eq!(r.state(), SessionState::Connected);
    }

    #[test]
    fn stale_reconnect_timer_is_ignored() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        let old = r.controller.session_id();
        r.command(SessionCommand::ChangeVoice {
            voice: "ash".into(),
        });

        r.controller
            .handle(SessionEvent::ReconnectDue { session: old });

        assert_eq!(r.opens().len(), 2);
    }

    // -----------------------------------------------------------------------
    // Error taxonomy
    // -----------------------------------------------------------------------

    #[test]
    fn microphone_failure_returns_to_idle_with_notice() {
        let mut r = build_rig(true);
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });

        assert_eq!(r.state(), SessionState::Idle);
        assert_eq!(
            r.calls(),
            vec![
                "channel.open(nova)",
                "capture.start failed",
                "channel.close",
                "playback.clear",
            ]
        );
        assert!(!r.socket_open());
        let notice = r.view.lock().unwrap().notice.clone().unwrap();
        assert_eq!(notice.kind, NoticeKind::Device);
        assert!(notice.message.contains("permission denied"));
    }

    #[test]
    fn late_microphone_failure_returns_to_idle_with_notice() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        r.inbound(InboundEvent::SessionCreated);
        r.clear_calls();

        r.mic_fails_late("device unplugged");
        assert_eq!(r.state(), SessionState::Connected);
        r.pump();

        assert_eq!(r.state(), SessionState::Idle);
        assert_eq!(
            r.calls(),
            vec!["capture.stop", "channel.close", "playback.clear"]
        );
        assert!(!r.socket_open());
        let notice = r.view.lock().unwrap().notice.clone().unwrap();
        assert_eq!(notice.kind, NoticeKind::Device);
        assert!(notice.message.contains("device unplugged"));
    }

    #[test]
    fn late_microphone_failure_of_replaced_session_is_ignored() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        let stale_fault = r.fault.lock().unwrap().take().unwrap();
        r.command(SessionCommand::ChangeVoice {
            voice: "echo".into(),
        });

        stale_fault(CaptureError::MicUnavailable("old stream".into()));
        r.pump();

        assert_eq!(r.state(), SessionState::Connecting);
        assert!(r.mic_active());
        assert!(r.view.lock().unwrap().notice.is_none());
    }

    #[test]
    fn remote_error_is_surfaced_without_transition() {
        let mut r = rig();
        r.to_speaking("nova");

        r.inbound(InboundEvent::Error {
            error: Some(RemoteError::Text("OpenAI connection error".into())),
        });

        assert_eq!(r.state(), SessionState::Speaking);
        let notice = r.view.lock().unwrap().notice.clone().unwrap();
        assert_eq!(notice.kind, NoticeKind::Remote);
        assert_eq!(notice.message, "OpenAI connection error");

        r.command(SessionCommand::DismissNotice);
        assert!(r.view.lock().unwrap().notice.is_none());
    }

    #[test]
    fn remote_error_without_message_gets_generic_text() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        r.inbound(InboundEvent::Error { error: None });

        let notice = r.view.lock().unwrap().notice.clone().unwrap();
        assert!(!notice.message.is_empty());
        assert_eq!(r.state(), SessionState::Connecting);
    }

    #[test]
    fn undecodable_delta_is_dropped() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        r.inbound(InboundEvent::SessionCreated);

        r.inbound(InboundEvent::AudioDelta {
            delta: "%%% not base64".into(),
        });

        assert_eq!(r.state(), SessionState::Connected);
        assert!(r.controller.playback().is_empty());
    }

    #[test]
    fn delta_before_acknowledgement_is_ignored() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        r.inbound(delta(20));
        assert_eq!(r.state(), SessionState::Connecting);
        assert!(r.controller.playback().is_empty());
    }

    // -----------------------------------------------------------------------
    // Frames and playback status
    // -----------------------------------------------------------------------

    #[test]
    fn microphone_frames_reach_the_channel() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        r.speak(4096);
        r.speak(4096);
        r.pump();

        let p = r.record.lock().unwrap();
        assert_eq!(p.sent.len(), 2);
        assert_eq!(p.sent[0].sample_count(), 4096);
    }

    #[test]
    fn muted_frames_are_not_sent() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        r.command(SessionCommand::SetMuted(true));
        r.speak(1024);
        r.pump();
        assert!(r.record.lock().unwrap().sent.is_empty());
        assert!(r.view.lock().unwrap().muted);

        r.command(SessionCommand::SetMuted(false));
        r.speak(1024);
        r.pump();
        assert_eq!(r.record.lock().unwrap().sent.len(), 1);
    }

    #[test]
    fn frames_from_previous_session_are_dropped() {
        let mut r = rig();
        r.command(SessionCommand::Open {
            voice: "nova".into(),
        });
        let old = r.controller.session_id();
        r.command(SessionCommand::ChangeVoice {
            voice: "onyx".into(),
        });

        r.controller.handle(SessionEvent::Frame {
            session: old,
            frame: AudioFrame::encode(&[0.0; 256]),
        });

        assert!(r.record.lock().unwrap().sent.is_empty());
    }

    #[test]
    fn speech_started_during_playback_clears_speaking() {
        let mut r = rig();
        r.to_speaking("nova");
        assert!(r.view.lock().unwrap().speaking);

        r.inbound(InboundEvent::SpeechStarted);

        assert_eq!(r.state(), SessionState::Listening);
        let view = r.view.lock().unwrap().clone();
        assert!(view.recording);
        assert!(!view.speaking);

        // A late audio.done for the interrupted turn changes nothing.
        r.inbound(InboundEvent::AudioDone);
        assert_eq!(r.state(), SessionState::Listening);
        assert!(!r.view.lock().unwrap().speaking);
    }

    #[test]
    fn playback_tick_retires_finished_audio() {
        let mut r = rig();
        r.to_speaking("nova");
        r.inbound(InboundEvent::AudioDone);
        assert!(r.view.lock().unwrap().rendering);

        r.advance_clock(Duration::from_millis(150));
        r.controller.handle(SessionEvent::PlaybackTick);

        assert!(r.controller.playback().is_empty());
        assert!(!r.view.lock().unwrap().rendering);
    }

    #[test]
    fn unknown_default_voice_falls_back() {
        let config = SessionConfig {
            default_voice: "robot".into(),
            ..SessionConfig::default()
        };
        let r = rig();
        let controller = SessionController::new(
            config,
            Box::new(MockCapture {
                log: Arc::clone(&r.log),
                fail: false,
                callback: Arc::default(),
                fault: Arc::default(),
            }),
            Box::new(MockChannel {
                log: Arc::clone(&r.log),
                record: Arc::default(),
            }),
            PlaybackQueue::new(Box::new(MockOutput {
                log: Arc::clone(&r.log),
                now: Arc::default(),
            })),
            new_shared_view("robot"),
        );
        assert_eq!(controller.voice(), FALLBACK_VOICE);
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn run_closes_session_when_commands_end() {
        let r = rig();
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let handle = tokio::spawn(r.controller.run(cmd_rx));

        cmd_tx
            .send(SessionCommand::Open {
                voice: "ballad".into(),
            })
            .await
            .unwrap();
        drop(cmd_tx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run loop did not exit")
            .unwrap();

        let view = r.view.lock().unwrap().clone();
        assert_eq!(view.state, SessionState::Closed);
        assert_eq!(view.voice, "ballad");
        let calls = r.log.lock().unwrap().clone();
        assert_eq!(calls[0], "channel.open(ballad)");
        assert!(calls.contains(&"capture.stop".to_string()));
        assert!(r.mic.lock().unwrap().is_none());
        assert!(!r.record.lock().unwrap().open);
    }
}
