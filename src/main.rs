//! Application entry point: realtime voice assistant.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Create the [`tokio`] runtime (multi-thread, 2 workers).
//! 4. Build the microphone encoder, the realtime socket channel and the
//!    speaker output (silent fallback when no output device exists).
//! 5. Spawn the session controller on the runtime.
//! 6. Run [`eframe::run_native`]; blocks the main thread until the window
//!    is closed, after which the command channel drops and the controller
//!    closes the session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use voice_assistant::{
    app::AssistantApp,
    audio::MicEncoder,
    config::AppConfig,
    playback::{AudioOutput, PlaybackQueue, SilentOutput, SpeakerOutput},
    session::{
        is_known_voice, new_shared_view, SessionCommand, SessionController, FALLBACK_VOICE,
    },
    transport::{HttpTokenSource, WsChannel},
};

use eframe::egui;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Native options builder
// ---------------------------------------------------------------------------

fn native_options(config: &AppConfig) -> eframe::NativeOptions {
    let mut vp = egui::ViewportBuilder::default()
        .with_decorations(false)
        .with_transparent(true)
        .with_inner_size([300.0, 88.0])
        .with_min_inner_size([260.0, 60.0])
        .with_resizable(false);

    if config.ui.always_on_top {
        vp = vp.with_always_on_top();
    }

    if let Some((x, y)) = config.ui.window_position {
        vp = vp.with_position(egui::pos2(x, y));
    }

    eframe::NativeOptions {
        viewport: vp,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Voice assistant starting up");

    // 2. Configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });
    if !is_known_voice(&config.session.default_voice) {
        log::warn!(
            "Configured voice {:?} is not in the catalog; using {FALLBACK_VOICE}",
            config.session.default_voice
        );
        config.session.default_voice = FALLBACK_VOICE.to_string();
    }

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    // 4. Session resources
    let capture = MicEncoder::new(config.audio.input_device.clone(), config.audio.frame_samples);

    let mut channel = WsChannel::new(&config.transport);
    match HttpTokenSource::from_config(&config.transport) {
        Some(tokens) => {
            log::info!("Session tokens will be fetched before each connect");
            channel = channel.with_token_source(Arc::new(tokens));
        }
        None => log::info!("No token_url configured; connecting without a session token"),
    }

    // Degrade to a silent clock so the session still runs without speakers.
    let output: Box<dyn AudioOutput> = match SpeakerOutput::open(config.audio.output_device.clone())
    {
        Ok(speaker) => {
            log::info!("Speaker output opened");
            Box::new(speaker)
        }
        Err(e) => {
            log::warn!("Speaker unavailable ({e}); assistant audio will not be heard");
            Box::new(SilentOutput::new())
        }
    };

    // 5. Session controller
    let view = new_shared_view(&config.session.default_voice);
    let (command_tx, command_rx) = mpsc::channel::<SessionCommand>(16);

    let controller = SessionController::new(
        config.session.clone(),
        Box::new(capture),
        Box::new(channel),
        PlaybackQueue::new(output),
        Arc::clone(&view),
    );
    let session_task = rt.spawn(controller.run(command_rx));

    if config.session.auto_connect {
        let _ = command_tx.try_send(SessionCommand::Open {
            voice: config.session.default_voice.clone(),
        });
    }

    // 6. Build the egui app and run it (blocks until the window is closed)
    let app = AssistantApp::new(view, command_tx, config.clone());
    let options = native_options(&config);

    let ui_result = eframe::run_native(
        "Voice Assistant",
        options,
        Box::new(move |_cc| Ok(Box::new(app))),
    );

    // The app (and its command sender) is gone; give the controller a moment
    // to release the microphone and socket.
    match rt.block_on(async { tokio::time::timeout(SHUTDOWN_GRACE, session_task).await }) {
        Ok(Ok(())) => log::info!("Session shut down cleanly"),
        Ok(Err(e)) => log::warn!("Session task ended abnormally: {e}"),
        Err(_) => log::warn!("Session did not shut down within {SHUTDOWN_GRACE:?}"),
    }

    ui_result.map_err(|e| anyhow::anyhow!("UI error: {e}"))
}
