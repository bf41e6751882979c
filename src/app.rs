//! Voice assistant floating widget: egui/eframe application.
//!
//! # Architecture
//!
//! [`AssistantApp`] is the top-level [`eframe::App`].  It holds no session
//! logic of its own:
//!
//! * `view`       : [`SharedView`] published by the session controller,
//!   read once per frame.
//! * `command_tx` : sends [`SessionCommand`]s to the controller with
//!   `try_send`, so the UI thread never blocks.
//!
//! # Widget States
//!
//! | State | Visual |
//! |-------|--------|
//! | `Idle` / `Closed` | voice picker + "Connect", dim gray |
//! | `Connecting` / `Reconnecting` | spinner + status, blue |
//! | `Connected` | "Say something", green |
//! | `Listening` | pulsing indicator, red |
//! | `Speaking` | level bars, green |
//!
//! A notice (microphone, service or voice problem) is shown in orange under
//! the status line until dismissed.

use std::time::Duration;

use eframe::egui;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::session::{
    find_voice, NoticeKind, SessionCommand, SessionState, SessionView, SharedView, VOICES,
};

// ---------------------------------------------------------------------------
// AssistantApp
// ---------------------------------------------------------------------------

/// eframe application: the floating voice assistant widget.
pub struct AssistantApp {
    // ── Session ──────────────────────────────────────────────────────────
    /// Snapshot published by the controller after every event.
    view: SharedView,
    /// Send commands to the session controller.
    command_tx: mpsc::Sender<SessionCommand>,

    // ── UI state ─────────────────────────────────────────────────────────
    /// Voice currently selected in the picker.
    selected_voice: String,
    /// Whether the details panel is expanded.
    show_details: bool,
    /// Spinner animation phase (increases each frame).
    spinner_phase: f32,
    /// Outer window position seen on the last frame.
    window_pos: Option<egui::Pos2>,

    // ── Configuration ────────────────────────────────────────────────────
    /// Application configuration; only the window position changes, and it
    /// is written back on exit.
    config: AppConfig,
}

impl AssistantApp {
    /// Create a new [`AssistantApp`].
    ///
    /// * `view`       : snapshot shared with the session controller.
    /// * `command_tx` : sender end of the session command channel.
    /// * `config`     : loaded application configuration.
    pub fn new(view: SharedView, command_tx: mpsc::Sender<SessionCommand>, config: AppConfig) -> Self {
        let selected_voice = view
            .lock()
            .map(|v| v.voice.clone())
            .unwrap_or_else(|_| config.session.default_voice.clone());

        Self {
            view,
            command_tx,
            selected_voice,
            show_details: false,
            spinner_phase: 0.0,
            window_pos: None,
            config,
        }
    }

    /// Copy the last seen window position into the config.  Returns `true`
    /// when it differs from what the config already holds.
    fn remember_position(&mut self) -> bool {
        let Some(pos) = self.window_pos else {
            return false;
        };
        let pos = Some((pos.x, pos.y));
        if self.config.ui.window_position == pos {
            return false;
        }
        self.config.ui.window_position = pos;
        true
    }

    fn snapshot(&self) -> SessionView {
        match self.view.lock() {
            Ok(v) => v.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn send(&self, cmd: SessionCommand) {
        if let Err(e) = self.command_tx.try_send(cmd) {
            log::warn!("ui: dropping command: {e}");
        }
    }

    // ── Window sizing ────────────────────────────────────────────────────

    /// Resize the window to fit the current content.
    fn update_window_size(&self, ctx: &egui::Context, view: &SessionView) {
        let mut height = 88.0;
        if view.notice.is_some() {
            height += 34.0;
        }
        if self.show_details {
            height += 76.0;
        }
        ctx.send_viewport_cmd(egui::ViewportCommand::InnerSize(egui::vec2(300.0, height)));
    }

    // ── Custom title bar ─────────────────────────────────────────────────

    /// Draw the draggable title bar with status icon, title, and window
    /// controls (details, minimise, close).
    fn draw_title_bar(&mut self, ui: &mut egui::Ui, ctx: &egui::Context, view: &SessionView) {
        ui.horizontal(|ui| {
            let icon = match view.state {
                SessionState::Idle | SessionState::Closed => "  ",
                SessionState::Connecting | SessionState::Reconnecting => ". ",
                SessionState::Connected => "o ",
                SessionState::Listening => "* ",
                SessionState::Speaking => "> ",
            };
            ui.label(egui::RichText::new(icon).color(state_color(view.state)));

            let title_resp = ui.label(
                egui::RichText::new("Voice Assistant")
                    .color(egui::Color32::from_rgb(200, 200, 200))
                    .size(13.0),
            );
            if title_resp.is_pointer_button_down_on() {
                if let Some(outer_rect) = ctx.input(|i| i.viewport().outer_rect) {
                    let delta = ctx.input(|i| i.pointer.delta());
                    ctx.send_viewport_cmd(egui::ViewportCommand::OuterPosition(
                        outer_rect.min + delta,
                    ));
                }
            }

            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                if title_button(ui, "x", egui::Color32::from_rgb(200, 100, 100)).clicked() {
                    ctx.send_viewport_cmd(egui::ViewportCommand::Close);
                }
                if title_button(ui, "-", egui::Color32::from_rgb(150, 150, 150)).clicked() {
                    ctx.send_viewport_cmd(egui::ViewportCommand::Minimized(true));
                }
                if title_button(ui, "=", egui::Color32::from_rgb(150, 150, 150)).clicked() {
                    self.show_details = !self.show_details;
                }
            });
        });
    }

    // ── Panels ───────────────────────────────────────────────────────────

    /// Status line: spinner or indicator, state label, voice.
    fn draw_status(&self, ui: &mut egui::Ui, view: &SessionView) {
        let busy = matches!(
            view.state,
            SessionState::Connecting | SessionState::Reconnecting
        );
        let text = match view.state {
            SessionState::Connected => "Connected, say something".to_string(),
            SessionState::Reconnecting if view.reconnect_attempts > 1 => {
                format!("Reconnecting… (attempt {})", view.reconnect_attempts)
            }
            state if busy => format!("{} {}", self.spinner_char(), state.label()),
            state => state.label().to_string(),
        };

        ui.horizontal(|ui| {
            ui.label(
                egui::RichText::new(text)
                    .color(state_color(view.state))
                    .size(13.0),
            );
            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                if view.muted {
                    ui.label(
                        egui::RichText::new("muted")
                            .color(egui::Color32::from_rgb(255, 136, 68))
                            .size(11.0),
                    );
                }
                if view.rendering {
                    self.draw_level(ui);
                }
            });
        });
    }

    /// Voice picker plus Connect / End / Mute.
    fn draw_controls(&mut self, ui: &mut egui::Ui, view: &SessionView) {
        let live = view.state.is_open() || view.state == SessionState::Reconnecting;

        ui.horizontal(|ui| {
            let selected_name = find_voice(&self.selected_voice)
                .map(|v| v.display_name)
                .unwrap_or(self.selected_voice.as_str())
                .to_string();

            let before = self.selected_voice.clone();
            egui::ComboBox::from_id_salt("voice-picker")
                .width(110.0)
                .selected_text(selected_name)
                .show_ui(ui, |ui| {
                    for voice in VOICES {
                        ui.selectable_value(
                            &mut self.selected_voice,
                            voice.id.to_string(),
                            voice.display_name,
                        )
                        .on_hover_text(voice.description);
                    }
                });
            if self.selected_voice != before {
                self.send(SessionCommand::ChangeVoice {
                    voice: self.selected_voice.clone(),
                });
            }

            if live {
                if ui
                    .add(egui::Button::new(egui::RichText::new("End").size(11.0)))
                    .clicked()
                {
                    self.send(SessionCommand::Close);
                }
            } else if ui
                .add(egui::Button::new(egui::RichText::new("Connect").size(11.0)))
                .clicked()
            {
                self.send(SessionCommand::Open {
                    voice: self.selected_voice.clone(),
                });
            }

            let mute_label = if view.muted { "Unmute" } else { "Mute" };
            if ui
                .add_enabled(
                    live,
                    egui::Button::new(egui::RichText::new(mute_label).size(11.0)),
                )
                .clicked()
            {
                self.send(SessionCommand::SetMuted(!view.muted));
            }
        });
    }

    /// Notice line with a dismiss button.
    fn draw_notice(&self, ui: &mut egui::Ui, view: &SessionView) {
        let Some(notice) = &view.notice else {
            return;
        };
        let prefix = match notice.kind {
            NoticeKind::Device => "Microphone",
            NoticeKind::Remote => "Service",
            NoticeKind::Voice => "Voice",
        };

        ui.add_space(2.0);
        ui.horizontal(|ui| {
            ui.label(
                egui::RichText::new(format!("{prefix}: {}", notice.message))
                    .color(egui::Color32::from_rgb(255, 136, 68))
                    .size(11.0),
            );
            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                if ui
                    .add(egui::Button::new(egui::RichText::new("ok").size(10.0)))
                    .clicked()
                {
                    self.send(SessionCommand::DismissNotice);
                }
            });
        });
    }

    /// Connection details.
    fn draw_details(&self, ui: &mut egui::Ui, view: &SessionView) {
        let line = |ui: &mut egui::Ui, text: String| {
            ui.label(
                egui::RichText::new(text)
                    .color(egui::Color32::from_rgb(140, 140, 140))
                    .size(11.0),
            );
        };

        ui.add_space(2.0);
        line(ui, format!("  Server: {}", self.config.transport.url));
        line(ui, format!("  Voice: {}", view.voice));
        line(
            ui,
            format!(
                "  Frames: {} sent, {} dropped",
                view.frames_sent, view.frames_dropped
            ),
        );
        line(
            ui,
            format!(
                "  Reconnect delay: {} ms",
                self.config.session.reconnect_delay_ms
            ),
        );
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    /// Small animated bars shown while assistant audio is playing.
    fn draw_level(&self, ui: &mut egui::Ui) {
        let (rect, _) = ui.allocate_exact_size(egui::vec2(24.0, 12.0), egui::Sense::hover());
        let painter = ui.painter();
        let bar_width = rect.width() / 4.0;

        for i in 0..4 {
            let phase = self.spinner_phase + i as f32 * 0.9;
            let amplitude = 0.35 + 0.65 * (phase * 1.6).sin().abs();
            let x = rect.left() + i as f32 * bar_width;
            painter.rect_filled(
                egui::Rect::from_center_size(
                    egui::pos2(x + bar_width / 2.0, rect.center().y),
                    egui::vec2((bar_width * 0.6).max(1.0), rect.height() * amplitude),
                ),
                1.0,
                egui::Color32::from_rgb(80, 200, 120),
            );
        }
    }

    /// A simple rotating ASCII spinner character driven by `spinner_phase`.
    fn spinner_char(&self) -> char {
        let chars = ['|', '/', '-', '\\'];
        let idx = (self.spinner_phase as usize) % chars.len();
        chars[idx]
    }
}

fn title_button(ui: &mut egui::Ui, text: &str, color: egui::Color32) -> egui::Response {
    ui.add(egui::Button::new(egui::RichText::new(text).color(color).size(12.0)).frame(false))
}

/// Accent colour for a session state.
fn state_color(state: SessionState) -> egui::Color32 {
    match state {
        SessionState::Idle | SessionState::Closed => egui::Color32::from_rgb(120, 120, 120),
        SessionState::Connecting | SessionState::Reconnecting => {
            egui::Color32::from_rgb(68, 136, 255)
        }
        SessionState::Connected | SessionState::Speaking => egui::Color32::from_rgb(80, 200, 120),
        SessionState::Listening => egui::Color32::from_rgb(255, 68, 68),
    }
}

// ---------------------------------------------------------------------------
// eframe::App impl
// ---------------------------------------------------------------------------

impl eframe::App for AssistantApp {
    /// Called every frame by eframe.  Reads the session snapshot, advances
    /// animation, then renders the widget.
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let view = self.snapshot();

        // --- Advance spinner animation -------------------------------------
        self.spinner_phase += 0.08;
        if self.spinner_phase >= 4.0 {
            self.spinner_phase = 0.0;
        }

        // --- Schedule repaints ----------------------------------------------
        // The controller updates the view from another thread, so keep
        // polling even when nothing is animating.
        let repaint = if view.rendering || view.state == SessionState::Listening {
            Duration::from_millis(33)
        } else if matches!(
            view.state,
            SessionState::Connecting | SessionState::Reconnecting
        ) {
            Duration::from_millis(66)
        } else {
            Duration::from_millis(250)
        };
        ctx.request_repaint_after(repaint);

        self.update_window_size(ctx, &view);
        if let Some(rect) = ctx.input(|i| i.viewport().outer_rect) {
            self.window_pos = Some(rect.min);
        }

        // --- Dark transparent background frame ----------------------------
        let frame = egui::Frame::new()
            .fill(egui::Color32::from_rgba_premultiplied(30, 30, 30, 220))
            .corner_radius(egui::CornerRadius::same(8))
            .inner_margin(egui::Margin::same(8));

        egui::CentralPanel::default().frame(frame).show(ctx, |ui| {
            self.draw_title_bar(ui, ctx, &view);
            ui.separator();
            self.draw_status(ui, &view);
            self.draw_notice(ui, &view);
            ui.add_space(4.0);
            self.draw_controls(ui, &view);

            if self.show_details {
                ui.separator();
                self.draw_details(ui, &view);
            }
        });
    }

    /// End the session when the window goes away and remember where the
    /// widget was.
    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        log::info!("Voice assistant widget closing");
        self.send(SessionCommand::Close);

        if self.remember_position() {
            match self.config.save() {
                Ok(()) => log::info!("Saved window position {:?}", self.config.ui.window_position),
                Err(e) => log::warn!("Failed to save window position: {e}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
