//! # Operator Console
//!
//! The eframe application on top of [`SessionController`]. It only renders state
//! and forwards operator input; all broker, backend and upload work happens in
//! the controller and its tasks.
//!
//! ## Layout
//!
//! ```text
//! ┌ header: connection, client id, exploration, Start/Stop ───────────┐
//! │ live frame                │ detection frame                       │
//! │ sensor table              │ movement pad                          │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Frames are decoded into textures once per received frame. A texture is
//! named after the frame's display handle and dropped as soon as the frame is
//! superseded or released.

pub mod common;

use eframe::egui::{
    self, vec2, Align2, Button, Context, Event, Grid, Id, Image, Key, Modal, RichText, TextEdit,
    TextureHandle, TextureOptions, Ui,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::alert::Alert;
use crate::control::MovementCommand;
use crate::session::{Session, SessionController};
use crate::telemetry::{FrameBuffer, SensorReadings, DETECTION_LABEL, VIDEO_LABEL};

use self::common::{
    connection_color, create_frame, decode_frame, gas_detected, reading_text,
    temperature_is_critical, ToastQueue, UiColors,
};

const REPAINT_INTERVAL: Duration = Duration::from_millis(33);
const FRAME_SIZE: egui::Vec2 = egui::Vec2 { x: 480.0, y: 360.0 };

/// What the last successful telemetry read showed.
#[derive(Default)]
struct TelemetryView {
    sensors: SensorReadings,
    video: Option<FrameBuffer>,
    detection: Option<FrameBuffer>,
    last_update: Option<chrono::NaiveDateTime>,
}

/// Texture of the frame a panel currently shows.
#[derive(Default)]
struct FrameTexture {
    sequence: Option<u64>,
    texture: Option<TextureHandle>,
}

impl FrameTexture {
    fn update(&mut self, ctx: &Context, frame: Option<&FrameBuffer>, label: &str) {
        let Some(frame) = frame else {
            self.sequence = None;
            self.texture = None;
            return;
        };
        if self.sequence == Some(frame.sequence) {
            return;
        }
        self.sequence = Some(frame.sequence);
        match decode_frame(frame) {
            Ok(image) => {
                self.texture = Some(ctx.load_texture(
                    frame.display_uri(label),
                    image,
                    TextureOptions::LINEAR,
                ));
            }
            Err(e) => debug!("Skipping undecodable {} frame {}: {}", label, frame.sequence, e),
        }
    }

    fn release(&mut self, released: &[String]) {
        if self
            .texture
            .as_ref()
            .is_some_and(|t| {
                let name = t.name();
                released.iter().any(|uri| *uri == name)
            })
        {
            self.sequence = None;
            self.texture = None;
        }
    }
}

#[derive(Default)]
struct NamePrompt {
    name: String,
    error: Option<String>,
}

pub struct StreamControllerUI {
    controller: SessionController,
    alerts: mpsc::Receiver<Alert>,
    toasts: ToastQueue,
    fatal: Option<Alert>,
    name_prompt: Option<NamePrompt>,
    view: TelemetryView,
    session: Option<Session>,
    video_texture: FrameTexture,
    detection_texture: FrameTexture,
}

impl StreamControllerUI {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        controller: SessionController,
        alerts: mpsc::Receiver<Alert>,
    ) -> Self {
        cc.egui_ctx.set_theme(egui::Theme::Dark);
        Self {
            controller,
            alerts,
            toasts: ToastQueue::default(),
            fatal: None,
            name_prompt: None,
            view: TelemetryView::default(),
            session: None,
            video_texture: FrameTexture::default(),
            detection_texture: FrameTexture::default(),
        }
    }

    fn drain_alerts(&mut self) {
        let now = Instant::now();
        while let Ok(alert) = self.alerts.try_recv() {
            if alert.is_fatal() {
                if self.fatal.is_none() {
                    self.fatal = Some(alert);
                } else {
                    debug!("Fatal alert already pending, dropping: {}", alert);
                }
            } else {
                self.toasts.push(alert, now);
            }
        }
        self.toasts.expire(now);
    }

    /// Takes a fresh snapshot; keeps the previous one while a writer holds the lock.
    fn refresh_view(&mut self) {
        let telemetry = self.controller.telemetry();
        if let Ok(state) = telemetry.try_read() {
            self.view = TelemetryView {
                sensors: state.sensors.clone(),
                video: state.video.clone(),
                detection: state.detection.as_ref().map(|d| d.frame.clone()),
                last_update: state.last_update,
            };
        }
        if let Some(session) = self.controller.session_snapshot() {
            self.session = session;
        }
    }

    fn update_textures(&mut self, ctx: &Context) {
        self.video_texture
            .update(ctx, self.view.video.as_ref(), VIDEO_LABEL);
        self.detection_texture
            .update(ctx, self.view.detection.as_ref(), DETECTION_LABEL);
    }

    fn release_frames(&mut self, released: Vec<String>) {
        debug!("Released frames: {:?}", released);
        self.video_texture.release(&released);
        self.detection_texture.release(&released);
        self.view.video = None;
        self.view.detection = None;
    }

    fn handle_keyboard(&mut self, ctx: &Context) {
        if ctx.wants_keyboard_input() || self.name_prompt.is_some() || self.fatal.is_some() {
            return;
        }
        let keys: Vec<Key> = ctx.input(|i| {
            i.events
                .iter()
                .filter_map(|event| match event {
                    Event::Key {
                        key,
                        pressed: true,
                        repeat: false,
                        modifiers,
                        ..
                    } if modifiers.is_none() => Some(*key),
                    _ => None,
                })
                .collect()
        });
        for key in keys {
            if let Some(command) = self.controller.handle_key(key) {
                debug!("Key {:?} sent {}", key, command);
            }
        }
    }

    fn header(&mut self, ui: &mut Ui) {
        let state = self.controller.connection_state();
        ui.horizontal(|ui| {
            ui.heading("Stream Controller");
            ui.colored_label(connection_color(state), "\u{2B24}");
            ui.label(state.to_string());
            if !self.controller.client_id().is_empty() {
                ui.label(RichText::new(self.controller.client_id()).monospace());
            }
            ui.separator();

            match &self.session {
                Some(session) => {
                    let id = session
                        .id
                        .as_ref()
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "creating…".to_string());
                    ui.label(format!("Exploration: {} ({})", session.name, id));
                }
                None => {
                    ui.label("No exploration running");
                }
            }

            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                if self.session.is_some() {
                    if ui.add(Button::new("Stop").min_size(vec2(80.0, 24.0))).clicked() {
                        let released = self.controller.stop();
                        self.session = None;
                        self.release_frames(released);
                    }
                } else if ui
                    .add(Button::new("Start").min_size(vec2(80.0, 24.0)))
                    .clicked()
                {
                    self.name_prompt = Some(NamePrompt::default());
                }

                if let Some(last) = self.view.last_update {
                    ui.label(format!("Last update {}", last.format("%H:%M:%S")));
                }
            });
        });
    }

    fn frame_panel(ui: &mut Ui, title: &str, frame: &FrameTexture) {
        create_frame(UiColors::EXTREME_BG, UiColors::BORDER).show(ui, |ui| {
            ui.set_min_size(FRAME_SIZE);
            ui.vertical(|ui| {
                ui.label(RichText::new(title).strong());
                match &frame.texture {
                    Some(texture) => {
                        ui.add(
                            Image::new(texture)
                                .max_size(FRAME_SIZE)
                                .maintain_aspect_ratio(true),
                        );
                    }
                    None => {
                        ui.centered_and_justified(|ui| ui.label("No frame"));
                    }
                }
            });
        });
    }

    fn sensor_table(&self, ui: &mut Ui) {
        let sensors = &self.view.sensors;
        create_frame(UiColors::INNER_BG, UiColors::BORDER).show(ui, |ui| {
            Grid::new("sensor_table")
                .num_columns(2)
                .striped(true)
                .spacing(vec2(24.0, 4.0))
                .show(ui, |ui| {
                    ui.label("Infrared");
                    ui.label(reading_text(sensors.infrared.as_deref(), false));
                    ui.end_row();

                    ui.label("Temperature");
                    let temperature = sensors.temperature.as_deref();
                    ui.label(reading_text(temperature, temperature_is_critical(temperature)));
                    ui.end_row();

                    ui.label("Humidity");
                    ui.label(reading_text(sensors.humidity.as_deref(), false));
                    ui.end_row();

                    ui.label("Gas");
                    let gas = sensors.gas.as_deref();
                    ui.label(reading_text(gas, gas_detected(gas)));
                    ui.end_row();
                });
        });
    }

    fn movement_pad(&self, ui: &mut Ui) {
        let size = vec2(90.0, 32.0);
        let mut pressed = None;
        create_frame(UiColors::INNER_BG, UiColors::BORDER).show(ui, |ui| {
            Grid::new("movement_pad")
                .num_columns(3)
                .spacing(vec2(4.0, 4.0))
                .show(ui, |ui| {
                    let mut button = |ui: &mut Ui, command: MovementCommand| {
                        if ui.add(Button::new(command.label()).min_size(size)).clicked() {
                            pressed = Some(command);
                        }
                    };

                    ui.label("");
                    button(ui, MovementCommand::Forward);
                    ui.label("");
                    ui.end_row();

                    button(ui, MovementCommand::Left);
                    button(ui, MovementCommand::Stop);
                    button(ui, MovementCommand::Right);
                    ui.end_row();

                    ui.label("");
                    button(ui, MovementCommand::Backward);
                    ui.label("");
                    ui.end_row();
                });
            ui.small("Keys: w forward, x backward, a left, d right, s stop");
        });
        if let Some(command) = pressed {
            self.controller.press_movement(command);
        }
    }

    fn name_prompt(&mut self, ctx: &Context) {
        let Some(prompt) = self.name_prompt.as_mut() else {
            return;
        };

        let mut submit = false;
        let mut cancel = false;
        let response = Modal::new(Id::new("exploration_name")).show(ctx, |ui| {
            ui.set_width(280.0);
            ui.heading("New exploration");
            ui.label("Name");
            let edit = ui.add(TextEdit::singleline(&mut prompt.name).hint_text("required"));
            if edit.lost_focus() && ui.input(|i| i.key_pressed(Key::Enter)) {
                submit = true;
            }
            if let Some(error) = &prompt.error {
                ui.colored_label(UiColors::CRITICAL, error.as_str());
            }
            ui.separator();
            egui::Sides::new().show(
                ui,
                |left| {
                    if left.button("Start").clicked() {
                        submit = true;
                    }
                },
                |right| {
                    if right.button("Cancel").clicked() {
                        cancel = true;
                    }
                },
            );
        });

        if cancel || response.should_close() {
            self.name_prompt = None;
            return;
        }
        if submit {
            let name = prompt.name.clone();
            match self.controller.start(&name) {
                Ok(()) => {
                    info!("Exploration '{}' started from the console", name.trim());
                    self.name_prompt = None;
                }
                Err(e) => prompt.error = Some(e.to_string()),
            }
        }
    }

    fn fatal_modal(&mut self, ctx: &Context) {
        let Some(alert) = self.fatal.as_ref() else {
            return;
        };

        let mut acknowledged = false;
        Modal::new(Id::new("fatal_alert")).show(ctx, |ui| {
            ui.set_width(320.0);
            ui.heading(RichText::new(alert.kind.to_string()).color(UiColors::CRITICAL));
            ui.label(alert.message.as_str());
            ui.separator();
            if ui.button("Restart").clicked() {
                acknowledged = true;
            }
        });

        if acknowledged {
            warn!("Operator acknowledged: {}", alert);
            self.fatal = None;
            self.name_prompt = None;
            let released = self.controller.restart();
            self.session = None;
            self.release_frames(released);
        }
    }

    fn toasts(&mut self, ctx: &Context) {
        if self.toasts.is_empty() {
            return;
        }
        let mut dismissed = None;
        egui::Area::new(Id::new("toasts"))
            .anchor(Align2::RIGHT_BOTTOM, vec2(-12.0, -12.0))
            .show(ctx, |ui| {
                for (index, toast) in self.toasts.iter().enumerate() {
                    create_frame(UiColors::MAIN_BG, UiColors::INACTIVE).show(ui, |ui| {
                        ui.horizontal(|ui| {
                            ui.label(toast.alert.to_string());
                            if ui.small_button("\u{2716}").clicked() {
                                dismissed = Some(index);
                            }
                        });
                    });
                }
            });
        if let Some(index) = dismissed {
            self.toasts.dismiss(index);
        }
    }
}

impl eframe::App for StreamControllerUI {
    fn update(&mut self, ctx: &Context, _frame: &mut eframe::Frame) {
        ctx.request_repaint_after(REPAINT_INTERVAL);

        self.drain_alerts();
        self.refresh_view();
        self.update_textures(ctx);
        self.handle_keyboard(ctx);

        egui::TopBottomPanel::top("header")
            .show_separator_line(false)
            .show(ctx, |ui| self.header(ui));

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.horizontal_top(|ui| {
                ui.vertical(|ui| {
                    Self::frame_panel(ui, "Live", &self.video_texture);
                    self.sensor_table(ui);
                });
                ui.add_space(8.0);
                ui.vertical(|ui| {
                    Self::frame_panel(ui, "Detection", &self.detection_texture);
                    self.movement_pad(ui);
                });
            });
        });

        self.toasts(ctx);
        self.name_prompt(ctx);
        self.fatal_modal(ctx);
    }
}
