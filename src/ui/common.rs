//! # UI Common Components
//!
//! Styling shared by every panel of the console plus the presentation rules
//! for sensor readings. The core keeps readings as raw strings; everything that
//! interprets them for display lives here.

use eframe::egui::{Color32, ColorImage, Frame, RichText, Stroke};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::alert::Alert;
use crate::mqtt::mqtt_handler::ConnectionState;
use crate::telemetry::{ContentType, FrameBuffer};

/// Placeholder for a reading that never arrived.
pub const NO_READING: &str = "-";

/// Temperatures strictly above this are highlighted.
pub const TEMPERATURE_LIMIT: i64 = 50;

pub const TOAST_LIFETIME: Duration = Duration::from_secs(6);

/// Color palette of the dark console theme.
pub struct UiColors;

impl UiColors {
    /// Primary background color for main content areas (RGB: 30, 30, 30)
    pub const MAIN_BG: Color32 = Color32::from_rgb(30, 30, 30);

    /// Secondary background color for nested components (RGB: 25, 25, 25)
    pub const INNER_BG: Color32 = Color32::from_rgb(25, 25, 25);

    /// Deepest background color, used behind video frames (RGB: 20, 20, 20)
    pub const EXTREME_BG: Color32 = Color32::from_rgb(20, 20, 20);

    pub const BORDER: Color32 = Color32::from_rgb(60, 60, 60);

    /// Connected (RGB: 50, 200, 20)
    pub const ACTIVE: Color32 = Color32::from_rgb(50, 200, 20);

    /// Disconnected or failed (RGB: 200, 50, 20)
    pub const INACTIVE: Color32 = Color32::from_rgb(200, 50, 20);

    /// Connecting (RGB: 220, 170, 30)
    pub const PENDING: Color32 = Color32::from_rgb(220, 170, 30);

    pub const CRITICAL: Color32 = Color32::from_rgb(230, 40, 40);
}

pub fn create_frame(bg_color: Color32, border_color: Color32) -> Frame {
    Frame::new()
        .stroke(Stroke::new(1.0, border_color))
        .fill(bg_color)
        .inner_margin(4)
        .outer_margin(2)
}

pub fn connection_color(state: ConnectionState) -> Color32 {
    match state {
        ConnectionState::Connected => UiColors::ACTIVE,
        ConnectionState::Connecting => UiColors::PENDING,
        ConnectionState::Disconnected | ConnectionState::Erroring => UiColors::INACTIVE,
    }
}

pub fn sensor_text(value: Option<&str>) -> &str {
    value.unwrap_or(NO_READING)
}

/// Leading integer of a reading: optional sign and digits after leading
/// whitespace, anything after the digits ignored (`"55abc"` is 55, `"1.5"` is 1).
fn leading_integer(value: Option<&str>) -> Option<i64> {
    let text = value?.trim_start();
    let (negative, rest) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let magnitude = rest[..digits].parse::<i64>().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

pub fn temperature_is_critical(value: Option<&str>) -> bool {
    leading_integer(value).is_some_and(|t| t > TEMPERATURE_LIMIT)
}

/// The gas sensor reports `1` when it triggers.
pub fn gas_detected(value: Option<&str>) -> bool {
    leading_integer(value) == Some(1)
}

/// Formats a reading, bold red when `critical`.
pub fn reading_text(value: Option<&str>, critical: bool) -> RichText {
    let text = RichText::new(sensor_text(value));
    if critical {
        text.strong().color(UiColors::CRITICAL)
    } else {
        text
    }
}

/// Decodes a received frame into pixels for a texture.
pub fn decode_frame(frame: &FrameBuffer) -> Result<ColorImage, image::ImageError> {
    let format = match frame.content_type {
        ContentType::Jpeg => image::ImageFormat::Jpeg,
    };
    let rgba = image::load_from_memory_with_format(&frame.bytes, format)?.to_rgba8();
    let size = [rgba.width() as usize, rgba.height() as usize];
    Ok(ColorImage::from_rgba_unmultiplied(size, rgba.as_raw()))
}

#[derive(Debug, Clone)]
pub struct Toast {
    pub alert: Alert,
    pub shown_at: Instant,
}

/// Transient alerts on screen, oldest first.
#[derive(Debug, Default)]
pub struct ToastQueue {
    toasts: VecDeque<Toast>,
}

impl ToastQueue {
    const MAX_VISIBLE: usize = 5;

    pub fn push(&mut self, alert: Alert, now: Instant) {
        if self.toasts.len() == Self::MAX_VISIBLE {
            self.toasts.pop_front();
        }
        self.toasts.push_back(Toast {
            alert,
            shown_at: now,
        });
    }

    pub fn expire(&mut self, now: Instant) {
        self.toasts
            .retain(|t| now.saturating_duration_since(t.shown_at) < TOAST_LIFETIME);
    }

    pub fn dismiss(&mut self, index: usize) {
        self.toasts.remove(index);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Toast> {
        self.toasts.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.toasts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.toasts.len()
    }
}
