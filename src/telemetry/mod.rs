//! # Telemetry State
//!
//! The typed state slots the demultiplexer writes and the UI and upload
//! scheduler read. Everything here is replaced wholesale when a new message
//! arrives; no history is kept.
//!
//! The state is shared as [`SharedTelemetry`] (`Arc<RwLock<..>>`). Writers hold
//! the lock only for the duration of a single slot update.

pub mod demux;

use chrono::NaiveDateTime;
use std::sync::Arc;
use tokio::sync::RwLock;

pub type SharedTelemetry = Arc<RwLock<TelemetryState>>;

pub fn shared() -> SharedTelemetry {
    Arc::new(RwLock::new(TelemetryState::default()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    Jpeg,
}

impl ContentType {
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ContentType::Jpeg => "jpg",
        }
    }
}

/// Binary image payload tagged with its content type.
///
/// `sequence` is unique per received frame and makes up the display handle,
/// so a UI can drop cached textures of superseded frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub content_type: ContentType,
    pub bytes: Arc<[u8]>,
    pub sequence: u64,
}

impl FrameBuffer {
    pub fn display_uri(&self, label: &str) -> String {
        format!(
            "bytes://{}-{}.{}",
            label,
            self.sequence,
            self.content_type.extension()
        )
    }
}

/// Latest annotated frame together with its base64 text.
///
/// Both halves are built from the same payload and only ever replaced as one
/// value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionFrame {
    pub frame: FrameBuffer,
    pub base64: String,
}

/// Raw sensor strings; `None` means nothing was received yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorReadings {
    pub infrared: Option<String>,
    pub temperature: Option<String>,
    pub humidity: Option<String>,
    pub gas: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryState {
    pub sensors: SensorReadings,
    pub video: Option<FrameBuffer>,
    pub detection: Option<DetectionFrame>,
    /// Receive time of the last message that hit a known topic
    pub last_update: Option<NaiveDateTime>,
    frame_counter: u64,
}

impl TelemetryState {
    pub(crate) fn next_sequence(&mut self) -> u64 {
        self.frame_counter += 1;
        self.frame_counter
    }

    /// Releases both frames, returning the display URIs that became invalid.
    pub fn release_frames(&mut self) -> Vec<String> {
        let mut released = Vec::new();
        if let Some(video) = self.video.take() {
            released.push(video.display_uri(VIDEO_LABEL));
        }
        if let Some(detection) = self.detection.take() {
            released.push(detection.frame.display_uri(DETECTION_LABEL));
        }
        released
    }

    /// Text cache the upload scheduler compares against its shadow.
    pub fn detection_base64(&self) -> Option<&str> {
        self.detection.as_ref().map(|d| d.base64.as_str())
    }
}

pub const VIDEO_LABEL: &str = "stream";
pub const DETECTION_LABEL: &str = "detection";
