//! Routes inbound broker messages to exactly one telemetry slot.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use tracing::{debug, trace};

use super::{ContentType, DetectionFrame, FrameBuffer, TelemetryState};
use crate::mqtt::config::TopicSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetrySlot {
    Infrared,
    Temperature,
    Humidity,
    Gas,
    VideoFrame,
    DetectionFrame,
}

#[derive(Debug, Clone)]
pub struct Demultiplexer {
    topics: TopicSet,
}

impl Demultiplexer {
    pub fn new(topics: TopicSet) -> Self {
        Self { topics }
    }

    pub fn slot_for(&self, topic: &str) -> Option<TelemetrySlot> {
        let t = &self.topics;
        if topic == t.infrared {
            Some(TelemetrySlot::Infrared)
        } else if topic == t.temperature {
            Some(TelemetrySlot::Temperature)
        } else if topic == t.humidity {
            Some(TelemetrySlot::Humidity)
        } else if topic == t.gas {
            Some(TelemetrySlot::Gas)
        } else if topic == t.stream_send {
            Some(TelemetrySlot::VideoFrame)
        } else if topic == t.stream_receive {
            Some(TelemetrySlot::DetectionFrame)
        } else {
            None
        }
    }

    /// Applies one message to the state.
    ///
    /// Returns the updated slot, or `None` for an unknown topic, in which case
    /// `state` is left untouched.
    pub fn route(
        &self,
        state: &mut TelemetryState,
        topic: &str,
        payload: &[u8],
    ) -> Option<TelemetrySlot> {
        let Some(slot) = self.slot_for(topic) else {
            trace!("Ignoring message on unknown topic {}", topic);
            return None;
        };

        match slot {
            TelemetrySlot::Infrared => state.sensors.infrared = Some(as_text(payload)),
            TelemetrySlot::Temperature => state.sensors.temperature = Some(as_text(payload)),
            TelemetrySlot::Humidity => state.sensors.humidity = Some(as_text(payload)),
            TelemetrySlot::Gas => state.sensors.gas = Some(as_text(payload)),
            TelemetrySlot::VideoFrame => {
                let sequence = state.next_sequence();
                state.video = Some(image_frame(payload, sequence));
            }
            TelemetrySlot::DetectionFrame => {
                let sequence = state.next_sequence();
                state.detection = Some(DetectionFrame {
                    frame: image_frame(payload, sequence),
                    base64: STANDARD.encode(payload),
                });
            }
        }

        debug!("Routed {} bytes from {} to {:?}", payload.len(), topic, slot);
        Some(slot)
    }
}

fn as_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

fn image_frame(payload: &[u8], sequence: u64) -> FrameBuffer {
    FrameBuffer {
        content_type: ContentType::Jpeg,
        bytes: Arc::from(payload),
        sequence,
    }
}
