use chrono::NaiveDateTime;
use std::fmt;
use std::sync::Arc;

/// One inbound broker message as handed to the demultiplexer.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Arc<[u8]>,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} - {} ({} bytes)",
            self.timestamp,
            self.topic,
            self.payload.len()
        )
    }
}

impl fmt::Debug for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BrokerMessage({})", self)
    }
}

impl BrokerMessage {
    pub fn from_topic(topic: impl Into<String>, payload: &[u8]) -> Self {
        BrokerMessage {
            topic: topic.into(),
            payload: Arc::from(payload),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    /// Short preview for log lines, never more than 16 characters of payload.
    pub fn preview(&self) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        let mut preview: String = text.chars().take(16).collect();
        if text.chars().count() > 16 {
            preview.push('…');
        }
        preview
    }
}
