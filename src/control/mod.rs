//! Operator control commands.
//!
//! Movement commands go to the robot-control topic as plain literals, the
//! stream start/stop signal goes to the stream-control topic. Both are fire
//! and forget: a failed publish only raises a transient alert.

use egui::Key;
use std::fmt;
use tracing::{debug, info};

use crate::alert::{Alert, AlertKind, AlertSender};
use crate::mqtt::config::ControlTopics;
use crate::mqtt::mqtt_handler::{ConnectionManager, PublishOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MovementCommand {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl MovementCommand {
    pub const ALL: [MovementCommand; 5] = [
        MovementCommand::Forward,
        MovementCommand::Backward,
        MovementCommand::Left,
        MovementCommand::Right,
        MovementCommand::Stop,
    ];

    /// Literal sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementCommand::Forward => "forward",
            MovementCommand::Backward => "backward",
            MovementCommand::Left => "left",
            MovementCommand::Right => "right",
            MovementCommand::Stop => "stop",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MovementCommand::Forward => "Forward",
            MovementCommand::Backward => "Backward",
            MovementCommand::Left => "Left",
            MovementCommand::Right => "Right",
            MovementCommand::Stop => "Stop",
        }
    }
}

impl fmt::Display for MovementCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Keyboard layout: w/x forward/backward, a/d left/right, s stop.
pub fn movement_for_key(key: Key) -> Option<MovementCommand> {
    match key {
        Key::W => Some(MovementCommand::Forward),
        Key::A => Some(MovementCommand::Left),
        Key::X => Some(MovementCommand::Backward),
        Key::D => Some(MovementCommand::Right),
        Key::S => Some(MovementCommand::Stop),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSignal {
    Resume,
    Halt,
}

impl StreamSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSignal::Resume => "p",
            StreamSignal::Halt => "s",
        }
    }
}

pub struct CommandPublisher {
    topics: ControlTopics,
    alerts: AlertSender,
}

impl CommandPublisher {
    pub fn new(topics: ControlTopics, alerts: AlertSender) -> Self {
        Self { topics, alerts }
    }

    pub fn publish_movement(
        &self,
        connection: &ConnectionManager,
        command: MovementCommand,
    ) -> Option<PublishOutcome> {
        info!("Movement command: {}", command);
        self.publish(
            connection,
            &self.topics.robot_control,
            command.as_str(),
            "Publish robot control error",
        )
    }

    pub fn publish_stream_signal(
        &self,
        connection: &ConnectionManager,
        signal: StreamSignal,
    ) -> Option<PublishOutcome> {
        info!("Stream signal: {:?}", signal);
        self.publish(
            connection,
            &self.topics.stream_control,
            signal.as_str(),
            "Publish stream control error",
        )
    }

    /// Returns `None` when the publish failed and an alert was raised.
    fn publish(
        &self,
        connection: &ConnectionManager,
        topic: &str,
        payload: &str,
        failure: &str,
    ) -> Option<PublishOutcome> {
        match connection.publish(topic, payload) {
            Ok(outcome) => {
                debug!("Publish to {}: {:?}", topic, outcome);
                Some(outcome)
            }
            Err(e) => {
                self.alerts.raise(Alert::transient(
                    AlertKind::Publish,
                    format!("{}: {}", failure, e),
                ));
                None
            }
        }
    }
}
