//! User-visible alerts.
//!
//! Every component reports failures at the boundary where they happen by
//! raising an [`Alert`]. The UI drains the channel each frame: transient alerts
//! become dismissable toasts, fatal ones block the console until the operator
//! confirms the restart.

use std::fmt;
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    /// Nothing was corrupted, the operation can simply be retried
    Transient,
    /// The session must be reset before continuing
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Connection,
    Subscription,
    SessionCreation,
    Publish,
    Upload,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            AlertKind::Connection => "Connection",
            AlertKind::Subscription => "Subscription",
            AlertKind::SessionCreation => "Exploration",
            AlertKind::Publish => "Publish",
            AlertKind::Upload => "Object detection",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    pub fn transient(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Transient,
            kind,
            message: message.into(),
        }
    }

    pub fn fatal(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Fatal,
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == AlertSeverity::Fatal
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Cloneable sending side handed to every component.
#[derive(Debug, Clone)]
pub struct AlertSender {
    tx: mpsc::Sender<Alert>,
}

impl AlertSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Never blocks; a full or closed channel only loses the notification.
    pub fn raise(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Fatal => error!("{}", alert),
            AlertSeverity::Transient => warn!("{}", alert),
        }
        if let Err(e) = self.tx.try_send(alert) {
            warn!("Dropping alert, UI channel unavailable: {}", e);
        }
    }
}
