//! # Application Configuration
//!
//! All runtime settings come from environment-style `KEY=value` pairs. They are
//! read from `~/.config/streamcontroller/config.toml` (a flat table of the same
//! keys) and then overridden by process environment variables, so a deployment
//! can keep credentials out of the file.
//!
//! Every broker, topic and backend key is required; a missing key stops the
//! application at startup rather than producing a half-wired console.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mqtt::config::{BrokerConfig, ControlTopics, TopicSet};

const CONFIG_DIR: &str = ".config/streamcontroller";
const CONFIG_FILE: &str = "config.toml";

pub const DEFAULT_CLIENT_ID_PREFIX: &str = "mqtt_iyoti_";
pub const DEFAULT_UPLOAD_INTERVAL_SECS: u64 = 10;

/// Keys that must be present in either the config file or the environment.
pub const REQUIRED_KEYS: [&str; 13] = [
    "BROKER_HOST",
    "BROKER_PORT",
    "BROKER_USERNAME",
    "BROKER_PASSWORD",
    "IR_TOPIC",
    "TEMP_TOPIC",
    "HUMID_TOPIC",
    "GAS_TOPIC",
    "STREAM_SEND_TOPIC",
    "STREAM_RECEIVE_TOPIC",
    "ROBOT_CONTROL_TOPIC",
    "STREAM_CONTROL_TOPIC",
    "BACKEND_URL",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration key: {0}")]
    MissingKey(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Unsupported broker protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Topic '{0}' is configured for more than one stream")]
    DuplicateTopic(String),

    #[error("Failed to read config file {path}: {reason}")]
    File { path: String, reason: String },
}

/// Backend REST service settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
}

/// Operator console behaviour that is not tied to a single component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSettings {
    /// When set, movement keys only publish while an exploration is running.
    pub keyboard_requires_session: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub topics: TopicSet,
    pub control_topics: ControlTopics,
    pub backend: BackendConfig,
    pub upload_interval: Duration,
    pub control: ControlSettings,
}

impl AppConfig {
    /// Loads the config file (if any) and applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut values = match config_file_path() {
            Some(path) => read_config_file(&path)?,
            None => HashMap::new(),
        };

        let mut overridden = 0;
        for key in REQUIRED_KEYS.iter().chain(OPTIONAL_KEYS.iter()) {
            if let Ok(value) = std::env::var(key) {
                values.insert(key.to_string(), value);
                overridden += 1;
            }
        }
        debug!("{} configuration keys taken from the environment", overridden);

        Self::from_lookup(|key| values.get(key).cloned())
    }

    /// Builds and validates the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String, ConfigError> {
            match lookup(key) {
                Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
                _ => Err(ConfigError::MissingKey(key.to_string())),
            }
        };

        let protocol = lookup("BROKER_PROTOCOL").unwrap_or_else(|| "mqtt".to_string());
        if !matches!(protocol.trim(), "mqtt" | "tcp") {
            return Err(ConfigError::UnsupportedProtocol(protocol));
        }

        let port_raw = required("BROKER_PORT")?;
        let port = port_raw
            .parse::<u16>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "BROKER_PORT".to_string(),
                reason: e.to_string(),
            })?;

        let broker = BrokerConfig {
            host: required("BROKER_HOST")?,
            port,
            username: required("BROKER_USERNAME")?,
            password: required("BROKER_PASSWORD")?,
            client_id_prefix: lookup("CLIENT_ID_PREFIX")
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CLIENT_ID_PREFIX.to_string()),
        };

        let topics = TopicSet {
            infrared: required("IR_TOPIC")?,
            temperature: required("TEMP_TOPIC")?,
            humidity: required("HUMID_TOPIC")?,
            gas: required("GAS_TOPIC")?,
            stream_send: required("STREAM_SEND_TOPIC")?,
            stream_receive: required("STREAM_RECEIVE_TOPIC")?,
        };
        if let Some(duplicate) = topics.first_duplicate() {
            return Err(ConfigError::DuplicateTopic(duplicate.to_string()));
        }

        let control_topics = ControlTopics {
            robot_control: required("ROBOT_CONTROL_TOPIC")?,
            stream_control: required("STREAM_CONTROL_TOPIC")?,
        };

        let base_url = required("BACKEND_URL")?;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "BACKEND_URL".to_string(),
                reason: "expected an http:// or https:// URL".to_string(),
            });
        }

        let upload_secs = match lookup("UPLOAD_INTERVAL_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "UPLOAD_INTERVAL_SECS".to_string(),
                        reason: format!("'{}' is not a positive number of seconds", raw),
                    })
                }
            },
            None => DEFAULT_UPLOAD_INTERVAL_SECS,
        };

        let keyboard_requires_session = match lookup("KEYBOARD_REQUIRES_SESSION") {
            Some(raw) => raw
                .trim()
                .parse::<bool>()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "KEYBOARD_REQUIRES_SESSION".to_string(),
                    reason: e.to_string(),
                })?,
            None => false,
        };

        info!(
            "Configuration loaded: broker {}:{}, backend {}",
            broker.host, broker.port, base_url
        );

        Ok(Self {
            broker,
            topics,
            control_topics,
            backend: BackendConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
            },
            upload_interval: Duration::from_secs(upload_secs),
            control: ControlSettings {
                keyboard_requires_session,
            },
        })
    }
}

const OPTIONAL_KEYS: [&str; 4] = [
    "BROKER_PROTOCOL",
    "CLIENT_ID_PREFIX",
    "UPLOAD_INTERVAL_SECS",
    "KEYBOARD_REQUIRES_SESSION",
];

fn config_file_path() -> Option<PathBuf> {
    let mut path = dirs::home_dir()?;
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    if path.exists() {
        Some(path)
    } else {
        warn!(
            "No config file at {}, relying on environment variables",
            path.display()
        );
        None
    }
}

fn read_config_file(path: &PathBuf) -> Result<HashMap<String, String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config_table(&content).map_err(|reason| ConfigError::File {
        path: path.display().to_string(),
        reason,
    })
}

/// Flattens a TOML table of scalar values into string key/value pairs.
fn parse_config_table(content: &str) -> Result<HashMap<String, String>, String> {
    let table = content.parse::<toml::Table>().map_err(|e| e.to_string())?;
    let mut values = HashMap::new();
    for (key, value) in table {
        let value = match value {
            toml::Value::String(s) => s,
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            other => return Err(format!("key {} has unsupported value {}", key, other)),
        };
        values.insert(key, value);
    }
    Ok(values)
}
