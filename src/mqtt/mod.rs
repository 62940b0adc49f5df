//! # MQTT Integration Module
//!
//! Broker side of the console: one connection per mounted console, the topic
//! subscriptions of a running exploration, and the event loop that feeds every
//! inbound message into the telemetry demultiplexer.
//!
//! ```text
//! mqtt/
//! ├── config.rs          - Broker parameters and topic names
//! ├── message_manager.rs - Timestamped inbound messages
//! ├── mqtt_handler.rs    - Connection lifecycle and the rumqttc event loop
//! └── subscription.rs    - Session-scoped subscribe/unsubscribe of the topic set
//! ```
//!
//! All broker requests go through [`BrokerTransport`], implemented for
//! `rumqttc::AsyncClient`. Requests are queued without awaiting; results come
//! back through the event loop and are reported as alerts.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod subscription;

use rumqttc::{AsyncClient, QoS};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Broker client rejected the request: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Non-blocking broker operations the rest of the crate depends on.
pub trait BrokerTransport: Send + Sync + 'static {
    fn subscribe(&self, topic: &str) -> Result<(), MqttError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;

    fn disconnect(&self) -> Result<(), MqttError>;
}

impl BrokerTransport for AsyncClient {
    fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.try_subscribe(topic, QoS::AtMostOnce)?;
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.try_unsubscribe(topic)?;
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }

    fn disconnect(&self) -> Result<(), MqttError> {
        self.try_disconnect()?;
        Ok(())
    }
}
