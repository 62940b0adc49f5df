//! Broker connection manager.
//!
//! Owns the single broker connection of a mounted console. [`ConnectionManager::connect`]
//! spawns an [`EventLoopDriver`] task that polls the rumqttc event loop,
//! routes inbound publishes into the telemetry state and correlates
//! SUBACK/UNSUBACK packets with the topics they belong to.
//!
//! # Connection lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──CONNACK──► Connected
//!      ▲                                                  │
//!      │                                            poll error
//!      └────── end() / task finished ◄─── Erroring ◄──────┘
//! ```
//!
//! A poll error is fatal for the connection: no reconnect is attempted from
//! here, the operator restarts the session instead.

use rand::{distributions::Alphanumeric, Rng};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::BrokerConfig;
use super::message_manager::BrokerMessage;
use super::{BrokerTransport, MqttError};
use crate::alert::{Alert, AlertKind, AlertSender};
use crate::telemetry::demux::Demultiplexer;
use crate::telemetry::SharedTelemetry;

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 100;
/// Camera frames easily exceed rumqttc's 10 KiB default.
const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Erroring,
}

impl ConnectionState {
    /// A live connection must not be replaced by a second one.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Erroring => "Error",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// Not connected; nothing was sent
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Subscribe,
    Unsubscribe,
}

/// Bookkeeping messages from the manager to the event loop task.
#[derive(Debug)]
pub enum AckRequest {
    Track {
        serial: u64,
        kind: AckKind,
        topic: String,
    },
    /// The request with this serial never reached the event loop
    Withdraw { serial: u64 },
}

struct BrokerLink {
    transport: Arc<dyn BrokerTransport>,
    acks: mpsc::UnboundedSender<AckRequest>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    config: BrokerConfig,
    demux: Demultiplexer,
    telemetry: SharedTelemetry,
    alerts: AlertSender,
    runtime: Handle,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    client_id: String,
    link: Option<BrokerLink>,
    next_serial: AtomicU64,
}

impl ConnectionManager {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: BrokerConfig,
        demux: Demultiplexer,
        telemetry: SharedTelemetry,
        alerts: AlertSender,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            demux,
            telemetry,
            alerts,
            runtime: Handle::current(),
            state_tx: Arc::new(state_tx),
            client_id: String::new(),
            link: None,
            next_serial: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Opens the broker connection unless a live one already exists.
    pub fn connect(&mut self) {
        if self.link.is_some() && self.state().is_live() {
            debug!(
                "Connection {} already {}, not connecting again",
                self.client_id,
                self.state()
            );
            return;
        }
        self.release_link();

        let client_id = generate_client_id(&self.config.client_id_prefix);
        info!("Connecting to {} as {}", self.config, client_id);

        let mut options = MqttOptions::new(
            client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options
            .set_credentials(self.config.username.clone(), self.config.password.clone())
            .set_keep_alive(KEEP_ALIVE)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (driver, cancel) = self.attach(client_id, Arc::new(client));
        self.state_tx.send_replace(ConnectionState::Connecting);

        let task = self.runtime.spawn(driver.run(eventloop, cancel));
        if let Some(link) = self.link.as_mut() {
            link.task = Some(task);
        }
    }

    fn attach(
        &mut self,
        client_id: String,
        transport: Arc<dyn BrokerTransport>,
    ) -> (EventLoopDriver, CancellationToken) {
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let driver = EventLoopDriver {
            demux: self.demux.clone(),
            telemetry: self.telemetry.clone(),
            alerts: self.alerts.clone(),
            state_tx: self.state_tx.clone(),
            transport: transport.clone(),
            acks: acks_rx,
            queued: VecDeque::new(),
            in_flight: HashMap::new(),
            connected_before: false,
        };

        self.client_id = client_id;
        self.link = Some(BrokerLink {
            transport,
            acks: acks_tx,
            cancel: cancel.clone(),
            task: None,
        });
        (driver, cancel)
    }

    /// Queues a QoS 0 publish. Returns `Skipped` while not connected.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<PublishOutcome, MqttError> {
        let Some(link) = self.live_link() else {
            warn!("Not connected, dropping publish to {}", topic);
            return Ok(PublishOutcome::Skipped);
        };
        let payload = payload.into();
        debug!("Publishing {} bytes to {}", payload.len(), topic);
        link.transport.publish(topic, payload)?;
        Ok(PublishOutcome::Sent)
    }

    pub fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.tracked_request(AckKind::Subscribe, topic)
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.tracked_request(AckKind::Unsubscribe, topic)
    }

    fn tracked_request(&self, kind: AckKind, topic: &str) -> Result<(), MqttError> {
        let link = self.live_link().ok_or(MqttError::NotConnected)?;
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        // Registered before the request so the event loop always finds it.
        let _ = link.acks.send(AckRequest::Track {
            serial,
            kind,
            topic: topic.to_string(),
        });

        let result = match kind {
            AckKind::Subscribe => link.transport.subscribe(topic),
            AckKind::Unsubscribe => link.transport.unsubscribe(topic),
        };
        if result.is_err() {
            let _ = link.acks.send(AckRequest::Withdraw { serial });
        }
        result
    }

    /// Tears the connection down. Safe to call in any state.
    pub fn end(&mut self) {
        if self.link.is_some() {
            info!("Ending connection {}", self.client_id);
        }
        self.release_link();
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    fn release_link(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.transport.disconnect() {
                debug!("Disconnect request not delivered: {}", e);
            }
            link.cancel.cancel();
            if let Some(task) = link.task {
                if task.is_finished() {
                    trace!("Event loop task had already stopped");
                }
            }
        }
    }

    fn live_link(&self) -> Option<&BrokerLink> {
        if self.is_connected() {
            self.link.as_ref()
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn attach_for_test(
        &mut self,
        transport: Arc<dyn BrokerTransport>,
        state: ConnectionState,
    ) -> EventLoopDriver {
        let (driver, _cancel) = self.attach("mqtt_test_client".to_string(), transport);
        self.state_tx.send_replace(state);
        driver
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.end();
    }
}

pub fn generate_client_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// Consumes rumqttc events for one connection.
pub struct EventLoopDriver {
    demux: Demultiplexer,
    telemetry: SharedTelemetry,
    alerts: AlertSender,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    transport: Arc<dyn BrokerTransport>,
    acks: mpsc::UnboundedReceiver<AckRequest>,
    queued: VecDeque<(u64, AckKind, String)>,
    in_flight: HashMap<u16, (AckKind, String)>,
    connected_before: bool,
}

impl EventLoopDriver {
    pub async fn run(mut self, mut eventloop: EventLoop, cancel: CancellationToken) {
        info!("Broker event loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Event loop cancelled, flushing disconnect");
                    let flush = async {
                        loop {
                            match eventloop.poll().await {
                                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                                Ok(_) => {}
                            }
                        }
                    };
                    let _ = tokio::time::timeout(DISCONNECT_GRACE, flush).await;
                    break;
                }

                event = eventloop.poll() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(e) => {
                        self.handle_poll_error(&e.to_string(), cancel.is_cancelled());
                        break;
                    }
                }
            }
        }

        info!("Broker event loop stopped");
    }

    pub(crate) async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    if self.connected_before {
                        info!("Reconnected to broker");
                    } else {
                        info!("Connected to broker");
                    }
                    self.connected_before = true;
                    self.state_tx.send_replace(ConnectionState::Connected);
                } else {
                    warn!("Broker refused connection: {:?}", ack.code);
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let message = BrokerMessage::from_topic(publish.topic, &publish.payload);
                trace!("Received {}: {}", message, message.preview());
                let mut state = self.telemetry.write().await;
                if self
                    .demux
                    .route(&mut state, &message.topic, &message.payload)
                    .is_some()
                {
                    state.last_update = Some(message.timestamp);
                }
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let Some((_, topic)) = self.in_flight.remove(&ack.pkid) else {
                    warn!("SUBACK for unknown packet id {}", ack.pkid);
                    return;
                };
                let failed = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if failed {
                    self.alerts.raise(Alert::fatal(
                        AlertKind::Subscription,
                        format!("Error on subscribing '{}' topic.", topic),
                    ));
                } else {
                    info!("Subscribed to {}", topic);
                }
            }
            Event::Incoming(Packet::UnsubAck(ack)) => match self.in_flight.remove(&ack.pkid) {
                Some((_, topic)) => info!("Unsubscribed from {}", topic),
                None => warn!("UNSUBACK for unknown packet id {}", ack.pkid),
            },
            Event::Incoming(Packet::Disconnect) => warn!("Broker sent DISCONNECT"),
            Event::Outgoing(Outgoing::Subscribe(pkid)) => self.correlate(AckKind::Subscribe, pkid),
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                self.correlate(AckKind::Unsubscribe, pkid)
            }
            other => trace!("Broker event: {:?}", other),
        }
    }

    /// A poll error after cancellation is the broker closing the socket we
    /// asked it to close; the manager already reported `Disconnected`.
    fn handle_poll_error(&mut self, reason: &str, cancelled: bool) {
        if cancelled {
            debug!("Connection closed after cancel: {}", reason);
            return;
        }
        self.handle_error(reason);
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    fn handle_error(&mut self, reason: &str) {
        error!("Connection error: {}", reason);
        self.state_tx.send_replace(ConnectionState::Erroring);
        if let Err(e) = self.transport.disconnect() {
            debug!("Disconnect after error not delivered: {}", e);
        }
        self.alerts.raise(Alert::fatal(
            AlertKind::Connection,
            format!("Connection error: {}", reason),
        ));
    }

    /// Requests leave the event loop in the order they were queued, so the
    /// oldest tracked request owns the packet id.
    fn correlate(&mut self, kind: AckKind, pkid: u16) {
        while let Ok(request) = self.acks.try_recv() {
            match request {
                AckRequest::Track {
                    serial,
                    kind,
                    topic,
                } => self.queued.push_back((serial, kind, topic)),
                AckRequest::Withdraw { serial } => self.queued.retain(|(s, _, _)| *s != serial),
            }
        }

        match self.queued.pop_front() {
            Some((_, queued_kind, topic)) if queued_kind == kind => {
                trace!("Packet {} carries {:?} for {}", pkid, kind, topic);
                self.in_flight.insert(pkid, (kind, topic));
            }
            Some((_, queued_kind, topic)) => {
                warn!(
                    "Packet {} is {:?} but {:?} for {} was expected",
                    pkid, kind, queued_kind, topic
                );
            }
            None => debug!("Untracked {:?} packet {}", kind, pkid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertSeverity;
    use crate::config::tests::sample_config;
    use crate::mqtt::testing::{Call, FakeTransport};
    use crate::telemetry;
    use rumqttc::{ConnAck, Publish, QoS, SubAck, UnsubAck};
    use tokio::sync::mpsc::Receiver;

    fn manager() -> (ConnectionManager, Receiver<Alert>, SharedTelemetry) {
        let config = sample_config();
        let (alerts, rx) = AlertSender::channel(16);
        let telemetry = telemetry::shared();
        let manager = ConnectionManager::new(
            config.broker,
            Demultiplexer::new(config.topics),
            telemetry.clone(),
            alerts,
        );
        (manager, rx, telemetry)
    }

    #[test]
    fn client_ids_carry_prefix_and_differ() {
        let a = generate_client_id("mqtt_iyoti_");
        let b = generate_client_id("mqtt_iyoti_");
        assert!(a.starts_with("mqtt_iyoti_"));
        assert_eq!(a.len(), "mqtt_iyoti_".len() + 10);
        assert!(a["mqtt_iyoti_".len()..].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_skipped() {
        let (mut manager, _rx, _) = manager();
        assert_eq!(
            manager.publish("robot/control", "forward").unwrap(),
            PublishOutcome::Skipped
        );

        let fake = Arc::new(FakeTransport::default());
        manager.attach_for_test(fake.clone(), ConnectionState::Connecting);
        assert_eq!(
            manager.publish("robot/control", "forward").unwrap(),
            PublishOutcome::Skipped
        );
        assert!(fake.published().is_empty());
        assert!(matches!(
            manager.subscribe("robot/temp"),
            Err(MqttError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connack_marks_connected_and_publish_goes_out() {
        let (mut manager, _rx, _) = manager();
        let fake = Arc::new(FakeTransport::default());
        let mut driver = manager.attach_for_test(fake.clone(), ConnectionState::Connecting);

        driver
            .handle_event(Event::Incoming(Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::Success,
            })))
            .await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.client_id(), "mqtt_test_client");

        assert_eq!(
            manager.publish("robot/control", "stop").unwrap(),
            PublishOutcome::Sent
        );
        assert_eq!(
            fake.published(),
            vec![("robot/control".to_string(), "stop".to_string())]
        );
    }

    #[tokio::test]
    async fn incoming_publish_updates_telemetry() {
        let (mut manager, _rx, telemetry) = manager();
        let mut driver =
            manager.attach_for_test(Arc::new(FakeTransport::default()), ConnectionState::Connected);

        driver
            .handle_event(Event::Incoming(Packet::Publish(Publish::new(
                "robot/temp",
                QoS::AtMostOnce,
                b"55".to_vec(),
            ))))
            .await;
        let state = telemetry.read().await;
        assert_eq!(state.sensors.temperature.as_deref(), Some("55"));
        assert!(state.last_update.is_some());
        drop(state);

        driver
            .handle_event(Event::Incoming(Packet::Publish(Publish::new(
                "robot/unknown",
                QoS::AtMostOnce,
                b"1".to_vec(),
            ))))
            .await;
        assert_eq!(
            telemetry.read().await.sensors.temperature.as_deref(),
            Some("55")
        );
    }

    #[tokio::test]
    async fn failed_suback_raises_fatal_alert_for_its_topic() {
        let (mut manager, mut rx, _) = manager();
        let mut driver =
            manager.attach_for_test(Arc::new(FakeTransport::default()), ConnectionState::Connected);

        manager.subscribe("robot/ir").unwrap();
        manager.subscribe("robot/temp").unwrap();
        driver.handle_event(Event::Outgoing(Outgoing::Subscribe(7))).await;
        driver.handle_event(Event::Outgoing(Outgoing::Subscribe(8))).await;

        driver
            .handle_event(Event::Incoming(Packet::SubAck(SubAck::new(
                7,
                vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
            ))))
            .await;
        assert!(rx.try_recv().is_err());

        driver
            .handle_event(Event::Incoming(Packet::SubAck(SubAck::new(
                8,
                vec![SubscribeReasonCode::Failure],
            ))))
            .await;
        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.severity, AlertSeverity::Fatal);
        assert_eq!(alert.kind, AlertKind::Subscription);
        assert!(alert.message.contains("robot/temp"));
    }

    #[tokio::test]
    async fn withdrawn_requests_do_not_shift_correlation() {
        let (mut manager, mut rx, _) = manager();
        let fake = Arc::new(FakeTransport::default());
        let mut driver = manager.attach_for_test(fake.clone(), ConnectionState::Connected);

        fake.fail_subscribe.store(true, Ordering::SeqCst);
        assert!(manager.subscribe("robot/ir").is_err());
        fake.fail_subscribe.store(false, Ordering::SeqCst);
        manager.subscribe("robot/gas").unwrap();
        manager.unsubscribe("robot/gas").unwrap();

        driver.handle_event(Event::Outgoing(Outgoing::Subscribe(1))).await;
        driver.handle_event(Event::Outgoing(Outgoing::Unsubscribe(2))).await;
        driver
            .handle_event(Event::Incoming(Packet::SubAck(SubAck::new(
                1,
                vec![SubscribeReasonCode::Failure],
            ))))
            .await;
        driver
            .handle_event(Event::Incoming(Packet::UnsubAck(UnsubAck::new(2))))
            .await;

        let alert = rx.try_recv().unwrap();
        assert!(alert.message.contains("robot/gas"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn connection_error_is_fatal() {
        let (mut manager, mut rx, _) = manager();
        let fake = Arc::new(FakeTransport::default());
        let mut driver = manager.attach_for_test(fake.clone(), ConnectionState::Connected);

        driver.handle_error("connection reset by peer");
        assert_eq!(manager.state(), ConnectionState::Erroring);
        assert!(fake.calls().contains(&Call::Disconnect));

        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.kind, AlertKind::Connection);
        assert!(alert.is_fatal());
    }

    #[tokio::test]
    async fn poll_error_after_cancel_is_quiet() {
        let (mut manager, mut rx, _) = manager();
        let mut driver =
            manager.attach_for_test(Arc::new(FakeTransport::default()), ConnectionState::Connected);
        manager.end();

        driver.handle_poll_error("connection closed by peer", true);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());

        driver.handle_poll_error("connection reset by peer", false);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(rx.try_recv().unwrap().is_fatal());
    }

    #[tokio::test]
    async fn connect_twice_keeps_the_first_connection() {
        let (mut manager, _rx, _) = manager();
        manager.connect();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        let first_id = manager.client_id().to_string();
        assert!(first_id.starts_with("mqtt_iyoti_"));
        let first_cancel = manager.link.as_ref().unwrap().cancel.clone();

        manager.connect();
        assert_eq!(manager.client_id(), first_id);
        let link = manager.link.as_ref().unwrap();
        assert!(!first_cancel.is_cancelled());
        assert!(link.task.is_some());

        manager.end();
        assert!(first_cancel.is_cancelled());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn end_is_safe_in_any_state() {
        let (mut manager, _rx, _) = manager();
        manager.end();
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let fake = Arc::new(FakeTransport::default());
        manager.attach_for_test(fake.clone(), ConnectionState::Connected);
        manager.end();
        manager.end();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(fake.calls(), vec![Call::Disconnect]);
    }
}
