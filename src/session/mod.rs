//! # Exploration Session Controller
//!
//! [`SessionController`] is the single owned context of a mounted console. It
//! holds the broker connection, the subscription and command components, the
//! shared telemetry and session slots and the upload scheduler, and exposes
//! the operator actions as plain methods.
//!
//! ## Lifecycle
//!
//! ```text
//! mount ──► connect + start scheduler
//!   start(name) ──► create exploration (async) ─► resume signal ─► subscribe all
//!   stop()      ──► halt signal ─► unsubscribe all ─► release frames, clear session
//!   restart()   ──► clear session and frames, reconnect if the connection died
//! teardown / Drop ──► cancel scheduler, end connection
//! ```
//!
//! `restart()` is the recovery for fatal alerts: it resets local state and
//! leaves the operator free to start again.

use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, AlertKind, AlertSender};
use crate::backend::{CreateExplorationRequest, ExplorationApi, ExplorationId};
use crate::config::AppConfig;
use crate::control::{movement_for_key, CommandPublisher, MovementCommand, StreamSignal};
use crate::mqtt::mqtt_handler::{ConnectionManager, ConnectionState};
use crate::mqtt::subscription::{SubscriptionController, SubscriptionOutcome};
use crate::telemetry::demux::Demultiplexer;
use crate::telemetry::{self, SharedTelemetry};
use crate::upload::{UploadScheduler, UploadSchedulerHandle};

pub type SharedSession = Arc<RwLock<Option<Session>>>;

pub fn shared() -> SharedSession {
    Arc::new(RwLock::new(None))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Exploration name must not be empty")]
    EmptyName,

    #[error("An exploration is already running: {0}")]
    AlreadyRunning(String),

    #[error("Session state is busy, try again")]
    Busy,
}

/// One operator-started exploration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Increases with every start; stale create responses are matched against it
    pub epoch: u64,
    pub name: String,
    pub id: Option<ExplorationId>,
    last_uploaded: Option<String>,
}

impl Session {
    pub fn new(epoch: u64, name: impl Into<String>) -> Self {
        Self {
            epoch,
            name: name.into(),
            id: None,
            last_uploaded: None,
        }
    }

    /// Base64 of the last frame the backend accepted for this session.
    pub fn last_uploaded(&self) -> Option<&str> {
        self.last_uploaded.as_deref()
    }

    pub(crate) fn mark_uploaded(&mut self, image_base64: String) {
        self.last_uploaded = Some(image_base64);
    }
}

pub struct SessionController {
    config: AppConfig,
    runtime: Handle,
    connection: ConnectionManager,
    subscriptions: SubscriptionController,
    publisher: CommandPublisher,
    telemetry: SharedTelemetry,
    session: SharedSession,
    api: Arc<dyn ExplorationApi>,
    alerts: AlertSender,
    uploader: Option<UploadSchedulerHandle>,
    epoch: u64,
}

impl SessionController {
    /// Builds the controller without touching the network.
    pub fn new(config: AppConfig, api: Arc<dyn ExplorationApi>, alerts: AlertSender) -> Self {
        let telemetry = telemetry::shared();
        let connection = ConnectionManager::new(
            config.broker.clone(),
            Demultiplexer::new(config.topics.clone()),
            telemetry.clone(),
            alerts.clone(),
        );

        Self {
            subscriptions: SubscriptionController::new(config.topics.clone(), alerts.clone()),
            publisher: CommandPublisher::new(config.control_topics.clone(), alerts.clone()),
            runtime: Handle::current(),
            connection,
            telemetry,
            session: shared(),
            api,
            alerts,
            uploader: None,
            epoch: 0,
            config,
        }
    }

    /// Connects to the broker and starts the upload scheduler.
    pub fn mount(config: AppConfig, api: Arc<dyn ExplorationApi>, alerts: AlertSender) -> Self {
        let mut controller = Self::new(config, api, alerts);
        controller.connection.connect();
        controller.start_uploader();
        controller
    }

    fn start_uploader(&mut self) {
        if self.uploader.as_ref().is_some_and(|u| u.is_running()) {
            return;
        }
        let scheduler = UploadScheduler::create(
            self.config.upload_interval,
            self.api.clone(),
            self.session.clone(),
            self.telemetry.clone(),
            self.alerts.clone(),
        );
        self.uploader = Some(UploadSchedulerHandle::spawn(&self.runtime, scheduler));
    }

    pub fn telemetry(&self) -> SharedTelemetry {
        self.telemetry.clone()
    }

    pub fn session(&self) -> SharedSession {
        self.session.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn client_id(&self) -> &str {
        self.connection.client_id()
    }

    /// Non-blocking snapshot for rendering; `None` while the slot is locked.
    pub fn session_snapshot(&self) -> Option<Option<Session>> {
        self.session.try_read().ok().map(|s| s.clone())
    }

    pub fn is_session_active(&self) -> bool {
        self.session
            .try_read()
            .map(|s| s.is_some())
            .unwrap_or(true)
    }

    /// Starts an exploration named `name`.
    ///
    /// The exploration id arrives later; until then the scheduler does not
    /// upload anything.
    pub fn start(&mut self, name: &str) -> Result<(), SessionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::EmptyName);
        }

        self.epoch += 1;
        let epoch = self.epoch;
        {
            let mut slot = self
                .session
                .try_write()
                .map_err(|_| SessionError::Busy)?;
            if let Some(running) = slot.as_ref() {
                return Err(SessionError::AlreadyRunning(running.name.clone()));
            }
            *slot = Some(Session::new(epoch, name));
        }
        info!("Starting exploration '{}' (epoch {})", name, epoch);

        self.spawn_create(epoch, name.to_string());

        self.publisher
            .publish_stream_signal(&self.connection, StreamSignal::Resume);
        self.subscriptions.subscribe_all(&self.connection);
        Ok(())
    }

    fn spawn_create(&self, epoch: u64, name: String) {
        let api = self.api.clone();
        let session = self.session.clone();
        let alerts = self.alerts.clone();

        self.runtime.spawn(async move {
            let request = CreateExplorationRequest { name };
            match api.create_exploration(&request).await {
                Ok(created) => {
                    let mut slot = session.write().await;
                    match slot.as_mut().filter(|s| s.epoch == epoch) {
                        Some(current) => {
                            info!(
                                "Exploration '{}' has id {} ({})",
                                current.name, created.exploration_id, created.message
                            );
                            current.id = Some(created.exploration_id);
                        }
                        None => debug!("Discarding id for ended exploration epoch {}", epoch),
                    }
                }
                Err(e) => {
                    error!("Creating exploration '{}' failed: {}", request.name, e);
                    let mut slot = session.write().await;
                    if slot.as_ref().is_some_and(|s| s.epoch == epoch) {
                        *slot = None;
                    }
                    drop(slot);
                    alerts.raise(Alert::fatal(
                        AlertKind::SessionCreation,
                        "Exploration failed to be created. The session will be reset.",
                    ));
                }
            }
        });
    }

    /// Stops the running exploration.
    ///
    /// Returns the display handles of released frames so the UI can drop them.
    pub fn stop(&mut self) -> Vec<String> {
        info!("Stopping exploration");
        self.publisher
            .publish_stream_signal(&self.connection, StreamSignal::Halt);
        if let SubscriptionOutcome::Failed { topic } =
            self.subscriptions.unsubscribe_all(&self.connection)
        {
            warn!("Stop left {} subscribed", topic);
        }
        self.clear_session();
        self.release_frames()
    }

    /// Resets local state after a fatal alert and reconnects if needed.
    pub fn restart(&mut self) -> Vec<String> {
        warn!("Restarting session state");
        if self.connection.is_connected() {
            self.subscriptions.unsubscribe_all(&self.connection);
        }
        self.subscriptions.reset();
        self.clear_session();
        let released = self.release_frames();

        if !self.connection.state().is_live() {
            self.connection.connect();
        }
        self.start_uploader();
        released
    }

    pub fn press_movement(&self, command: MovementCommand) {
        self.publisher
            .publish_movement(&self.connection, command);
    }

    /// Handles a key press; returns the command if one was published.
    pub fn handle_key(&self, key: egui::Key) -> Option<MovementCommand> {
        let command = movement_for_key(key)?;
        if self.config.control.keyboard_requires_session && !self.is_session_active() {
            debug!("Ignoring {:?}, no exploration running", key);
            return None;
        }
        self.press_movement(command);
        Some(command)
    }

    /// Cancels the scheduler and ends the broker connection.
    pub fn teardown(&mut self) {
        if let Some(uploader) = self.uploader.take() {
            drop(uploader);
            debug!("Upload scheduler cancelled");
        }
        self.connection.end();
        self.clear_session();
    }

    fn clear_session(&self) {
        match self.session.try_write() {
            Ok(mut slot) => {
                if let Some(session) = slot.take() {
                    info!("Exploration '{}' cleared", session.name);
                }
            }
            Err(_) => {
                let session = self.session.clone();
                self.runtime.spawn(async move {
                    session.write().await.take();
                });
            }
        }
    }

    fn release_frames(&self) -> Vec<String> {
        match self.telemetry.try_write() {
            Ok(mut state) => state.release_frames(),
            Err(_) => {
                let telemetry = self.telemetry.clone();
                self.runtime.spawn(async move {
                    telemetry.write().await.release_frames();
                });
                Vec::new()
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn connection_mut(&mut self) -> &mut ConnectionManager {
        &mut self.connection
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertSeverity;
    use crate::backend::testing::FakeApi;
    use crate::config::tests::sample_config;
    use crate::mqtt::testing::{Call, FakeTransport};
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    fn controller(
        api: FakeApi,
    ) -> (
        SessionController,
        Arc<FakeApi>,
        Arc<FakeTransport>,
        Receiver<Alert>,
    ) {
        let (alerts, rx) = AlertSender::channel(32);
        let api = Arc::new(api);
        let mut controller = SessionController::new(sample_config(), api.clone(), alerts);
        let fake = Arc::new(FakeTransport::default());
        controller
            .connection_mut()
            .attach_for_test(fake.clone(), ConnectionState::Connected);
        (controller, api, fake, rx)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn start_publishes_resume_before_subscribing() {
        let (mut controller, api, fake, _rx) = controller(FakeApi::with_id("exp-9"));
        controller.start("Cave run").unwrap();
        settle().await;

        let calls = fake.calls();
        assert_eq!(
            calls[0],
            Call::Publish("robot/stream/control".to_string(), b"p".to_vec())
        );
        assert_eq!(calls[1], Call::Subscribe("robot/ir".to_string()));
        assert_eq!(calls.len(), 7);

        assert_eq!(api.created.lock().await.clone(), vec!["Cave run".to_string()]);
        let session = controller.session().read().await.clone().unwrap();
        assert_eq!(session.name, "Cave run");
        assert_eq!(session.id, Some(ExplorationId("exp-9".to_string())));
    }

    #[tokio::test]
    async fn start_requires_a_name_and_no_running_session() {
        let (mut controller, _api, fake, _rx) = controller(FakeApi::with_id("exp-9"));
        assert_eq!(controller.start("   "), Err(SessionError::EmptyName));
        assert!(fake.calls().is_empty());

        controller.start("first").unwrap();
        assert_eq!(
            controller.start("second"),
            Err(SessionError::AlreadyRunning("first".to_string()))
        );
    }

    #[tokio::test]
    async fn stop_halts_unsubscribes_and_releases_frames() {
        let (mut controller, _api, fake, _rx) = controller(FakeApi::with_id("exp-9"));
        controller.start("run").unwrap();
        settle().await;
        {
            let demux = Demultiplexer::new(sample_config().topics);
            let telemetry = controller.telemetry();
            let mut state = telemetry.write().await;
            demux.route(&mut state, "robot/stream/send", b"frame");
            demux.route(&mut state, "robot/stream/receive", b"A");
            demux.route(&mut state, "robot/temp", b"21");
        }

        let released = controller.stop();
        assert_eq!(released.len(), 2);

        let calls = fake.calls();
        let halt = calls
            .iter()
            .position(|c| *c == Call::Publish("robot/stream/control".to_string(), b"s".to_vec()))
            .unwrap();
        let first_unsub = calls
            .iter()
            .position(|c| matches!(c, Call::Unsubscribe(_)))
            .unwrap();
        assert!(halt < first_unsub);

        let telemetry = controller.telemetry();
        let state = telemetry.read().await;
        assert!(state.video.is_none());
        assert!(state.detection.is_none());
        assert_eq!(state.sensors.temperature.as_deref(), Some("21"));
        drop(state);
        assert!(controller.session().read().await.is_none());
    }

    #[tokio::test]
    async fn failed_create_is_fatal_and_clears_session() {
        let (mut controller, api, _fake, mut rx) = controller(FakeApi::failing_create("500"));
        controller.start("doomed").unwrap();
        settle().await;

        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.severity, AlertSeverity::Fatal);
        assert_eq!(alert.kind, AlertKind::SessionCreation);
        assert!(controller.session().read().await.is_none());

        controller.restart();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(api.uploads.lock().await.is_empty());
        assert!(!controller.is_session_active());
    }

    #[tokio::test]
    async fn late_create_response_is_ignored_after_stop() {
        let (mut controller, _api, _fake, _rx) = controller(FakeApi::with_id("old"));
        controller.start("first").unwrap();
        controller.stop();
        controller.start("second").unwrap();
        settle().await;

        let session = controller.session().read().await.clone().unwrap();
        assert_eq!(session.name, "second");
        assert_eq!(session.epoch, 2);
    }

    #[tokio::test]
    async fn key_w_publishes_forward_once() {
        let (controller, _api, fake, _rx) = controller(FakeApi::default());
        assert_eq!(
            controller.handle_key(egui::Key::W),
            Some(MovementCommand::Forward)
        );
        assert_eq!(controller.handle_key(egui::Key::P), None);
        assert_eq!(
            fake.published(),
            vec![("robot/control".to_string(), "forward".to_string())]
        );
    }

    #[tokio::test]
    async fn keys_publish_nothing_while_disconnected() {
        let (alerts, _rx) = AlertSender::channel(8);
        let mut controller =
            SessionController::new(sample_config(), Arc::new(FakeApi::default()), alerts);
        let fake = Arc::new(FakeTransport::default());
        controller
            .connection_mut()
            .attach_for_test(fake.clone(), ConnectionState::Disconnected);

        controller.handle_key(egui::Key::W);
        controller.press_movement(MovementCommand::Stop);
        assert!(fake.published().is_empty());
    }

    #[tokio::test]
    async fn keyboard_can_be_gated_on_session() {
        let mut config = sample_config();
        config.control.keyboard_requires_session = true;
        let (alerts, _rx) = AlertSender::channel(8);
        let mut controller =
            SessionController::new(config, Arc::new(FakeApi::with_id("x")), alerts);
        let fake = Arc::new(FakeTransport::default());
        controller
            .connection_mut()
            .attach_for_test(fake.clone(), ConnectionState::Connected);

        assert_eq!(controller.handle_key(egui::Key::D), None);
        controller.start("run").unwrap();
        assert_eq!(
            controller.handle_key(egui::Key::D),
            Some(MovementCommand::Right)
        );
        assert!(fake
            .published()
            .contains(&("robot/control".to_string(), "right".to_string())));
    }

    #[tokio::test]
    async fn dropping_the_controller_ends_connection() {
        let (mut controller, _api, fake, _rx) = controller(FakeApi::with_id("exp-9"));
        controller.start("run").unwrap();
        settle().await;
        let session = controller.session();

        drop(controller);
        assert!(fake.calls().contains(&Call::Disconnect));
        assert!(session.read().await.is_none());
    }

    #[tokio::test]
    async fn teardown_ends_connection() {
        let (mut controller, _api, fake, _rx) = controller(FakeApi::default());
        controller.teardown();
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
        assert!(fake.calls().contains(&Call::Disconnect));
    }
}
