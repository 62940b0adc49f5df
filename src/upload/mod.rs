//! Detection upload scheduler with statum state machine
//!
//! Periodically forwards the latest detection frame to the backend, but only
//! when it differs from the last frame successfully uploaded for the running
//! exploration.
//!
//! # State Machine
//!
//! ```text
//! Configured ──activate()──► Running ──cancelled──► Stopped
//! ```
//!
//! # Tick
//!
//! ```text
//! session? ─no─► skip
//!   │ id? ─no─► skip
//!   │ frame == shadow? ─yes─► skip
//!   ▼
//! post_object_detection ──ok──► shadow := frame
//!                       └─err─► alert, shadow unchanged (retried next tick)
//! ```
//!
//! A tick awaits its upload before the interval can fire again, so two uploads
//! are never in flight at the same time.

use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, AlertKind, AlertSender};
use crate::backend::{ExplorationApi, ObjectDetectionUpload};
use crate::session::SharedSession;
use crate::telemetry::SharedTelemetry;

/// States for the scheduler lifecycle using statum
#[state]
#[derive(Debug, Clone)]
pub enum SchedulerState {
    Configured, // Collaborators wired, timer not started
    Running,    // Ticking on the upload period
    Stopped,    // Cancelled, no further uploads
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoSession,
    NoExplorationId,
    NoFrame,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Uploaded,
    Failed,
}

#[machine]
pub struct UploadScheduler<S: SchedulerState> {
    period: Duration,
    api: Arc<dyn ExplorationApi>,
    session: SharedSession,
    telemetry: SharedTelemetry,
    alerts: AlertSender,
}

impl<S: SchedulerState> UploadScheduler<S> {
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl UploadScheduler<Configured> {
    pub fn create(
        period: Duration,
        api: Arc<dyn ExplorationApi>,
        session: SharedSession,
        telemetry: SharedTelemetry,
        alerts: AlertSender,
    ) -> Self {
        debug!("Creating upload scheduler with period {:?}", period);
        Self::new(period, api, session, telemetry, alerts)
    }

    pub fn activate(self) -> UploadScheduler<Running> {
        info!("Upload scheduler running every {:?}", self.period);
        self.transition()
    }
}

impl UploadScheduler<Running> {
    /// Runs one upload check.
    pub async fn tick(&mut self) -> TickOutcome {
        let (epoch, upload) = {
            let session_guard = self.session.read().await;
            let Some(session) = session_guard.as_ref() else {
                return TickOutcome::Skipped(SkipReason::NoSession);
            };
            let Some(exploration_id) = session.id.clone() else {
                return TickOutcome::Skipped(SkipReason::NoExplorationId);
            };

            let telemetry = self.telemetry.read().await;
            let current = telemetry.detection_base64();
            if current == session.last_uploaded() {
                return TickOutcome::Skipped(SkipReason::Unchanged);
            }
            let Some(current) = current else {
                return TickOutcome::Skipped(SkipReason::NoFrame);
            };

            (
                session.epoch,
                ObjectDetectionUpload {
                    exploration_id,
                    image_blob: current.to_string(),
                },
            )
        };

        match self.api.post_object_detection(&upload).await {
            Ok(()) => {
                info!("Object detection was successfully posted.");
                let mut session_guard = self.session.write().await;
                match session_guard.as_mut().filter(|s| s.epoch == epoch) {
                    Some(session) => session.mark_uploaded(upload.image_blob),
                    None => debug!("Session {} ended during upload", epoch),
                }
                TickOutcome::Uploaded
            }
            Err(e) => {
                self.alerts.raise(Alert::transient(
                    AlertKind::Upload,
                    format!("Object detection was failed to be posted: {}", e),
                ));
                TickOutcome::Failed
            }
        }
    }

    /// Ticks every period until `cancel` fires. The first tick happens one
    /// full period after start.
    pub async fn run_until_cancelled(
        mut self,
        cancel: CancellationToken,
    ) -> UploadScheduler<Stopped> {
        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = interval.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            warn!("Upload abandoned, scheduler cancelled");
                            break;
                        }
                        outcome = self.tick() => debug!("Upload tick: {:?}", outcome),
                    }
                }
            }
        }

        info!("Upload scheduler stopped");
        self.transition()
    }
}

/// Owns the scheduler task; dropping the handle cancels it.
#[derive(Debug)]
pub struct UploadSchedulerHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl UploadSchedulerHandle {
    pub fn spawn(runtime: &Handle, scheduler: UploadScheduler<Configured>) -> Self {
        let cancel = CancellationToken::new();
        let running = scheduler.activate();
        let token = cancel.clone();
        let task = runtime.spawn(async move {
            let _stopped = running.run_until_cancelled(token).await;
        });
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancels the task and waits for it to finish.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Upload scheduler task failed: {}", e);
            }
        }
    }
}

impl Drop for UploadSchedulerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeApi;
    use crate::backend::ExplorationId;
    use crate::config::tests::sample_config;
    use crate::session::{self, Session};
    use crate::telemetry::{self, demux::Demultiplexer};
    use tokio::sync::mpsc::Receiver;

    struct Fixture {
        api: Arc<FakeApi>,
        session: SharedSession,
        telemetry: SharedTelemetry,
        demux: Demultiplexer,
        alerts: AlertSender,
        alerts_rx: Receiver<Alert>,
    }

    impl Fixture {
        fn new() -> Self {
            let (alerts, alerts_rx) = AlertSender::channel(16);
            Self {
                api: Arc::new(FakeApi::with_id("exp-1")),
                session: session::shared(),
                telemetry: telemetry::shared(),
                demux: Demultiplexer::new(sample_config().topics),
                alerts,
                alerts_rx,
            }
        }

        fn scheduler(&self) -> UploadScheduler<Configured> {
            UploadScheduler::create(
                Duration::from_secs(10),
                self.api.clone(),
                self.session.clone(),
                self.telemetry.clone(),
                self.alerts.clone(),
            )
        }

        async fn start_session(&self, id: Option<&str>) {
            let mut session = Session::new(1, "cave");
            session.id = id.map(|id| ExplorationId(id.to_string()));
            *self.session.write().await = Some(session);
        }

        async fn detection(&self, payload: &[u8]) {
            let mut state = self.telemetry.write().await;
            self.demux
                .route(&mut state, "robot/stream/receive", payload);
        }

        async fn shadow(&self) -> Option<String> {
            self.session
                .read()
                .await
                .as_ref()
                .and_then(|s| s.last_uploaded().map(str::to_string))
        }
    }

    #[tokio::test]
    async fn uploads_new_frame_once() {
        let fx = Fixture::new();
        let mut scheduler = fx.scheduler().activate();
        fx.start_session(Some("exp-1")).await;

        assert_eq!(
            scheduler.tick().await,
            TickOutcome::Skipped(SkipReason::Unchanged)
        );

        fx.detection(b"A").await;
        assert_eq!(scheduler.tick().await, TickOutcome::Uploaded);
        assert_eq!(fx.shadow().await.as_deref(), Some("QQ=="));
        assert_eq!(
            scheduler.tick().await,
            TickOutcome::Skipped(SkipReason::Unchanged)
        );

        let uploads = fx.api.uploads.lock().await.clone();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].exploration_id, ExplorationId("exp-1".to_string()));
        assert_eq!(uploads[0].image_blob, "QQ==");
    }

    #[tokio::test]
    async fn never_uploads_without_exploration_id() {
        let fx = Fixture::new();
        let mut scheduler = fx.scheduler().activate();

        fx.detection(b"A").await;
        assert_eq!(
            scheduler.tick().await,
            TickOutcome::Skipped(SkipReason::NoSession)
        );

        fx.start_session(None).await;
        for payload in [&b"B"[..], b"C", b"D"] {
            fx.detection(payload).await;
            assert_eq!(
                scheduler.tick().await,
                TickOutcome::Skipped(SkipReason::NoExplorationId)
            );
        }
        assert!(fx.api.uploads.lock().await.is_empty());
    }

    #[tokio::test]
    async fn one_upload_per_distinct_consecutive_frame() {
        let fx = Fixture::new();
        let mut scheduler = fx.scheduler().activate();
        fx.start_session(Some("exp-1")).await;

        for payload in [&b"a"[..], b"a", b"b", b"b", b"b", b"a"] {
            fx.detection(payload).await;
            scheduler.tick().await;
        }
        assert_eq!(
            fx.api.uploaded_blobs().await,
            vec!["YQ==".to_string(), "Yg==".to_string(), "YQ==".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_upload_keeps_shadow_and_retries() {
        let mut fx = Fixture::new();
        let mut scheduler = fx.scheduler().activate();
        fx.start_session(Some("exp-1")).await;
        fx.detection(b"A").await;

        fx.api.fail_next_upload("503").await;
        assert_eq!(scheduler.tick().await, TickOutcome::Failed);
        assert_eq!(fx.shadow().await, None);
        let alert = fx.alerts_rx.try_recv().unwrap();
        assert!(!alert.is_fatal());
        assert_eq!(alert.kind, AlertKind::Upload);

        assert_eq!(scheduler.tick().await, TickOutcome::Uploaded);
        assert_eq!(
            fx.api.uploaded_blobs().await,
            vec!["QQ==".to_string(), "QQ==".to_string()]
        );
        assert_eq!(fx.shadow().await.as_deref(), Some("QQ=="));
    }

    #[tokio::test]
    async fn missing_frame_is_skipped_after_release() {
        let fx = Fixture::new();
        let mut scheduler = fx.scheduler().activate();
        fx.start_session(Some("exp-1")).await;
        fx.detection(b"A").await;
        scheduler.tick().await;

        fx.telemetry.write().await.release_frames();
        assert_eq!(
            scheduler.tick().await,
            TickOutcome::Skipped(SkipReason::NoFrame)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_scheduler_ticks_on_period_until_shutdown() {
        let fx = Fixture::new();
        fx.start_session(Some("exp-1")).await;
        fx.detection(b"A").await;

        let mut handle = UploadSchedulerHandle::spawn(&Handle::current(), fx.scheduler());
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(fx.api.uploads.lock().await.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fx.api.uploaded_blobs().await, vec!["QQ==".to_string()]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.api.uploads.lock().await.len(), 1);

        handle.shutdown().await;
        assert!(!handle.is_running());
        fx.detection(b"B").await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fx.api.uploads.lock().await.len(), 1);
    }
}
