use crate::error::MinerError;
use crate::models::settings::MiningConfig;
use crate::models::status::{MinerStatus, SchedulerState};
use crate::services::claim_service::ClaimAgent;
use crate::services::log_service::{LogEntry, LogLevel, LogService};
use crate::services::platform::{PlatformClient, SettingsStore};
use crate::services::progress_tracker::ProgressTracker;
use crate::services::scheduler::{Scheduler, SchedulerDeps};
use crate::services::status_broadcaster::{StatusBroadcaster, StatusSubscription, SubscriptionHandle};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// Headroom on top of the session teardown bound for the scheduler's own exit.
const STOP_GRACE: Duration = Duration::from_secs(1);

struct RunHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Control plane for the drop miner.
///
/// Construct one per process with the platform and settings collaborators,
/// then drive it with [`start`](Self::start) / [`stop`](Self::stop). Status
/// is read with [`status`](Self::status) or streamed via
/// [`subscribe`](Self::subscribe).
pub struct MiningService {
    deps: SchedulerDeps,
    run: Mutex<Option<RunHandle>>,
}

impl MiningService {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        store: Arc<dyn SettingsStore>,
        config: MiningConfig,
    ) -> Self {
        let logs = LogService::new(config.log_capacity);
        let claims = ClaimAgent::new(platform.clone(), config.clone(), logs.clone());

        Self {
            deps: SchedulerDeps {
                broadcaster: StatusBroadcaster::new(config.subscriber_buffer),
                platform,
                store,
                config,
                logs,
                claims,
                active_sessions: Arc::new(AtomicUsize::new(0)),
                settings_changed: Arc::new(Notify::new()),
                auth_expired: Arc::new(AtomicBool::new(false)),
                progress: Arc::new(std::sync::Mutex::new(ProgressTracker::new())),
            },
            run: Mutex::new(None),
        }
    }

    /// Build the service with timing constants read from the app's config file.
    pub fn from_config_file(
        platform: Arc<dyn PlatformClient>,
        store: Arc<dyn SettingsStore>,
        app_name: &str,
    ) -> Result<Self, MinerError> {
        let config = MiningConfig::load(app_name)?;
        Ok(Self::new(platform, store, config))
    }

    /// Start mining. Does nothing if already running.
    pub async fn start(&self) -> Result<(), MinerError> {
        let mut run = self.run.lock().await;

        if let Some(current) = run.as_mut() {
            if !current.handle.is_finished() {
                if self.status().is_running {
                    log::debug!("Mining already running, ignoring start");
                    return Ok(());
                }
                // The previous run already published `Stopped` and is exiting.
                if tokio::time::timeout(STOP_GRACE, &mut current.handle).await.is_err() {
                    current.handle.abort();
                }
            }
        }

        if self.deps.auth_expired.load(Ordering::SeqCst) {
            self.deps
                .logs
                .warn("🔒 Refusing to start: authentication expired, log in again first");
            return Err(MinerError::AuthenticationExpired);
        }
        if !self.deps.store.is_authenticated().await {
            self.deps.logs.warn("🔒 Refusing to start: not authenticated");
            return Err(MinerError::NotAuthenticated);
        }

        let cancel = CancellationToken::new();
        let scheduler = Scheduler::start(self.deps.clone(), cancel.clone());
        let handle = tokio::spawn(scheduler.run());

        *run = Some(RunHandle { cancel, handle });
        Ok(())
    }

    /// Stop mining and wait for the watch session to be torn down.
    ///
    /// Idempotent. If the scheduler does not exit in time it is aborted, the
    /// status is forced to `Stopped`, and `ShutdownTimeout` is returned.
    pub async fn stop(&self) -> Result<(), MinerError> {
        let mut run = self.run.lock().await;
        let Some(mut current) = run.take() else {
            return Ok(());
        };

        current.cancel.cancel();
        let limit = self.deps.config.shutdown_timeout() + STOP_GRACE;

        match tokio::time::timeout(limit, &mut current.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.deps
                    .logs
                    .error(format!("❌ Mining scheduler crashed: {}", e));
                self.publish_stopped(Some(format!("mining scheduler crashed: {}", e)));
                Ok(())
            }
            Err(_) => {
                current.handle.abort();
                self.deps.logs.error(format!(
                    "🚨 Mining scheduler did not stop within {:?}, forced shutdown",
                    limit
                ));
                self.publish_stopped(Some("shutdown was forced after a timeout".into()));
                Err(MinerError::ShutdownTimeout(limit))
            }
        }
    }

    pub fn status(&self) -> Arc<MinerStatus> {
        self.deps.broadcaster.current()
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running
    }

    /// Most recent `limit` log entries, oldest first.
    pub fn logs(&self, limit: usize) -> Vec<LogEntry> {
        self.deps.logs.get_recent_logs(limit)
    }

    /// Entries at or above `level`, oldest first.
    pub fn logs_by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.deps.logs.get_logs_by_level(level)
    }

    pub fn clear_logs(&self) {
        self.deps.logs.clear_logs();
    }

    pub fn subscribe(&self) -> StatusSubscription {
        self.deps.broadcaster.subscribe()
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.deps.broadcaster.unsubscribe(handle)
    }

    /// Ask the running scheduler to re-read settings and re-evaluate now.
    pub fn reload_settings(&self) {
        self.deps.settings_changed.notify_one();
    }

    /// Clear the expired-credentials latch once the host has logged in again.
    pub fn notify_reauthenticated(&self) {
        if self.deps.auth_expired.swap(false, Ordering::SeqCst) {
            self.deps.logs.info("🔓 Re-authenticated, mining can be started again");
        }
    }

    fn publish_stopped(&self, error_message: Option<String>) {
        let mut status = (*self.deps.broadcaster.current()).clone();
        status.is_running = false;
        status.state = SchedulerState::Stopped;
        status.current_stream = None;
        status.next_switch = None;
        status.watch_duration_secs = 0;
        status.last_update = Utc::now();
        if error_message.is_some() {
            status.error_message = error_message;
        }
        self.deps.broadcaster.publish_status(status);
    }
}

impl Drop for MiningService {
    fn drop(&mut self) {
        if let Some(current) = self.run.get_mut() {
            current.cancel.cancel();
        }
    }
}
