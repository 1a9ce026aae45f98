use crate::error::{MinerError, PlatformError};
use crate::models::drops::{ChannelRef, WatchTarget};
use crate::models::settings::MiningConfig;
use crate::services::log_service::LogService;
use crate::services::platform::{with_timeout, PlatformClient};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 16;

/// What a running session reports back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A heartbeat was accepted; `credit` is the watch time it accounts for.
    Heartbeat { credit: Duration },
    /// Too many failed heartbeats, or the channel went offline or changed game.
    /// The session has stopped on its own.
    Unhealthy(String),
    AuthExpired,
    BonusAvailable { claim_id: String },
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub heartbeat_interval: Duration,
    pub liveness_interval: Duration,
    pub max_failures: u32,
    pub request_timeout: Duration,
    pub check_bonuses: bool,
}

impl SessionOptions {
    pub fn from_config(config: &MiningConfig, check_bonuses: bool) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            liveness_interval: config.liveness_check_interval(),
            max_failures: config.max_heartbeat_failures.max(1),
            request_timeout: config.request_timeout(),
            check_bonuses,
        }
    }
}

/// Decrements the live session count when the session task ends, however it ends.
struct ActiveSessionGuard(Arc<AtomicUsize>);

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keeps one channel "watched": heartbeats on a fixed interval plus a
/// slower live/game check.
pub struct WatchSession {
    target: WatchTarget,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    started_at: Instant,
    logs: LogService,
}

impl WatchSession {
    /// Spawn a session for `target`.
    ///
    /// `active` counts running sessions across the process; starting while
    /// another session is still alive is an invariant violation. The session
    /// is also cancelled when `parent` is.
    pub fn start(
        platform: Arc<dyn PlatformClient>,
        target: WatchTarget,
        options: SessionOptions,
        active: &Arc<AtomicUsize>,
        parent: &CancellationToken,
        logs: LogService,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), MinerError> {
        if active
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let message = format!(
                "refusing to watch {}: another watch session is still active",
                target.channel_login
            );
            logs.error(format!("🚨 {}", message));
            return Err(MinerError::InvariantViolation(message));
        }
        let guard = ActiveSessionGuard(active.clone());

        let cancel = parent.child_token();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let task = SessionTask {
            platform,
            channel: target.channel_ref(),
            game_id: target.game.id.clone(),
            options,
            cancel: cancel.clone(),
            events: tx,
            logs: logs.clone(),
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            task.run().await;
        });

        logs.info(format!(
            "📺 Watching {} for {}",
            target.channel_login, target.game.name
        ));

        Ok((
            Self {
                target,
                cancel,
                handle,
                started_at: Instant::now(),
                logs,
            },
            rx,
        ))
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Cancel the session and wait for its task to exit.
    ///
    /// An in-flight heartbeat is abandoned, never completed after this
    /// returns. If the task does not exit within `timeout` it is aborted and
    /// the timeout is reported as an error.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), MinerError> {
        self.cancel.cancel();

        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(())) => {
                log::debug!("Watch session for {} stopped", self.target.channel_login);
                Ok(())
            }
            Ok(Err(e)) => {
                self.logs.error(format!(
                    "❌ Watch session for {} ended abnormally: {}",
                    self.target.channel_login, e
                ));
                Ok(())
            }
            Err(_) => {
                self.handle.abort();
                self.logs.error(format!(
                    "🚨 Watch session for {} did not stop within {:?}, aborted",
                    self.target.channel_login, timeout
                ));
                Err(MinerError::ShutdownTimeout(timeout))
            }
        }
    }
}

struct SessionTask {
    platform: Arc<dyn PlatformClient>,
    channel: ChannelRef,
    game_id: String,
    options: SessionOptions,
    cancel: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
    logs: LogService,
}

impl SessionTask {
    async fn run(self) {
        let mut heartbeat = tokio::time::interval(self.options.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness = tokio::time::interval_at(
            Instant::now() + self.options.liveness_interval,
            self.options.liveness_interval,
        );
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut consecutive_failures = 0;
        let mut last_beat: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = heartbeat.tick() => {
                    let result = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            log::debug!("Dropping in-flight heartbeat for {}", self.channel.channel_login);
                            break;
                        }
                        result = with_timeout(
                            self.options.request_timeout,
                            self.platform.send_watch_heartbeat(&self.channel),
                        ) => result,
                    };

                    match result {
                        Ok(()) => {
                            consecutive_failures = 0;
                            let now = Instant::now();
                            let credit = last_beat
                                .map(|previous| (now - previous).min(self.options.heartbeat_interval))
                                .unwrap_or(Duration::ZERO);
                            last_beat = Some(now);

                            if !self.emit(SessionEvent::Heartbeat { credit }).await {
                                break;
                            }
                        }
                        Err(PlatformError::AuthenticationExpired) => {
                            self.emit(SessionEvent::AuthExpired).await;
                            break;
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            // Time spent failing is not credited.
                            last_beat = None;

                            if consecutive_failures < self.options.max_failures {
                                self.logs.debug(format!(
                                    "Heartbeat failed for {} (failure {}/{}): {}",
                                    self.channel.channel_login,
                                    consecutive_failures,
                                    self.options.max_failures,
                                    e
                                ));
                            } else {
                                self.logs.warn(format!(
                                    "⚠️ Heartbeat failed for {} (failure {}/{}), giving up: {}",
                                    self.channel.channel_login,
                                    consecutive_failures,
                                    self.options.max_failures,
                                    e
                                ));
                                self.emit(SessionEvent::Unhealthy(format!(
                                    "{} heartbeats in a row failed on {}",
                                    consecutive_failures, self.channel.channel_login
                                )))
                                .await;
                                break;
                            }
                        }
                    }
                }

                _ = liveness.tick() => {
                    if !self.check_liveness().await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns false once the session should end.
    async fn check_liveness(&self) -> bool {
        let status = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            status = with_timeout(
                self.options.request_timeout,
                self.platform.check_channel(&self.channel),
            ) => status,
        };

        match status {
            Ok(status) if !status.is_live => {
                self.emit(SessionEvent::Unhealthy(format!(
                    "{} went offline",
                    self.channel.channel_login
                )))
                .await;
                return false;
            }
            Ok(status) => {
                if let Some(game_id) = status.game_id {
                    if game_id != self.game_id {
                        self.emit(SessionEvent::Unhealthy(format!(
                            "{} switched to another game",
                            self.channel.channel_login
                        )))
                        .await;
                        return false;
                    }
                }
            }
            Err(PlatformError::AuthenticationExpired) => {
                self.emit(SessionEvent::AuthExpired).await;
                return false;
            }
            Err(e) => {
                self.logs.warn(format!(
                    "⚠️ Liveness check for {} failed, keeping session: {}",
                    self.channel.channel_login, e
                ));
            }
        }

        if self.options.check_bonuses {
            return self.check_bonus().await;
        }
        true
    }

    async fn check_bonus(&self) -> bool {
        let bonus = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            bonus = with_timeout(
                self.options.request_timeout,
                self.platform.available_community_points(&self.channel),
            ) => bonus,
        };

        match bonus {
            Ok(Some(claim_id)) => self.emit(SessionEvent::BonusAvailable { claim_id }).await,
            Ok(None) => true,
            Err(PlatformError::AuthenticationExpired) => {
                self.emit(SessionEvent::AuthExpired).await;
                false
            }
            Err(e) => {
                self.logs.warn(format!(
                    "⚠️ Bonus lookup on {} failed: {}",
                    self.channel.channel_login, e
                ));
                true
            }
        }
    }

    /// Deliver an event unless the session is being cancelled. Returns false
    /// if the event could not be delivered.
    async fn emit(&self, event: SessionEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}
