use crate::error::{MinerError, PlatformError};
use crate::models::drops::{DropCampaign, Game, WatchTarget};
use crate::models::settings::{MinerSettings, MiningConfig};
use crate::models::status::{ActiveDrop, CampaignSummary, MinerStatus, SchedulerState};
use crate::services::claim_service::{ClaimAgent, ClaimReceipt};
use crate::services::log_service::LogService;
use crate::services::platform::{with_timeout, PlatformClient, SettingsStore};
use crate::services::progress_tracker::{CompletedDrop, ProgressTracker};
use crate::services::status_broadcaster::StatusBroadcaster;
use crate::services::watch_session::{SessionEvent, SessionOptions, WatchSession};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Collaborators shared between the control plane and each scheduler run.
#[derive(Clone)]
pub(crate) struct SchedulerDeps {
    pub platform: Arc<dyn PlatformClient>,
    pub store: Arc<dyn SettingsStore>,
    pub config: MiningConfig,
    pub logs: LogService,
    pub broadcaster: StatusBroadcaster,
    pub claims: ClaimAgent,
    pub active_sessions: Arc<AtomicUsize>,
    pub settings_changed: Arc<Notify>,
    /// Latched when the platform reports expired credentials.
    pub auth_expired: Arc<AtomicBool>,
    /// Progress carried from one run to the next. A run takes it on start
    /// and hands it back when it stops.
    pub progress: Arc<Mutex<ProgressTracker>>,
}

struct ActiveWatch {
    session: WatchSession,
    events: mpsc::Receiver<SessionEvent>,
}

enum ClaimOutcome {
    Drop {
        drop_id: String,
        result: Result<ClaimReceipt, PlatformError>,
    },
    Points {
        channel_login: String,
        result: Result<ClaimReceipt, PlatformError>,
    },
}

/// One run of the mining state machine, from `Idle` until `Stopped`.
///
/// Owns every piece of mutable mining state; the outside world only sees
/// the snapshots it publishes.
pub(crate) struct Scheduler {
    deps: SchedulerDeps,
    cancel: CancellationToken,
    state: SchedulerState,
    settings: MinerSettings,
    campaigns: Vec<DropCampaign>,
    tracker: ProgressTracker,
    last_refresh: Option<Instant>,
    watch: Option<ActiveWatch>,
    pending_claims: JoinSet<ClaimOutcome>,
    error_message: Option<String>,
    total_watched: Duration,
}

impl Scheduler {
    /// Create a run and publish its `Idle` snapshot, so the status reflects
    /// the start before the task is first polled.
    pub fn start(deps: SchedulerDeps, cancel: CancellationToken) -> Self {
        let tracker = std::mem::take(
            &mut *deps
                .progress
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut scheduler = Self {
            deps,
            cancel,
            state: SchedulerState::Stopped,
            settings: MinerSettings::default(),
            campaigns: Vec::new(),
            tracker,
            last_refresh: None,
            watch: None,
            pending_claims: JoinSet::new(),
            error_message: None,
            total_watched: Duration::ZERO,
        };
        scheduler.deps.logs.info("⛏️ Drop miner started");
        scheduler.transition(SchedulerState::Idle);
        scheduler
    }

    pub async fn run(mut self) {
        if let Err(e) = self.drive().await {
            self.fail(e);
        }

        self.teardown().await;
        self.pending_claims.abort_all();
        self.transition(SchedulerState::Stopped);
        *self
            .deps
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = std::mem::take(&mut self.tracker);
        self.deps.logs.info("🛑 Drop miner stopped");
    }

    async fn drive(&mut self) -> Result<(), MinerError> {
        loop {
            match self.state {
                SchedulerState::Stopped => return Ok(()),
                // Teardown must finish even when a stop is pending.
                SchedulerState::Switching => self.step().await?,
                _ => {
                    let cancel = self.cancel.clone();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        result = self.step() => result?,
                    }
                }
            }
        }
    }

    async fn step(&mut self) -> Result<(), MinerError> {
        match self.state {
            SchedulerState::Idle => {
                self.load_settings().await;
                if self.refresh_due() {
                    self.refresh_campaigns().await?;
                }
                self.transition(SchedulerState::Selecting);
            }
            SchedulerState::Selecting => match self.select_target(None).await? {
                Some(target) => self.begin_watching(target)?,
                None => {
                    let poll = self.deps.config.selection_poll_interval();
                    self.deps.logs.info(format!(
                        "💤 No tracked game has both unfinished drops and a live channel, retrying in {}s",
                        poll.as_secs()
                    ));
                    self.wait_for_next_cycle(poll).await?;
                    self.transition(SchedulerState::Idle);
                }
            },
            SchedulerState::Watching => {
                let reason = self.watch_until_switch().await?;
                self.deps.logs.info(format!("🔄 Switching: {}", reason));
                self.transition(SchedulerState::Switching);
            }
            SchedulerState::Switching => {
                self.teardown().await;
                self.transition(SchedulerState::Idle);
            }
            SchedulerState::Stopped => {}
        }
        Ok(())
    }

    /// Sleep out one selection poll. Claims finishing meanwhile are still
    /// processed; a settings change cuts the wait short.
    async fn wait_for_next_cycle(&mut self, poll: Duration) -> Result<(), MinerError> {
        let sleep = tokio::time::sleep(poll);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                _ = self.deps.settings_changed.notified() => {
                    log::debug!("Settings changed, re-evaluating early");
                    return Ok(());
                }
                Some(joined) = self.pending_claims.join_next() => {
                    self.on_claim_finished(joined)?;
                }
            }
        }
    }

    fn transition(&mut self, next: SchedulerState) {
        if self.state != next {
            log::debug!("Scheduler {} -> {}", self.state, next);
        }
        self.state = next;
        self.publish();
    }

    fn publish(&self) {
        self.deps.broadcaster.publish_status(self.snapshot());
    }

    fn fail(&mut self, error: MinerError) {
        let message = error.to_string();
        if matches!(
            error,
            MinerError::AuthenticationExpired | MinerError::Platform(PlatformError::AuthenticationExpired)
        ) {
            self.deps.auth_expired.store(true, Ordering::SeqCst);
        }
        self.deps.logs.error(format!("❌ Mining halted: {}", message));
        self.deps.broadcaster.publish_error(message.clone());
        self.error_message = Some(message);
    }

    async fn load_settings(&mut self) {
        match self.deps.store.get_settings().await {
            Ok(settings) => self.settings = settings,
            Err(e) => self
                .deps
                .logs
                .warn(format!("⚠️ Could not load settings, keeping previous ones: {:#}", e)),
        }
    }

    fn refresh_due(&self) -> bool {
        self.last_refresh
            .map_or(true, |at| at.elapsed() >= self.deps.config.campaign_refresh_interval())
    }

    /// Replace the campaign snapshot. Only campaigns whose window contains
    /// now are kept.
    async fn refresh_campaigns(&mut self) -> Result<(), MinerError> {
        let listed = with_timeout(
            self.deps.config.request_timeout(),
            self.deps.platform.list_campaigns(),
        )
        .await;

        let campaigns = match listed {
            Ok(campaigns) => campaigns,
            Err(PlatformError::AuthenticationExpired) => return Err(MinerError::AuthenticationExpired),
            Err(e) => {
                self.deps
                    .logs
                    .warn(format!("⚠️ Failed to refresh drop campaigns: {}", e));
                return Ok(());
            }
        };

        let now = Utc::now();
        let active: Vec<DropCampaign> = campaigns
            .into_iter()
            .filter(|campaign| campaign.is_active_at(now))
            .collect();

        for drop in active.iter().flat_map(|c| &c.time_based_drops) {
            if drop.is_claimed {
                self.deps.claims.mark_claimed(&drop.id);
            }
        }

        let watched_game = self.watched_game().map(str::to_owned);
        self.tracker.sync_campaigns(&active, watched_game.as_deref());
        self.deps.logs.debug(format!("Tracking {} active campaigns", active.len()));
        self.campaigns = active;
        self.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// Games in selection order: the configured list minus exclusions, then
    /// (if enabled) unlisted games with campaigns, earliest-ending first.
    fn priority_list(&self) -> Vec<Game> {
        let excluded: HashSet<&str> = self.settings.excluded_games.iter().map(String::as_str).collect();
        let mut names: HashMap<&str, &str> = HashMap::new();
        let mut earliest_end: HashMap<&str, DateTime<Utc>> = HashMap::new();
        for campaign in &self.campaigns {
            names
                .entry(campaign.game_id.as_str())
                .or_insert(campaign.game_name.as_str());
            earliest_end
                .entry(campaign.game_id.as_str())
                .and_modify(|end| *end = (*end).min(campaign.end_at))
                .or_insert(campaign.end_at);
        }

        let mut seen = HashSet::new();
        let mut games = Vec::new();
        for id in &self.settings.games {
            if excluded.contains(id.as_str()) || !seen.insert(id.as_str()) {
                continue;
            }
            games.push(Game {
                id: id.clone(),
                name: names.get(id.as_str()).copied().unwrap_or(id.as_str()).to_string(),
                priority: games.len(),
            });
        }

        if self.settings.watch_unlisted {
            let mut unlisted: Vec<(&DateTime<Utc>, &str)> = earliest_end
                .iter()
                .filter(|(id, _)| !excluded.contains(*id) && !seen.contains(*id))
                .map(|(id, end)| (end, *id))
                .collect();
            unlisted.sort();

            for (_, id) in unlisted {
                games.push(Game {
                    id: id.to_string(),
                    name: names.get(id).copied().unwrap_or(id).to_string(),
                    priority: games.len(),
                });
            }
        }

        games
    }

    /// First game, in priority order, with unfinished drops and a live
    /// channel. `above` limits the search to games ranked strictly higher.
    async fn select_target(&self, above: Option<usize>) -> Result<Option<WatchTarget>, MinerError> {
        for game in self.priority_list() {
            if above.is_some_and(|rank| game.priority >= rank) {
                break;
            }
            if !self.tracker.has_unfinished(&game.id) {
                continue;
            }

            let resolved = with_timeout(
                self.deps.config.request_timeout(),
                self.deps.platform.resolve_live_channel(&game.id),
            )
            .await;

            match resolved {
                Ok(Some(channel)) => return Ok(Some(WatchTarget::new(channel, game))),
                Ok(None) => log::debug!("No live channel with drops for {}", game.name),
                Err(PlatformError::AuthenticationExpired) => {
                    return Err(MinerError::AuthenticationExpired)
                }
                Err(e) => self
                    .deps
                    .logs
                    .warn(format!("⚠️ Could not look up channels for {}: {}", game.name, e)),
            }
        }
        Ok(None)
    }

    fn begin_watching(&mut self, target: WatchTarget) -> Result<(), MinerError> {
        if let Some(current) = &self.watch {
            return Err(MinerError::InvariantViolation(format!(
                "asked to watch {} while still watching {}",
                target.channel_login,
                current.session.target().channel_login
            )));
        }

        let options = SessionOptions::from_config(&self.deps.config, self.settings.claim_community_points);
        let (session, events) = WatchSession::start(
            self.deps.platform.clone(),
            target,
            options,
            &self.deps.active_sessions,
            &self.cancel,
            self.deps.logs.clone(),
        )?;

        self.watch = Some(ActiveWatch { session, events });
        self.transition(SchedulerState::Watching);
        Ok(())
    }

    /// Stop the active session, if any, and wait for it to exit.
    async fn teardown(&mut self) {
        if let Some(active) = self.watch.take() {
            // A timeout is already logged as a fault; the task has been aborted.
            let _ = active
                .session
                .shutdown(self.deps.config.shutdown_timeout())
                .await;
            self.deps.claims.forget_bonuses();
        }
    }

    fn watched_game(&self) -> Option<&str> {
        self.watch
            .as_ref()
            .map(|active| active.session.target().game.id.as_str())
    }

    /// Observe the session until something calls for a switch. Returns the reason.
    async fn watch_until_switch(&mut self) -> Result<String, MinerError> {
        if self.watch.is_none() {
            return Err(MinerError::InvariantViolation(
                "watching without an active session".into(),
            ));
        }

        let period = self.deps.config.selection_poll_interval();
        let mut reevaluate = tokio::time::interval_at(Instant::now() + period, period);
        reevaluate.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = next_event(&mut self.watch) => match event {
                    Some(event) => {
                        if let Some(reason) = self.on_session_event(event)? {
                            return Ok(reason);
                        }
                    }
                    None => return Ok("watch session ended".into()),
                },
                Some(joined) = self.pending_claims.join_next() => self.on_claim_finished(joined)?,
                _ = reevaluate.tick() => {
                    if let Some(reason) = self.reevaluate().await? {
                        return Ok(reason);
                    }
                }
                _ = self.deps.settings_changed.notified() => {
                    if let Some(reason) = self.reevaluate().await? {
                        return Ok(reason);
                    }
                }
            }
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) -> Result<Option<String>, MinerError> {
        let Some(target) = self.watch.as_ref().map(|active| active.session.target().clone()) else {
            return Ok(None);
        };

        match event {
            SessionEvent::Heartbeat { credit } => {
                self.total_watched += credit;
                let completed = self.tracker.accrue(&target.game.id, credit);
                for drop in completed {
                    self.on_drop_completed(drop);
                }
                self.publish();

                if !self.tracker.has_unfinished(&target.game.id) {
                    return Ok(Some(format!("all drops for {} are complete", target.game.name)));
                }
                Ok(None)
            }
            SessionEvent::Unhealthy(reason) => Ok(Some(reason)),
            SessionEvent::AuthExpired => Err(MinerError::AuthenticationExpired),
            SessionEvent::BonusAvailable { claim_id } => {
                if self.settings.claim_community_points {
                    let claims = self.deps.claims.clone();
                    let channel_id = target.channel_id.clone();
                    let channel_login = target.channel_login.clone();
                    self.pending_claims.spawn(async move {
                        let result = claims.claim_community_points(&claim_id, &channel_id).await;
                        ClaimOutcome::Points { channel_login, result }
                    });
                }
                Ok(None)
            }
        }
    }

    fn on_drop_completed(&mut self, drop: CompletedDrop) {
        self.deps
            .logs
            .info(format!("🎉 Drop {} reached 100%", drop.drop_name));

        if self.deps.claims.is_claimed(&drop.drop_id) {
            self.tracker.mark_claimed(&drop.drop_id);
            return;
        }
        if !self.settings.claim_drops {
            self.deps
                .logs
                .info(format!("Auto-claim is off, leaving {} unclaimed", drop.drop_name));
            return;
        }

        let claim_id = self
            .campaigns
            .iter()
            .filter(|campaign| campaign.id == drop.campaign_id)
            .flat_map(|campaign| &campaign.time_based_drops)
            .find(|candidate| candidate.id == drop.drop_id)
            .and_then(|candidate| candidate.claim_id.clone());

        let Some(claim_id) = claim_id else {
            log::debug!("No claim token yet for {}, will retry", drop.drop_id);
            self.tracker.rearm(&drop.drop_id);
            return;
        };

        let claims = self.deps.claims.clone();
        self.pending_claims.spawn(async move {
            let result = claims.claim_drop(&drop.drop_id, &claim_id).await;
            ClaimOutcome::Drop {
                drop_id: drop.drop_id,
                result,
            }
        });
    }

    fn on_claim_finished(&mut self, joined: Result<ClaimOutcome, JoinError>) -> Result<(), MinerError> {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => return Ok(()),
            Err(e) => {
                self.deps.logs.error(format!("❌ Claim task crashed: {}", e));
                return Ok(());
            }
        };

        match outcome {
            ClaimOutcome::Drop { drop_id, result } => match result {
                Ok(_) => {
                    self.tracker.mark_claimed(&drop_id);
                    self.publish();
                }
                Err(PlatformError::AuthenticationExpired) => return Err(MinerError::AuthenticationExpired),
                Err(_) => {
                    // Left unclaimed; the next heartbeat on its game reports it again.
                    self.tracker.rearm(&drop_id);
                }
            },
            ClaimOutcome::Points { channel_login, result } => match result {
                Ok(_) => log::debug!("Bonus on {} handled", channel_login),
                Err(PlatformError::AuthenticationExpired) => return Err(MinerError::AuthenticationExpired),
                Err(_) => {}
            },
        }
        Ok(())
    }

    /// Periodic check while watching: refresh data and look for a reason to switch.
    async fn reevaluate(&mut self) -> Result<Option<String>, MinerError> {
        self.load_settings().await;
        if self.refresh_due() {
            self.refresh_campaigns().await?;
        }

        let Some(current) = self.watch.as_ref().map(|active| active.session.target().game.clone()) else {
            return Ok(None);
        };

        let rank = self
            .priority_list()
            .into_iter()
            .find(|game| game.id == current.id)
            .map(|game| game.priority);
        let Some(rank) = rank else {
            return Ok(Some(format!("{} is no longer in the watch list", current.name)));
        };

        if !self.tracker.has_unfinished(&current.id) {
            return Ok(Some(format!("no unfinished drops left for {}", current.name)));
        }

        if rank > 0 {
            if let Some(preferred) = self.select_target(Some(rank)).await? {
                return Ok(Some(format!(
                    "higher-priority game {} is live on {}",
                    preferred.game.name, preferred.channel_login
                )));
            }
        }

        self.publish();
        Ok(None)
    }

    fn snapshot(&self) -> MinerStatus {
        let now = Utc::now();
        let target = self.watch.as_ref().map(|active| active.session.target().clone());
        let watched_game = target.as_ref().map(|t| t.game.id.as_str());

        let mut next_switch: Option<DateTime<Utc>> = None;
        let active_drops: Vec<ActiveDrop> = self
            .tracker
            .iter()
            .filter(|entry| !entry.is_claimed)
            .map(|entry| {
                let estimated_completion = (watched_game == Some(entry.game_id.as_str())
                    && !entry.is_complete())
                .then(|| chrono::Duration::from_std(entry.remaining()).ok())
                .flatten()
                .map(|remaining| now + remaining);
                next_switch = next_switch.max(estimated_completion);

                ActiveDrop {
                    id: entry.drop_id.clone(),
                    name: entry.drop_name.clone(),
                    game_name: entry.game_name.clone(),
                    required_minutes: entry.required_minutes,
                    current_minutes: entry.current_minutes(),
                    progress: entry.percentage(),
                    is_claimed: entry.is_claimed,
                    estimated_completion,
                }
            })
            .collect();

        let focus = watched_game.and_then(|game_id| {
            self.tracker
                .drops_for_game(game_id)
                .filter(|entry| entry.needs_watching())
                .min_by_key(|entry| entry.remaining())
        });
        let current_progress = match (focus, watched_game) {
            (Some(entry), _) => entry.percentage(),
            (None, Some(_)) => 100.0,
            (None, None) => 0.0,
        };
        let current_campaign = focus
            .or_else(|| watched_game.and_then(|game_id| self.tracker.drops_for_game(game_id).next()))
            .map(|entry| CampaignSummary {
                id: entry.campaign_id.clone(),
                name: entry.campaign_name.clone(),
                game_name: entry.game_name.clone(),
            });

        MinerStatus {
            is_running: self.state != SchedulerState::Stopped,
            state: self.state,
            current_stream: target,
            current_campaign,
            current_progress,
            total_campaigns: self.campaigns.len(),
            claimed_drops: self.tracker.claimed_count(),
            last_update: now,
            next_switch,
            error_message: self.error_message.clone(),
            active_drops,
            watch_duration_secs: self
                .watch
                .as_ref()
                .map_or(0, |active| active.session.elapsed().as_secs()),
            total_watched_secs: self.total_watched.as_secs(),
        }
    }
}

async fn next_event(watch: &mut Option<ActiveWatch>) -> Option<SessionEvent> {
    match watch {
        Some(active) => active.events.recv().await,
        None => std::future::pending().await,
    }
}
