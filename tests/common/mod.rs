// tests/common/mod.rs
//
// Hand-written fakes for the platform and settings store, shared by the
// scheduler scenarios.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use drop_miner::{
    ChannelRef, ChannelStatus, DropCampaign, MinerSettings, MinerStatus, MiningConfig, PlatformClient,
    PlatformError, SettingsStore, StatusMessage, StatusSubscription, TimeBasedDrop,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config() -> MiningConfig {
    MiningConfig {
        subscriber_buffer: 1024,
        ..MiningConfig::default()
    }
}

/// A campaign active for a day either side of now, one drop per `(id, minutes)`.
pub fn campaign(id: &str, game_id: &str, drops: &[(&str, u32)]) -> DropCampaign {
    let now = Utc::now();
    DropCampaign {
        id: id.to_string(),
        name: format!("{} campaign", game_id),
        game_id: game_id.to_string(),
        game_name: format!("Game {}", game_id),
        start_at: now - ChronoDuration::days(1),
        end_at: now + ChronoDuration::days(1),
        time_based_drops: drops
            .iter()
            .map(|(drop_id, minutes)| TimeBasedDrop {
                id: drop_id.to_string(),
                name: format!("Reward {}", drop_id),
                required_minutes_watched: *minutes,
                current_minutes_watched: 0,
                is_claimed: false,
                claim_id: Some(format!("claim-{}", drop_id)),
            })
            .collect(),
    }
}

#[derive(Default)]
struct PlatformState {
    campaigns: Vec<DropCampaign>,
    // game id -> live channel
    live: HashMap<String, ChannelRef>,
    heartbeats: Vec<(String, tokio::time::Instant)>,
    heartbeat_delay: Duration,
    auth_expired: bool,
    claims: Vec<String>,
    claim_attempts: usize,
    // Drop claims still to be refused with a transient error.
    failing_claims: usize,
    failing_resolves: HashSet<String>,
    resolve_stall: Duration,
    failing_heartbeats: bool,
    bonus: Option<String>,
    resolve_calls: Vec<String>,
}

#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    pub fn new(campaigns: Vec<DropCampaign>) -> Arc<Self> {
        let platform = Self::default();
        platform.lock().campaigns = campaigns;
        Arc::new(platform)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap()
    }

    /// Put a channel named `<login>` live on `game_id`.
    pub fn go_live(&self, game_id: &str, login: &str) {
        self.lock().live.insert(
            game_id.to_string(),
            ChannelRef {
                channel_id: format!("id-{}", login),
                channel_login: login.to_string(),
            },
        );
    }

    pub fn go_offline(&self, game_id: &str) {
        self.lock().live.remove(game_id);
    }

    pub fn expire_auth(&self) {
        self.lock().auth_expired = true;
    }

    pub fn restore_auth(&self) {
        self.lock().auth_expired = false;
    }

    pub fn set_heartbeat_delay(&self, delay: Duration) {
        self.lock().heartbeat_delay = delay;
    }

    /// Refuse the next `count` drop claims with a transient error.
    pub fn fail_claims(&self, count: usize) {
        self.lock().failing_claims = count;
    }

    /// Channel lookups for `game_id` fail with a transient error.
    pub fn fail_resolves(&self, game_id: &str) {
        self.lock().failing_resolves.insert(game_id.to_string());
    }

    /// Block the calling thread inside every channel lookup.
    pub fn stall_resolves(&self, stall: Duration) {
        self.lock().resolve_stall = stall;
    }

    pub fn fail_heartbeats(&self, failing: bool) {
        self.lock().failing_heartbeats = failing;
    }

    /// Offer a bonus on whatever channel is being watched, once.
    pub fn offer_bonus(&self, claim_id: &str) {
        self.lock().bonus = Some(claim_id.to_string());
    }

    pub fn claim_attempts(&self) -> usize {
        self.lock().claim_attempts
    }

    pub fn heartbeat_count(&self) -> usize {
        self.lock().heartbeats.len()
    }

    /// Channel logins in the order heartbeats were sent.
    pub fn heartbeat_channels(&self) -> Vec<String> {
        self.lock().heartbeats.iter().map(|(login, _)| login.clone()).collect()
    }

    pub fn claims(&self) -> Vec<String> {
        self.lock().claims.clone()
    }

    pub fn resolve_calls(&self) -> Vec<String> {
        self.lock().resolve_calls.clone()
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn list_campaigns(&self) -> Result<Vec<DropCampaign>, PlatformError> {
        let state = self.lock();
        if state.auth_expired {
            return Err(PlatformError::AuthenticationExpired);
        }
        Ok(state.campaigns.clone())
    }

    async fn resolve_live_channel(&self, game_id: &str) -> Result<Option<ChannelRef>, PlatformError> {
        let stall = {
            let mut state = self.lock();
            if state.auth_expired {
                return Err(PlatformError::AuthenticationExpired);
            }
            state.resolve_calls.push(game_id.to_string());
            if state.failing_resolves.contains(game_id) {
                return Err(PlatformError::Transient("directory unavailable".into()));
            }
            state.resolve_stall
        };
        if !stall.is_zero() {
            // Blocks the worker thread, so cancellation cannot interrupt it.
            std::thread::sleep(stall);
            return Ok(None);
        }
        Ok(self.lock().live.get(game_id).cloned())
    }

    async fn send_watch_heartbeat(&self, channel: &ChannelRef) -> Result<(), PlatformError> {
        let delay = {
            let mut state = self.lock();
            if state.auth_expired {
                return Err(PlatformError::AuthenticationExpired);
            }
            if state.failing_heartbeats {
                return Err(PlatformError::Transient("connection reset".into()));
            }
            state
                .heartbeats
                .push((channel.channel_login.clone(), tokio::time::Instant::now()));
            state.heartbeat_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn claim_drop(&self, claim_id: &str) -> Result<(), PlatformError> {
        let mut state = self.lock();
        state.claim_attempts += 1;
        if state.failing_claims > 0 {
            state.failing_claims -= 1;
            return Err(PlatformError::Transient("claim service busy".into()));
        }
        state.claims.push(claim_id.to_string());
        Ok(())
    }

    async fn claim_community_points(&self, claim_id: &str, _channel_id: &str) -> Result<(), PlatformError> {
        self.lock().claims.push(claim_id.to_string());
        Ok(())
    }

    async fn check_channel(&self, channel: &ChannelRef) -> Result<ChannelStatus, PlatformError> {
        let state = self.lock();
        if state.auth_expired {
            return Err(PlatformError::AuthenticationExpired);
        }
        let game_id = state
            .live
            .iter()
            .find(|(_, live)| live.channel_id == channel.channel_id)
            .map(|(game_id, _)| game_id.clone());
        Ok(ChannelStatus {
            is_live: game_id.is_some(),
            game_id,
        })
    }

    async fn available_community_points(&self, _channel: &ChannelRef) -> Result<Option<String>, PlatformError> {
        Ok(self.lock().bonus.take())
    }
}

pub struct FakeStore {
    settings: Mutex<MinerSettings>,
    authenticated: AtomicBool,
}

impl FakeStore {
    pub fn new(games: &[&str]) -> Arc<Self> {
        Self::with_settings(MinerSettings {
            games: games.iter().map(|g| g.to_string()).collect(),
            ..MinerSettings::default()
        })
    }

    pub fn with_settings(settings: MinerSettings) -> Arc<Self> {
        Arc::new(Self {
            settings: Mutex::new(settings),
            authenticated: AtomicBool::new(true),
        })
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn update(&self, change: impl FnOnce(&mut MinerSettings)) {
        change(&mut self.settings.lock().unwrap());
    }
}

#[async_trait]
impl SettingsStore for FakeStore {
    async fn get_settings(&self) -> anyhow::Result<MinerSettings> {
        Ok(self.settings.lock().unwrap().clone())
    }

    async fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}

/// Read status messages until one satisfies `predicate`.
pub async fn wait_for_status<F>(updates: &mut StatusSubscription, mut predicate: F) -> Arc<MinerStatus>
where
    F: FnMut(&MinerStatus) -> bool,
{
    let wait = async {
        while let Some(message) = updates.recv().await {
            if let StatusMessage::Status(status) = message {
                if predicate(&status) {
                    return status;
                }
            }
        }
        panic!("status stream ended");
    };

    tokio::time::timeout(Duration::from_secs(3600), wait)
        .await
        .expect("timed out waiting for status")
}

pub fn watching_game(status: &MinerStatus) -> Option<&str> {
    status.current_stream.as_ref().map(|target| target.game.id.as_str())
}
