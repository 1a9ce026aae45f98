use crate::error::MinerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// User preferences served by the settings store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerSettings {
    /// Game ids in watch priority order (first = highest priority).
    pub games: Vec<String>,
    pub excluded_games: Vec<String>,
    /// Also mine games that have campaigns but are not in `games`.
    pub watch_unlisted: bool,
    pub claim_drops: bool,
    pub claim_community_points: bool,
}

impl Default for MinerSettings {
    fn default() -> Self {
        Self {
            games: Vec::new(),
            excluded_games: Vec::new(),
            watch_unlisted: false,
            claim_drops: true,
            claim_community_points: true,
        }
    }
}

/// Tunable timing constants for the miner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    pub heartbeat_interval_secs: u64,
    pub liveness_check_interval_secs: u64,
    pub max_heartbeat_failures: u32,
    pub selection_poll_interval_secs: u64,
    pub campaign_refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub claim_max_attempts: u32,
    pub claim_backoff_base_ms: u64,
    pub claim_backoff_max_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub subscriber_buffer: usize,
    pub log_capacity: usize,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 20,
            liveness_check_interval_secs: 60,
            max_heartbeat_failures: 3,
            selection_poll_interval_secs: 60,
            campaign_refresh_interval_secs: 300, // Re-list campaigns every 5 minutes
            request_timeout_secs: 30,
            claim_max_attempts: 3,
            claim_backoff_base_ms: 1000,
            claim_backoff_max_ms: 30_000,
            shutdown_timeout_secs: 10,
            subscriber_buffer: 32,
            log_capacity: 500,
        }
    }
}

impl MiningConfig {
    /// Load the config for `app_name`, creating it with defaults on first run.
    pub fn load(app_name: &str) -> Result<Self, MinerError> {
        let config: MiningConfig = confy::load(app_name, Some("mining"))?;
        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_check_interval_secs.max(1))
    }

    pub fn selection_poll_interval(&self) -> Duration {
        Duration::from_secs(self.selection_poll_interval_secs.max(1))
    }

    pub fn campaign_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.campaign_refresh_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs.max(1))
    }

    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base... capped.
    pub fn claim_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let delay = self.claim_backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.claim_backoff_max_ms))
    }
}
