use crate::error::PlatformError;
use crate::models::settings::MiningConfig;
use crate::services::log_service::LogService;
use crate::services::platform::{with_timeout, PlatformClient};
use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimReceipt {
    /// The platform accepted the claim just now.
    Claimed,
    /// Already claimed earlier; the platform was not contacted.
    AlreadyClaimed,
}

/// Claims earned drops and channel bonuses.
///
/// Both claim kinds are idempotent: once something is recorded as claimed,
/// asking again succeeds without another platform call. Transient failures
/// are retried with capped exponential backoff.
#[derive(Clone)]
pub struct ClaimAgent {
    platform: Arc<dyn PlatformClient>,
    claimed_drops: Arc<Mutex<HashSet<String>>>,
    claimed_points: Arc<Mutex<HashSet<String>>>,
    config: MiningConfig,
    logs: LogService,
}

impl ClaimAgent {
    pub fn new(platform: Arc<dyn PlatformClient>, config: MiningConfig, logs: LogService) -> Self {
        Self {
            platform,
            claimed_drops: Arc::new(Mutex::new(HashSet::new())),
            claimed_points: Arc::new(Mutex::new(HashSet::new())),
            config,
            logs,
        }
    }

    /// Claim a completed drop using the platform's claim token.
    pub async fn claim_drop(&self, drop_id: &str, claim_id: &str) -> Result<ClaimReceipt, PlatformError> {
        if contains(&self.claimed_drops, drop_id) {
            log::debug!("Drop {} already claimed, skipping", drop_id);
            return Ok(ClaimReceipt::AlreadyClaimed);
        }

        let platform = self.platform.clone();
        let timeout = self.config.request_timeout();
        self.with_retries(&format!("drop {}", drop_id), || {
            let platform = platform.clone();
            let claim_id = claim_id.to_string();
            async move { with_timeout(timeout, platform.claim_drop(&claim_id)).await }
        })
        .await?;

        insert(&self.claimed_drops, drop_id);
        self.logs.info(format!("🎁 Claimed drop {}", drop_id));
        Ok(ClaimReceipt::Claimed)
    }

    /// Claim a channel's community points bonus.
    pub async fn claim_community_points(
        &self,
        claim_id: &str,
        channel_id: &str,
    ) -> Result<ClaimReceipt, PlatformError> {
        if contains(&self.claimed_points, claim_id) {
            return Ok(ClaimReceipt::AlreadyClaimed);
        }

        let platform = self.platform.clone();
        let timeout = self.config.request_timeout();
        self.with_retries(&format!("bonus {} on channel {}", claim_id, channel_id), || {
            let platform = platform.clone();
            let claim_id = claim_id.to_string();
            let channel_id = channel_id.to_string();
            async move {
                with_timeout(timeout, platform.claim_community_points(&claim_id, &channel_id)).await
            }
        })
        .await?;

        insert(&self.claimed_points, claim_id);
        self.logs.info(format!("💰 Claimed channel points bonus on {}", channel_id));
        Ok(ClaimReceipt::Claimed)
    }

    /// Record a drop the platform already reports as claimed.
    pub fn mark_claimed(&self, drop_id: &str) {
        insert(&self.claimed_drops, drop_id);
    }

    pub fn is_claimed(&self, drop_id: &str) -> bool {
        contains(&self.claimed_drops, drop_id)
    }

    /// Forget bonus claim ids once the session they were offered on has ended.
    /// Each id is issued for a single occurrence, so none can come back.
    pub fn forget_bonuses(&self) {
        let mut points = self
            .claimed_points
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !points.is_empty() {
            log::debug!("Forgetting {} claimed bonus ids", points.len());
            points.clear();
        }
    }

    #[cfg(test)]
    fn claimed_bonus_count(&self) -> usize {
        self.claimed_points
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    async fn with_retries<F, Fut>(&self, what: &str, mut op: F) -> Result<(), PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), PlatformError>>,
    {
        let max_attempts = self.config.claim_max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_transient() => {
                    self.logs.warn(format!("❌ Claim for {} rejected: {}", what, e));
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    self.logs.warn(format!(
                        "❌ Claim for {} failed after {} attempts: {}",
                        what, attempt, e
                    ));
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff_with_jitter(attempt);
                    self.logs.debug(format!(
                        "⚠️ Claim for {} failed (attempt {}/{}): {}, retrying in {}ms",
                        what,
                        attempt,
                        max_attempts,
                        e,
                        delay.as_millis()
                    ));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.config.claim_backoff(attempt);
        let spread = (delay.as_millis() as u64) / 10;
        let jitter = if spread > 0 {
            rand::rng().random_range(0..=spread)
        } else {
            0
        };
        delay + Duration::from_millis(jitter)
    }
}

fn contains(set: &Mutex<HashSet<String>>, key: &str) -> bool {
    set.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .contains(key)
}

fn insert(set: &Mutex<HashSet<String>>, key: &str) {
    set.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(key.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::platform::MockPlatformClient;
    use mockall::predicate::eq;

    fn agent(mock: MockPlatformClient) -> ClaimAgent {
        ClaimAgent::new(Arc::new(mock), MiningConfig::default(), LogService::default())
    }

    #[tokio::test]
    async fn second_claim_is_a_successful_no_op() {
        let mut mock = MockPlatformClient::new();
        mock.expect_claim_drop()
            .with(eq("claim-d1"))
            .times(1)
            .returning(|_| Ok(()));
        let agent = agent(mock);

        let first = agent.claim_drop("d1", "claim-d1").await.unwrap();
        let second = agent.claim_drop("d1", "claim-d1").await.unwrap();

        assert_eq!(first, ClaimReceipt::Claimed);
        assert_eq!(second, ClaimReceipt::AlreadyClaimed);
        assert!(agent.is_claimed("d1"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let mut mock = MockPlatformClient::new();
        let mut calls = 0;
        mock.expect_claim_drop().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(PlatformError::Transient("503".into()))
            } else {
                Ok(())
            }
        });
        let agent = agent(mock);

        let receipt = agent.claim_drop("d1", "claim-d1").await.unwrap();
        assert_eq!(receipt, ClaimReceipt::Claimed);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_and_stays_unclaimed() {
        let mut mock = MockPlatformClient::new();
        mock.expect_claim_drop()
            .times(3)
            .returning(|_| Err(PlatformError::Transient("reset".into())));
        let agent = agent(mock);

        let result = agent.claim_drop("d1", "claim-d1").await;
        assert!(matches!(result, Err(PlatformError::Transient(_))));
        assert!(!agent.is_claimed("d1"));
    }

    #[tokio::test]
    async fn auth_expiry_is_not_retried() {
        let mut mock = MockPlatformClient::new();
        mock.expect_claim_community_points()
            .times(1)
            .returning(|_, _| Err(PlatformError::AuthenticationExpired));
        let agent = agent(mock);

        let result = agent.claim_community_points("bonus-1", "chan-1").await;
        assert_eq!(result, Err(PlatformError::AuthenticationExpired));
    }

    #[tokio::test]
    async fn community_points_are_idempotent_per_claim_id() {
        let mut mock = MockPlatformClient::new();
        mock.expect_claim_community_points()
            .with(eq("bonus-1"), eq("chan-1"))
            .times(1)
            .returning(|_, _| Ok(()));
        let agent = agent(mock);

        assert_eq!(
            agent.claim_community_points("bonus-1", "chan-1").await.unwrap(),
            ClaimReceipt::Claimed
        );
        assert_eq!(
            agent.claim_community_points("bonus-1", "chan-1").await.unwrap(),
            ClaimReceipt::AlreadyClaimed
        );
    }

    #[tokio::test]
    async fn forgotten_bonuses_no_longer_occupy_the_set() {
        let mut mock = MockPlatformClient::new();
        mock.expect_claim_community_points()
            .times(2)
            .returning(|_, _| Ok(()));
        let agent = agent(mock);

        agent.claim_community_points("bonus-1", "chan-1").await.unwrap();
        agent.claim_community_points("bonus-2", "chan-1").await.unwrap();
        assert_eq!(agent.claimed_bonus_count(), 2);

        agent.forget_bonuses();
        assert_eq!(agent.claimed_bonus_count(), 0);
    }

    #[tokio::test]
    async fn drops_known_claimed_skip_the_platform() {
        let mock = MockPlatformClient::new();
        let agent = agent(mock);
        assert!(!agent.is_claimed("d9"));
        agent.mark_claimed("d9");
        assert!(agent.is_claimed("d9"));
        assert_eq!(
            agent.claim_drop("d9", "claim-d9").await.unwrap(),
            ClaimReceipt::AlreadyClaimed
        );
    }
}
