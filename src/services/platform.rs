use crate::error::PlatformError;
use crate::models::drops::{ChannelRef, ChannelStatus, DropCampaign};
use crate::models::settings::MinerSettings;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Authenticated queries against the streaming platform.
///
/// The miner only needs this narrow surface; how requests reach the wire
/// is up to the implementation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn list_campaigns(&self) -> Result<Vec<DropCampaign>, PlatformError>;

    /// A channel currently live on `game_id` with drops enabled, if any.
    async fn resolve_live_channel(&self, game_id: &str) -> Result<Option<ChannelRef>, PlatformError>;

    /// "Still watching" keep-alive for `channel`.
    async fn send_watch_heartbeat(&self, channel: &ChannelRef) -> Result<(), PlatformError>;

    async fn claim_drop(&self, claim_id: &str) -> Result<(), PlatformError>;

    async fn claim_community_points(&self, claim_id: &str, channel_id: &str) -> Result<(), PlatformError>;

    async fn check_channel(&self, channel: &ChannelRef) -> Result<ChannelStatus, PlatformError>;

    /// Claim id of a bonus waiting on `channel`, if the platform exposes one.
    async fn available_community_points(
        &self,
        _channel: &ChannelRef,
    ) -> Result<Option<String>, PlatformError> {
        Ok(None)
    }
}

/// Persisted settings and credentials, owned by the host application.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_settings(&self) -> anyhow::Result<MinerSettings>;

    async fn is_authenticated(&self) -> bool;
}

/// Bound a platform call by `limit`; running out of time counts as a transient failure.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, PlatformError>
where
    F: Future<Output = Result<T, PlatformError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(PlatformError::Transient(format!(
            "request timed out after {}s",
            limit.as_secs()
        ))),
    }
}
