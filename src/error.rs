use std::time::Duration;
use thiserror::Error;

/// Failure reported by a [`PlatformClient`](crate::services::platform::PlatformClient) call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// Network hiccup, 5xx, request timeout. Safe to retry.
    #[error("network error: {0}")]
    Transient(String),

    /// The channel went offline or stopped streaming the tracked game.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The access token was revoked or expired. Fatal to the running session.
    #[error("authentication expired")]
    AuthenticationExpired,
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transient(_))
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, PlatformError::AuthenticationExpired)
    }
}

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("authentication expired, re-authenticate before starting the miner")]
    AuthenticationExpired,

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("teardown exceeded {0:?}, shutdown was forced")]
    ShutdownTimeout(Duration),

    #[error("settings store error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("config error: {0}")]
    Config(#[from] confy::ConfyError),
}

impl MinerError {
    /// Errors that must halt the scheduler instead of being retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            MinerError::Platform(e) => e.is_auth_expired(),
            MinerError::AuthenticationExpired | MinerError::InvariantViolation(_) => true,
            _ => false,
        }
    }
}
