use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tracked game. `priority` is its position in the watch list (0 = highest).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub name: String,
    pub priority: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropCampaign {
    pub id: String,
    pub name: String,
    pub game_id: String,
    pub game_name: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub time_based_drops: Vec<TimeBasedDrop>,
}

impl DropCampaign {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.start_at <= now && now <= self.end_at
    }
}

/// A time-gated reward as reported by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBasedDrop {
    pub id: String,
    pub name: String,
    pub required_minutes_watched: u32,
    /// Minutes the platform has already credited, used to seed tracking.
    #[serde(default)]
    pub current_minutes_watched: u32,
    #[serde(default)]
    pub is_claimed: bool,
    /// Opaque token the platform needs to claim this drop, once earned.
    #[serde(default)]
    pub claim_id: Option<String>,
}

/// A live channel resolved by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub channel_id: String,
    pub channel_login: String,
}

/// Result of re-checking a channel while it is being watched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub is_live: bool,
    pub game_id: Option<String>,
}

/// The single channel currently being watched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub channel_id: String,
    pub channel_login: String,
    pub game: Game,
}

impl WatchTarget {
    pub fn new(channel: ChannelRef, game: Game) -> Self {
        Self {
            channel_id: channel.channel_id,
            channel_login: channel.channel_login,
            game,
        }
    }

    pub fn channel_ref(&self) -> ChannelRef {
        ChannelRef {
            channel_id: self.channel_id.clone(),
            channel_login: self.channel_login.clone(),
        }
    }
}
