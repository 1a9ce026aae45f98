use crate::models::drops::WatchTarget;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Scheduler lifecycle. Exactly one of these holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Idle,
    Selecting,
    Watching,
    Switching,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Stopped => write!(f, "stopped"),
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::Selecting => write!(f, "selecting"),
            SchedulerState::Watching => write!(f, "watching"),
            SchedulerState::Switching => write!(f, "switching"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub id: String,
    pub name: String,
    pub game_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveDrop {
    pub id: String,
    pub name: String,
    pub game_name: String,
    pub required_minutes: u32,
    pub current_minutes: u32,
    /// 0.0 - 100.0
    pub progress: f64,
    pub is_claimed: bool,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Read-only snapshot published on every scheduler transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerStatus {
    pub is_running: bool,
    pub state: SchedulerState,
    pub current_stream: Option<WatchTarget>,
    pub current_campaign: Option<CampaignSummary>,
    pub current_progress: f64,
    pub total_campaigns: usize,
    pub claimed_drops: usize,
    pub last_update: DateTime<Utc>,
    pub next_switch: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub active_drops: Vec<ActiveDrop>,
    pub watch_duration_secs: u64,
    pub total_watched_secs: u64,
}

impl Default for MinerStatus {
    fn default() -> Self {
        Self {
            is_running: false,
            state: SchedulerState::Stopped,
            current_stream: None,
            current_campaign: None,
            current_progress: 0.0,
            total_campaigns: 0,
            claimed_drops: 0,
            last_update: Utc::now(),
            next_switch: None,
            error_message: None,
            active_drops: Vec::new(),
            watch_duration_secs: 0,
            total_watched_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Envelope delivered to status subscribers: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StatusMessage {
    Status(Arc<MinerStatus>),
    Error(ErrorReport),
}

impl StatusMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn as_status(&self) -> Option<&MinerStatus> {
        match self {
            StatusMessage::Status(status) => Some(status),
            StatusMessage::Error(_) => None,
        }
    }
}
