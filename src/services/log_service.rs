use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_MAX_LOGS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Bounded ring buffer of miner log entries shown on the dashboard.
///
/// Cheap to clone; all clones share the same buffer. Every entry is also
/// forwarded to the `log` facade so the host's logger sees it.
#[derive(Clone)]
pub struct LogService {
    logs: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl LogService {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            logs: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Add a log entry to the ring buffer
    pub fn log_message(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };

        let facade_level: log::Level = level.into();
        log::log!(target: "drop_miner", facade_level, "{}", entry.message);

        let mut logs = self.lock();
        if logs.len() >= self.capacity {
            logs.pop_front();
        }
        logs.push_back(entry);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log_message(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log_message(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log_message(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log_message(LogLevel::Error, message);
    }

    /// Most recent `limit` entries, oldest first. `limit` is capped at the capacity.
    pub fn get_recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        let logs = self.lock();
        let limit = limit.min(self.capacity);
        let skip = logs.len().saturating_sub(limit);
        logs.iter().skip(skip).cloned().collect()
    }

    /// Entries at or above `level`
    pub fn get_logs_by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.lock()
            .iter()
            .filter(|entry| entry.level >= level)
            .cloned()
            .collect()
    }

    pub fn clear_logs(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        // A panic while holding the lock cannot leave the deque half-written.
        self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LogService {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOGS)
    }
}
