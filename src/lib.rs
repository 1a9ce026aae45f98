//! Drops mining scheduler.
//!
//! [`MiningService`] picks the highest-priority game that still has
//! unfinished drops and a live channel, keeps a watch session alive on it,
//! claims drops as they complete and streams status snapshots to any number
//! of subscribers. The streaming platform and settings storage are injected
//! through the [`PlatformClient`] and [`SettingsStore`] traits.

pub mod error;
pub mod models;
pub mod services;

pub use error::{MinerError, PlatformError};
pub use models::drops::{ChannelRef, ChannelStatus, DropCampaign, Game, TimeBasedDrop, WatchTarget};
pub use models::settings::{MinerSettings, MiningConfig};
pub use models::status::{MinerStatus, SchedulerState, StatusMessage};
pub use services::log_service::{LogEntry, LogLevel};
pub use services::mining_service::MiningService;
pub use services::platform::{PlatformClient, SettingsStore};
pub use services::status_broadcaster::{StatusSubscription, SubscriptionHandle};
