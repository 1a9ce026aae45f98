pub mod claim_service;
pub mod log_service;
pub mod mining_service;
pub mod platform;
pub mod progress_tracker;
pub(crate) mod scheduler;
pub mod status_broadcaster;
pub mod watch_session;
