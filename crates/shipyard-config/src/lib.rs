//! KDL configuration parsing for Shipyard.
//!
//! This crate handles parsing of:
//! - System configuration (queue limits, timeouts, retry policy, store)
//! - Human-readable durations (`"10m"`, `"1h30m"`, `"250ms"`)

pub mod duration;
pub mod error;
pub mod system;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use system::{QueueConfig, RetryConfig, StoreConfig, SystemConfig, parse_system_config};
