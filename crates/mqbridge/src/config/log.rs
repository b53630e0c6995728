//! Logging configuration.

use serde::Deserialize;

/// Default interval between route statistics lines, in seconds.
pub const DEFAULT_STATS_INTERVAL: u64 = 60;

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or env_logger filter: error, warn, info, debug, trace.
    pub level: String,
    /// Seconds between route statistics lines (0 = never).
    pub stats_interval: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}
