//! CallGroup configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Construction parameters for a call group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallGroupConfig {
    /// Number of arrivals that completes the batch
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Watchdog timeout in milliseconds (0 disables the timeout fallback)
    #[serde(default = "default_timeout_ms", rename = "timeout-ms")]
    pub timeout_ms: u64,
}

fn default_capacity() -> usize {
    debug!("default_capacity: called");
    2
}

fn default_timeout_ms() -> u64 {
    debug!("default_timeout_ms: called");
    1000
}

impl Default for CallGroupConfig {
    fn default() -> Self {
        debug!("CallGroupConfig::default: called");
        Self {
            capacity: default_capacity(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl CallGroupConfig {
    /// Get the watchdog timeout as a Duration
    pub fn timeout(&self) -> Duration {
        debug!(timeout_ms = %self.timeout_ms, "CallGroupConfig::timeout: called");
        Duration::from_millis(self.timeout_ms)
    }
}
