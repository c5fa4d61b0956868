//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `BELAY_TICK_INTERVAL_MS`: scheduler tick interval (default: 1000)
//! - `BELAY_POLL_TIMEOUT_MS`: per-handle executor poll timeout (default: 5000)
//! - `BELAY_DISPATCH_MAX_ATTEMPTS`: bounded dispatch retries per task instance (default: 3)
//! - `BELAY_MAX_CATCHUP_SLOTS`: cap on slots materialized per graph per tick (default: 100)
//! - `BELAY_MAX_CONCURRENT`: local pool worker slots (default: num_cpus * 2)
//! - `BELAY_DEFINITIONS_DIR`: directory of JSON graph definitions (optional; the
//!   binary's `--definitions` flag takes precedence)

use std::{env, path::PathBuf, time::Duration};

use anyhow::Result;

use crate::scheduler::SchedulerConfig;

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Scheduler tick interval in milliseconds.
    pub tick_interval_ms: u64,

    /// Upper bound on a single executor poll call (milliseconds).
    pub poll_timeout_ms: u64,

    /// Consecutive failed hand-offs tolerated before the fatal alert.
    pub dispatch_max_attempts: u32,

    /// Maximum schedule slots materialized per graph per tick.
    pub max_catchup_slots: usize,

    /// Worker slots for the local pool executor.
    pub max_concurrent: usize,

    /// Where the directory graph source reads definitions from.
    pub definitions_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` if present, then reads from the environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let tick_interval_ms = env::var("BELAY_TICK_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);

        let poll_timeout_ms = env::var("BELAY_POLL_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        let dispatch_max_attempts = env::var("BELAY_DISPATCH_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let max_catchup_slots = env::var("BELAY_MAX_CATCHUP_SLOTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let max_concurrent = env::var("BELAY_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| num_cpus::get().max(1) * 2);

        let definitions_dir = env::var("BELAY_DEFINITIONS_DIR").ok().map(PathBuf::from);

        Ok(Self {
            tick_interval_ms,
            poll_timeout_ms,
            dispatch_max_attempts,
            max_catchup_slots,
            max_concurrent,
            definitions_dir,
        })
    }

    /// The scheduler-facing slice of the configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            dispatch_max_attempts: self.dispatch_max_attempts,
            max_catchup_slots: self.max_catchup_slots,
        }
    }

    /// Create a test configuration with tight timings.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            tick_interval_ms: 50,
            poll_timeout_ms: 1000,
            dispatch_max_attempts: 3,
            max_catchup_slots: 100,
            max_concurrent: 4,
            definitions_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_maps_to_scheduler_config() {
        let config = Config::test_config();
        let sched = config.scheduler_config();
        assert_eq!(sched.tick_interval, Duration::from_millis(50));
        assert_eq!(sched.poll_timeout, Duration::from_millis(1000));
        assert_eq!(sched.dispatch_max_attempts, 3);
        assert_eq!(sched.max_catchup_slots, 100);
    }
}
