//! Orchestrator configuration.
//!
//! Every knob has a serde default so a partial config file deserializes
//! into a working orchestrator; `OrchestratorConfig::default()` is the
//! documented baseline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, KestrelResult};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Default per-verb timeout in seconds when the caller supplies none.
    #[serde(default = "default_verb_timeout_secs")]
    pub verb_timeout_secs: u64,
    /// Lock TTL = verb timeout × this multiplier. SwitchWrites holds locks
    /// across several RPC groups, so the TTL must outlive the verb.
    #[serde(default = "default_lock_ttl_multiplier")]
    pub lock_ttl_multiplier: u32,
    /// Max tolerated replication lag before a switch is refused, seconds.
    #[serde(default = "default_max_replication_lag_secs")]
    pub max_replication_lag_allowed_secs: u64,
    /// A stream is considered throttled while its last throttler report is
    /// younger than this window, seconds.
    #[serde(default = "default_throttle_window_secs")]
    pub throttle_window_secs: u64,
    /// Number of LOCK TABLES cycles run on sources to drain in-flight
    /// writes before gathering positions.
    #[serde(default = "default_lock_tables_cycles")]
    pub lock_tables_cycles: u32,
    /// Delay between LOCK TABLES cycles, milliseconds.
    #[serde(default = "default_lock_tables_cycle_delay_ms")]
    pub lock_tables_cycle_delay_ms: u64,
    /// Bounded fan-out width for per-shard agent calls.
    #[serde(default = "default_fanout_concurrency")]
    pub fanout_concurrency: usize,
    /// Capacity of the process-wide background-job semaphore. Jobs that
    /// fail to acquire a permit are skipped, not queued.
    #[serde(default = "default_background_job_capacity")]
    pub background_job_capacity: usize,
    /// Poll interval while waiting for targets to catch up, milliseconds.
    #[serde(default = "default_catchup_poll_interval_ms")]
    pub catchup_poll_interval_ms: u64,
}

fn default_verb_timeout_secs() -> u64 {
    30
}
fn default_lock_ttl_multiplier() -> u32 {
    3
}
fn default_max_replication_lag_secs() -> u64 {
    30
}
fn default_throttle_window_secs() -> u64 {
    60
}
fn default_lock_tables_cycles() -> u32 {
    2
}
fn default_lock_tables_cycle_delay_ms() -> u64 {
    1000
}
fn default_fanout_concurrency() -> usize {
    8
}
fn default_background_job_capacity() -> usize {
    4
}
fn default_catchup_poll_interval_ms() -> u64 {
    1000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            verb_timeout_secs: default_verb_timeout_secs(),
            lock_ttl_multiplier: default_lock_ttl_multiplier(),
            max_replication_lag_allowed_secs: default_max_replication_lag_secs(),
            throttle_window_secs: default_throttle_window_secs(),
            lock_tables_cycles: default_lock_tables_cycles(),
            lock_tables_cycle_delay_ms: default_lock_tables_cycle_delay_ms(),
            fanout_concurrency: default_fanout_concurrency(),
            background_job_capacity: default_background_job_capacity(),
            catchup_poll_interval_ms: default_catchup_poll_interval_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// Validate and resolve a caller-supplied timeout. Anything under one
    /// second is refused rather than silently clamped.
    pub fn resolve_timeout(&self, requested: Option<Duration>) -> KestrelResult<Duration> {
        let timeout = requested.unwrap_or(Duration::from_secs(self.verb_timeout_secs));
        if timeout < Duration::from_secs(1) {
            return Err(KestrelError::InvalidArgument(format!(
                "timeout {}ms is below the 1s minimum",
                timeout.as_millis()
            )));
        }
        Ok(timeout)
    }

    /// Lock TTL for a verb running with the given timeout.
    pub fn lock_ttl(&self, verb_timeout: Duration) -> Duration {
        verb_timeout * self.lock_ttl_multiplier
    }

    pub fn max_replication_lag_allowed(&self) -> Duration {
        Duration::from_secs(self.max_replication_lag_allowed_secs)
    }

    pub fn throttle_window(&self) -> Duration {
        Duration::from_secs(self.throttle_window_secs)
    }

    pub fn lock_tables_cycle_delay(&self) -> Duration {
        Duration::from_millis(self.lock_tables_cycle_delay_ms)
    }

    pub fn catchup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.catchup_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = OrchestratorConfig::default();
        assert_eq!(c.verb_timeout_secs, 30);
        assert_eq!(c.lock_ttl_multiplier, 3);
        assert_eq!(c.lock_tables_cycles, 2);
    }

    #[test]
    fn test_partial_config_deserializes() {
        let c: OrchestratorConfig = serde_json::from_str(r#"{"verb_timeout_secs": 60}"#).unwrap();
        assert_eq!(c.verb_timeout_secs, 60);
        assert_eq!(c.fanout_concurrency, 8);
    }

    #[test]
    fn test_resolve_timeout_default_and_minimum() {
        let c = OrchestratorConfig::default();
        assert_eq!(c.resolve_timeout(None).unwrap(), Duration::from_secs(30));
        assert_eq!(
            c.resolve_timeout(Some(Duration::from_secs(5))).unwrap(),
            Duration::from_secs(5)
        );
        let err = c.resolve_timeout(Some(Duration::from_millis(500))).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_lock_ttl_covers_verb() {
        let c = OrchestratorConfig::default();
        assert_eq!(c.lock_ttl(Duration::from_secs(30)), Duration::from_secs(90));
    }
}
