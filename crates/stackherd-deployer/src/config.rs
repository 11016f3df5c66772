//! Engine configuration
//!
//! Values come from `stackherd_common::defaults`, optionally overridden by the
//! `engine` section of the stack file, and finally by CLI flags.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use stackherd_common::defaults;

/// Tunables for one deployer run
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// AWS calls admitted per rate window
    #[serde(default = "defaults::default_rate_limit")]
    pub rate_limit: usize,
    /// Rate window length in milliseconds
    #[serde(default = "defaults::default_rate_interval_ms")]
    pub rate_interval_ms: u64,
    /// Delay between two status polls
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Change-set creation attempts when the per-stack limit is hit
    pub change_set_attempts: u32,
    /// Keys per `DeleteObjects` request
    pub delete_batch_size: usize,
    /// Upper bound for one credential acquisition
    #[serde(with = "millis")]
    pub credentials_timeout: Duration,
    /// Named AWS profile
    pub profile: Option<String>,
    /// Scratch space for zipped and inlined artifacts
    pub temp_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit: defaults::DEFAULT_RATE_LIMIT,
            rate_interval_ms: defaults::DEFAULT_RATE_INTERVAL_MS,
            poll_interval: defaults::DEFAULT_POLL_INTERVAL,
            change_set_attempts: defaults::DEFAULT_CHANGE_SET_ATTEMPTS,
            delete_batch_size: defaults::DEFAULT_DELETE_BATCH_SIZE,
            credentials_timeout: defaults::DEFAULT_CREDENTIALS_TIMEOUT,
            profile: None,
            temp_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn rate_interval(&self) -> Duration {
        Duration::from_millis(self.rate_interval_ms)
    }

    /// Scratch directory, falling back to the system temp dir.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Durations as integer milliseconds in the stack file
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.rate_limit, 10);
        assert_eq!(config.rate_interval(), Duration::from_secs(1));
        assert_eq!(config.change_set_attempts, 3);
        assert_eq!(config.delete_batch_size, 1000);
    }

    #[test]
    fn test_partial_override() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"rateLimit": 4, "pollInterval": 250}"#).unwrap();
        assert_eq!(config.rate_limit, 4);
        assert_eq!(config.rate_interval_ms, 1000);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.change_set_attempts, 3);
    }
}
