//! Default configuration values shared across stackherd components

use std::time::Duration;

/// Default number of AWS calls admitted per rate-limit window
pub const DEFAULT_RATE_LIMIT: usize = 10;

/// Default rate-limit window in milliseconds
pub const DEFAULT_RATE_INTERVAL_MS: u64 = 1000;

/// Fixed delay between two status polls of the same stack or change set
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum attempts at creating a change set when the per-stack limit is hit
pub const DEFAULT_CHANGE_SET_ATTEMPTS: u32 = 3;

/// S3 `DeleteObjects` accepts at most this many keys per request
pub const DEFAULT_DELETE_BATCH_SIZE: usize = 1000;

/// Default timeout for acquiring AWS credentials
pub const DEFAULT_CREDENTIALS_TIMEOUT: Duration = Duration::from_secs(30);

/// Region queried for global resources (IAM, CloudFront) during tag search
pub const GLOBAL_RESOURCE_REGION: &str = "us-east-1";

// Serde default functions for struct field defaults

/// Returns the default rate limit
pub fn default_rate_limit() -> usize {
    DEFAULT_RATE_LIMIT
}

/// Returns the default rate interval
pub fn default_rate_interval_ms() -> u64 {
    DEFAULT_RATE_INTERVAL_MS
}
