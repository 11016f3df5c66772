//! AWS test utilities
//!
//! Provides region detection and unique stack names for integration tests
//! against a real account.

use chrono::Utc;

/// Get the AWS region for tests.
///
/// Checks environment variables in order:
/// 1. AWS_REGION
/// 2. AWS_DEFAULT_REGION
/// 3. Falls back to us-east-2
pub fn get_test_region() -> String {
    std::env::var("AWS_REGION")
        .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
        .unwrap_or_else(|_| "us-east-2".to_string())
}

/// Generate a unique run ID for test resources.
///
/// Format: `test-{timestamp_ms}-{counter}`, unique even when tests start
/// simultaneously.
pub fn test_run_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let ts = Utc::now().timestamp_millis();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("test-{}-{}", ts, counter)
}

/// Stack name for one test run, valid as a CloudFormation stack name.
pub fn test_stack_name(prefix: &str) -> String {
    format!("stackherd-{prefix}-{}", test_run_id())
}

/// Artifact bucket for integration tests, from `STACKHERD_TEST_BUCKET`.
pub fn test_bucket() -> Option<String> {
    std::env::var("STACKHERD_TEST_BUCKET").ok()
}
