//! AWS account validation and identity

use anyhow::{Context, Result};
use tracing::info;

use super::context::AwsContext;
use super::send;
use crate::throttle::RateLimiter;

/// Strongly-typed AWS account ID (12-digit string)
///
/// ARN reconstruction needs the account of the caller, so this is captured
/// once per run and threaded through instead of a bare `String`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, derive_more::Deref)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(s: impl Into<String>) -> Self {
        AccountId(s.into())
    }
}

/// Fetch the current AWS account ID from credentials via STS GetCallerIdentity
///
/// This operation requires no special permissions - it always succeeds if
/// credentials are valid. Use this to validate credentials and capture the
/// account ID at the start of operations.
pub async fn get_current_account_id(ctx: &AwsContext, limiter: &RateLimiter) -> Result<AccountId> {
    let request = ctx.sts(ctx.region()).get_caller_identity();
    let identity = send(limiter, || request.send())
        .await
        .context("Failed to get AWS caller identity - check credentials")?;

    let account = identity
        .account()
        .context("No account ID returned from STS GetCallerIdentity")?;

    info!(account_id = %account, "AWS account validated");

    Ok(AccountId(account.to_string()))
}
