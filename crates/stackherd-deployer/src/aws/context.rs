//! Shared AWS configuration context
//!
//! Provides `AwsContext` for loading AWS SDK configuration once and
//! creating service clients for any region from the same config.

use aws_config::identity::IdentityCache;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use std::sync::Arc;
use std::time::Duration;

/// Shared AWS configuration context for creating service clients.
///
/// Stacks in one run may live in different regions, so clients are created
/// per call with a region override on top of the shared config. Credentials
/// and their cache are shared by every client.
///
/// # Example
/// ```ignore
/// let aws = AwsContext::with_profile("eu-west-1", None, Duration::from_secs(30)).await;
///
/// let cfn = aws.cloudformation("eu-west-1");
/// let iam = aws.iam(GLOBAL_RESOURCE_REGION);
/// ```
#[derive(Clone)]
pub struct AwsContext {
    config: Arc<SdkConfig>,
    region: String,
}

macro_rules! regional_client {
    ($(#[$doc:meta])* $name:ident, $sdk:ident) => {
        $(#[$doc])*
        pub fn $name(&self, region: &str) -> $sdk::Client {
            let config = $sdk::config::Builder::from(self.sdk_config())
                .region(Region::new(region.to_string()))
                .build();
            $sdk::Client::from_conf(config)
        }
    };
}

impl AwsContext {
    /// Load AWS configuration with the default credential chain.
    pub async fn new(region: &str) -> Self {
        Self::with_profile(
            region,
            None,
            stackherd_common::defaults::DEFAULT_CREDENTIALS_TIMEOUT,
        )
        .await
    }

    /// Load AWS configuration, optionally pinned to a named profile.
    ///
    /// `credentials_timeout` bounds each credential acquisition, including
    /// refreshes of short-lived credentials during long deployments.
    pub async fn with_profile(
        region: &str,
        profile: Option<&str>,
        credentials_timeout: Duration,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .identity_cache(
                IdentityCache::lazy()
                    .load_timeout(credentials_timeout)
                    .build(),
            );
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }

        Self {
            config: Arc::new(loader.load().await),
            region: region.to_string(),
        }
    }

    /// Wrap an already-built SDK config. Its region becomes the default.
    pub fn from_sdk_config(config: SdkConfig) -> Self {
        let region = config
            .region()
            .map(|r| r.as_ref().to_string())
            .unwrap_or_default();
        Self {
            config: Arc::new(config),
            region,
        }
    }

    /// Get the underlying SDK config for direct client construction.
    pub fn sdk_config(&self) -> &SdkConfig {
        &self.config
    }

    /// Get the home region string.
    pub fn region(&self) -> &str {
        &self.region
    }

    regional_client!(
        /// Create a CloudFormation client for `region`.
        cloudformation, aws_sdk_cloudformation
    );
    regional_client!(
        /// Create an S3 client for `region`.
        s3, aws_sdk_s3
    );
    regional_client!(
        /// Create an ECR client for `region`.
        ecr, aws_sdk_ecr
    );
    regional_client!(
        /// Create a Resource Groups Tagging API client for `region`.
        tagging, aws_sdk_resourcegroupstagging
    );
    regional_client!(
        /// Create an STS client for `region`.
        sts, aws_sdk_sts
    );
    regional_client!(iam, aws_sdk_iam);
    regional_client!(lambda, aws_sdk_lambda);
    regional_client!(cognito_identity, aws_sdk_cognitoidentity);
    regional_client!(cognito_idp, aws_sdk_cognitoidentityprovider);
    regional_client!(dynamodb, aws_sdk_dynamodb);
    regional_client!(cloudfront, aws_sdk_cloudfront);
    regional_client!(sqs, aws_sdk_sqs);
    regional_client!(eventbridge, aws_sdk_eventbridge);
    regional_client!(athena, aws_sdk_athena);
}

impl std::fmt::Debug for AwsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsContext")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}
