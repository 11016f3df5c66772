//! Tag-based resource discovery through the Resource Groups Tagging API
//!
//! Finds resources by tag directly from AWS, independent of any stack's
//! resource list. Retained resources outlive their stack, so this is the only
//! way to find them after the stack is gone.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_resourcegroupstagging::types::TagFilter;
use tracing::debug;

use super::api::TagSearch;
use super::context::AwsContext;
use super::send;
use crate::throttle::RateLimiter;

/// Scanner for resources carrying a given tag
pub struct TaggingSearch {
    ctx: AwsContext,
    limiter: Arc<RateLimiter>,
}

impl TaggingSearch {
    pub fn new(ctx: AwsContext, limiter: Arc<RateLimiter>) -> Self {
        Self { ctx, limiter }
    }
}

#[async_trait]
impl TagSearch for TaggingSearch {
    async fn find_tagged(&self, region: &str, key: &str, value: &str) -> Result<Vec<String>> {
        let client = self.ctx.tagging(region);
        let filter = TagFilter::builder().key(key).values(value).build();

        let mut arns = Vec::new();
        let mut pagination_token: Option<String> = None;
        loop {
            let request = client
                .get_resources()
                .tag_filters(filter.clone())
                .set_pagination_token(pagination_token.take());
            let response = send(&self.limiter, || request.send())
                .await
                .with_context(|| format!("Failed to search {region} for {key}={value}"))?;

            arns.extend(
                response
                    .resource_tag_mapping_list()
                    .iter()
                    .filter_map(|m| m.resource_arn().map(str::to_string)),
            );

            // The service signals the last page with an empty token
            match response.pagination_token() {
                Some(token) if !token.is_empty() => pagination_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(
            region = %region,
            key = %key,
            value = %value,
            count = arns.len(),
            "Tagged resources found"
        );
        Ok(arns)
    }
}
