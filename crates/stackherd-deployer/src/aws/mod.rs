//! AWS collaborators for the deploy engine
//!
//! This module provides:
//! - `api`: the collaborator traits the engine is written against
//! - SDK-backed implementations for CloudFormation, S3, ECR (with bollard),
//!   the Resource Groups Tagging API and per-service resource deletion
//! - `error`: SDK error classification
//! - `account`: caller account lookup via STS
//!
//! Every SDK request goes through [`send`], which admits it through the
//! shared [`RateLimiter`] and classifies failures into [`AwsError`].

pub mod account;
pub mod api;
pub mod cloudformation;
pub mod context;
pub mod deleter;
pub mod ecr;
pub mod error;
pub mod s3;
pub mod tagging;

use std::future::Future;
use std::sync::Arc;

use aws_sdk_cloudformation::error::ProvideErrorMetadata;

use crate::throttle::RateLimiter;

pub use account::{AccountId, get_current_account_id};
pub use api::{
    ImageRegistry, ObjectStore, ResourceDeleter, Services, StackApi, TagSearch, TemplateSource,
    TemplateStage,
};
pub use cloudformation::CloudFormationStacks;
pub use context::AwsContext;
pub use deleter::AwsResourceDeleter;
pub use ecr::EcrImageRegistry;
pub use error::{AwsError, classify_anyhow_error, classify_aws_error, ignore_not_found};
pub use s3::S3ObjectStore;
pub use tagging::TaggingSearch;

/// Admit an SDK request through the limiter and classify its error.
pub(crate) async fn send<F, Fut, T, E>(limiter: &RateLimiter, request: F) -> anyhow::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    limiter
        .call(request)
        .await?
        .map_err(|e| error::classify_sdk_error(e).into())
}

/// Build the production collaborator set sharing one limiter.
pub async fn aws_services(ctx: &AwsContext, limiter: Arc<RateLimiter>) -> anyhow::Result<Services> {
    let account_id = get_current_account_id(ctx, &limiter).await?;
    Ok(Services {
        stacks: Arc::new(CloudFormationStacks::new(ctx.clone(), limiter.clone())),
        objects: Arc::new(S3ObjectStore::new(ctx.clone(), limiter.clone())),
        images: Arc::new(EcrImageRegistry::new(ctx.clone(), limiter.clone())?),
        tags: Arc::new(TaggingSearch::new(ctx.clone(), limiter.clone())),
        deleter: Arc::new(AwsResourceDeleter::new(ctx.clone(), limiter)),
        account_id,
    })
}
