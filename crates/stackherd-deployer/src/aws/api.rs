//! Collaborator interfaces for the deploy engine
//!
//! The engine never touches an SDK client directly. It talks to these traits,
//! which have one AWS-backed implementation each (see the sibling modules)
//! and in-memory fakes in `stackherd-test-utils`.
//!
//! Every method takes the target region explicitly because a single run can
//! span stacks in several regions.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stackherd_common::{Arn, ResourceKind};

use super::account::AccountId;

/// Which copy of a deployed template to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateStage {
    /// The template as submitted, with transforms unexpanded
    Original,
    /// The template after macros and transforms ran
    Processed,
}

/// Where CloudFormation reads a template from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Body(String),
    Url(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSetType {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDescription {
    pub stack_id: String,
    pub name: String,
    pub status: String,
    pub status_reason: Option<String>,
    pub outputs: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSetDescription {
    pub arn: String,
    pub stack_id: String,
    pub status: String,
    pub status_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSetRequest {
    pub stack_name: String,
    pub change_set_name: String,
    pub change_set_type: ChangeSetType,
    pub template: TemplateSource,
    pub parameters: BTreeMap<String, String>,
    pub capabilities: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateParameter {
    pub key: String,
    pub has_default: bool,
}

/// What a template needs in order to be deployed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateSummary {
    pub parameters: Vec<TemplateParameter>,
    pub capabilities: Vec<String>,
    pub declared_transforms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackResource {
    pub logical_id: String,
    pub physical_id: Option<String>,
    pub resource_type: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEvent {
    pub stack_id: String,
    pub logical_id: String,
    pub physical_id: Option<String>,
    pub resource_type: String,
    pub status: String,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One object version or delete marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectVersion {
    pub key: String,
    pub version_id: Option<String>,
}

/// Continuation point of a version listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMarker {
    pub key_marker: String,
    pub version_id_marker: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionPage {
    pub versions: Vec<ObjectVersion>,
    pub next: Option<VersionMarker>,
}

/// CloudFormation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StackApi: Send + Sync {
    /// Describe a stack by name or id. `None` when it does not exist.
    async fn describe_stack(&self, region: &str, stack: &str) -> Result<Option<StackDescription>>;

    /// Describe a change set by ARN. `None` when it does not exist.
    async fn describe_change_set(
        &self,
        region: &str,
        arn: &str,
    ) -> Result<Option<ChangeSetDescription>>;

    /// Create a change set and return its ARN.
    async fn create_change_set(&self, region: &str, request: &ChangeSetRequest) -> Result<String>;

    async fn execute_change_set(&self, region: &str, arn: &str) -> Result<()>;

    async fn delete_change_set(&self, region: &str, arn: &str) -> Result<()>;

    /// ARNs of every change set currently attached to `stack`.
    async fn list_change_sets(&self, region: &str, stack: &str) -> Result<Vec<String>>;

    async fn delete_stack(&self, region: &str, stack: &str) -> Result<()>;

    async fn list_stack_resources(&self, region: &str, stack: &str)
    -> Result<Vec<StackResource>>;

    async fn get_template(&self, region: &str, stack: &str, stage: TemplateStage)
    -> Result<String>;

    async fn validate_template(&self, region: &str, template: &TemplateSource) -> Result<()>;

    async fn get_template_summary(
        &self,
        region: &str,
        template: &TemplateSource,
    ) -> Result<TemplateSummary>;

    /// Events of one stack, newest first, stopping before `since` if given.
    async fn describe_stack_events(
        &self,
        region: &str,
        stack: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StackEvent>>;
}

/// S3
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head_object(&self, region: &str, bucket: &str, key: &str) -> Result<bool>;

    async fn put_object(&self, region: &str, bucket: &str, key: &str, body: &Path) -> Result<()>;

    async fn get_object(&self, region: &str, bucket: &str, key: &str) -> Result<Vec<u8>>;

    async fn get_object_tags(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
    ) -> Result<BTreeMap<String, String>>;

    async fn put_object_tags(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Keys of every current object in the bucket.
    async fn list_keys(&self, region: &str, bucket: &str) -> Result<Vec<String>>;

    /// One page of object versions and delete markers.
    async fn list_object_versions(
        &self,
        region: &str,
        bucket: &str,
        from: Option<VersionMarker>,
    ) -> Result<VersionPage>;

    /// Delete at most one service batch. Returns the keys that failed.
    async fn delete_objects(
        &self,
        region: &str,
        bucket: &str,
        objects: &[ObjectVersion],
    ) -> Result<Vec<String>>;

    async fn delete_bucket(&self, region: &str, bucket: &str) -> Result<()>;
}

/// ECR plus the local container engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Digest of `repository:tag` if that image was pushed before.
    async fn find_image_digest(
        &self,
        region: &str,
        repository: &str,
        tag: &str,
    ) -> Result<Option<String>>;

    /// Build `context` with `dockerfile`, push it as `repository:tag` and
    /// return the pushed content digest.
    async fn build_and_push(
        &self,
        region: &str,
        repository: &str,
        tag: &str,
        context: &Path,
        dockerfile: &str,
    ) -> Result<String>;
}

/// Resource Groups Tagging API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TagSearch: Send + Sync {
    /// ARNs of every resource in `region` tagged `key=value`.
    async fn find_tagged(&self, region: &str, key: &str, value: &str) -> Result<Vec<String>>;
}

/// Per-service deletion of reclaimable resources
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceDeleter: Send + Sync {
    async fn untag(&self, region: &str, kind: ResourceKind, arn: &Arn, keys: &[String])
    -> Result<()>;

    async fn delete(&self, region: &str, kind: ResourceKind, arn: &Arn) -> Result<()>;
}

/// Every collaborator the engine needs, shared across tasks
#[derive(Clone)]
pub struct Services {
    pub stacks: Arc<dyn StackApi>,
    pub objects: Arc<dyn ObjectStore>,
    pub images: Arc<dyn ImageRegistry>,
    pub tags: Arc<dyn TagSearch>,
    pub deleter: Arc<dyn ResourceDeleter>,
    pub account_id: AccountId,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}
