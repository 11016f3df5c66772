//! Stateful in-memory AWS
//!
//! [`FakeCloud`] implements every collaborator trait over one shared state,
//! so a test can deploy a stack, upload its artifacts, tag its resources and
//! then delete and collect it, and inspect what each step did.
//!
//! Remote operations settle immediately: a change set is classified as soon
//! as it is created and a stack reaches its final status as soon as its
//! change set is executed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stackherd::aws::api::{
    ChangeSetDescription, ChangeSetRequest, ChangeSetType, ObjectVersion, StackDescription,
    StackEvent, StackResource, TemplateParameter, TemplateSummary, VersionMarker, VersionPage,
};
use stackherd::aws::{
    AccountId, AwsError, ImageRegistry, ObjectStore, ResourceDeleter, Services, StackApi,
    TagSearch, TemplateSource, TemplateStage,
};
use stackherd::packaging::descriptors::parse_https_url;
use stackherd_common::{Arn, ResourceKind};

/// Account every fake resource belongs to
pub const ACCOUNT_ID: &str = "123456789012";

const NO_CHANGES: &str = "The submitted information didn't contain changes. \
                          Submit different information to create a change set.";

#[derive(Debug, Clone)]
struct FakeStack {
    stack_id: String,
    status: String,
    reason: Option<String>,
    template: Option<String>,
    parameters: BTreeMap<String, String>,
    tags: BTreeMap<String, String>,
    outputs: BTreeMap<String, String>,
    resources: Vec<StackResource>,
    events: Vec<StackEvent>,
}

#[derive(Debug, Clone)]
struct FakeChangeSet {
    region: String,
    stack: String,
    status: String,
    reason: Option<String>,
    request: ChangeSetRequest,
    body: String,
}

#[derive(Debug, Clone, Default)]
struct FakeObject {
    body: Vec<u8>,
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct Tagged {
    region: String,
    arn: String,
    tags: BTreeMap<String, String>,
}

/// How an execution should end for one stack
#[derive(Debug, Clone)]
struct PlannedFailure {
    logical_id: String,
    resource_type: String,
    reason: String,
}

#[derive(Default)]
struct State {
    stacks: BTreeMap<(String, String), FakeStack>,
    change_sets: BTreeMap<String, FakeChangeSet>,
    objects: BTreeMap<(String, String), FakeObject>,
    buckets: BTreeSet<String>,
    images: BTreeMap<(String, String), String>,
    tagged: Vec<Tagged>,

    planned_outputs: BTreeMap<(String, String), BTreeMap<String, String>>,
    planned_resources: BTreeMap<(String, String), Vec<StackResource>>,
    deploy_failures: BTreeMap<(String, String), PlannedFailure>,
    delete_failures: BTreeMap<(String, String), String>,
    failing_arns: BTreeSet<String>,
    failing_keys: BTreeSet<String>,
    limit_exceeded: u32,
    version_page_size: Option<usize>,

    calls: Vec<String>,
    counter: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Find a stack by name or stack id
    fn find(&self, region: &str, stack: &str) -> Option<(String, String)> {
        self.stacks
            .iter()
            .find(|((r, name), s)| r == region && (name == stack || s.stack_id == stack))
            .map(|(key, _)| key.clone())
    }

    fn template_body(&self, template: &TemplateSource) -> Result<String> {
        match template {
            TemplateSource::Body(body) => Ok(body.clone()),
            TemplateSource::Url(url) => {
                let object = parse_https_url(url)
                    .ok_or_else(|| anyhow!("unsupported template URL {url}"))?;
                let stored = self
                    .objects
                    .get(&(object.bucket.clone(), object.key.clone()))
                    .ok_or_else(|| not_found(url))?;
                Ok(String::from_utf8_lossy(&stored.body).into_owned())
            }
        }
    }
}

fn not_found(id: &str) -> anyhow::Error {
    AwsError::NotFound {
        resource_id: id.to_string(),
    }
    .into()
}

fn access_denied(id: &str) -> anyhow::Error {
    AwsError::Sdk {
        code: Some("AccessDenied".to_string()),
        message: format!("not authorized to modify {id}"),
    }
    .into()
}

/// In-memory CloudFormation, S3, ECR, tagging and resource deletion
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<State>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }

    /// Every collaborator backed by this fake
    pub fn services(self: &Arc<Self>) -> Services {
        Services {
            stacks: self.clone(),
            objects: self.clone(),
            images: self.clone(),
            tags: self.clone(),
            deleter: self.clone(),
            account_id: AccountId::new(ACCOUNT_ID),
        }
    }

    // Setup

    /// Outputs a stack reports once deployed
    pub fn plan_outputs(&self, region: &str, stack: &str, outputs: &[(&str, &str)]) {
        self.lock().planned_outputs.insert(
            (region.to_string(), stack.to_string()),
            outputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    /// Resources a stack owns once deployed
    pub fn plan_resources(&self, region: &str, stack: &str, resources: Vec<StackResource>) {
        self.lock()
            .planned_resources
            .insert((region.to_string(), stack.to_string()), resources);
    }

    /// Make the next execution of `stack` roll back because of `logical_id`
    pub fn fail_deploy(
        &self,
        region: &str,
        stack: &str,
        logical_id: &str,
        resource_type: &str,
        reason: &str,
    ) {
        self.lock().deploy_failures.insert(
            (region.to_string(), stack.to_string()),
            PlannedFailure {
                logical_id: logical_id.to_string(),
                resource_type: resource_type.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    /// Make deleting `stack` end in DELETE_FAILED
    pub fn fail_delete(&self, region: &str, stack: &str, reason: &str) {
        self.lock()
            .delete_failures
            .insert((region.to_string(), stack.to_string()), reason.to_string());
    }

    /// Reject deletes and untags of `arn`
    pub fn fail_resource(&self, arn: &str) {
        self.lock().failing_arns.insert(arn.to_string());
    }

    /// Report `key` as failed in every batch delete
    pub fn fail_object(&self, key: &str) {
        self.lock().failing_keys.insert(key.to_string());
    }

    /// Reject the next `times` change set creations with LimitExceeded
    pub fn limit_change_sets(&self, times: u32) {
        self.lock().limit_exceeded = times;
    }

    pub fn set_version_page_size(&self, size: usize) {
        self.lock().version_page_size = Some(size);
    }

    /// A stack that already exists, with the given template body
    pub fn put_stack(&self, region: &str, stack: &str, status: &str, template: Option<&str>) {
        let mut state = self.lock();
        let id = state.next_id();
        let outputs = state
            .planned_outputs
            .get(&(region.to_string(), stack.to_string()))
            .cloned()
            .unwrap_or_default();
        let resources = state
            .planned_resources
            .get(&(region.to_string(), stack.to_string()))
            .cloned()
            .unwrap_or_default();
        state.stacks.insert(
            (region.to_string(), stack.to_string()),
            FakeStack {
                stack_id: stack_arn(region, stack, id),
                status: status.to_string(),
                reason: None,
                template: template.map(str::to_string),
                parameters: BTreeMap::new(),
                tags: BTreeMap::new(),
                outputs,
                resources,
                events: Vec::new(),
            },
        );
    }

    pub fn put_object_with_tags(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        tags: &[(&str, &str)],
    ) {
        let mut state = self.lock();
        state.buckets.insert(bucket.to_string());
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            FakeObject {
                body: body.to_vec(),
                tags: tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
    }

    /// A resource the tagging API reports in `region`
    pub fn tag_resource(&self, region: &str, arn: &str, tags: &[(&str, &str)]) {
        self.lock().tagged.push(Tagged {
            region: region.to_string(),
            arn: arn.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }

    // Inspection

    /// Every mutating call, in order
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls starting with `prefix`, in order
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn stack_status(&self, region: &str, stack: &str) -> Option<String> {
        let state = self.lock();
        state
            .stacks
            .get(&(region.to_string(), stack.to_string()))
            .map(|s| s.status.clone())
    }

    pub fn stack_parameters(&self, region: &str, stack: &str) -> BTreeMap<String, String> {
        let state = self.lock();
        state
            .stacks
            .get(&(region.to_string(), stack.to_string()))
            .map(|s| s.parameters.clone())
            .unwrap_or_default()
    }

    pub fn object_keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn object_body(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.body.clone())
    }

    pub fn object_tags(&self, bucket: &str, key: &str) -> BTreeMap<String, String> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.tags.clone())
            .unwrap_or_default()
    }

    pub fn bucket_exists(&self, bucket: &str) -> bool {
        self.lock().buckets.contains(bucket)
    }

    pub fn tagged_arns(&self) -> Vec<String> {
        self.lock().tagged.iter().map(|t| t.arn.clone()).collect()
    }

    pub fn change_set_count(&self, region: &str, stack: &str) -> usize {
        self.lock()
            .change_sets
            .values()
            .filter(|c| c.region == region && c.stack == stack)
            .count()
    }
}

pub fn stack_arn(region: &str, stack: &str, id: u64) -> String {
    format!("arn:aws:cloudformation:{region}:{ACCOUNT_ID}:stack/{stack}/{id:08x}")
}

/// A resource as ListStackResources reports it
pub fn stack_resource(logical_id: &str, resource_type: &str, physical_id: &str) -> StackResource {
    StackResource {
        logical_id: logical_id.to_string(),
        physical_id: Some(physical_id.to_string()),
        resource_type: resource_type.to_string(),
        status: "CREATE_COMPLETE".to_string(),
    }
}

fn summarize(body: &str) -> Result<TemplateSummary> {
    let template: serde_yaml::Value = serde_yaml::from_str(body).map_err(|e| AwsError::Sdk {
        code: Some("ValidationError".to_string()),
        message: format!("Template format error: {e}"),
    })?;

    let parameters = template
        .get("Parameters")
        .and_then(serde_yaml::Value::as_mapping)
        .map(|params| {
            params
                .iter()
                .filter_map(|(key, decl)| {
                    Some(TemplateParameter {
                        key: key.as_str()?.to_string(),
                        has_default: decl.get("Default").is_some(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let declared_transforms = match template.get("Transform") {
        Some(serde_yaml::Value::String(t)) => vec![t.clone()],
        Some(serde_yaml::Value::Sequence(ts)) => ts
            .iter()
            .filter_map(|t| t.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    Ok(TemplateSummary {
        parameters,
        capabilities: Vec::new(),
        declared_transforms,
    })
}

#[async_trait]
impl StackApi for FakeCloud {
    async fn describe_stack(&self, region: &str, stack: &str) -> Result<Option<StackDescription>> {
        let state = self.lock();
        Ok(state.find(region, stack).and_then(|key| {
            let s = state.stacks.get(&key)?;
            Some(StackDescription {
                stack_id: s.stack_id.clone(),
                name: key.1.clone(),
                status: s.status.clone(),
                status_reason: s.reason.clone(),
                outputs: s.outputs.clone(),
                tags: s.tags.clone(),
            })
        }))
    }

    async fn describe_change_set(
        &self,
        _region: &str,
        arn: &str,
    ) -> Result<Option<ChangeSetDescription>> {
        let state = self.lock();
        Ok(state.change_sets.get(arn).map(|c| {
            let stack_id = state
                .stacks
                .get(&(c.region.clone(), c.stack.clone()))
                .map(|s| s.stack_id.clone())
                .unwrap_or_default();
            ChangeSetDescription {
                arn: arn.to_string(),
                stack_id,
                status: c.status.clone(),
                status_reason: c.reason.clone(),
            }
        }))
    }

    async fn create_change_set(&self, region: &str, request: &ChangeSetRequest) -> Result<String> {
        let mut state = self.lock();
        state.calls.push(format!("create_change_set {region}/{}", request.stack_name));
        if state.limit_exceeded > 0 {
            state.limit_exceeded -= 1;
            return Err(AwsError::LimitExceeded {
                message: format!("ChangeSet limit exceeded for stack {}", request.stack_name),
            }
            .into());
        }

        let body = state.template_body(&request.template)?;
        summarize(&body)?;

        let key = (region.to_string(), request.stack_name.clone());
        let existing = state.stacks.get(&key).cloned();
        if request.change_set_type == ChangeSetType::Create && existing.is_none() {
            let id = state.next_id();
            state.stacks.insert(
                key.clone(),
                FakeStack {
                    stack_id: stack_arn(region, &request.stack_name, id),
                    status: "REVIEW_IN_PROGRESS".to_string(),
                    reason: None,
                    template: None,
                    parameters: BTreeMap::new(),
                    tags: BTreeMap::new(),
                    outputs: BTreeMap::new(),
                    resources: Vec::new(),
                    events: Vec::new(),
                },
            );
        } else if existing.is_none() {
            return Err(not_found(&request.stack_name));
        }

        let unchanged = existing.is_some_and(|s| {
            s.template.as_deref() == Some(body.as_str())
                && s.parameters == request.parameters
                && s.tags == request.tags
        });
        let (status, reason) = if unchanged {
            ("FAILED", Some(NO_CHANGES.to_string()))
        } else {
            ("CREATE_COMPLETE", None)
        };

        let id = state.next_id();
        let arn = format!(
            "arn:aws:cloudformation:{region}:{ACCOUNT_ID}:changeSet/{}/{id:08x}",
            request.change_set_name
        );
        state.change_sets.insert(
            arn.clone(),
            FakeChangeSet {
                region: region.to_string(),
                stack: request.stack_name.clone(),
                status: status.to_string(),
                reason,
                request: request.clone(),
                body,
            },
        );
        Ok(arn)
    }

    async fn execute_change_set(&self, region: &str, arn: &str) -> Result<()> {
        let mut state = self.lock();
        let change_set = state.change_sets.remove(arn).ok_or_else(|| not_found(arn))?;
        state
            .calls
            .push(format!("execute_change_set {region}/{}", change_set.stack));

        let key = (region.to_string(), change_set.stack.clone());
        let failure = state.deploy_failures.remove(&key);
        let outputs = state.planned_outputs.get(&key).cloned().unwrap_or_default();
        let resources = state.planned_resources.get(&key).cloned().unwrap_or_default();
        let stack = state.stacks.get_mut(&key).ok_or_else(|| not_found(arn))?;
        let creating = change_set.request.change_set_type == ChangeSetType::Create;
        let now = Utc::now();

        match failure {
            Some(failure) => {
                stack.status = if creating {
                    "ROLLBACK_COMPLETE"
                } else {
                    "UPDATE_ROLLBACK_COMPLETE"
                }
                .to_string();
                stack.reason = Some("The following resource(s) failed to create".to_string());
                stack.events.push(StackEvent {
                    stack_id: stack.stack_id.clone(),
                    logical_id: failure.logical_id,
                    physical_id: None,
                    resource_type: failure.resource_type,
                    status: if creating { "CREATE_FAILED" } else { "UPDATE_FAILED" }.to_string(),
                    reason: Some(failure.reason),
                    timestamp: now,
                });
            }
            None => {
                stack.status = if creating {
                    "CREATE_COMPLETE"
                } else {
                    "UPDATE_COMPLETE"
                }
                .to_string();
                stack.reason = None;
                stack.template = Some(change_set.body);
                stack.parameters = change_set.request.parameters;
                stack.tags = change_set.request.tags;
                stack.outputs = outputs;
                stack.resources = resources;
            }
        }
        Ok(())
    }

    async fn delete_change_set(&self, _region: &str, arn: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("delete_change_set {arn}"));
        state
            .change_sets
            .remove(arn)
            .map(|_| ())
            .ok_or_else(|| not_found(arn))
    }

    async fn list_change_sets(&self, region: &str, stack: &str) -> Result<Vec<String>> {
        let state = self.lock();
        Ok(state
            .change_sets
            .iter()
            .filter(|(_, c)| c.region == region && c.stack == stack)
            .map(|(arn, _)| arn.clone())
            .collect())
    }

    async fn delete_stack(&self, region: &str, stack: &str) -> Result<()> {
        let mut state = self.lock();
        let Some(key) = state.find(region, stack) else {
            return Ok(());
        };
        state.calls.push(format!("delete_stack {region}/{}", key.1));
        match state.delete_failures.get(&key).cloned() {
            Some(reason) => {
                if let Some(s) = state.stacks.get_mut(&key) {
                    s.status = "DELETE_FAILED".to_string();
                    s.reason = Some(reason);
                }
            }
            None => {
                state.stacks.remove(&key);
                state.change_sets.retain(|_, c| !(c.region == key.0 && c.stack == key.1));
            }
        }
        Ok(())
    }

    async fn list_stack_resources(
        &self,
        region: &str,
        stack: &str,
    ) -> Result<Vec<StackResource>> {
        let state = self.lock();
        let key = state.find(region, stack).ok_or_else(|| not_found(stack))?;
        Ok(state
            .stacks
            .get(&key)
            .map(|s| s.resources.clone())
            .unwrap_or_default())
    }

    async fn get_template(
        &self,
        region: &str,
        stack: &str,
        _stage: TemplateStage,
    ) -> Result<String> {
        let state = self.lock();
        state
            .find(region, stack)
            .and_then(|key| state.stacks.get(&key)?.template.clone())
            .ok_or_else(|| not_found(stack))
    }

    async fn validate_template(&self, region: &str, template: &TemplateSource) -> Result<()> {
        let state = self.lock();
        let body = state.template_body(template)?;
        drop(state);
        self.record(format!("validate_template {region}"));
        summarize(&body).map(|_| ())
    }

    async fn get_template_summary(
        &self,
        _region: &str,
        template: &TemplateSource,
    ) -> Result<TemplateSummary> {
        let body = self.lock().template_body(template)?;
        summarize(&body)
    }

    async fn describe_stack_events(
        &self,
        region: &str,
        stack: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StackEvent>> {
        let state = self.lock();
        let key = state.find(region, stack).ok_or_else(|| not_found(stack))?;
        let mut events: Vec<StackEvent> = state
            .stacks
            .get(&key)
            .map(|s| s.events.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|e| since.is_none_or(|since| e.timestamp >= since))
            .collect();
        events.reverse();
        Ok(events)
    }
}

#[async_trait]
impl ObjectStore for FakeCloud {
    async fn head_object(&self, _region: &str, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .lock()
            .objects
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn put_object(&self, _region: &str, bucket: &str, key: &str, body: &Path) -> Result<()> {
        let body = tokio::fs::read(body).await?;
        let mut state = self.lock();
        state.calls.push(format!("put_object {bucket}/{key}"));
        state.buckets.insert(bucket.to_string());
        state
            .objects
            .entry((bucket.to_string(), key.to_string()))
            .or_default()
            .body = body;
        Ok(())
    }

    async fn get_object(&self, _region: &str, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.body.clone())
            .ok_or_else(|| not_found(key))
    }

    async fn get_object_tags(
        &self,
        _region: &str,
        bucket: &str,
        key: &str,
    ) -> Result<BTreeMap<String, String>> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.tags.clone())
            .ok_or_else(|| not_found(key))
    }

    async fn put_object_tags(
        &self,
        _region: &str,
        bucket: &str,
        key: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("put_object_tags {bucket}/{key}"));
        let object = state
            .objects
            .get_mut(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| not_found(key))?;
        object.tags = tags.clone();
        Ok(())
    }

    async fn list_keys(&self, _region: &str, bucket: &str) -> Result<Vec<String>> {
        Ok(self.object_keys(bucket))
    }

    async fn list_object_versions(
        &self,
        _region: &str,
        bucket: &str,
        from: Option<VersionMarker>,
    ) -> Result<VersionPage> {
        let state = self.lock();
        let page_size = state.version_page_size.unwrap_or(1000);
        let remaining: Vec<String> = state
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .filter(|k| from.as_ref().is_none_or(|m| *k > m.key_marker))
            .collect();

        let versions: Vec<ObjectVersion> = remaining
            .iter()
            .take(page_size)
            .map(|key| ObjectVersion {
                key: key.clone(),
                version_id: None,
            })
            .collect();
        let next = if remaining.len() > page_size {
            versions.last().map(|v| VersionMarker {
                key_marker: v.key.clone(),
                version_id_marker: None,
            })
        } else {
            None
        };
        Ok(VersionPage { versions, next })
    }

    async fn delete_objects(
        &self,
        _region: &str,
        bucket: &str,
        objects: &[ObjectVersion],
    ) -> Result<Vec<String>> {
        let mut state = self.lock();
        state
            .calls
            .push(format!("delete_objects {bucket} {}", objects.len()));
        let mut failed = Vec::new();
        for object in objects {
            if state.failing_keys.contains(&object.key) {
                failed.push(object.key.clone());
            } else {
                state
                    .objects
                    .remove(&(bucket.to_string(), object.key.clone()));
            }
        }
        Ok(failed)
    }

    async fn delete_bucket(&self, _region: &str, bucket: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("delete_bucket {bucket}"));
        if state.objects.keys().any(|(b, _)| b == bucket) {
            return Err(AwsError::Sdk {
                code: Some("BucketNotEmpty".to_string()),
                message: format!("The bucket {bucket} you tried to delete is not empty"),
            }
            .into());
        }
        let arn = format!("arn:aws:s3:::{bucket}");
        state.tagged.retain(|t| t.arn != arn);
        if state.buckets.remove(bucket) {
            Ok(())
        } else {
            Err(not_found(bucket))
        }
    }
}

#[async_trait]
impl ImageRegistry for FakeCloud {
    async fn find_image_digest(
        &self,
        _region: &str,
        repository: &str,
        tag: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .lock()
            .images
            .get(&(repository.to_string(), tag.to_string()))
            .cloned())
    }

    async fn build_and_push(
        &self,
        _region: &str,
        repository: &str,
        tag: &str,
        context: &Path,
        _dockerfile: &str,
    ) -> Result<String> {
        if !context.is_dir() {
            return Err(anyhow!("build context {} is not a directory", context.display()));
        }
        let mut state = self.lock();
        state.calls.push(format!("build_and_push {repository}:{tag}"));
        let id = state.next_id();
        let digest = format!("sha256:{id:064x}");
        state
            .images
            .insert((repository.to_string(), tag.to_string()), digest.clone());
        Ok(digest)
    }
}

#[async_trait]
impl TagSearch for FakeCloud {
    async fn find_tagged(&self, region: &str, key: &str, value: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .tagged
            .iter()
            .filter(|t| t.region == region && t.tags.get(key).is_some_and(|v| v == value))
            .map(|t| t.arn.clone())
            .collect())
    }
}

#[async_trait]
impl ResourceDeleter for FakeCloud {
    async fn untag(
        &self,
        _region: &str,
        _kind: ResourceKind,
        arn: &Arn,
        keys: &[String],
    ) -> Result<()> {
        let raw = arn.to_string();
        let mut state = self.lock();
        state.calls.push(format!("untag {raw}"));
        if state.failing_arns.contains(&raw) {
            return Err(access_denied(&raw));
        }
        let tagged = state
            .tagged
            .iter_mut()
            .find(|t| t.arn == raw)
            .ok_or_else(|| not_found(&raw))?;
        for key in keys {
            tagged.tags.remove(key);
        }
        Ok(())
    }

    async fn delete(&self, _region: &str, kind: ResourceKind, arn: &Arn) -> Result<()> {
        let raw = arn.to_string();
        let mut state = self.lock();
        state.calls.push(format!("delete {kind} {raw}"));
        if state.failing_arns.contains(&raw) {
            return Err(access_denied(&raw));
        }
        let before = state.tagged.len();
        state.tagged.retain(|t| t.arn != raw);
        if state.tagged.len() == before {
            return Err(not_found(&raw));
        }
        Ok(())
    }
}
