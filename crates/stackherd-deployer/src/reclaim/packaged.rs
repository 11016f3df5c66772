//! Pruning of uploaded artifacts no live template references
//!
//! Packaged objects carry the `RootStackName` of every stack that uploaded
//! them. An object is pruned when one of the candidate stacks owns it and no
//! existing stack template, root or nested, still points at it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use stackherd_common::tags::{TAG_ROOT_STACK_NAME, split_values};
use tracing::{debug, info, instrument, warn};

use crate::aws::api::ObjectVersion;
use crate::aws::{ObjectStore, StackApi, TemplateStage};
use crate::packaging::{ObjectRef, Template};
use crate::stackfile::ResolvedStack;

const NESTED_STACK_TYPE: &str = "AWS::CloudFormation::Stack";

/// Outcome of one prune run
#[derive(Debug, Default)]
pub struct PruneReport {
    /// Objects owned by a candidate stack
    pub examined: usize,
    /// Owned objects some live template still references
    pub kept: usize,
    pub deleted: Vec<ObjectRef>,
    pub failed: Vec<ObjectRef>,
}

/// Deletes packaged objects that no live stack references
#[derive(Clone)]
pub struct PackagedFileReclaimer {
    stacks: Arc<dyn StackApi>,
    objects: Arc<dyn ObjectStore>,
    batch_size: usize,
}

impl PackagedFileReclaimer {
    pub fn new(
        stacks: Arc<dyn StackApi>,
        objects: Arc<dyn ObjectStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            stacks,
            objects,
            batch_size: batch_size.max(1),
        }
    }

    /// Prune the artifact buckets of every candidate stack that allows it.
    #[instrument(skip_all, fields(stacks = candidates.len()))]
    pub async fn prune(&self, candidates: &[ResolvedStack]) -> Result<PruneReport> {
        // (region, bucket) -> candidate stack names
        let mut buckets: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        for stack in candidates {
            if stack.flags.skip_prune {
                debug!(stack = %stack.id, "Pruning disabled");
                continue;
            }
            if let Some(bucket) = &stack.bucket {
                buckets
                    .entry((stack.region().to_string(), bucket.clone()))
                    .or_default()
                    .insert(stack.name().to_string());
            }
        }

        let mut report = PruneReport::default();
        let mut references = ReferenceCache::default();
        for ((region, bucket), owners) in &buckets {
            self.prune_bucket(region, bucket, owners, &mut references, &mut report)
                .await?;
        }
        info!(
            examined = report.examined,
            kept = report.kept,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Pruned packaged files"
        );
        Ok(report)
    }

    async fn prune_bucket(
        &self,
        region: &str,
        bucket: &str,
        candidates: &BTreeSet<String>,
        references: &mut ReferenceCache,
        report: &mut PruneReport,
    ) -> Result<()> {
        let mut doomed = Vec::new();
        for key in self.objects.list_keys(region, bucket).await? {
            let tags = self.objects.get_object_tags(region, bucket, &key).await?;
            let Some(owners) = tags.get(TAG_ROOT_STACK_NAME) else {
                continue;
            };
            let owners: Vec<&str> = split_values(owners).collect();
            if !owners.iter().any(|o| candidates.contains(*o)) {
                continue;
            }
            report.examined += 1;

            let object = ObjectRef {
                bucket: bucket.to_string(),
                key,
            };
            let mut referenced = false;
            for owner in owners.iter().copied().chain(candidates.iter().map(String::as_str)) {
                let refs = references.get(self, region, owner).await?;
                if refs.contains(&object) {
                    referenced = true;
                    break;
                }
            }
            if referenced {
                debug!(bucket, key = %object.key, "Still referenced");
                report.kept += 1;
            } else {
                doomed.push(object);
            }
        }

        for chunk in doomed.chunks(self.batch_size) {
            let versions: Vec<ObjectVersion> = chunk
                .iter()
                .map(|o| ObjectVersion {
                    key: o.key.clone(),
                    version_id: None,
                })
                .collect();
            let failed: BTreeSet<String> = self
                .objects
                .delete_objects(region, bucket, &versions)
                .await?
                .into_iter()
                .collect();
            for object in chunk {
                if failed.contains(&object.key) {
                    warn!(bucket, key = %object.key, "Failed to delete packaged file");
                    report.failed.push(object.clone());
                } else {
                    report.deleted.push(object.clone());
                }
            }
        }
        Ok(())
    }

    /// Objects referenced by `stack` and its nested stacks. Empty when the
    /// stack does not exist.
    async fn stack_references(&self, region: &str, stack: &str) -> Result<BTreeSet<ObjectRef>> {
        let mut found = BTreeSet::new();
        let mut work = vec![stack.to_string()];
        let mut visited = BTreeSet::new();

        while let Some(current) = work.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if self.stacks.describe_stack(region, &current).await?.is_none() {
                continue;
            }
            let body = self
                .stacks
                .get_template(region, &current, TemplateStage::Original)
                .await?;
            match Template::parse(Path::new(""), &body) {
                Ok(template) => found.extend(template.packaged_objects()),
                Err(e) => warn!(stack = %current, error = %e, "Unreadable template"),
            }

            for resource in self.stacks.list_stack_resources(region, &current).await? {
                if resource.resource_type == NESTED_STACK_TYPE {
                    if let Some(id) = resource.physical_id {
                        work.push(id);
                    }
                }
            }
        }
        Ok(found)
    }
}

/// Per-run memo of each stack's references
#[derive(Default)]
struct ReferenceCache {
    by_stack: BTreeMap<(String, String), BTreeSet<ObjectRef>>,
}

impl ReferenceCache {
    async fn get(
        &mut self,
        reclaimer: &PackagedFileReclaimer,
        region: &str,
        stack: &str,
    ) -> Result<&BTreeSet<ObjectRef>> {
        let key = (region.to_string(), stack.to_string());
        if !self.by_stack.contains_key(&key) {
            let refs = reclaimer.stack_references(region, stack).await?;
            self.by_stack.insert(key.clone(), refs);
        }
        Ok(&self.by_stack[&key])
    }
}
