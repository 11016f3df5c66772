//! Resources that outlived their stack
//!
//! CloudFormation propagates the `RootStackName` tag to every taggable
//! resource it creates, so anything still carrying the tag that is not part
//! of the live stack tree was retained by a deletion policy, or orphaned by a
//! failed delete.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};
use futures::future::join_all;
use stackherd_common::defaults::GLOBAL_RESOURCE_REGION;
use stackherd_common::tags::{TAG_ROOT_STACK_NAME, contains_value};
use stackherd_common::{Arn, ResourceKind};
use tracing::{debug, info, instrument, warn};

use super::live::list_live_resource_arns;
use super::{CleanupResult, ReclaimEntry, ReclaimReport};
use crate::aws::api::Services;
use crate::aws::classify_anyhow_error;
use crate::stackfile::ResolvedStack;

/// A tagged resource that is not part of the live stack tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedResource {
    pub arn: Arn,
    /// Region its delete API is called in
    pub region: String,
    pub kind: ResourceKind,
}

impl RetainedResource {
    fn entry(&self, stack: &str, result: CleanupResult) -> ReclaimEntry {
        ReclaimEntry {
            stack: stack.to_string(),
            region: self.region.clone(),
            kind: self.kind,
            arn: self.arn.to_string(),
            result,
        }
    }
}

/// Finds and deletes a stack's retained resources
#[derive(Clone)]
pub struct RetainedResourceReclaimer {
    services: Services,
    batch_size: usize,
}

impl RetainedResourceReclaimer {
    pub fn new(services: Services, batch_size: usize) -> Self {
        Self {
            services,
            batch_size: batch_size.max(1),
        }
    }

    /// Tagged resources of `stack` that are supported and not in `exclude`,
    /// in cleanup order.
    pub async fn list_retained_resource_arns(
        &self,
        stack: &ResolvedStack,
        exclude: &BTreeSet<String>,
    ) -> Result<Vec<RetainedResource>> {
        let mut regions = vec![stack.region()];
        if stack.region() != GLOBAL_RESOURCE_REGION {
            regions.push(GLOBAL_RESOURCE_REGION);
        }

        let exclude: BTreeSet<String> = exclude
            .iter()
            .map(|raw| ResourceKind::identity_of(raw))
            .collect();
        let mut found: BTreeMap<String, RetainedResource> = BTreeMap::new();
        for region in regions {
            let arns = self
                .services
                .tags
                .find_tagged(region, TAG_ROOT_STACK_NAME, stack.name())
                .await?;
            for raw in arns {
                if found.contains_key(&raw) {
                    continue;
                }
                let Ok(arn) = raw.parse::<Arn>() else {
                    debug!(arn = %raw, "Ignoring malformed ARN");
                    continue;
                };
                let Some(kind) = ResourceKind::from_arn(&arn) else {
                    debug!(arn = %raw, "Ignoring unsupported resource type");
                    continue;
                };
                if exclude.contains(&kind.identity(&arn)) {
                    continue;
                }
                // The global region's search only contributes global resources
                if region != stack.region() && !kind.is_global() {
                    continue;
                }
                let region = if kind.is_global() {
                    GLOBAL_RESOURCE_REGION.to_string()
                } else {
                    region.to_string()
                };
                found.insert(raw, RetainedResource { arn, region, kind });
            }
        }

        let mut retained: Vec<_> = found.into_values().collect();
        retained.sort_by_key(|r| r.kind.cleanup_priority());
        Ok(retained)
    }

    /// Delete, or report as skipped, every retained resource of `stack`.
    #[instrument(skip_all, fields(stack = %stack.id))]
    pub async fn reclaim(&self, stack: &ResolvedStack) -> Result<ReclaimReport> {
        let mut report = ReclaimReport::default();
        if stack.flags.skip_retained_cleanup {
            debug!("Retained resource cleanup disabled");
            return Ok(report);
        }

        let live = list_live_resource_arns(
            self.services.stacks.as_ref(),
            &self.services.account_id,
            stack.region(),
            stack.name(),
        )
        .await?;
        let retained = self.list_retained_resource_arns(stack, &live).await?;
        if retained.is_empty() {
            debug!("No retained resources");
            return Ok(report);
        }
        info!(count = retained.len(), "Found retained resources");

        if !stack.flags.force_delete {
            for resource in &retained {
                info!(
                    arn = %resource.arn,
                    kind = %resource.kind,
                    "Retained resource left in place"
                );
                report.record(resource.entry(stack.name(), CleanupResult::Skipped));
            }
            return Ok(report);
        }

        // Same-priority resources do not depend on each other
        let mut by_priority: BTreeMap<u8, Vec<&RetainedResource>> = BTreeMap::new();
        for resource in &retained {
            by_priority
                .entry(resource.kind.cleanup_priority())
                .or_default()
                .push(resource);
        }
        for group in by_priority.into_values() {
            let results = join_all(
                group
                    .iter()
                    .map(|r| self.delete_resource(r, &stack.bucket_cleanup_tags)),
            )
            .await;
            for (resource, result) in group.into_iter().zip(results) {
                report.record(resource.entry(stack.name(), result));
            }
        }
        Ok(report)
    }

    async fn delete_resource(
        &self,
        resource: &RetainedResource,
        bucket_filter: &BTreeMap<String, String>,
    ) -> CleanupResult {
        let region = resource.region.as_str();
        let deleter = &self.services.deleter;
        let result = match resource.kind {
            ResourceKind::S3Bucket => {
                match self
                    .empty_and_delete_bucket(region, &resource.arn, bucket_filter)
                    .await
                {
                    Ok(BucketCleanup::Deleted) => Ok(()),
                    Ok(BucketCleanup::Kept { objects }) => {
                        info!(arn = %resource.arn, objects, "Bucket holds unmatched objects, kept");
                        return CleanupResult::Skipped;
                    }
                    Err(e) => Err(e),
                }
            }
            ResourceKind::CognitoIdentityPool | ResourceKind::CognitoUserPool => {
                let keys = [TAG_ROOT_STACK_NAME.to_string()];
                match deleter.untag(region, resource.kind, &resource.arn, &keys).await {
                    Err(e) if classify_anyhow_error(&e).is_not_found() => {
                        debug!(arn = %resource.arn, "Pool already deleted");
                        return CleanupResult::AlreadyDeleted;
                    }
                    Err(e) => Err(e),
                    Ok(()) => deleter.delete(region, resource.kind, &resource.arn).await,
                }
            }
            _ => deleter.delete(region, resource.kind, &resource.arn).await,
        };

        match result {
            Ok(()) => {
                info!(kind = %resource.kind, arn = %resource.arn, "Deleted");
                CleanupResult::Deleted
            }
            Err(e) if classify_anyhow_error(&e).is_not_found() => CleanupResult::AlreadyDeleted,
            Err(e) => {
                warn!(
                    kind = %resource.kind,
                    arn = %resource.arn,
                    error = ?e,
                    "Cleanup failed"
                );
                CleanupResult::Failed
            }
        }
    }

    /// Delete object versions and delete markers, then the bucket.
    ///
    /// With a non-empty `filter` only keys whose current tags carry every
    /// filter pair are deleted, and the bucket survives if anything else
    /// is left in it.
    async fn empty_and_delete_bucket(
        &self,
        region: &str,
        arn: &Arn,
        filter: &BTreeMap<String, String>,
    ) -> Result<BucketCleanup> {
        let bucket = arn.resource_name();
        let objects = &self.services.objects;
        let mut marker = None;
        let mut deleted = 0usize;
        let mut verdicts: BTreeMap<String, bool> = BTreeMap::new();
        loop {
            let page = objects.list_object_versions(region, bucket, marker).await?;
            let mut doomed = Vec::with_capacity(page.versions.len());
            for version in page.versions {
                if !filter.is_empty() && !verdicts.contains_key(&version.key) {
                    let matched = self
                        .matches_filter(region, bucket, &version.key, filter)
                        .await?;
                    verdicts.insert(version.key.clone(), matched);
                }
                if verdicts.get(&version.key).copied().unwrap_or(true) {
                    doomed.push(version);
                }
            }
            for chunk in doomed.chunks(self.batch_size) {
                let failed = objects.delete_objects(region, bucket, chunk).await?;
                if !failed.is_empty() {
                    bail!(
                        "failed to delete {} objects from bucket {bucket}, first: {}",
                        failed.len(),
                        failed[0]
                    );
                }
                deleted += chunk.len();
            }
            marker = page.next;
            if marker.is_none() {
                break;
            }
        }

        let kept = verdicts.values().filter(|matched| !**matched).count();
        debug!(bucket, objects = deleted, kept, "Emptied bucket");
        if kept > 0 {
            return Ok(BucketCleanup::Kept { objects: kept });
        }
        objects.delete_bucket(region, bucket).await?;
        Ok(BucketCleanup::Deleted)
    }

    async fn matches_filter(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        filter: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let tags = match self.services.objects.get_object_tags(region, bucket, key).await {
            Ok(tags) => tags,
            // The current version is a delete marker
            Err(e) if classify_anyhow_error(&e).is_not_found() => return Ok(true),
            Err(e) => return Err(e),
        };
        Ok(filter.iter().all(|(name, wanted)| {
            tags.get(name).is_some_and(|value| contains_value(value, wanted))
        }))
    }
}

enum BucketCleanup {
    Deleted,
    /// Keys left behind because their tags did not match
    Kept { objects: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::api::{
        MockImageRegistry, MockObjectStore, MockResourceDeleter, MockStackApi, MockTagSearch,
        ObjectVersion, StackDescription, StackResource, VersionMarker, VersionPage,
    };
    use crate::aws::{AccountId, AwsError};
    use crate::stackfile::{StackFlags, StackRef, TemplateLocation};
    use std::path::PathBuf;
    use std::sync::Arc;

    const BUCKET_ARN: &str = "arn:aws:s3:::app-assets";
    const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/app-role";
    const TABLE_ARN: &str = "arn:aws:dynamodb:eu-west-1:123456789012:table/orders";
    const POOL_ARN: &str = "arn:aws:cognito-idp:eu-west-1:123456789012:userpool/eu-west-1_Ab";

    fn stack(flags: StackFlags) -> ResolvedStack {
        ResolvedStack {
            id: StackRef::new("eu-west-1", "app"),
            template: TemplateLocation::Path(PathBuf::from("t.yaml")),
            depends_on: Vec::new(),
            parameters: BTreeMap::new(),
            tags: BTreeMap::new(),
            bucket: None,
            repository: None,
            flags,
            capabilities: Vec::new(),
            outputs_file: None,
            bucket_cleanup_tags: BTreeMap::new(),
        }
    }

    fn services(
        tags: MockTagSearch,
        objects: MockObjectStore,
        deleter: MockResourceDeleter,
    ) -> Services {
        let mut stacks = MockStackApi::new();
        stacks.expect_describe_stack().returning(|_, _| Ok(None));
        Services {
            stacks: Arc::new(stacks),
            objects: Arc::new(objects),
            images: Arc::new(MockImageRegistry::new()),
            tags: Arc::new(tags),
            deleter: Arc::new(deleter),
            account_id: AccountId::new("123456789012"),
        }
    }

    fn tag_search() -> MockTagSearch {
        let mut tags = MockTagSearch::new();
        tags.expect_find_tagged().returning(|region, key, value| {
            assert_eq!((key, value), ("RootStackName", "app"));
            Ok(match region {
                "eu-west-1" => vec![
                    BUCKET_ARN.to_string(),
                    TABLE_ARN.to_string(),
                    "arn:aws:sns:eu-west-1:123456789012:alerts".to_string(),
                ],
                _ => vec![ROLE_ARN.to_string()],
            })
        });
        tags
    }

    #[tokio::test]
    async fn test_live_resources_are_excluded() {
        let reclaimer = RetainedResourceReclaimer::new(
            services(tag_search(), MockObjectStore::new(), MockResourceDeleter::new()),
            1000,
        );
        let exclude = BTreeSet::from([TABLE_ARN.to_string()]);
        let retained = reclaimer
            .list_retained_resource_arns(&stack(StackFlags::default()), &exclude)
            .await
            .unwrap();

        let arns: Vec<_> = retained.iter().map(|r| r.arn.to_string()).collect();
        assert_eq!(arns, vec![BUCKET_ARN.to_string(), ROLE_ARN.to_string()]);
        assert_eq!(retained[1].region, "us-east-1");
    }

    #[tokio::test]
    async fn test_not_forced_is_skipped() {
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().never();
        let reclaimer = RetainedResourceReclaimer::new(
            services(tag_search(), MockObjectStore::new(), deleter),
            1000,
        );
        let report = reclaimer.reclaim(&stack(StackFlags::default())).await.unwrap();
        assert_eq!(report.count(CleanupResult::Skipped), 3);
    }

    #[tokio::test]
    async fn test_forced_empties_bucket_before_delete() {
        let mut objects = MockObjectStore::new();
        objects
            .expect_list_object_versions()
            .returning(|_, _, from| {
                Ok(match from {
                    None => VersionPage {
                        versions: (0..3)
                            .map(|i| ObjectVersion {
                                key: format!("k{i}"),
                                version_id: Some("v1".to_string()),
                            })
                            .collect(),
                        next: Some(VersionMarker {
                            key_marker: "k2".to_string(),
                            version_id_marker: Some("v1".to_string()),
                        }),
                    },
                    Some(_) => VersionPage {
                        versions: vec![ObjectVersion {
                            key: "k3".to_string(),
                            version_id: None,
                        }],
                        next: None,
                    },
                })
            });
        objects
            .expect_delete_objects()
            .times(3)
            .returning(|_, _, batch| {
                assert!(batch.len() <= 2);
                Ok(Vec::new())
            });
        objects
            .expect_delete_bucket()
            .withf(|_, bucket| bucket == "app-assets")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().times(2).returning(|_, _, _| Ok(()));

        let reclaimer = RetainedResourceReclaimer::new(services(tag_search(), objects, deleter), 2);
        let report = reclaimer
            .reclaim(&stack(StackFlags {
                force_delete: true,
                ..Default::default()
            }))
            .await
            .unwrap();
        assert_eq!(report.count(CleanupResult::Deleted), 3);
    }

    #[tokio::test]
    async fn test_pool_not_found_on_untag_is_already_deleted() {
        let mut tags = MockTagSearch::new();
        tags.expect_find_tagged().returning(|region, _, _| {
            Ok(if region == "eu-west-1" {
                vec![POOL_ARN.to_string()]
            } else {
                Vec::new()
            })
        });
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_untag().returning(|_, _, _, _| {
            Err(AwsError::NotFound {
                resource_id: POOL_ARN.to_string(),
            }
            .into())
        });
        deleter.expect_delete().never();

        let reclaimer =
            RetainedResourceReclaimer::new(services(tags, MockObjectStore::new(), deleter), 1000);
        let report = reclaimer
            .reclaim(&stack(StackFlags {
                force_delete: true,
                ..Default::default()
            }))
            .await
            .unwrap();
        assert_eq!(report.count(CleanupResult::AlreadyDeleted), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().returning(|_, kind, _| {
            if kind == ResourceKind::DynamoDbTable {
                anyhow::bail!("ResourceInUseException")
            }
            Ok(())
        });
        let mut objects = MockObjectStore::new();
        objects
            .expect_list_object_versions()
            .returning(|_, _, _| Ok(VersionPage::default()));
        objects.expect_delete_bucket().returning(|_, _| Ok(()));

        let reclaimer =
            RetainedResourceReclaimer::new(services(tag_search(), objects, deleter), 1000);
        let report = reclaimer
            .reclaim(&stack(StackFlags {
                force_delete: true,
                ..Default::default()
            }))
            .await
            .unwrap();
        assert_eq!(report.count(CleanupResult::Failed), 1);
        assert_eq!(report.count(CleanupResult::Deleted), 2);
    }

    fn bucket_only() -> MockTagSearch {
        let mut tags = MockTagSearch::new();
        tags.expect_find_tagged().returning(|region, _, _| {
            Ok(if region == "eu-west-1" {
                vec![BUCKET_ARN.to_string()]
            } else {
                Vec::new()
            })
        });
        tags
    }

    fn version(key: &str, id: &str) -> ObjectVersion {
        ObjectVersion {
            key: key.to_string(),
            version_id: Some(id.to_string()),
        }
    }

    fn filtered_stack() -> ResolvedStack {
        let mut stack = stack(StackFlags {
            force_delete: true,
            ..Default::default()
        });
        stack.bucket_cleanup_tags = BTreeMap::from([("purpose".to_string(), "build".to_string())]);
        stack
    }

    #[tokio::test]
    async fn test_tag_filter_keeps_unmatched_objects_and_bucket() {
        let mut objects = MockObjectStore::new();
        objects.expect_list_object_versions().returning(|_, _, _| {
            Ok(VersionPage {
                versions: vec![
                    version("build/a", "v1"),
                    version("build/a", "v2"),
                    version("build/b", "v1"),
                    version("gone", "m1"),
                    version("keep/c", "v1"),
                ],
                next: None,
            })
        });
        objects
            .expect_get_object_tags()
            .times(4)
            .returning(|_, _, key| match key {
                "build/a" => Ok(BTreeMap::from([(
                    "purpose".to_string(),
                    "build".to_string(),
                )])),
                "build/b" => Ok(BTreeMap::from([(
                    "purpose".to_string(),
                    "cache+build".to_string(),
                )])),
                "gone" => Err(AwsError::NotFound {
                    resource_id: key.to_string(),
                }
                .into()),
                _ => Ok(BTreeMap::new()),
            });
        let deleted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&deleted);
        objects
            .expect_delete_objects()
            .returning(move |_, _, batch| {
                let mut sink = sink.lock().unwrap();
                sink.extend(batch.iter().map(|v| v.key.clone()));
                Ok(Vec::new())
            });
        objects.expect_delete_bucket().never();

        let reclaimer = RetainedResourceReclaimer::new(
            services(bucket_only(), objects, MockResourceDeleter::new()),
            1000,
        );
        let report = reclaimer.reclaim(&filtered_stack()).await.unwrap();

        assert_eq!(report.count(CleanupResult::Skipped), 1);
        assert_eq!(
            *deleted.lock().unwrap(),
            vec!["build/a", "build/a", "build/b", "gone"]
        );
    }

    #[tokio::test]
    async fn test_tag_filter_deletes_bucket_when_everything_matched() {
        let mut objects = MockObjectStore::new();
        objects.expect_list_object_versions().returning(|_, _, _| {
            Ok(VersionPage {
                versions: vec![version("build/a", "v1")],
                next: None,
            })
        });
        objects.expect_get_object_tags().returning(|_, _, _| {
            Ok(BTreeMap::from([("purpose".to_string(), "build".to_string())]))
        });
        objects
            .expect_delete_objects()
            .times(1)
            .returning(|_, _, _| Ok(Vec::new()));
        objects
            .expect_delete_bucket()
            .times(1)
            .returning(|_, _| Ok(()));

        let reclaimer = RetainedResourceReclaimer::new(
            services(bucket_only(), objects, MockResourceDeleter::new()),
            1000,
        );
        let report = reclaimer.reclaim(&filtered_stack()).await.unwrap();
        assert_eq!(report.count(CleanupResult::Deleted), 1);
    }

    #[tokio::test]
    async fn test_live_role_with_path_is_kept() {
        const PATHED_ROLE: &str = "arn:aws:iam::123456789012:role/service-role/app-role";

        let mut stacks = MockStackApi::new();
        stacks.expect_describe_stack().returning(|_, name| {
            Ok(Some(StackDescription {
                stack_id: name.to_string(),
                name: name.to_string(),
                status: "CREATE_COMPLETE".to_string(),
                status_reason: None,
                outputs: BTreeMap::new(),
                tags: BTreeMap::new(),
            }))
        });
        // CloudFormation reports a role by its bare name
        stacks.expect_list_stack_resources().returning(|_, _| {
            Ok(vec![StackResource {
                logical_id: "Role".to_string(),
                physical_id: Some("app-role".to_string()),
                resource_type: "AWS::IAM::Role".to_string(),
                status: "CREATE_COMPLETE".to_string(),
            }])
        });
        let mut tags = MockTagSearch::new();
        tags.expect_find_tagged().returning(|region, _, _| {
            Ok(if region == "us-east-1" {
                vec![PATHED_ROLE.to_string()]
            } else {
                Vec::new()
            })
        });
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().never();

        let reclaimer = RetainedResourceReclaimer::new(
            Services {
                stacks: Arc::new(stacks),
                objects: Arc::new(MockObjectStore::new()),
                images: Arc::new(MockImageRegistry::new()),
                tags: Arc::new(tags),
                deleter: Arc::new(deleter),
                account_id: AccountId::new("123456789012"),
            },
            1000,
        );
        let report = reclaimer
            .reclaim(&stack(StackFlags {
                force_delete: true,
                ..Default::default()
            }))
            .await
            .unwrap();
        assert!(report.entries.is_empty(), "{report:?}");
    }
}
