//! Per-service deletion of retained resources

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use stackherd_common::{Arn, ResourceKind};
use tracing::{debug, info};

use super::api::ResourceDeleter;
use super::context::AwsContext;
use super::error::ignore_not_found;
use super::send;
use crate::throttle::RateLimiter;
use crate::wait::{Settle, settle};

/// Deletes reclaimable resources through their owning service's API
pub struct AwsResourceDeleter {
    ctx: AwsContext,
    limiter: Arc<RateLimiter>,
}

/// Split an EventBridge rule id into (bus, name).
fn split_rule_id(rule_id: &str) -> (Option<&str>, &str) {
    match rule_id.split_once('/') {
        Some((bus, name)) => (Some(bus), name),
        None => (None, rule_id),
    }
}

impl AwsResourceDeleter {
    pub fn new(ctx: AwsContext, limiter: Arc<RateLimiter>) -> Self {
        Self { ctx, limiter }
    }

    /// Delete a role with everything attached to it.
    ///
    /// IAM refuses to delete a role that is still in an instance profile or
    /// has policies, so those go first.
    async fn delete_role(&self, region: &str, role_name: &str) -> Result<()> {
        let client = self.ctx.iam(region);

        let request = client.list_instance_profiles_for_role().role_name(role_name);
        let profiles = send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to list instance profiles of {role_name}"))?;
        for profile in profiles.instance_profiles() {
            let profile_name = profile.instance_profile_name();
            let request = client
                .remove_role_from_instance_profile()
                .instance_profile_name(profile_name)
                .role_name(role_name);
            ignore_not_found(send(&self.limiter, || request.send()).await.map(|_| ()))
                .with_context(|| format!("Failed to remove {role_name} from {profile_name}"))?;
            debug!(
                role_name = %role_name,
                profile_name = %profile_name,
                "Role removed from instance profile"
            );
        }

        let request = client.list_role_policies().role_name(role_name);
        let inline = send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to list inline policies of {role_name}"))?;
        for policy_name in inline.policy_names() {
            let request = client
                .delete_role_policy()
                .role_name(role_name)
                .policy_name(policy_name);
            ignore_not_found(send(&self.limiter, || request.send()).await.map(|_| ()))
                .with_context(|| format!("Failed to delete policy {policy_name} of {role_name}"))?;
            debug!(role_name = %role_name, policy_name = %policy_name, "Inline policy deleted");
        }

        let request = client.list_attached_role_policies().role_name(role_name);
        let attached = send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to list attached policies of {role_name}"))?;
        for policy_arn in attached.attached_policies().iter().filter_map(|p| p.policy_arn()) {
            let request = client
                .detach_role_policy()
                .role_name(role_name)
                .policy_arn(policy_arn);
            ignore_not_found(send(&self.limiter, || request.send()).await.map(|_| ()))
                .with_context(|| format!("Failed to detach {policy_arn} from {role_name}"))?;
            debug!(role_name = %role_name, policy_arn = %policy_arn, "Managed policy detached");
        }

        let request = client.delete_role().role_name(role_name);
        send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to delete IAM role {role_name}"))?;
        Ok(())
    }

    /// Disable a distribution, wait for the edge to converge, then delete it.
    async fn delete_distribution(&self, region: &str, id: &str) -> Result<()> {
        let client = self.ctx.cloudfront(region);

        let request = client.get_distribution_config().id(id);
        let current = send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to read config of distribution {id}"))?;
        let mut etag = current
            .e_tag()
            .context("CloudFront returned no ETag")?
            .to_string();

        if let Some(config) = current.distribution_config().filter(|c| c.enabled()) {
            let mut disabled = config.clone();
            disabled.enabled = false;
            let request = client
                .update_distribution()
                .id(id)
                .if_match(&etag)
                .distribution_config(disabled);
            let updated = send(&self.limiter, || request.send())
                .await
                .with_context(|| format!("Failed to disable distribution {id}"))?;
            etag = updated
                .e_tag()
                .context("CloudFront returned no ETag")?
                .to_string();
            info!(distribution = %id, "Distribution disabled, waiting for deployment");
        }

        settle(&format!("distribution {id}"), Settle::DISTRIBUTION, || {
            let client = client.clone();
            async move {
                let request = client.get_distribution().id(id);
                let output = send(&self.limiter, || request.send()).await?;
                Ok(output
                    .distribution()
                    .is_some_and(|d| d.status() == "Deployed"))
            }
        })
        .await?;

        let request = client.get_distribution().id(id);
        let latest = send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to read distribution {id}"))?;
        if let Some(tag) = latest.e_tag() {
            etag = tag.to_string();
        }

        let request = client.delete_distribution().id(id).if_match(&etag);
        send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to delete distribution {id}"))?;
        Ok(())
    }

    async fn delete_rule(&self, region: &str, rule_id: &str) -> Result<()> {
        let client = self.ctx.eventbridge(region);
        let (bus, name) = split_rule_id(rule_id);

        let request = client
            .list_targets_by_rule()
            .rule(name)
            .set_event_bus_name(bus.map(str::to_string));
        let targets = send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to list targets of rule {rule_id}"))?;
        let ids: Vec<String> = targets.targets().iter().map(|t| t.id().to_string()).collect();
        if !ids.is_empty() {
            let request = client
                .remove_targets()
                .rule(name)
                .set_event_bus_name(bus.map(str::to_string))
                .set_ids(Some(ids))
                .force(true);
            send(&self.limiter, || request.send())
                .await
                .with_context(|| format!("Failed to remove targets of rule {rule_id}"))?;
        }

        let request = client
            .delete_rule()
            .name(name)
            .set_event_bus_name(bus.map(str::to_string))
            .force(true);
        send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to delete rule {rule_id}"))?;
        Ok(())
    }
}

#[async_trait]
impl ResourceDeleter for AwsResourceDeleter {
    async fn untag(
        &self,
        region: &str,
        kind: ResourceKind,
        arn: &Arn,
        keys: &[String],
    ) -> Result<()> {
        let raw = arn.to_string();
        let keys = Some(keys.to_vec());
        debug!(arn = %raw, kind = %kind, "Removing tags");

        match kind {
            ResourceKind::CognitoIdentityPool => {
                let client = self.ctx.cognito_identity(region);
                let request = client.untag_resource().resource_arn(&raw).set_tag_keys(keys);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::CognitoUserPool => {
                let client = self.ctx.cognito_idp(region);
                let request = client.untag_resource().resource_arn(&raw).set_tag_keys(keys);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::IamRole => {
                let client = self.ctx.iam(region);
                let request = client
                    .untag_role()
                    .role_name(kind.delete_handle(arn))
                    .set_tag_keys(keys);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::LambdaFunction => {
                let client = self.ctx.lambda(region);
                let request = client.untag_resource().resource(&raw).set_tag_keys(keys);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::DynamoDbTable => {
                let client = self.ctx.dynamodb(region);
                let request = client.untag_resource().resource_arn(&raw).set_tag_keys(keys);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::SqsQueue => {
                let client = self.ctx.sqs(region);
                let request = client
                    .untag_queue()
                    .queue_url(kind.delete_handle(arn))
                    .set_tag_keys(keys);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::EventBridgeRule => {
                let client = self.ctx.eventbridge(region);
                let request = client.untag_resource().resource_arn(&raw).set_tag_keys(keys);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::AthenaWorkGroup => {
                let client = self.ctx.athena(region);
                let request = client.untag_resource().resource_arn(&raw).set_tag_keys(keys);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::EcrRepository => {
                let client = self.ctx.ecr(region);
                let request = client.untag_resource().resource_arn(&raw).set_tag_keys(keys);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::CloudFrontDistribution => {
                let client = self.ctx.cloudfront(region);
                let tag_keys = aws_sdk_cloudfront::types::TagKeys::builder()
                    .set_items(keys)
                    .build();
                let request = client.untag_resource().resource(&raw).tag_keys(tag_keys);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::S3Bucket => {
                bail!("Removing individual tags from bucket {raw} is not supported")
            }
        }
        Ok(())
    }

    async fn delete(&self, region: &str, kind: ResourceKind, arn: &Arn) -> Result<()> {
        let handle = kind.delete_handle(arn);
        info!(kind = %kind, arn = %arn, region = %region, "Deleting retained resource");

        match kind {
            ResourceKind::IamRole => self.delete_role(region, &handle).await?,
            ResourceKind::CloudFrontDistribution => {
                self.delete_distribution(region, &handle).await?
            }
            ResourceKind::EventBridgeRule => self.delete_rule(region, &handle).await?,
            ResourceKind::LambdaFunction => {
                let client = self.ctx.lambda(region);
                let request = client.delete_function().function_name(&handle);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::CognitoIdentityPool => {
                let client = self.ctx.cognito_identity(region);
                let request = client.delete_identity_pool().identity_pool_id(&handle);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::CognitoUserPool => {
                let client = self.ctx.cognito_idp(region);
                let request = client.delete_user_pool().user_pool_id(&handle);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::DynamoDbTable => {
                let client = self.ctx.dynamodb(region);
                let request = client.delete_table().table_name(&handle);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::SqsQueue => {
                let client = self.ctx.sqs(region);
                let request = client.delete_queue().queue_url(&handle);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::AthenaWorkGroup => {
                let client = self.ctx.athena(region);
                let request = client
                    .delete_work_group()
                    .work_group(&handle)
                    .recursive_delete_option(true);
                send(&self.limiter, || request.send()).await?;
            }
            ResourceKind::EcrRepository => {
                let client = self.ctx.ecr(region);
                let request = client
                    .delete_repository()
                    .repository_name(&handle)
                    .force(true);
                send(&self.limiter, || request.send()).await?;
            }
            // Buckets must be emptied through the object store first
            ResourceKind::S3Bucket => bail!("Bucket {handle} is deleted through the object store"),
        }

        info!(kind = %kind, arn = %arn, "Retained resource deleted");
        Ok(())
    }
}
