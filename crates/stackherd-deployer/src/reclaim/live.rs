//! ARNs of resources a stack tree still owns

use std::collections::BTreeSet;

use anyhow::Result;
use stackherd_common::{Arn, ResourceKind};
use tracing::debug;

use super::ClassificationError;
use crate::aws::{AccountId, StackApi};

const NESTED_STACK_TYPE: &str = "AWS::CloudFormation::Stack";

/// Types that are never tagged on their own. They cannot show up in a tag
/// search, so leaving them out of the live set is safe.
const UNTAGGED_TYPES: &[&str] = &[
    "AWS::IAM::Policy",
    "AWS::IAM::RolePolicy",
    "AWS::IAM::UserPolicy",
    "AWS::IAM::GroupPolicy",
    "AWS::IAM::InstanceProfile",
    "AWS::IAM::AccessKey",
    "AWS::IAM::UserToGroupAddition",
    "AWS::IAM::Group",
    "AWS::Lambda::Permission",
    "AWS::Lambda::EventSourceMapping",
    "AWS::Lambda::EventInvokeConfig",
    "AWS::Lambda::Url",
    "AWS::Cognito::UserPoolClient",
    "AWS::Cognito::UserPoolDomain",
    "AWS::Cognito::UserPoolGroup",
    "AWS::Cognito::UserPoolUser",
    "AWS::Cognito::UserPoolResourceServer",
    "AWS::Cognito::UserPoolIdentityProvider",
    "AWS::Cognito::UserPoolUICustomizationAttachment",
    "AWS::Cognito::IdentityPoolRoleAttachment",
    "AWS::S3::BucketPolicy",
    "AWS::SQS::QueuePolicy",
    "AWS::SQS::QueueInlinePolicy",
    "AWS::CloudFront::CloudFrontOriginAccessIdentity",
    "AWS::CloudFront::OriginAccessControl",
    "AWS::CloudFront::CachePolicy",
    "AWS::CloudFront::OriginRequestPolicy",
    "AWS::CloudFront::ResponseHeadersPolicy",
    "AWS::CloudFront::Function",
    "AWS::Events::EventBus",
    "AWS::Events::EventBusPolicy",
    "AWS::Events::Archive",
    "AWS::Events::Connection",
    "AWS::Athena::NamedQuery",
    "AWS::Athena::PreparedStatement",
    "AWS::ECR::RegistryPolicy",
    "AWS::ECR::ReplicationConfiguration",
];

/// Walk `stack` and its nested stacks and return the ARN of every resource
/// that could otherwise be mistaken for a retained one.
///
/// A stack that does not exist owns nothing. A resource of any other type
/// whose ARN cannot be derived is an error, because leaving it out could let
/// the reclaimer delete it.
pub async fn list_live_resource_arns(
    stacks: &dyn StackApi,
    account: &AccountId,
    region: &str,
    stack: &str,
) -> Result<BTreeSet<String>> {
    let mut live = BTreeSet::new();
    let mut work = vec![stack.to_string()];
    let mut visited = BTreeSet::new();

    while let Some(current) = work.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        if stacks.describe_stack(region, &current).await?.is_none() {
            debug!(stack = %current, "Stack does not exist, nothing live");
            continue;
        }

        for resource in stacks.list_stack_resources(region, &current).await? {
            if resource.status == "DELETE_COMPLETE" {
                continue;
            }
            let Some(physical_id) = resource.physical_id.as_deref() else {
                continue;
            };

            if resource.resource_type == NESTED_STACK_TYPE {
                work.push(physical_id.to_string());
                continue;
            }

            match ResourceKind::from_cfn_type(&resource.resource_type) {
                Some(kind) => {
                    live.insert(kind.arn_from_physical_id(region, account, physical_id)?);
                }
                None if Arn::looks_like_arn(physical_id) => {
                    live.insert(physical_id.to_string());
                }
                None if UNTAGGED_TYPES.contains(&resource.resource_type.as_str()) => {}
                None => {
                    return Err(ClassificationError {
                        stack: current,
                        logical_id: resource.logical_id,
                        resource_type: resource.resource_type,
                        physical_id: physical_id.to_string(),
                    }
                    .into());
                }
            }
        }
    }

    debug!(stack, count = live.len(), "Listed live resources");
    Ok(live)
}
