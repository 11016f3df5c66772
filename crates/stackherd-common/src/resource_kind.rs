//! Reclaimable AWS resource types
//!
//! A `ResourceKind` is a resource type whose ARN can be reconstructed from a
//! CloudFormation physical id, which is what makes it safe to compare live
//! stack resources against tag-search results. Types outside this list are
//! never deleted by the reclaimer.

use crate::arn::{Arn, ArnError, partition_for_region};

/// Types of AWS resources stackherd can reclaim after stack deletion
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    strum::Display,
    strum::EnumIter,
)]
pub enum ResourceKind {
    /// CloudFront distribution (global, must be disabled before deletion)
    CloudFrontDistribution,
    /// Lambda function
    LambdaFunction,
    /// EventBridge rule (targets removed before deletion)
    EventBridgeRule,
    /// SQS queue
    SqsQueue,
    /// DynamoDB table
    DynamoDbTable,
    /// Athena workgroup
    AthenaWorkGroup,
    /// ECR repository
    EcrRepository,
    /// Cognito identity pool
    CognitoIdentityPool,
    /// Cognito user pool
    CognitoUserPool,
    /// S3 bucket (emptied before deletion)
    S3Bucket,
    /// IAM role (global)
    IamRole,
}

impl ResourceKind {
    /// Map a CloudFormation resource type to a reclaimable kind
    pub fn from_cfn_type(resource_type: &str) -> Option<Self> {
        Some(match resource_type {
            "AWS::IAM::Role" => Self::IamRole,
            "AWS::Lambda::Function" | "AWS::Serverless::Function" => Self::LambdaFunction,
            "AWS::Cognito::IdentityPool" => Self::CognitoIdentityPool,
            "AWS::Cognito::UserPool" => Self::CognitoUserPool,
            "AWS::S3::Bucket" => Self::S3Bucket,
            "AWS::DynamoDB::Table" | "AWS::Serverless::SimpleTable" => Self::DynamoDbTable,
            "AWS::CloudFront::Distribution" => Self::CloudFrontDistribution,
            "AWS::SQS::Queue" => Self::SqsQueue,
            "AWS::Events::Rule" => Self::EventBridgeRule,
            "AWS::Athena::WorkGroup" => Self::AthenaWorkGroup,
            "AWS::ECR::Repository" => Self::EcrRepository,
            _ => return None,
        })
    }

    /// Identify the kind of an ARN returned by tag search
    pub fn from_arn(arn: &Arn) -> Option<Self> {
        let resource = arn.resource.as_str();
        Some(match arn.service.as_str() {
            "iam" if resource.starts_with("role/") => Self::IamRole,
            "lambda" if resource.starts_with("function:") => Self::LambdaFunction,
            "cognito-identity" if resource.starts_with("identitypool/") => {
                Self::CognitoIdentityPool
            }
            "cognito-idp" if resource.starts_with("userpool/") => Self::CognitoUserPool,
            "s3" if !resource.contains('/') => Self::S3Bucket,
            "dynamodb" if resource.starts_with("table/") && resource.matches('/').count() == 1 => {
                Self::DynamoDbTable
            }
            "cloudfront" if resource.starts_with("distribution/") => Self::CloudFrontDistribution,
            "sqs" => Self::SqsQueue,
            "events" if resource.starts_with("rule/") => Self::EventBridgeRule,
            "athena" if resource.starts_with("workgroup/") => Self::AthenaWorkGroup,
            "ecr" if resource.starts_with("repository/") => Self::EcrRepository,
            _ => return None,
        })
    }

    /// Global resources are only visible to tag search in `us-east-1`
    pub fn is_global(self) -> bool {
        matches!(self, Self::IamRole | Self::CloudFrontDistribution)
    }

    /// ARN service component of this kind
    pub fn service(self) -> &'static str {
        match self {
            Self::IamRole => "iam",
            Self::LambdaFunction => "lambda",
            Self::CognitoIdentityPool => "cognito-identity",
            Self::CognitoUserPool => "cognito-idp",
            Self::S3Bucket => "s3",
            Self::DynamoDbTable => "dynamodb",
            Self::CloudFrontDistribution => "cloudfront",
            Self::SqsQueue => "sqs",
            Self::EventBridgeRule => "events",
            Self::AthenaWorkGroup => "athena",
            Self::EcrRepository => "ecr",
        }
    }

    /// Get cleanup priority (lower number = cleanup first)
    ///
    /// - 0: CloudFront distributions (slowest, disable-then-delete)
    /// - 1: Functions and rules that consume other resources
    /// - 2: Data and queue resources
    /// - 3: Identity pools, which may reference user pools and roles
    /// - 4: User pools and buckets
    /// - 5: IAM roles, assumed by everything above
    pub fn cleanup_priority(self) -> u8 {
        match self {
            Self::CloudFrontDistribution => 0,
            Self::LambdaFunction | Self::EventBridgeRule => 1,
            Self::SqsQueue | Self::DynamoDbTable | Self::AthenaWorkGroup | Self::EcrRepository => 2,
            Self::CognitoIdentityPool => 3,
            Self::CognitoUserPool | Self::S3Bucket => 4,
            Self::IamRole => 5,
        }
    }

    /// Reconstruct the ARN of a resource from its CloudFormation physical id.
    ///
    /// Physical ids that are already ARN-shaped are returned unchanged.
    pub fn arn_from_physical_id(
        self,
        region: &str,
        account: &str,
        physical_id: &str,
    ) -> Result<String, ArnError> {
        if Arn::looks_like_arn(physical_id) {
            return Ok(physical_id.to_string());
        }

        let partition = partition_for_region(region);
        let service = self.service();
        let arn = match self {
            Self::IamRole => format!("arn:{partition}:iam::{account}:role/{physical_id}"),
            Self::S3Bucket => format!("arn:{partition}:s3:::{physical_id}"),
            Self::CloudFrontDistribution => {
                format!("arn:{partition}:cloudfront::{account}:distribution/{physical_id}")
            }
            Self::LambdaFunction => {
                format!("arn:{partition}:{service}:{region}:{account}:function:{physical_id}")
            }
            Self::CognitoIdentityPool => {
                format!("arn:{partition}:{service}:{region}:{account}:identitypool/{physical_id}")
            }
            Self::CognitoUserPool => {
                format!("arn:{partition}:{service}:{region}:{account}:userpool/{physical_id}")
            }
            Self::DynamoDbTable => {
                format!("arn:{partition}:{service}:{region}:{account}:table/{physical_id}")
            }
            Self::AthenaWorkGroup => {
                format!("arn:{partition}:{service}:{region}:{account}:workgroup/{physical_id}")
            }
            Self::EcrRepository => {
                format!("arn:{partition}:{service}:{region}:{account}:repository/{physical_id}")
            }
            Self::EventBridgeRule => {
                // Rules on a custom bus report `bus|name`
                let rule = match physical_id.split_once('|') {
                    Some((bus, name)) if bus != "default" => format!("{bus}/{name}"),
                    Some((_, name)) => name.to_string(),
                    None => physical_id.to_string(),
                };
                format!("arn:{partition}:{service}:{region}:{account}:rule/{rule}")
            }
            Self::SqsQueue => {
                // Physical id is the queue URL: https://sqs.<region>.amazonaws.com/<account>/<name>
                let mut segments = physical_id.trim_end_matches('/').rsplit('/');
                match (segments.next(), segments.next()) {
                    (Some(name), Some(owner)) if physical_id.starts_with("https://") => {
                        format!("arn:{partition}:{service}:{region}:{owner}:{name}")
                    }
                    _ => {
                        return Err(ArnError::UnsupportedPhysicalId {
                            kind: "AWS::SQS::Queue",
                            physical_id: physical_id.to_string(),
                        });
                    }
                }
            }
        };
        Ok(arn)
    }

    /// Form of `arn` used to compare live and tagged resources.
    ///
    /// A role's physical id is its bare name while its real ARN carries the
    /// role path, so roles compare by name alone.
    pub fn identity(self, arn: &Arn) -> String {
        match self {
            Self::IamRole => format!(
                "arn:{}:iam::{}:role/{}",
                arn.partition,
                arn.account,
                arn.resource_name()
            ),
            _ => arn.to_string(),
        }
    }

    /// Identity of a raw ARN string, or the string itself when it is not a
    /// supported ARN.
    pub fn identity_of(raw: &str) -> String {
        raw.parse::<Arn>()
            .ok()
            .and_then(|arn| Self::from_arn(&arn).map(|kind| kind.identity(&arn)))
            .unwrap_or_else(|| raw.to_string())
    }

    /// Name the per-service delete APIs expect for this ARN.
    ///
    /// Queues are addressed by URL. Rules (`bus/name`), repositories with a
    /// namespace, and identity pools (`region:uuid`) keep the full resource id.
    pub fn delete_handle(self, arn: &Arn) -> String {
        match self {
            Self::SqsQueue => format!(
                "https://sqs.{}.amazonaws.com/{}/{}",
                arn.region, arn.account, arn.resource
            ),
            Self::EventBridgeRule
            | Self::EcrRepository
            | Self::DynamoDbTable
            | Self::CognitoIdentityPool => arn.resource_id().to_string(),
            _ => arn.resource_name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    const REGION: &str = "eu-west-1";
    const ACCOUNT: &str = "123456789012";

    #[test]
    fn physical_id_round_trips_through_kind_detection() {
        let samples = [
            (ResourceKind::IamRole, "app-role"),
            (ResourceKind::LambdaFunction, "api-handler"),
            (ResourceKind::CognitoIdentityPool, "eu-west-1:0f1e2d3c"),
            (ResourceKind::CognitoUserPool, "eu-west-1_AbCdEf"),
            (ResourceKind::S3Bucket, "assets-bucket"),
            (ResourceKind::DynamoDbTable, "orders"),
            (ResourceKind::CloudFrontDistribution, "E2QWRUHAPOMQZL"),
            (
                ResourceKind::SqsQueue,
                "https://sqs.eu-west-1.amazonaws.com/123456789012/jobs",
            ),
            (ResourceKind::EventBridgeRule, "custom-bus|nightly"),
            (ResourceKind::AthenaWorkGroup, "analysts"),
            (ResourceKind::EcrRepository, "app/web"),
        ];
        assert_eq!(samples.len(), ResourceKind::iter().count());

        for (kind, physical_id) in samples {
            let raw = kind
                .arn_from_physical_id(REGION, ACCOUNT, physical_id)
                .unwrap();
            let arn: Arn = raw.parse().unwrap();
            assert_eq!(ResourceKind::from_arn(&arn), Some(kind), "{raw}");
        }
    }

    #[test]
    fn arn_shaped_physical_ids_pass_through() {
        let arn = "arn:aws:events:eu-west-1:123456789012:rule/nightly";
        assert_eq!(
            ResourceKind::EventBridgeRule
                .arn_from_physical_id(REGION, ACCOUNT, arn)
                .unwrap(),
            arn
        );
    }

    #[test]
    fn global_kinds_omit_region() {
        let arn = ResourceKind::IamRole
            .arn_from_physical_id("cn-north-1", ACCOUNT, "app-role")
            .unwrap();
        assert_eq!(arn, "arn:aws-cn:iam::123456789012:role/app-role");
    }

    #[test]
    fn default_bus_rules_have_no_bus_segment() {
        let arn = ResourceKind::EventBridgeRule
            .arn_from_physical_id(REGION, ACCOUNT, "default|nightly")
            .unwrap();
        assert!(arn.ends_with(":rule/nightly"));
    }

    #[test]
    fn queue_without_url_is_rejected() {
        assert!(
            ResourceKind::SqsQueue
                .arn_from_physical_id(REGION, ACCOUNT, "jobs")
                .is_err()
        );
    }

    #[test]
    fn delete_handles() {
        let queue: Arn = "arn:aws:sqs:eu-west-1:123456789012:jobs".parse().unwrap();
        assert_eq!(
            ResourceKind::SqsQueue.delete_handle(&queue),
            "https://sqs.eu-west-1.amazonaws.com/123456789012/jobs"
        );

        let role: Arn = "arn:aws:iam::123456789012:role/service/app-role"
            .parse()
            .unwrap();
        assert_eq!(ResourceKind::IamRole.delete_handle(&role), "app-role");
    }

    #[test]
    fn role_identity_ignores_path() {
        let rebuilt = ResourceKind::IamRole
            .arn_from_physical_id(REGION, ACCOUNT, "app-role")
            .unwrap();
        let tagged = "arn:aws:iam::123456789012:role/service-role/app-role";
        assert_eq!(
            ResourceKind::identity_of(&rebuilt),
            ResourceKind::identity_of(tagged)
        );
        assert_ne!(
            ResourceKind::identity_of(tagged),
            ResourceKind::identity_of("arn:aws:iam::123456789012:role/service-role/other-role")
        );
    }

    #[test]
    fn identity_of_other_kinds_is_the_arn() {
        let table = "arn:aws:dynamodb:eu-west-1:123456789012:table/orders";
        assert_eq!(ResourceKind::identity_of(table), table);
        assert_eq!(ResourceKind::identity_of("not-an-arn"), "not-an-arn");
    }

    #[test]
    fn test_functions_before_roles() {
        assert!(
            ResourceKind::LambdaFunction.cleanup_priority()
                < ResourceKind::IamRole.cleanup_priority(),
            "Functions must be deleted before the roles they assume"
        );
    }

    #[test]
    fn test_table_streams_are_not_tables() {
        let arn: Arn = "arn:aws:dynamodb:eu-west-1:1:table/orders/stream/2024"
            .parse()
            .unwrap();
        assert_eq!(ResourceKind::from_arn(&arn), None);
    }
}
