//! Amazon Resource Name parsing

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArnError {
    #[error("'{0}' is not an ARN")]
    Malformed(String),

    #[error("cannot derive an ARN for {kind} from physical id '{physical_id}'")]
    UnsupportedPhysicalId { kind: &'static str, physical_id: String },
}

/// A parsed ARN: `arn:partition:service:region:account:resource`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Arn {
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account: String,
    pub resource: String,
}

impl Arn {
    /// Check whether a string has the shape of an ARN
    pub fn looks_like_arn(s: &str) -> bool {
        s.starts_with("arn:") && s.splitn(6, ':').count() == 6
    }

    /// Last path or colon segment of the resource part.
    ///
    /// `role/service/app-role` yields `app-role`, `function:api` yields `api`.
    pub fn resource_name(&self) -> &str {
        self.resource
            .rsplit(['/', ':'])
            .next()
            .unwrap_or(&self.resource)
    }

    /// Resource part with its type prefix removed.
    ///
    /// `rule/custom-bus/nightly` yields `custom-bus/nightly`.
    pub fn resource_id(&self) -> &str {
        match self.resource.find(['/', ':']) {
            Some(idx) => &self.resource[idx + 1..],
            None => &self.resource,
        }
    }
}

impl FromStr for Arn {
    type Err = ArnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(6, ':');
        let (
            Some("arn"),
            Some(partition),
            Some(service),
            Some(region),
            Some(account),
            Some(resource),
        ) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(ArnError::Malformed(s.to_string()));
        };

        if partition.is_empty() || service.is_empty() || resource.is_empty() {
            return Err(ArnError::Malformed(s.to_string()));
        }

        Ok(Self {
            partition: partition.to_string(),
            service: service.to_string(),
            region: region.to_string(),
            account: account.to_string(),
            resource: resource.to_string(),
        })
    }
}

impl fmt::Display for Arn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arn:{}:{}:{}:{}:{}",
            self.partition, self.service, self.region, self.account, self.resource
        )
    }
}

/// Map a region to its AWS partition
pub fn partition_for_region(region: &str) -> &'static str {
    if region.starts_with("cn-") {
        "aws-cn"
    } else if region.starts_with("us-gov-") {
        "aws-us-gov"
    } else {
        "aws"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let raw = "arn:aws:lambda:eu-west-1:123456789012:function:api";
        let arn: Arn = raw.parse().unwrap();
        assert_eq!(arn.service, "lambda");
        assert_eq!(arn.region, "eu-west-1");
        assert_eq!(arn.resource_name(), "api");
        assert_eq!(arn.to_string(), raw);
    }

    #[test]
    fn global_arn_has_empty_region() {
        let arn: Arn = "arn:aws:s3:::my-bucket".parse().unwrap();
        assert_eq!(arn.region, "");
        assert_eq!(arn.account, "");
        assert_eq!(arn.resource_name(), "my-bucket");
    }

    #[test]
    fn resource_id_keeps_nested_segments() {
        let arn: Arn = "arn:aws:events:us-east-1:1:rule/custom-bus/nightly"
            .parse()
            .unwrap();
        assert_eq!(arn.resource_id(), "custom-bus/nightly");
        assert_eq!(arn.resource_name(), "nightly");
    }

    #[test]
    fn rejects_non_arns() {
        assert!("my-bucket".parse::<Arn>().is_err());
        assert!("arn:aws:s3".parse::<Arn>().is_err());
        assert!(!Arn::looks_like_arn("https://sqs.us-east-1.amazonaws.com/1/q"));
    }

    #[test]
    fn partitions() {
        assert_eq!(partition_for_region("cn-north-1"), "aws-cn");
        assert_eq!(partition_for_region("us-gov-west-1"), "aws-us-gov");
        assert_eq!(partition_for_region("eu-central-1"), "aws");
    }
}
