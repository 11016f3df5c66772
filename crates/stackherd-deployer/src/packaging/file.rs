//! Files tracked by one packaging run

use std::path::PathBuf;

/// Where a packaged file ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Destination {
    ObjectStorage,
    ContainerRegistry,
    Inline,
}

/// Whether a path is zipped before upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Archive {
    /// Upload as-is; directories are rejected
    Never,
    /// Zip directories and single files alike, except existing archives
    Always,
    /// Zip directories, upload single files as-is
    DirectoriesOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    InProgress,
    Uploaded,
}

/// An S3 object location
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct S3Location {
    pub region: String,
    pub bucket: String,
    pub key: String,
}

impl S3Location {
    /// Virtual-hosted-style URL, the form CloudFormation accepts for templates
    pub fn https_url(&self) -> String {
        let suffix = if self.region.starts_with("cn-") {
            "amazonaws.com.cn"
        } else {
            "amazonaws.com"
        };
        format!(
            "https://{}.s3.{}.{}/{}",
            self.bucket, self.region, suffix, self.key
        )
    }

    pub fn s3_url(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

/// Where a file was packaged to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackagedLocation {
    S3(S3Location),
    /// Image reference pinned by digest: `registry/repo@sha256:...`
    Image { uri: String },
    /// Content-addressed local copy, inlined into the template
    Inline { path: PathBuf, body: String },
}

/// A local path referenced by a template, and its packaging state
#[derive(Debug, Clone)]
pub struct PackagedFile {
    /// Absolute path, the file's identity within a run
    pub path: PathBuf,
    /// Resource type that referenced the path first
    pub resource_type: String,
    /// Property that referenced the path first
    pub property: String,
    pub destination: Destination,
    pub archive: Archive,
    /// A template whose own references get rewritten before upload
    pub is_template: bool,
    /// Every file that must be packaged before this one
    pub depends_on: Vec<PathBuf>,
    pub status: FileStatus,
    pub location: Option<PackagedLocation>,
    pub content_hash: Option<String>,
    /// Rewritten body, for templates
    pub rendered: Option<String>,
}

impl PackagedFile {
    pub fn new(
        path: PathBuf,
        resource_type: &str,
        property: &str,
        destination: Destination,
        archive: Archive,
        is_template: bool,
    ) -> Self {
        Self {
            path,
            resource_type: resource_type.to_string(),
            property: property.to_string(),
            destination,
            archive,
            is_template,
            depends_on: Vec::new(),
            status: FileStatus::Pending,
            location: None,
            content_hash: None,
            rendered: None,
        }
    }

    pub fn is_uploaded(&self) -> bool {
        self.status == FileStatus::Uploaded && self.location.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_https_url() {
        let loc = S3Location {
            region: "eu-west-1".to_string(),
            bucket: "artifacts".to_string(),
            key: "abc.yaml".to_string(),
        };
        assert_eq!(
            loc.https_url(),
            "https://artifacts.s3.eu-west-1.amazonaws.com/abc.yaml"
        );
        assert_eq!(loc.s3_url(), "s3://artifacts/abc.yaml");

        let cn = S3Location {
            region: "cn-north-1".to_string(),
            ..loc
        };
        assert_eq!(
            cn.https_url(),
            "https://artifacts.s3.cn-north-1.amazonaws.com.cn/abc.yaml"
        );
    }
}
