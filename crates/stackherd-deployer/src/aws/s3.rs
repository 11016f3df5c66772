//! S3-backed [`ObjectStore`]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier, Tag, Tagging};
use tracing::debug;

use super::api::{ObjectStore, ObjectVersion, VersionMarker, VersionPage};
use super::context::AwsContext;
use super::error::classify_anyhow_error;
use super::send;
use crate::throttle::RateLimiter;

/// S3 client for packaged artifacts and retained buckets
pub struct S3ObjectStore {
    ctx: AwsContext,
    limiter: Arc<RateLimiter>,
}

impl S3ObjectStore {
    pub fn new(ctx: AwsContext, limiter: Arc<RateLimiter>) -> Self {
        Self { ctx, limiter }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head_object(&self, region: &str, bucket: &str, key: &str) -> Result<bool> {
        let client = self.ctx.s3(region);
        let request = client.head_object().bucket(bucket).key(key);
        match send(&self.limiter, || request.send()).await {
            Ok(_) => Ok(true),
            Err(e) if classify_anyhow_error(&e).is_not_found() => Ok(false),
            Err(e) => Err(e.context(format!("Failed to check s3://{bucket}/{key}"))),
        }
    }

    async fn put_object(&self, region: &str, bucket: &str, key: &str, body: &Path) -> Result<()> {
        debug!(bucket = %bucket, key = %key, path = %body.display(), "Uploading file");

        let client = self.ctx.s3(region);
        let stream = ByteStream::from_path(body)
            .await
            .with_context(|| format!("Failed to read {}", body.display()))?;
        let request = client.put_object().bucket(bucket).key(key).body(stream);
        send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to upload s3://{bucket}/{key}"))?;
        Ok(())
    }

    async fn get_object(&self, region: &str, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let client = self.ctx.s3(region);
        let request = client.get_object().bucket(bucket).key(key);
        let output = send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to download s3://{bucket}/{key}"))?;
        let bytes = output
            .body
            .collect()
            .await
            .with_context(|| format!("Failed to read body of s3://{bucket}/{key}"))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn get_object_tags(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
    ) -> Result<BTreeMap<String, String>> {
        let client = self.ctx.s3(region);
        let request = client.get_object_tagging().bucket(bucket).key(key);
        let output = send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to read tags of s3://{bucket}/{key}"))?;
        Ok(output
            .tag_set()
            .iter()
            .map(|t| (t.key().to_string(), t.value().to_string()))
            .collect())
    }

    async fn put_object_tags(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let client = self.ctx.s3(region);
        let tag_set = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid object tag")?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .context("Invalid object tagging")?;
        let request = client
            .put_object_tagging()
            .bucket(bucket)
            .key(key)
            .tagging(tagging);
        send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to tag s3://{bucket}/{key}"))?;
        Ok(())
    }

    async fn list_keys(&self, region: &str, bucket: &str) -> Result<Vec<String>> {
        let client = self.ctx.s3(region);
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let request = client
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(continuation_token.take());
            let response = send(&self.limiter, || request.send())
                .await
                .with_context(|| format!("Failed to list objects in {bucket}"))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }
        Ok(keys)
    }

    async fn list_object_versions(
        &self,
        region: &str,
        bucket: &str,
        from: Option<VersionMarker>,
    ) -> Result<VersionPage> {
        let client = self.ctx.s3(region);
        let (key_marker, version_id_marker) = match from {
            Some(m) => (Some(m.key_marker), m.version_id_marker),
            None => (None, None),
        };
        let request = client
            .list_object_versions()
            .bucket(bucket)
            .set_key_marker(key_marker)
            .set_version_id_marker(version_id_marker);
        let response = send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to list object versions in {bucket}"))?;

        let versions = response
            .versions()
            .iter()
            .filter_map(|v| {
                Some(ObjectVersion {
                    key: v.key()?.to_string(),
                    version_id: v.version_id().map(str::to_string),
                })
            })
            .chain(response.delete_markers().iter().filter_map(|m| {
                Some(ObjectVersion {
                    key: m.key()?.to_string(),
                    version_id: m.version_id().map(str::to_string),
                })
            }))
            .collect();

        let next = match (response.is_truncated(), response.next_key_marker()) {
            (Some(true), Some(key)) => Some(VersionMarker {
                key_marker: key.to_string(),
                version_id_marker: response.next_version_id_marker().map(str::to_string),
            }),
            _ => None,
        };

        Ok(VersionPage { versions, next })
    }

    async fn delete_objects(
        &self,
        region: &str,
        bucket: &str,
        objects: &[ObjectVersion],
    ) -> Result<Vec<String>> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }

        let client = self.ctx.s3(region);
        let identifiers = objects
            .iter()
            .map(|o| {
                ObjectIdentifier::builder()
                    .key(&o.key)
                    .set_version_id(o.version_id.clone())
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid object identifier")?;
        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(true)
            .build()
            .context("Invalid delete request")?;
        let request = client.delete_objects().bucket(bucket).delete(delete);
        let output = send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to delete objects in {bucket}"))?;

        Ok(output
            .errors()
            .iter()
            .filter_map(|e| e.key().map(str::to_string))
            .collect())
    }

    async fn delete_bucket(&self, region: &str, bucket: &str) -> Result<()> {
        let client = self.ctx.s3(region);
        let request = client.delete_bucket().bucket(bucket);
        send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to delete bucket {bucket}"))?;
        Ok(())
    }
}
