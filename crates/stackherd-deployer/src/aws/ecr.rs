//! ECR-backed [`ImageRegistry`]
//!
//! Images are built by the local Docker daemon through bollard and pushed
//! with short-lived ECR credentials.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use aws_sdk_ecr::types::ImageIdentifier;
use base64::Engine;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::image::BuildImageOptions;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::StreamExt;
use http_body_util::{Either, Full};
use tracing::{debug, info};

use super::api::ImageRegistry;
use super::context::AwsContext;
use super::error::classify_anyhow_error;
use super::send;
use crate::throttle::RateLimiter;

/// Registry host of the caller's private ECR registry in `region`.
pub fn registry_host(account: &str, region: &str) -> String {
    let suffix = if region.starts_with("cn-") {
        "amazonaws.com.cn"
    } else {
        "amazonaws.com"
    };
    format!("{account}.dkr.ecr.{region}.{suffix}")
}

/// Pull the content digest out of a push status line.
///
/// The daemon reports `<tag>: digest: sha256:<hex> size: <n>` once the
/// manifest is uploaded.
fn digest_from_status(status: &str) -> Option<String> {
    let rest = status.split("digest: ").nth(1)?;
    let digest = rest.split_whitespace().next()?;
    digest.starts_with("sha256:").then(|| digest.to_string())
}

/// Tar and gzip a build context directory.
fn build_context_archive(context: &Path) -> Result<Vec<u8>> {
    let mut archive = Vec::new();
    {
        let encoder = GzEncoder::new(&mut archive, Compression::default());
        let mut tar = tar::Builder::new(encoder);
        tar.append_dir_all(".", context)
            .with_context(|| format!("Failed to archive {}", context.display()))?;
        tar.into_inner()
            .and_then(|encoder| encoder.finish())
            .context("Failed to finish build context archive")?;
    }
    debug!(context = %context.display(), bytes = archive.len(), "Build context created");
    Ok(archive)
}

/// ECR registry plus the local Docker daemon
pub struct EcrImageRegistry {
    ctx: AwsContext,
    limiter: Arc<RateLimiter>,
    docker: Docker,
}

impl EcrImageRegistry {
    pub fn new(ctx: AwsContext, limiter: Arc<RateLimiter>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self {
            ctx,
            limiter,
            docker,
        })
    }

    /// Registry id of the caller's private registry.
    async fn registry_id(&self, region: &str) -> Result<String> {
        let client = self.ctx.ecr(region);
        let request = client.describe_registry();
        let output = send(&self.limiter, || request.send())
            .await
            .context("Failed to describe ECR registry")?;
        output
            .registry_id()
            .map(str::to_string)
            .context("ECR returned no registry id")
    }

    /// Exchange an ECR authorization token for Docker push credentials.
    async fn push_credentials(&self, region: &str) -> Result<DockerCredentials> {
        let client = self.ctx.ecr(region);
        let request = client.get_authorization_token();
        let output = send(&self.limiter, || request.send())
            .await
            .context("Failed to get ECR authorization token")?;

        let data = output
            .authorization_data()
            .first()
            .context("ECR returned no authorization data")?;
        let token = data
            .authorization_token()
            .context("ECR returned an empty authorization token")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token)
            .context("ECR authorization token is not base64")?;
        let decoded = String::from_utf8(decoded).context("ECR authorization token is not UTF-8")?;
        let (username, password) = decoded
            .split_once(':')
            .context("ECR authorization token is not user:password")?;

        Ok(DockerCredentials {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            serveraddress: data.proxy_endpoint().map(str::to_string),
            ..Default::default()
        })
    }

    async fn build(&self, image: &str, context: &Path, dockerfile: &str) -> Result<()> {
        let context_dir = context.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || build_context_archive(&context_dir))
            .await
            .context("Build context task panicked")??;

        #[allow(deprecated)]
        let options = BuildImageOptions {
            dockerfile,
            t: image,
            rm: true,
            forcerm: true,
            pull: true,
            ..Default::default()
        };

        #[allow(deprecated)]
        let mut stream =
            self.docker
                .build_image(options, None, Some(Either::Left(Full::new(Bytes::from(archive)))));

        while let Some(msg) = stream.next().await {
            let output = msg.with_context(|| format!("Docker build of {image} failed"))?;
            if let Some(line) = output.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(image = %image, "{line}");
                }
            }
            if let Some(error) = output.error {
                bail!("Docker build of {image} failed: {error}");
            }
            if let Some(detail) = output.error_detail {
                bail!(
                    "Docker build of {image} failed: {}",
                    detail.message.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }
        Ok(())
    }

    /// Push `image:tag` and return the digest reported by the daemon, if any.
    async fn push(&self, region: &str, image: &str, tag: &str) -> Result<Option<String>> {
        let credentials = self.push_credentials(region).await?;

        #[allow(deprecated)]
        let options = bollard::image::PushImageOptions::<String> {
            tag: tag.to_string(),
        };

        #[allow(deprecated)]
        let mut stream = self
            .docker
            .push_image(image, Some(options), Some(credentials));

        let mut digest = None;
        while let Some(msg) = stream.next().await {
            let info = msg.with_context(|| format!("Failed to push {image}:{tag}"))?;
            if let Some(error) = info.error {
                bail!("Failed to push {image}:{tag}: {error}");
            }
            if let Some(found) = info.status.as_deref().and_then(digest_from_status) {
                digest = Some(found);
            }
        }
        Ok(digest)
    }
}

#[async_trait]
impl ImageRegistry for EcrImageRegistry {
    async fn find_image_digest(
        &self,
        region: &str,
        repository: &str,
        tag: &str,
    ) -> Result<Option<String>> {
        let client = self.ctx.ecr(region);
        let request = client
            .describe_images()
            .repository_name(repository)
            .image_ids(ImageIdentifier::builder().image_tag(tag).build());
        match send(&self.limiter, || request.send()).await {
            Ok(output) => Ok(output
                .image_details()
                .first()
                .and_then(|d| d.image_digest())
                .map(str::to_string)),
            Err(e) if classify_anyhow_error(&e).is_not_found() => Ok(None),
            Err(e) => Err(e.context(format!("Failed to describe {repository}:{tag}"))),
        }
    }

    async fn build_and_push(
        &self,
        region: &str,
        repository: &str,
        tag: &str,
        context: &Path,
        dockerfile: &str,
    ) -> Result<String> {
        let account = self.registry_id(region).await?;
        let image = format!("{}/{repository}", registry_host(&account, region));
        let tagged = format!("{image}:{tag}");

        info!(image = %tagged, context = %context.display(), "Building image");
        self.build(&tagged, context, dockerfile).await?;

        info!(image = %tagged, "Pushing image");
        if let Some(digest) = self.push(region, &image, tag).await? {
            return Ok(digest);
        }

        // Older daemons omit the digest line; ask the registry instead
        self.find_image_digest(region, repository, tag)
            .await?
            .with_context(|| format!("Pushed {tagged} but the registry has no digest for it"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_from_status() {
        assert_eq!(
            digest_from_status("abc123: digest: sha256:deadbeef size: 1234"),
            Some("sha256:deadbeef".to_string())
        );
        assert_eq!(digest_from_status("Pushed"), None);
        assert_eq!(digest_from_status("digest: md5:xyz size: 1"), None);
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(
            registry_host("123456789012", "eu-west-1"),
            "123456789012.dkr.ecr.eu-west-1.amazonaws.com"
        );
        assert_eq!(
            registry_host("123456789012", "cn-north-1"),
            "123456789012.dkr.ecr.cn-north-1.amazonaws.com.cn"
        );
    }

    #[test]
    fn test_build_context_archive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::write(dir.path().join("app.txt"), "hello").unwrap();

        let archive = build_context_archive(dir.path()).unwrap();
        let decoder = flate2::read::GzDecoder::new(&archive[..]);
        let mut tar = tar::Archive::new(decoder);
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("Dockerfile")));
        assert!(names.iter().any(|n| n.ends_with("app.txt")));
    }
}
