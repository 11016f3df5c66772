//! Discovery, upload and rewrite of one stack's artifacts

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use stackherd_common::tags::merge_tags;
use tracing::{debug, info, instrument};

use super::PackagingError;
use super::file::{Archive, Destination, FileStatus, PackagedFile, PackagedLocation, S3Location};
use super::hashing;
use super::template::Template;
use crate::aws::ecr::registry_host;
use crate::aws::{AccountId, ImageRegistry, ObjectStore, TemplateSource};
use crate::stackfile::ResolvedStack;

/// Result of packaging one root template
#[derive(Debug)]
pub struct PackageOutcome {
    /// The root template as given
    pub template_path: PathBuf,
    /// Every packaged file, keyed by absolute path
    pub files: BTreeMap<PathBuf, PackagedFile>,
    /// Where the rewritten root template was uploaded. `None` when the root
    /// references nothing local and is deployed as-is.
    pub root: Option<PackagedLocation>,
}

impl PackageOutcome {
    /// Template source to hand to CloudFormation.
    pub async fn template_source(&self) -> Result<TemplateSource> {
        match &self.root {
            Some(PackagedLocation::S3(location)) => Ok(TemplateSource::Url(location.https_url())),
            _ => {
                let body = tokio::fs::read_to_string(&self.template_path)
                    .await
                    .with_context(|| format!("read {}", self.template_path.display()))?;
                Ok(TemplateSource::Body(body))
            }
        }
    }

    /// Rewritten root template body, or the original when nothing was packaged.
    pub async fn root_body(&self) -> Result<String> {
        let root = tokio::fs::canonicalize(&self.template_path)
            .await
            .with_context(|| format!("resolve {}", self.template_path.display()))?;
        let rendered = self.files.get(&root).and_then(|f| f.rendered.clone());
        match rendered {
            Some(body) => Ok(body),
            None => Ok(tokio::fs::read_to_string(&self.template_path).await?),
        }
    }
}

/// Discovered files plus, per template, how each raw reference resolved
#[derive(Debug, Default)]
struct Discovery {
    files: BTreeMap<PathBuf, PackagedFile>,
    links: HashMap<PathBuf, BTreeMap<String, PathBuf>>,
}

enum Step {
    Enter(PathBuf),
    Exit(PathBuf, Vec<PathBuf>),
}

/// Per-stack settings every upload of a run shares
struct UploadTarget<'a> {
    stack: &'a ResolvedStack,
    tags: BTreeMap<String, String>,
    workdir: &'a Path,
}

/// Uploads local artifacts to content-addressed locations
#[derive(Clone)]
pub struct PackagingEngine {
    objects: Arc<dyn ObjectStore>,
    images: Arc<dyn ImageRegistry>,
    account_id: AccountId,
    temp_root: PathBuf,
}

impl PackagingEngine {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        images: Arc<dyn ImageRegistry>,
        account_id: AccountId,
        temp_root: PathBuf,
    ) -> Self {
        Self {
            objects,
            images,
            account_id,
            temp_root,
        }
    }

    /// Package every local artifact `template_path` references, directly or
    /// through nested templates.
    #[instrument(skip_all, fields(stack = %stack.id, template = %template_path.display()))]
    pub async fn package_files(
        &self,
        template_path: &Path,
        stack: &ResolvedStack,
    ) -> Result<PackageOutcome> {
        let root = tokio::fs::canonicalize(template_path)
            .await
            .map_err(|_| PackagingError::MissingPath {
                path: template_path.to_path_buf(),
                template: template_path.to_path_buf(),
            })?;

        let Discovery { mut files, links } = discover(&root).await?;
        if files.is_empty() {
            debug!("Nothing to package");
            return Ok(PackageOutcome {
                template_path: template_path.to_path_buf(),
                files,
                root: None,
            });
        }
        check_targets(&files, stack)?;

        let workdir = tempfile::Builder::new()
            .prefix("stackherd-")
            .tempdir_in(&self.temp_root)
            .with_context(|| format!("create work dir in {}", self.temp_root.display()))?;
        let target = UploadTarget {
            stack,
            tags: stack.stack_tags(),
            workdir: workdir.path(),
        };

        let expected = files.len();
        let mut wave = 0;
        loop {
            let ready: Vec<PathBuf> = files
                .values()
                .filter(|f| f.status == FileStatus::Pending)
                .filter(|f| {
                    f.depends_on
                        .iter()
                        .all(|d| files.get(d).is_some_and(PackagedFile::is_uploaded))
                })
                .map(|f| f.path.clone())
                .collect();
            if ready.is_empty() {
                break;
            }
            wave += 1;
            debug!(wave, files = ready.len(), "Uploading wave");

            let mut jobs = Vec::with_capacity(ready.len());
            for path in &ready {
                let rendered = match links.get(path) {
                    Some(refs) if files[path].is_template => {
                        Some(render_template(path, refs, &files).await?)
                    }
                    _ => None,
                };
                if let Some(file) = files.get_mut(path) {
                    file.status = FileStatus::InProgress;
                    file.rendered = rendered.clone();
                }
                jobs.push(self.upload(files[path].clone(), rendered, &target));
            }

            for (path, result) in ready.iter().zip(join_all(jobs).await) {
                let (hash, location) = result?;
                if let Some(file) = files.get_mut(path) {
                    file.content_hash = Some(hash);
                    file.location = Some(location);
                    file.status = FileStatus::Uploaded;
                }
            }
        }

        let packaged = files.values().filter(|f| f.is_uploaded()).count();
        if packaged != expected {
            return Err(PackagingError::CountMismatch { expected, packaged }.into());
        }

        let root_location = files.get(&root).and_then(|f| f.location.clone());
        info!(files = packaged, "Packaged artifacts");
        Ok(PackageOutcome {
            template_path: template_path.to_path_buf(),
            files,
            root: root_location,
        })
    }

    async fn upload(
        &self,
        file: PackagedFile,
        rendered: Option<String>,
        target: &UploadTarget<'_>,
    ) -> Result<(String, PackagedLocation)> {
        match file.destination {
            Destination::ObjectStorage => self.upload_object(&file, rendered, target).await,
            Destination::ContainerRegistry => self.push_image(&file, target).await,
            Destination::Inline => inline_copy(&file, target.workdir).await,
        }
    }

    async fn upload_object(
        &self,
        file: &PackagedFile,
        rendered: Option<String>,
        target: &UploadTarget<'_>,
    ) -> Result<(String, PackagedLocation)> {
        let (hash, key, body) = match rendered {
            Some(body) => {
                let hash = hashing::sha256_hex(body.as_bytes());
                let key = format!("{hash}.{}", template_extension(&file.path, &body));
                let staged = target.workdir.join(&key);
                tokio::fs::write(&staged, body).await?;
                (hash, key, staged)
            }
            None => stage_object(file, target.workdir).await?,
        };

        let stack = target.stack;
        let region = stack.region();
        let bucket = stack
            .bucket
            .as_deref()
            .ok_or_else(|| PackagingError::MissingBucket {
                stack: stack.id.to_string(),
            })?;

        let exists =
            !stack.flags.force_upload && self.objects.head_object(region, bucket, &key).await?;
        if exists {
            debug!(path = %file.path.display(), bucket, key = %key, "Object already uploaded");
        } else {
            self.objects
                .put_object(region, bucket, &key, &body)
                .await
                .with_context(|| format!("upload {} to s3://{bucket}/{key}", file.path.display()))?;
            info!(path = %file.path.display(), bucket, key = %key, "Uploaded");
        }

        let existing = self.objects.get_object_tags(region, bucket, &key).await?;
        let merged = merge_tags(&existing, &target.tags);
        if merged != existing {
            self.objects
                .put_object_tags(region, bucket, &key, &merged)
                .await?;
        }

        Ok((
            hash,
            PackagedLocation::S3(S3Location {
                region: region.to_string(),
                bucket: bucket.to_string(),
                key,
            }),
        ))
    }

    async fn push_image(
        &self,
        file: &PackagedFile,
        target: &UploadTarget<'_>,
    ) -> Result<(String, PackagedLocation)> {
        let stack = target.stack;
        let region = stack.region();
        let repository = stack
            .repository
            .as_deref()
            .ok_or_else(|| PackagingError::MissingRepository {
                stack: stack.id.to_string(),
            })?;

        let (context, dockerfile) = if file.path.is_dir() {
            (file.path.clone(), "Dockerfile".to_string())
        } else {
            let parent = file.path.parent().unwrap_or(Path::new("/")).to_path_buf();
            let name = file
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "Dockerfile".to_string());
            (parent, name)
        };

        let hash = {
            let context = context.clone();
            let dockerfile = dockerfile.clone();
            tokio::task::spawn_blocking(move || hashing::image_context_hash(&context, &dockerfile))
                .await??
        };
        let tag = hashing::image_tag(&context, &hash);

        let digest = match self.images.find_image_digest(region, repository, &tag).await? {
            Some(digest) => {
                debug!(repository, tag = %tag, "Image already pushed");
                digest
            }
            None => {
                let digest = self
                    .images
                    .build_and_push(region, repository, &tag, &context, &dockerfile)
                    .await
                    .with_context(|| format!("build and push {}", context.display()))?;
                info!(repository, tag = %tag, digest = %digest, "Pushed image");
                digest
            }
        };

        let uri = format!(
            "{}/{repository}@{digest}",
            registry_host(&self.account_id, region)
        );
        Ok((hash, PackagedLocation::Image { uri }))
    }
}

/// Hash a file or directory and stage the bytes to upload.
async fn stage_object(file: &PackagedFile, workdir: &Path) -> Result<(String, String, PathBuf)> {
    let source = file.path.clone();
    let zip = source.is_dir() || (file.archive == Archive::Always && !hashing::is_archive(&source));
    let staged = workdir.join(format!("{}.zip", uuid::Uuid::new_v4().simple()));

    tokio::task::spawn_blocking(move || -> Result<(String, String, PathBuf)> {
        if zip {
            hashing::write_zip(&source, &staged)?;
            let hash = hashing::hash_file(&staged)?;
            Ok((hash.clone(), format!("{hash}.zip"), staged))
        } else {
            let hash = hashing::hash_file(&source)?;
            let key = match source.extension().and_then(|e| e.to_str()) {
                Some(ext) => format!("{hash}.{ext}"),
                None => hash.clone(),
            };
            Ok((hash, key, source))
        }
    })
    .await?
}

async fn inline_copy(file: &PackagedFile, workdir: &Path) -> Result<(String, PackagedLocation)> {
    let source = file.path.clone();
    let hash = tokio::task::spawn_blocking(move || hashing::hash_file(&source)).await??;
    let name = match file.path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{hash}.{ext}"),
        None => hash.clone(),
    };
    let copy = workdir.join(name);
    tokio::fs::copy(&file.path, &copy)
        .await
        .with_context(|| format!("copy {}", file.path.display()))?;
    let body = tokio::fs::read_to_string(&copy).await?;
    Ok((hash, PackagedLocation::Inline { path: copy, body }))
}

fn template_extension(path: &Path, body: &str) -> &'static str {
    super::template::TemplateFormat::detect(path, body).extension()
}

async fn render_template(
    path: &Path,
    refs: &BTreeMap<String, PathBuf>,
    files: &BTreeMap<PathBuf, PackagedFile>,
) -> Result<String, PackagingError> {
    let mut template = Template::load(path).await?;
    template.rewrite(|raw| {
        refs.get(raw)
            .and_then(|abs| files.get(abs))
            .and_then(|f| f.location.clone())
    })?;
    template.render()
}

fn check_targets(
    files: &BTreeMap<PathBuf, PackagedFile>,
    stack: &ResolvedStack,
) -> Result<(), PackagingError> {
    let needs = |d: Destination| files.values().any(|f| f.destination == d);
    if needs(Destination::ObjectStorage) && stack.bucket.is_none() {
        return Err(PackagingError::MissingBucket {
            stack: stack.id.to_string(),
        });
    }
    if needs(Destination::ContainerRegistry) && stack.repository.is_none() {
        return Err(PackagingError::MissingRepository {
            stack: stack.id.to_string(),
        });
    }
    Ok(())
}

/// Walk the template tree depth-first with an explicit worklist.
///
/// A nested template is fully discovered before the template referencing it
/// records its dependencies, so every template ends up depending on every
/// file beneath it.
async fn discover(root: &Path) -> Result<Discovery, PackagingError> {
    let mut discovery = Discovery::default();
    let mut closures: HashMap<PathBuf, Vec<PathBuf>> = HashMap::new();
    let mut open: HashSet<PathBuf> = HashSet::new();
    let mut work = vec![Step::Enter(root.to_path_buf())];

    while let Some(step) = work.pop() {
        match step {
            Step::Enter(template_path) => {
                if closures.contains_key(&template_path) {
                    continue;
                }
                open.insert(template_path.clone());
                let template = Template::load(&template_path).await?;
                let base = template_path.parent().unwrap_or(Path::new("/")).to_path_buf();

                let mut direct = Vec::new();
                let mut nested = Vec::new();
                let mut refs = BTreeMap::new();
                for reference in template.references() {
                    let path = tokio::fs::canonicalize(base.join(&reference.raw))
                        .await
                        .map_err(|_| PackagingError::MissingPath {
                            path: base.join(&reference.raw),
                            template: template_path.clone(),
                        })?;
                    let descriptor = reference.descriptor;
                    if descriptor.nested_template && open.contains(&path) {
                        return Err(PackagingError::TemplateCycle { path });
                    }
                    let single_file_only = descriptor.destination == Destination::Inline
                        || (descriptor.destination == Destination::ObjectStorage
                            && descriptor.archive == Archive::Never);
                    if single_file_only && path.is_dir() {
                        return Err(PackagingError::DirectoryNotAllowed { path });
                    }
                    register(
                        &mut discovery.files,
                        PackagedFile::new(
                            path.clone(),
                            &reference.resource_type,
                            descriptor.property,
                            descriptor.destination,
                            descriptor.archive,
                            descriptor.nested_template,
                        ),
                    )?;
                    if descriptor.nested_template && !nested.contains(&path) {
                        nested.push(path.clone());
                    }
                    if !direct.contains(&path) {
                        direct.push(path.clone());
                    }
                    refs.insert(reference.raw, path);
                }
                discovery.links.insert(template_path.clone(), refs);

                work.push(Step::Exit(template_path, direct));
                for child in nested.into_iter().rev() {
                    work.push(Step::Enter(child));
                }
            }
            Step::Exit(template_path, direct) => {
                let mut closure = Vec::new();
                for dep in &direct {
                    for transitive in closures.get(dep).into_iter().flatten() {
                        if !closure.contains(transitive) {
                            closure.push(transitive.clone());
                        }
                    }
                    if !closure.contains(dep) {
                        closure.push(dep.clone());
                    }
                }
                open.remove(&template_path);

                if template_path == root && !direct.is_empty() {
                    register(
                        &mut discovery.files,
                        PackagedFile::new(
                            template_path.clone(),
                            "",
                            "",
                            Destination::ObjectStorage,
                            Archive::Never,
                            true,
                        ),
                    )?;
                }
                if let Some(file) = discovery.files.get_mut(&template_path) {
                    file.depends_on = closure.clone();
                }
                closures.insert(template_path, closure);
            }
        }
    }
    Ok(discovery)
}

fn register(
    files: &mut BTreeMap<PathBuf, PackagedFile>,
    file: PackagedFile,
) -> Result<(), PackagingError> {
    match files.get(&file.path) {
        Some(existing)
            if existing.destination != file.destination
                || existing.archive != file.archive
                || existing.is_template != file.is_template =>
        {
            Err(PackagingError::ConflictingDestination { path: file.path })
        }
        Some(_) => Ok(()),
        None => {
            files.insert(file.path.clone(), file);
            Ok(())
        }
    }
}
