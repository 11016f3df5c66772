//! Stack definitions
//!
//! A [`StackConfig`] is what the user wrote: some of its values may refer to
//! outputs of other stacks that do not exist yet. Once those stacks are
//! deployed, [`StackConfig::resolve`] turns it into an immutable
//! [`ResolvedStack`], which is the only form the engine operates on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stackherd_common::tags::TAG_ROOT_STACK_NAME;
use thiserror::Error;

use crate::config::EngineConfig;

#[derive(Debug, Error)]
pub enum StackFileError {
    #[error("{stack} has no output '{output}' (referenced by {referrer})")]
    MissingOutput {
        referrer: StackRef,
        stack: StackRef,
        output: String,
    },

    #[error("invalid value for {field} of {stack}: {message}")]
    InvalidValue {
        stack: StackRef,
        field: String,
        message: String,
    },

    #[error("failed to read stack file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse stack file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Identity of a stack: region plus name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackRef {
    pub region: String,
    pub name: String,
}

impl StackRef {
    pub fn new(region: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.name)
    }
}

/// Outputs of already-deployed stacks, keyed by stack
pub type DependencyOutputs = BTreeMap<StackRef, BTreeMap<String, String>>;

/// Resolver for values only a program can compute
pub type ComputeFn<T> = Arc<dyn Fn(&DependencyOutputs) -> Result<T, String> + Send + Sync>;

/// A configuration value that may depend on other stacks' outputs
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum Resolvable<T> {
    Literal(T),
    /// `{"stack": "...", "output": "...", "region": "..."}`; region defaults
    /// to the referencing stack's region
    Output {
        #[serde(default)]
        region: Option<String>,
        stack: String,
        output: String,
    },
    #[serde(skip)]
    Computed(ComputeFn<T>),
}

impl<T: fmt::Debug> fmt::Debug for Resolvable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            Self::Output {
                region,
                stack,
                output,
            } => f
                .debug_struct("Output")
                .field("region", region)
                .field("stack", stack)
                .field("output", output)
                .finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl<T> Resolvable<T> {
    /// Stack this value reads an output from, if any.
    pub fn output_ref(&self, default_region: &str) -> Option<StackRef> {
        match self {
            Self::Output { region, stack, .. } => Some(StackRef::new(
                region.as_deref().unwrap_or(default_region),
                stack.as_str(),
            )),
            _ => None,
        }
    }
}

impl<T> Resolvable<T>
where
    T: Clone + FromStr,
    T::Err: fmt::Display,
{
    fn resolve(
        &self,
        owner: &StackRef,
        field: &str,
        outputs: &DependencyOutputs,
    ) -> Result<T, StackFileError> {
        let invalid = |message: String| StackFileError::InvalidValue {
            stack: owner.clone(),
            field: field.to_string(),
            message,
        };

        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Output { output, .. } => {
                let source = self
                    .output_ref(&owner.region)
                    .ok_or_else(|| invalid("not an output reference".to_string()))?;
                let value = outputs
                    .get(&source)
                    .and_then(|o| o.get(output))
                    .ok_or_else(|| StackFileError::MissingOutput {
                        referrer: owner.clone(),
                        stack: source.clone(),
                        output: output.clone(),
                    })?;
                value.parse().map_err(|e: T::Err| invalid(e.to_string()))
            }
            Self::Computed(f) => f(outputs).map_err(invalid),
        }
    }
}

impl<T> From<T> for Resolvable<T> {
    fn from(value: T) -> Self {
        Self::Literal(value)
    }
}

/// Per-stack behaviour switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackFlags {
    /// Delete retained resources without asking
    pub force_delete: bool,
    /// Upload artifacts even when their content key already exists
    pub force_upload: bool,
    /// Keep unreferenced artifacts after delete
    pub skip_prune: bool,
    /// Leave retained resources alone after delete
    pub skip_retained_cleanup: bool,
}

/// A stack as written in the stack file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackConfig {
    pub region: String,
    pub name: String,
    /// Local template path or remote template URL
    pub template: String,
    #[serde(default)]
    pub depends_on: Vec<StackRef>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Resolvable<String>>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Bucket receiving packaged artifacts
    #[serde(default)]
    pub bucket: Option<Resolvable<String>>,
    /// ECR repository receiving packaged images
    #[serde(default)]
    pub repository: Option<Resolvable<String>>,
    #[serde(default)]
    pub flags: StackFlags,
    /// Capabilities granted in addition to the IAM ones
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Where `sync` writes this stack's outputs as JSON
    #[serde(default)]
    pub outputs_file: Option<PathBuf>,
    /// When emptying a retained bucket, only delete objects carrying all of
    /// these tags. A bucket with objects left over is kept.
    #[serde(default)]
    pub bucket_cleanup_tags: BTreeMap<String, String>,
}

impl StackConfig {
    pub fn id(&self) -> StackRef {
        StackRef::new(&self.region, &self.name)
    }

    /// Every stack whose outputs this config reads.
    pub fn output_refs(&self) -> BTreeSet<StackRef> {
        self.parameters
            .values()
            .chain(self.bucket.iter())
            .chain(self.repository.iter())
            .filter_map(|v| v.output_ref(&self.region))
            .collect()
    }

    /// Evaluate every deferred value against `outputs`.
    pub fn resolve(&self, outputs: &DependencyOutputs) -> Result<ResolvedStack, StackFileError> {
        let id = self.id();
        let parameters = self
            .parameters
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.resolve(&id, k, outputs)?)))
            .collect::<Result<BTreeMap<_, _>, StackFileError>>()?;
        let bucket = self
            .bucket
            .as_ref()
            .map(|b| b.resolve(&id, "bucket", outputs))
            .transpose()?;
        let repository = self
            .repository
            .as_ref()
            .map(|r| r.resolve(&id, "repository", outputs))
            .transpose()?;

        Ok(ResolvedStack {
            id,
            template: TemplateLocation::parse(&self.template),
            depends_on: self.depends_on.clone(),
            parameters,
            tags: self.tags.clone(),
            bucket,
            repository,
            flags: self.flags,
            capabilities: self.capabilities.clone(),
            outputs_file: self.outputs_file.clone(),
            bucket_cleanup_tags: self.bucket_cleanup_tags.clone(),
        })
    }
}

/// Where a stack's template lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateLocation {
    Path(PathBuf),
    Url(String),
}

impl TemplateLocation {
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("https://") || raw.starts_with("http://") || raw.starts_with("s3://") {
            Self::Url(raw.to_string())
        } else {
            Self::Path(PathBuf::from(raw))
        }
    }
}

/// A stack with every value known, ready to deploy
#[derive(Debug, Clone)]
pub struct ResolvedStack {
    pub id: StackRef,
    pub template: TemplateLocation,
    pub depends_on: Vec<StackRef>,
    pub parameters: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub bucket: Option<String>,
    pub repository: Option<String>,
    pub flags: StackFlags,
    pub capabilities: Vec<String>,
    pub outputs_file: Option<PathBuf>,
    pub bucket_cleanup_tags: BTreeMap<String, String>,
}

impl ResolvedStack {
    pub fn region(&self) -> &str {
        &self.id.region
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// User tags plus the root tag every owned resource is discovered by.
    pub fn stack_tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.tags.clone();
        tags.insert(TAG_ROOT_STACK_NAME.to_string(), self.id.name.clone());
        tags
    }
}

/// Contents of a stack file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFile {
    #[serde(default)]
    pub engine: EngineConfig,
    pub stacks: Vec<StackConfig>,
}

impl StackFile {
    /// Load a stack file. Relative paths inside it are relative to the file.
    pub fn load(path: &Path) -> Result<Self, StackFileError> {
        let raw = std::fs::read_to_string(path).map_err(|source| StackFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut file: StackFile =
            serde_json::from_str(&raw).map_err(|source| StackFileError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for stack in &mut file.stacks {
            if let TemplateLocation::Path(p) = TemplateLocation::parse(&stack.template) {
                if p.is_relative() {
                    stack.template = base.join(p).display().to_string();
                }
            }
            if let Some(out) = stack.outputs_file.as_mut() {
                if out.is_relative() {
                    *out = base.join(&*out);
                }
            }
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs() -> DependencyOutputs {
        let mut outputs = DependencyOutputs::new();
        outputs.insert(
            StackRef::new("eu-west-1", "network"),
            BTreeMap::from([("VpcId".to_string(), "vpc-123".to_string())]),
        );
        outputs
    }

    #[test]
    fn test_parse_stack_config() {
        let config: StackConfig = serde_json::from_str(
            r#"{
                "region": "eu-west-1",
                "name": "app",
                "template": "app.yaml",
                "dependsOn": [{"region": "eu-west-1", "name": "network"}],
                "parameters": {
                    "Env": "prod",
                    "Vpc": {"stack": "network", "output": "VpcId"}
                },
                "bucket": "artifacts",
                "flags": {"forceDelete": true},
                "bucketCleanupTags": {"purpose": "build"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.id().to_string(), "eu-west-1/app");
        assert!(config.flags.force_delete);
        assert!(!config.flags.skip_prune);
        assert_eq!(config.bucket_cleanup_tags["purpose"], "build");
        assert!(matches!(config.parameters["Env"], Resolvable::Literal(_)));
        assert!(matches!(config.parameters["Vpc"], Resolvable::Output { .. }));
        assert_eq!(
            config.output_refs().into_iter().collect::<Vec<_>>(),
            vec![StackRef::new("eu-west-1", "network")]
        );
    }

    #[test]
    fn test_resolve_outputs() {
        let config: StackConfig = serde_json::from_str(
            r#"{
                "region": "eu-west-1",
                "name": "app",
                "template": "https://example.com/app.yaml",
                "parameters": {"Vpc": {"stack": "network", "output": "VpcId"}}
            }"#,
        )
        .unwrap();

        let resolved = config.resolve(&outputs()).unwrap();
        assert_eq!(resolved.parameters["Vpc"], "vpc-123");
        assert_eq!(
            resolved.template,
            TemplateLocation::Url("https://example.com/app.yaml".to_string())
        );
        assert_eq!(resolved.stack_tags()[TAG_ROOT_STACK_NAME], "app");
    }

    #[test]
    fn test_missing_output_is_error() {
        let mut config: StackConfig = serde_json::from_str(
            r#"{"region": "eu-west-1", "name": "app", "template": "t.json"}"#,
        )
        .unwrap();
        config.bucket = Some(Resolvable::Output {
            region: Some("us-east-1".to_string()),
            stack: "network".to_string(),
            output: "Bucket".to_string(),
        });

        let err = config.resolve(&outputs()).unwrap_err();
        assert!(matches!(err, StackFileError::MissingOutput { .. }));
    }

    #[test]
    fn test_computed_value() {
        let mut config: StackConfig = serde_json::from_str(
            r#"{"region": "eu-west-1", "name": "app", "template": "t.json"}"#,
        )
        .unwrap();
        config.parameters.insert(
            "Subnet".to_string(),
            Resolvable::Computed(Arc::new(|outputs| {
                outputs
                    .values()
                    .find_map(|o| o.get("VpcId"))
                    .map(|vpc| format!("{vpc}-a"))
                    .ok_or_else(|| "no vpc".to_string())
            })),
        );

        let resolved = config.resolve(&outputs()).unwrap();
        assert_eq!(resolved.parameters["Subnet"], "vpc-123-a");
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stacks.json");
        std::fs::write(
            &file,
            r#"{
                "engine": {"rateLimit": 2},
                "stacks": [{
                    "region": "eu-west-1",
                    "name": "app",
                    "template": "templates/app.yaml",
                    "outputsFile": "out/app.json"
                }]
            }"#,
        )
        .unwrap();

        let loaded = StackFile::load(&file).unwrap();
        assert_eq!(loaded.engine.rate_limit, 2);
        assert_eq!(
            loaded.stacks[0].template,
            dir.path().join("templates/app.yaml").display().to_string()
        );
        assert_eq!(
            loaded.stacks[0].outputs_file,
            Some(dir.path().join("out/app.json"))
        );
    }
}
