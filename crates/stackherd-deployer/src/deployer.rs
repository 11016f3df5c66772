//! The operations a stack file supports
//!
//! [`Deployer`] wires the engine components to one collaborator set and
//! exposes `deploy`, `del`, `cleanup`, `pkg`, `sync` and `status` over a list
//! of stack configs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::aws::api::Services;
use crate::aws::{AwsContext, TemplateSource, aws_services};
use crate::changeset::ChangeSetManager;
use crate::config::EngineConfig;
use crate::packaging::descriptors::parse_s3_url;
use crate::packaging::{PackagedLocation, PackagingEngine, S3Location};
use crate::poller::{PollOutcome, StatusPoller, WaitGoal};
use crate::reclaim::{PackagedFileReclaimer, PruneReport, ReclaimReport, RetainedResourceReclaimer};
use crate::scheduler::{GraphMode, GraphReport, run_graph};
use crate::stackfile::{DependencyOutputs, ResolvedStack, StackConfig, StackRef, TemplateLocation};
use crate::throttle::RateLimiter;

/// Output key/value pairs of one stack
pub type Outputs = BTreeMap<String, String>;

/// Status reported for a stack that does not exist
pub const NOT_DEPLOYED: &str = "NOT_DEPLOYED";

const NESTED_STACK_TYPE: &str = "AWS::CloudFormation::Stack";

/// A packaged root template
#[derive(Debug, Clone)]
pub struct PackagedTemplate {
    pub stack: StackRef,
    /// Uploaded template URL; `None` when nothing needed packaging
    pub url: Option<String>,
    /// Rewritten template body
    pub body: String,
}

/// Both garbage collectors' results
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub retained: ReclaimReport,
    pub pruned: PruneReport,
}

impl CleanupReport {
    pub fn is_success(&self) -> bool {
        !self.retained.has_failures() && self.pruned.failed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct DeleteReport {
    pub graph: GraphReport,
    pub cleanup: CleanupReport,
}

impl DeleteReport {
    pub fn is_success(&self) -> bool {
        self.graph.is_success() && self.cleanup.is_success()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Multi-stack deploy, delete and cleanup
pub struct Deployer {
    services: Services,
    limiter: Option<Arc<RateLimiter>>,
    poller: StatusPoller,
    changesets: ChangeSetManager,
    packaging: PackagingEngine,
    retained: RetainedResourceReclaimer,
    packaged: PackagedFileReclaimer,
}

impl Deployer {
    pub fn new(services: Services, config: &EngineConfig) -> Self {
        let poller = StatusPoller::new(services.stacks.clone(), config.poll_interval);
        Self {
            changesets: ChangeSetManager::new(
                services.stacks.clone(),
                poller.clone(),
                config.change_set_attempts,
            ),
            packaging: PackagingEngine::new(
                services.objects.clone(),
                services.images.clone(),
                services.account_id.clone(),
                config.temp_dir(),
            ),
            retained: RetainedResourceReclaimer::new(services.clone(), config.delete_batch_size),
            packaged: PackagedFileReclaimer::new(
                services.stacks.clone(),
                services.objects.clone(),
                config.delete_batch_size,
            ),
            poller,
            services,
            limiter: None,
        }
    }

    /// Build a deployer backed by AWS, with every call sharing one limiter.
    pub async fn connect(config: &EngineConfig, region: &str) -> Result<Self> {
        let ctx =
            AwsContext::with_profile(region, config.profile.as_deref(), config.credentials_timeout)
                .await;
        let limiter = Arc::new(RateLimiter::new(config.rate_limit, config.rate_interval()));
        let services = aws_services(&ctx, limiter.clone()).await?;
        let mut deployer = Self::new(services, config);
        deployer.limiter = Some(limiter);
        Ok(deployer)
    }

    /// The shared limiter, when backed by AWS
    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Deploy every stack in dependency order.
    pub async fn deploy(&self, stacks: &[StackConfig]) -> Result<GraphReport> {
        let configs: BTreeMap<StackRef, &StackConfig> =
            stacks.iter().map(|s| (s.id(), s)).collect();
        let in_set: BTreeSet<StackRef> = configs.keys().cloned().collect();
        let external: BTreeSet<StackRef> = stacks
            .iter()
            .flat_map(StackConfig::output_refs)
            .filter(|r| !in_set.contains(r))
            .collect();
        let outputs = Mutex::new(self.fetch_outputs(&external).await?);

        let report = run_graph(stacks, GraphMode::Deploy, |id| {
            let config = configs.get(&id).copied();
            let outputs = &outputs;
            async move {
                let config = config.with_context(|| format!("unknown stack {id}"))?;
                let resolved = {
                    let snapshot = lock(outputs);
                    config.resolve(&snapshot)?
                };
                let produced = self.deploy_stack(&resolved).await?;
                lock(outputs).insert(id, produced);
                Ok(())
            }
        })
        .await?;
        Ok(report)
    }

    /// Package, change and wait for one resolved stack. Returns its outputs.
    #[instrument(skip_all, fields(stack = %stack.id))]
    pub async fn deploy_stack(&self, stack: &ResolvedStack) -> Result<Outputs> {
        let started = Utc::now();
        let region = stack.region();

        let template = match &stack.template {
            TemplateLocation::Path(path) => {
                let outcome = self.packaging.package_files(path, stack).await?;
                outcome.template_source().await?
            }
            TemplateLocation::Url(url) => TemplateSource::Url(https_template_url(region, url)),
        };
        self.services
            .stacks
            .validate_template(region, &template)
            .await
            .with_context(|| format!("Template of {} is invalid", stack.id))?;

        let change_set = self.changesets.create_change_set(stack, &template).await?;
        if change_set.has_changes {
            if let PollOutcome::Failed(reason) = self
                .changesets
                .execute_change_set(stack, &change_set.arn)
                .await?
            {
                let events = self.failure_report(region, stack.name(), started).await;
                bail!("Deploying {} failed: {reason}{events}", stack.id);
            }
        }

        let outputs = self.stack_outputs(stack).await?;
        if let Some(path) = &stack.outputs_file {
            write_outputs(path, &outputs).await?;
        }
        Ok(outputs)
    }

    /// Delete every stack, dependents first, then collect what they left.
    pub async fn del(&self, stacks: &[StackConfig]) -> Result<DeleteReport> {
        let resolved = self.resolve_live(stacks).await?;

        let graph = run_graph(stacks, GraphMode::Delete, |id| self.delete_stack(id)).await?;

        let deleted: Vec<ResolvedStack> = graph
            .succeeded
            .iter()
            .filter_map(|id| resolved.get(id).cloned().flatten())
            .collect();
        let cleanup = self.collect(&deleted).await?;
        Ok(DeleteReport { graph, cleanup })
    }

    #[instrument(skip(self), fields(stack = %id))]
    async fn delete_stack(&self, id: StackRef) -> Result<()> {
        let stacks = &self.services.stacks;
        let Some(existing) = stacks.describe_stack(&id.region, &id.name).await? else {
            info!("Stack does not exist");
            return Ok(());
        };
        stacks.delete_stack(&id.region, &existing.stack_id).await?;
        info!("Stack deleting");
        match self
            .poller
            .wait_for_status(&id.region, &existing.stack_id, WaitGoal::StackDeleted)
            .await?
        {
            PollOutcome::Reached => {
                info!("Stack deleted");
                Ok(())
            }
            PollOutcome::Failed(reason) => bail!("Deleting {id} failed: {reason}"),
        }
    }

    /// Reclaim retained resources and prune packaged files without deleting
    /// any stack.
    pub async fn cleanup(&self, stacks: &[StackConfig]) -> Result<CleanupReport> {
        let resolved: Vec<ResolvedStack> = self
            .resolve_live(stacks)
            .await?
            .into_values()
            .flatten()
            .collect();
        self.collect(&resolved).await
    }

    async fn collect(&self, stacks: &[ResolvedStack]) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for result in join_all(stacks.iter().map(|s| self.retained.reclaim(s))).await {
            report.retained.extend(result?);
        }
        report.pruned = self.packaged.prune(stacks).await?;
        Ok(report)
    }

    /// Package every stack's template without deploying.
    pub async fn pkg(&self, stacks: &[StackConfig]) -> Result<Vec<PackagedTemplate>> {
        let refs: BTreeSet<StackRef> = stacks.iter().flat_map(StackConfig::output_refs).collect();
        let outputs = self.fetch_outputs(&refs).await?;

        let jobs = stacks.iter().map(|config| {
            let outputs = &outputs;
            async move {
                let stack = config.resolve(outputs)?;
                let TemplateLocation::Path(path) = &stack.template else {
                    bail!("{} has a remote template, nothing to package", stack.id);
                };
                let outcome = self.packaging.package_files(path, &stack).await?;
                let url = match &outcome.root {
                    Some(PackagedLocation::S3(location)) => Some(location.https_url()),
                    _ => None,
                };
                Ok(PackagedTemplate {
                    stack: stack.id.clone(),
                    url,
                    body: outcome.root_body().await?,
                })
            }
        });
        join_all(jobs).await.into_iter().collect()
    }

    /// Read every stack's outputs and write configured output files.
    pub async fn sync(&self, stacks: &[StackConfig]) -> Result<BTreeMap<StackRef, Outputs>> {
        let mut synced = BTreeMap::new();
        for config in stacks {
            let id = config.id();
            let description = self
                .services
                .stacks
                .describe_stack(&id.region, &id.name)
                .await?
                .with_context(|| format!("Stack {id} does not exist"))?;
            if let Some(path) = &config.outputs_file {
                write_outputs(path, &description.outputs).await?;
            }
            synced.insert(id, description.outputs);
        }
        Ok(synced)
    }

    /// Current status code of a stack, or [`NOT_DEPLOYED`].
    pub async fn status(&self, stack: &StackConfig) -> Result<String> {
        Ok(self
            .services
            .stacks
            .describe_stack(&stack.region, &stack.name)
            .await?
            .map(|d| d.status)
            .unwrap_or_else(|| NOT_DEPLOYED.to_string()))
    }

    async fn stack_outputs(&self, stack: &ResolvedStack) -> Result<Outputs> {
        let description = self
            .services
            .stacks
            .describe_stack(stack.region(), stack.name())
            .await?
            .with_context(|| format!("Stack {} vanished after deploy", stack.id))?;
        Ok(description.outputs)
    }

    /// Outputs of the given stacks; stacks that do not exist are left out.
    async fn fetch_outputs(&self, refs: &BTreeSet<StackRef>) -> Result<DependencyOutputs> {
        let mut outputs = DependencyOutputs::new();
        for id in refs {
            match self.services.stacks.describe_stack(&id.region, &id.name).await? {
                Some(description) => {
                    outputs.insert(id.clone(), description.outputs);
                }
                None => debug!(stack = %id, "Referenced stack does not exist"),
            }
        }
        Ok(outputs)
    }

    /// Resolve stacks against the live outputs they reference. A stack that
    /// cannot be resolved maps to `None` and is deleted by name only.
    async fn resolve_live(
        &self,
        stacks: &[StackConfig],
    ) -> Result<BTreeMap<StackRef, Option<ResolvedStack>>> {
        let refs: BTreeSet<StackRef> = stacks.iter().flat_map(StackConfig::output_refs).collect();
        let outputs = self.fetch_outputs(&refs).await?;
        Ok(stacks
            .iter()
            .map(|config| {
                let resolved = match config.resolve(&outputs) {
                    Ok(resolved) => Some(resolved),
                    Err(e) => {
                        warn!(
                            stack = %config.id(),
                            error = %e,
                            "Cannot resolve stack, skipping its cleanup"
                        );
                        None
                    }
                };
                (config.id(), resolved)
            })
            .collect())
    }

    /// Failed events of a stack tree since `since`, newest first, one per
    /// line. Best effort: lookup errors are logged and skipped.
    async fn failure_report(
        &self,
        region: &str,
        stack: &str,
        since: chrono::DateTime<Utc>,
    ) -> String {
        let mut lines = Vec::new();
        let mut work = vec![stack.to_string()];
        let mut visited = BTreeSet::new();

        while let Some(current) = work.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let events = match self
                .services
                .stacks
                .describe_stack_events(region, &current, Some(since))
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    warn!(stack = %current, error = ?e, "Failed to fetch stack events");
                    continue;
                }
            };
            for event in events.into_iter().filter(|e| e.status.ends_with("_FAILED")) {
                lines.push(format!(
                    "  {} {} {} {}: {}",
                    event.timestamp.to_rfc3339(),
                    event.stack_id,
                    event.logical_id,
                    event.status,
                    event.reason.as_deref().unwrap_or("")
                ));
                if event.resource_type == NESTED_STACK_TYPE {
                    if let Some(nested) = event.physical_id.filter(|id| *id != event.stack_id) {
                        work.push(nested);
                    }
                }
            }
        }

        if lines.is_empty() {
            String::new()
        } else {
            format!("\nFailed resources:\n{}", lines.join("\n"))
        }
    }
}

/// CloudFormation only reads templates from https URLs.
fn https_template_url(region: &str, url: &str) -> String {
    match parse_s3_url(url) {
        Some(object) => S3Location {
            region: region.to_string(),
            bucket: object.bucket,
            key: object.key,
        }
        .https_url(),
        None => url.to_string(),
    }
}

async fn write_outputs(path: &Path, outputs: &Outputs) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(outputs)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write outputs to {}", path.display()))?;
    info!(path = %path.display(), "Outputs written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_template_url_becomes_https() {
        assert_eq!(
            https_template_url("eu-west-1", "s3://artifacts/t.yaml"),
            "https://artifacts.s3.eu-west-1.amazonaws.com/t.yaml"
        );
        assert_eq!(
            https_template_url("eu-west-1", "https://example.com/t.yaml"),
            "https://example.com/t.yaml"
        );
    }

    #[tokio::test]
    async fn test_write_outputs_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/app.json");
        let outputs = Outputs::from([("Url".to_string(), "https://x".to_string())]);
        write_outputs(&path, &outputs).await.unwrap();

        let written: Outputs =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, outputs);
    }
}
