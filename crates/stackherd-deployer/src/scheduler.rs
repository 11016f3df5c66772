//! Dependency-ordered execution across a set of stacks
//!
//! Deploys start a stack once every stack it depends on has deployed.
//! Deletes run the mirror image: a stack is deleted once every stack that
//! depends on it is gone. Independent stacks run concurrently, and a failed
//! stack blocks everything waiting on it without stopping unrelated work.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::stackfile::{StackConfig, StackRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum GraphMode {
    Deploy,
    Delete,
}

/// Scheduler-side state of one stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("stack {0} is defined more than once")]
    Duplicate(StackRef),

    #[error("stack dependencies form a cycle through {}", format_ids(.0))]
    Cycle(Vec<StackRef>),
}

fn format_ids(ids: &[StackRef]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Outcome of one graph run
#[derive(Debug, Default)]
pub struct GraphReport {
    pub succeeded: Vec<StackRef>,
    pub failed: Vec<(StackRef, anyhow::Error)>,
    /// Never started because a prerequisite failed
    pub blocked: Vec<StackRef>,
}

impl GraphReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

/// Validated dependency graph of a stack set
#[derive(Debug, Clone)]
pub struct StackGraph {
    /// Stack to the in-set stacks it depends on
    dependencies: BTreeMap<StackRef, BTreeSet<StackRef>>,
}

impl StackGraph {
    /// Build the graph. Edges come from `dependsOn` plus every stack whose
    /// outputs a value reads. Edges to stacks outside the set are dropped.
    pub fn new(stacks: &[StackConfig]) -> Result<Self, GraphError> {
        let mut ids = BTreeSet::new();
        for stack in stacks {
            if !ids.insert(stack.id()) {
                return Err(GraphError::Duplicate(stack.id()));
            }
        }

        let dependencies = stacks
            .iter()
            .map(|stack| {
                let id = stack.id();
                let deps = stack
                    .depends_on
                    .iter()
                    .cloned()
                    .chain(stack.output_refs())
                    .filter(|dep| *dep != id && ids.contains(dep))
                    .collect();
                (id, deps)
            })
            .collect();

        let graph = Self { dependencies };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Kahn's algorithm; whatever never reaches zero in-degree is on a cycle.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut remaining: BTreeMap<&StackRef, usize> = self
            .dependencies
            .iter()
            .map(|(id, deps)| (id, deps.len()))
            .collect();
        let mut ready: Vec<&StackRef> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();

        while let Some(done) = ready.pop() {
            remaining.remove(done);
            for (id, deps) in &self.dependencies {
                if deps.contains(done) {
                    if let Some(n) = remaining.get_mut(id) {
                        *n -= 1;
                        if *n == 0 {
                            ready.push(id);
                        }
                    }
                }
            }
        }

        if remaining.is_empty() {
            Ok(())
        } else {
            Err(GraphError::Cycle(remaining.into_keys().cloned().collect()))
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &StackRef> {
        self.dependencies.keys()
    }

    /// Stacks that must finish before `id` may start.
    fn prerequisites(&self, id: &StackRef, mode: GraphMode) -> Vec<&StackRef> {
        match mode {
            GraphMode::Deploy => self
                .dependencies
                .get(id)
                .into_iter()
                .flatten()
                .collect(),
            GraphMode::Delete => self
                .dependencies
                .iter()
                .filter(|(_, deps)| deps.contains(id))
                .map(|(dependent, _)| dependent)
                .collect(),
        }
    }

    /// Run `action` on every stack in dependency order with maximal
    /// concurrency.
    pub async fn run<F, Fut>(&self, mode: GraphMode, action: F) -> GraphReport
    where
        F: Fn(StackRef) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut status: BTreeMap<StackRef, NodeStatus> = self
            .ids()
            .map(|id| (id.clone(), NodeStatus::Pending))
            .collect();
        let mut running = FuturesUnordered::new();
        let mut report = GraphReport::default();

        loop {
            let eligible: Vec<StackRef> = status
                .iter()
                .filter(|(_, s)| **s == NodeStatus::Pending)
                .filter(|(id, _)| {
                    self.prerequisites(id, mode)
                        .iter()
                        .all(|p| status.get(*p) == Some(&NodeStatus::Succeeded))
                })
                .map(|(id, _)| id.clone())
                .collect();

            for id in eligible {
                debug!(stack = %id, mode = %mode, "Starting");
                status.insert(id.clone(), NodeStatus::InProgress);
                let work = action(id.clone());
                running.push(async move { (id, work.await) });
            }

            let Some((id, result)) = running.next().await else {
                break;
            };
            match result {
                Ok(()) => {
                    info!(stack = %id, mode = %mode, "Stack finished");
                    status.insert(id.clone(), NodeStatus::Succeeded);
                    report.succeeded.push(id);
                }
                Err(e) => {
                    error!(stack = %id, mode = %mode, error = ?e, "Stack failed");
                    status.insert(id.clone(), NodeStatus::Failed);
                    report.failed.push((id, e));
                }
            }
        }

        report.blocked = status
            .into_iter()
            .filter(|(_, s)| *s == NodeStatus::Pending)
            .map(|(id, _)| id)
            .collect();
        if !report.blocked.is_empty() {
            warn!(stacks = %format_ids(&report.blocked), "Blocked by failed prerequisites");
        }
        report
    }
}

/// Validate `stacks` as a graph and run `action` over it.
pub async fn run_graph<F, Fut>(
    stacks: &[StackConfig],
    mode: GraphMode,
    action: F,
) -> Result<GraphReport, GraphError>
where
    F: Fn(StackRef) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let graph = StackGraph::new(stacks)?;
    Ok(graph.run(mode, action).await)
}
