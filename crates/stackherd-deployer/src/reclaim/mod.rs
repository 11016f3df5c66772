//! Garbage collection after stack deletion
//!
//! - [`live`]: ARNs of every resource a stack tree still owns
//! - [`retained`]: resources tagged with a stack but no longer owned by it
//! - [`packaged`]: uploaded artifacts no live template references
//!
//! Both collectors record a result per resource and keep going on failure.

pub mod live;
pub mod packaged;
pub mod retained;

use stackherd_common::ResourceKind;
use thiserror::Error;

pub use live::list_live_resource_arns;
pub use packaged::{PackagedFileReclaimer, PruneReport};
pub use retained::{RetainedResource, RetainedResourceReclaimer};

/// Result of a single resource cleanup operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CleanupResult {
    /// Resource was successfully deleted
    Deleted,
    /// Resource was already deleted (not found)
    AlreadyDeleted,
    /// Cleanup failed with error
    Failed,
    /// Resource was left alone because its stack is not force-deleted
    Skipped,
}

/// A live resource whose ARN cannot be derived
#[derive(Debug, Error)]
#[error(
    "cannot derive the ARN of {logical_id} ({resource_type}, physical id {physical_id}) \
     in stack {stack}"
)]
pub struct ClassificationError {
    pub stack: String,
    pub logical_id: String,
    pub resource_type: String,
    pub physical_id: String,
}

#[derive(Debug, Clone)]
pub struct ReclaimEntry {
    pub stack: String,
    pub region: String,
    pub kind: ResourceKind,
    pub arn: String,
    pub result: CleanupResult,
}

/// Report of retained-resource cleanup
#[derive(Debug, Default)]
pub struct ReclaimReport {
    pub entries: Vec<ReclaimEntry>,
}

impl ReclaimReport {
    pub fn record(&mut self, entry: ReclaimEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, other: ReclaimReport) {
        self.entries.extend(other.entries);
    }

    pub fn count(&self, result: CleanupResult) -> usize {
        self.entries.iter().filter(|e| e.result == result).count()
    }

    pub fn has_failures(&self) -> bool {
        self.count(CleanupResult::Failed) > 0
    }

    pub fn skipped(&self) -> impl Iterator<Item = &ReclaimEntry> {
        self.entries
            .iter()
            .filter(|e| e.result == CleanupResult::Skipped)
    }
}
