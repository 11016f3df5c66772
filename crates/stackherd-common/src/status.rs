//! Closed stack and change-set status taxonomy
//!
//! CloudFormation reports statuses as strings. They are parsed into the enums
//! below and classified per wait goal, so "is this terminal" and "did it
//! succeed" are answered by one exhaustive `match` instead of membership
//! checks against ad hoc lists.

/// Coarse classification of a status with respect to a wait goal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Still moving, poll again
    InProgress,
    /// The goal was reached
    Succeeded,
    /// A terminal status that does not satisfy the goal
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Phase::InProgress)
    }
}

/// Every status a CloudFormation stack can report
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    CreateInProgress,
    CreateFailed,
    CreateComplete,
    RollbackInProgress,
    RollbackFailed,
    RollbackComplete,
    DeleteInProgress,
    DeleteFailed,
    DeleteComplete,
    UpdateInProgress,
    UpdateCompleteCleanupInProgress,
    UpdateComplete,
    UpdateFailed,
    UpdateRollbackInProgress,
    UpdateRollbackFailed,
    UpdateRollbackCompleteCleanupInProgress,
    UpdateRollbackComplete,
    ReviewInProgress,
    ImportInProgress,
    ImportComplete,
    ImportRollbackInProgress,
    ImportRollbackFailed,
    ImportRollbackComplete,
}

impl StackStatus {
    /// Parse from string, returning None for unknown values
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Check whether CloudFormation is still working on the stack
    pub fn is_in_progress(self) -> bool {
        use StackStatus::*;
        matches!(
            self,
            CreateInProgress
                | RollbackInProgress
                | DeleteInProgress
                | UpdateInProgress
                | UpdateCompleteCleanupInProgress
                | UpdateRollbackInProgress
                | UpdateRollbackCompleteCleanupInProgress
                | ReviewInProgress
                | ImportInProgress
                | ImportRollbackInProgress
        )
    }

    /// A stack in this state holds no resources and cannot be updated.
    ///
    /// It has to be deleted before a new CREATE change set is accepted.
    pub fn requires_replacement(self) -> bool {
        matches!(self, StackStatus::RollbackComplete)
    }

    /// A stack that exists only as a change-set placeholder.
    pub fn is_review(self) -> bool {
        matches!(self, StackStatus::ReviewInProgress)
    }

    /// Classify against the goal "the last deployment finished".
    pub fn deploy_phase(self) -> Phase {
        use StackStatus::*;
        match self {
            CreateComplete | UpdateComplete | ImportComplete => Phase::Succeeded,
            CreateFailed
            | RollbackFailed
            | RollbackComplete
            | DeleteFailed
            | DeleteComplete
            | UpdateFailed
            | UpdateRollbackFailed
            | UpdateRollbackComplete
            | ImportRollbackFailed
            | ImportRollbackComplete => Phase::Failed,
            CreateInProgress
            | RollbackInProgress
            | DeleteInProgress
            | UpdateInProgress
            | UpdateCompleteCleanupInProgress
            | UpdateRollbackInProgress
            | UpdateRollbackCompleteCleanupInProgress
            | ReviewInProgress
            | ImportInProgress
            | ImportRollbackInProgress => Phase::InProgress,
        }
    }

    /// Classify against the goal "the stack is gone".
    ///
    /// A stack that still reports a settled non-delete status right after a
    /// delete request has not picked the request up yet, so it is in progress.
    pub fn delete_phase(self) -> Phase {
        match self {
            StackStatus::DeleteComplete => Phase::Succeeded,
            StackStatus::DeleteFailed => Phase::Failed,
            _ => Phase::InProgress,
        }
    }
}

/// Every status a CloudFormation change set can report
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeSetStatus {
    CreatePending,
    CreateInProgress,
    CreateComplete,
    DeletePending,
    DeleteInProgress,
    DeleteComplete,
    DeleteFailed,
    Failed,
}

impl ChangeSetStatus {
    /// Parse from string, returning None for unknown values
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Classify against the goal "the change set is ready to execute".
    pub fn creation_phase(self) -> Phase {
        use ChangeSetStatus::*;
        match self {
            CreateComplete => Phase::Succeeded,
            Failed | DeleteComplete | DeleteFailed => Phase::Failed,
            CreatePending | CreateInProgress | DeletePending | DeleteInProgress => {
                Phase::InProgress
            }
        }
    }
}
