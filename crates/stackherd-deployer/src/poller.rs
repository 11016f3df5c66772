//! Blocking status polls for stacks and change sets

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use stackherd_common::{ChangeSetStatus, Phase, StackStatus};
use tracing::{debug, warn};

use crate::aws::StackApi;

/// What a poll is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WaitGoal {
    /// The last create or update finished
    StackDeployed,
    /// The stack is gone
    StackDeleted,
    /// The change set can be executed
    ChangeSetReady,
}

/// How a poll ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Reached,
    /// Terminal status that misses the goal, with the status reason
    Failed(String),
}

impl PollOutcome {
    pub fn is_reached(&self) -> bool {
        matches!(self, PollOutcome::Reached)
    }
}

/// Whether an ARN names a change set rather than a stack
pub fn is_change_set_arn(arn: &str) -> bool {
    arn.contains(":changeSet/")
}

/// Polls one ARN at a fixed interval until it is terminal for a goal.
///
/// There is no deadline. A remote operation that never settles keeps the
/// poll alive until the process is stopped.
#[derive(Clone)]
pub struct StatusPoller {
    stacks: Arc<dyn StackApi>,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(stacks: Arc<dyn StackApi>, interval: Duration) -> Self {
        Self { stacks, interval }
    }

    pub async fn wait_for_status(
        &self,
        region: &str,
        arn: &str,
        goal: WaitGoal,
    ) -> Result<PollOutcome> {
        let mut polls = 0u32;
        loop {
            polls += 1;
            let (status, phase, reason) = if is_change_set_arn(arn) {
                self.change_set_phase(region, arn, goal).await?
            } else {
                self.stack_phase(region, arn, goal).await?
            };

            match phase {
                Phase::Succeeded => {
                    debug!(arn = %arn, goal = %goal, status = %status, polls, "Status reached");
                    return Ok(PollOutcome::Reached);
                }
                Phase::Failed => {
                    debug!(arn = %arn, goal = %goal, status = %status, polls, "Status failed");
                    return Ok(PollOutcome::Failed(reason.unwrap_or(status)));
                }
                Phase::InProgress => {
                    debug!(arn = %arn, status = %status, "Waiting");
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }

    async fn stack_phase(
        &self,
        region: &str,
        arn: &str,
        goal: WaitGoal,
    ) -> Result<(String, Phase, Option<String>)> {
        let Some(stack) = self.stacks.describe_stack(region, arn).await? else {
            let phase = if goal == WaitGoal::StackDeleted {
                Phase::Succeeded
            } else {
                Phase::Failed
            };
            return Ok(("DOES_NOT_EXIST".to_string(), phase, None));
        };

        let phase = match StackStatus::parse(&stack.status) {
            Some(status) => match goal {
                WaitGoal::StackDeleted => status.delete_phase(),
                _ => status.deploy_phase(),
            },
            None => {
                warn!(arn = %arn, status = %stack.status, "Unknown stack status");
                Phase::InProgress
            }
        };
        Ok((stack.status, phase, stack.status_reason))
    }

    async fn change_set_phase(
        &self,
        region: &str,
        arn: &str,
        goal: WaitGoal,
    ) -> Result<(String, Phase, Option<String>)> {
        let Some(change_set) = self.stacks.describe_change_set(region, arn).await? else {
            return Ok(("DOES_NOT_EXIST".to_string(), Phase::Failed, None));
        };

        let phase = match (ChangeSetStatus::parse(&change_set.status), goal) {
            (Some(status), WaitGoal::ChangeSetReady) => status.creation_phase(),
            (Some(ChangeSetStatus::DeleteComplete), WaitGoal::StackDeleted) => Phase::Succeeded,
            (Some(_), _) => Phase::Failed,
            (None, _) => {
                warn!(arn = %arn, status = %change_set.status, "Unknown change set status");
                Phase::InProgress
            }
        };
        Ok((change_set.status, phase, change_set.status_reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::api::{ChangeSetDescription, MockStackApi, StackDescription};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    const STACK_ARN: &str = "arn:aws:cloudformation:eu-west-1:123456789012:stack/app/abc";
    const CHANGE_SET_ARN: &str =
        "arn:aws:cloudformation:eu-west-1:123456789012:changeSet/stackherd-1/def";

    fn stack(status: &str, reason: Option<&str>) -> StackDescription {
        StackDescription {
            stack_id: STACK_ARN.to_string(),
            name: "app".to_string(),
            status: status.to_string(),
            status_reason: reason.map(str::to_string),
            outputs: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    fn poller(mock: MockStackApi) -> StatusPoller {
        StatusPoller::new(Arc::new(mock), Duration::from_secs(1))
    }

    #[test]
    fn test_arn_shape() {
        assert!(is_change_set_arn(CHANGE_SET_ARN));
        assert!(!is_change_set_arn(STACK_ARN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_complete() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut mock = MockStackApi::new();
        mock.expect_describe_stack().returning(move |_, _| {
            let status = match counter.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => "UPDATE_IN_PROGRESS",
                _ => "UPDATE_COMPLETE",
            };
            Ok(Some(stack(status, None)))
        });

        let outcome = poller(mock)
            .wait_for_status("eu-west-1", STACK_ARN, WaitGoal::StackDeployed)
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Reached);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_returns_reason_or_status() {
        let mut mock = MockStackApi::new();
        mock.expect_describe_stack()
            .returning(|_, _| Ok(Some(stack("ROLLBACK_COMPLETE", Some("Bucket already exists")))));
        let outcome = poller(mock)
            .wait_for_status("eu-west-1", STACK_ARN, WaitGoal::StackDeployed)
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Failed("Bucket already exists".to_string()));

        let mut mock = MockStackApi::new();
        mock.expect_describe_stack()
            .returning(|_, _| Ok(Some(stack("DELETE_FAILED", None))));
        let outcome = poller(mock)
            .wait_for_status("eu-west-1", STACK_ARN, WaitGoal::StackDeleted)
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Failed("DELETE_FAILED".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_stack_counts_as_deleted() {
        let mut mock = MockStackApi::new();
        mock.expect_describe_stack().returning(|_, _| Ok(None));
        let poller = poller(mock);

        let deleted = poller
            .wait_for_status("eu-west-1", STACK_ARN, WaitGoal::StackDeleted)
            .await
            .unwrap();
        assert!(deleted.is_reached());

        let deployed = poller
            .wait_for_status("eu-west-1", STACK_ARN, WaitGoal::StackDeployed)
            .await
            .unwrap();
        assert!(!deployed.is_reached());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_set_arn_uses_change_set_api() {
        let mut mock = MockStackApi::new();
        mock.expect_describe_stack().never();
        mock.expect_describe_change_set().returning(|_, arn| {
            Ok(Some(ChangeSetDescription {
                arn: arn.to_string(),
                stack_id: STACK_ARN.to_string(),
                status: "FAILED".to_string(),
                status_reason: Some("No updates are to be performed.".to_string()),
            }))
        });

        let outcome = poller(mock)
            .wait_for_status("eu-west-1", CHANGE_SET_ARN, WaitGoal::ChangeSetReady)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Failed("No updates are to be performed.".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_status_keeps_polling() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut mock = MockStackApi::new();
        mock.expect_describe_stack().returning(move |_, _| {
            let status = if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                "SOMETHING_NEW"
            } else {
                "CREATE_COMPLETE"
            };
            Ok(Some(stack(status, None)))
        });

        let outcome = poller(mock)
            .wait_for_status("eu-west-1", STACK_ARN, WaitGoal::StackDeployed)
            .await
            .unwrap();
        assert!(outcome.is_reached());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
