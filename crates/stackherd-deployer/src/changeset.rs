//! Change set creation and execution

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use stackherd_common::StackStatus;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::aws::api::{ChangeSetRequest, ChangeSetType, TemplateSummary};
use crate::aws::error::is_no_changes_reason;
use crate::aws::{StackApi, TemplateSource, classify_anyhow_error, ignore_not_found};
use crate::poller::{PollOutcome, StatusPoller, WaitGoal};
use crate::stackfile::ResolvedStack;

/// Capabilities every change set is created with
const BASE_CAPABILITIES: &[&str] = &["CAPABILITY_IAM", "CAPABILITY_NAMED_IAM"];

/// Needed as soon as a template declares a transform or macro
const AUTO_EXPAND: &str = "CAPABILITY_AUTO_EXPAND";

/// A created change set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSetOutcome {
    pub arn: String,
    /// `false` when CloudFormation found nothing to change. The change set
    /// has already been removed in that case.
    pub has_changes: bool,
}

/// Creates, classifies and executes change sets for one stack at a time
#[derive(Clone)]
pub struct ChangeSetManager {
    stacks: Arc<dyn StackApi>,
    poller: StatusPoller,
    max_attempts: u32,
}

impl ChangeSetManager {
    pub fn new(stacks: Arc<dyn StackApi>, poller: StatusPoller, max_attempts: u32) -> Self {
        Self {
            stacks,
            poller,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Create a change set for `stack` and wait until it is classified.
    #[instrument(skip_all, fields(stack = %stack.id))]
    pub async fn create_change_set(
        &self,
        stack: &ResolvedStack,
        template: &TemplateSource,
    ) -> Result<ChangeSetOutcome> {
        let region = stack.region();
        let change_set_type = self.prepare_stack(stack).await?;

        let summary = self
            .stacks
            .get_template_summary(region, template)
            .await
            .with_context(|| format!("Failed to summarize template of {}", stack.id))?;
        let parameters = select_parameters(stack, &summary)?;
        let capabilities = capabilities(stack, &summary);

        let mut request = ChangeSetRequest {
            stack_name: stack.name().to_string(),
            change_set_name: String::new(),
            change_set_type,
            template: template.clone(),
            parameters,
            capabilities,
            tags: stack.stack_tags(),
        };

        let arn = self.create_with_retry(stack, &mut request).await?;
        info!(arn = %arn, kind = ?change_set_type, "Change set created");

        match self
            .poller
            .wait_for_status(region, &arn, WaitGoal::ChangeSetReady)
            .await?
        {
            PollOutcome::Reached => Ok(ChangeSetOutcome {
                arn,
                has_changes: true,
            }),
            PollOutcome::Failed(reason) if is_no_changes_reason(&reason) => {
                info!("No changes to deploy");
                if let Err(e) = ignore_not_found(self.stacks.delete_change_set(region, &arn).await)
                {
                    warn!(arn = %arn, error = ?e, "Failed to delete empty change set");
                }
                Ok(ChangeSetOutcome {
                    arn,
                    has_changes: false,
                })
            }
            PollOutcome::Failed(reason) => {
                bail!("Change set for {} failed: {reason}", stack.id)
            }
        }
    }

    /// Execute a change set and wait for the stack to settle.
    #[instrument(skip_all, fields(stack = %stack.id))]
    pub async fn execute_change_set(
        &self,
        stack: &ResolvedStack,
        arn: &str,
    ) -> Result<PollOutcome> {
        let region = stack.region();
        self.stacks.execute_change_set(region, arn).await?;
        info!(arn = %arn, "Change set executing");

        let outcome = self
            .poller
            .wait_for_status(region, stack.name(), WaitGoal::StackDeployed)
            .await?;
        if outcome.is_reached() {
            info!("Stack deployed");
        }
        Ok(outcome)
    }

    /// Settle the existing stack and choose CREATE or UPDATE.
    ///
    /// A stack whose first create rolled back cannot be updated and is
    /// deleted first.
    async fn prepare_stack(&self, stack: &ResolvedStack) -> Result<ChangeSetType> {
        let region = stack.region();
        let Some(existing) = self.stacks.describe_stack(region, stack.name()).await? else {
            return Ok(ChangeSetType::Create);
        };

        let status = StackStatus::parse(&existing.status);
        if status.is_some_and(StackStatus::requires_replacement) {
            warn!(status = %existing.status, "Stack must be replaced, deleting it first");
            self.stacks.delete_stack(region, &existing.stack_id).await?;
            match self
                .poller
                .wait_for_status(region, &existing.stack_id, WaitGoal::StackDeleted)
                .await?
            {
                PollOutcome::Reached => return Ok(ChangeSetType::Create),
                PollOutcome::Failed(reason) => {
                    bail!("Failed to delete {} before re-creating it: {reason}", stack.id)
                }
            }
        }

        if status.is_some_and(StackStatus::is_review) {
            Ok(ChangeSetType::Create)
        } else {
            Ok(ChangeSetType::Update)
        }
    }

    async fn create_with_retry(
        &self,
        stack: &ResolvedStack,
        request: &mut ChangeSetRequest,
    ) -> Result<String> {
        let region = stack.region();
        let mut attempt = 1;
        loop {
            request.change_set_name = format!("stackherd-{}", Uuid::new_v4().simple());
            match self.stacks.create_change_set(region, request).await {
                Ok(arn) => return Ok(arn),
                Err(e)
                    if attempt < self.max_attempts
                        && classify_anyhow_error(&e).is_limit_exceeded() =>
                {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        "Change set limit exceeded, deleting existing change sets"
                    );
                    self.delete_change_sets(stack).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn delete_change_sets(&self, stack: &ResolvedStack) -> Result<()> {
        let region = stack.region();
        let arns = self.stacks.list_change_sets(region, stack.name()).await?;
        debug!(count = arns.len(), "Deleting change sets");
        for arn in arns {
            ignore_not_found(self.stacks.delete_change_set(region, &arn).await)?;
        }
        Ok(())
    }
}

/// Keep the parameters the template declares and check required ones.
fn select_parameters(
    stack: &ResolvedStack,
    summary: &TemplateSummary,
) -> Result<BTreeMap<String, String>> {
    let mut selected = BTreeMap::new();
    let mut missing = Vec::new();
    for declared in &summary.parameters {
        match stack.parameters.get(&declared.key) {
            Some(value) => {
                selected.insert(declared.key.clone(), value.clone());
            }
            None if declared.has_default => {}
            None => missing.push(declared.key.as_str()),
        }
    }

    if !missing.is_empty() {
        bail!(
            "Missing value for template parameter(s) of {}: {}",
            stack.id,
            missing.join(", ")
        );
    }

    for key in stack.parameters.keys() {
        if !selected.contains_key(key) {
            debug!(parameter = %key, "Ignoring parameter the template does not declare");
        }
    }
    Ok(selected)
}

fn capabilities(stack: &ResolvedStack, summary: &TemplateSummary) -> Vec<String> {
    let mut set: BTreeSet<String> = BASE_CAPABILITIES.iter().map(|c| c.to_string()).collect();
    if !summary.declared_transforms.is_empty() {
        set.insert(AUTO_EXPAND.to_string());
    }
    set.extend(summary.capabilities.iter().cloned());
    set.extend(stack.capabilities.iter().cloned());
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::AwsError;
    use crate::aws::api::{
        ChangeSetDescription, MockStackApi, StackDescription, TemplateParameter,
    };
    use crate::stackfile::{StackFlags, StackRef, TemplateLocation};
    use std::time::Duration;

    fn resolved() -> ResolvedStack {
        ResolvedStack {
            id: StackRef::new("eu-west-1", "app"),
            template: TemplateLocation::Url("https://example.com/t.json".to_string()),
            depends_on: vec![],
            parameters: BTreeMap::from([
                ("Env".to_string(), "prod".to_string()),
                ("Unused".to_string(), "x".to_string()),
            ]),
            tags: BTreeMap::from([("team".to_string(), "infra".to_string())]),
            bucket: None,
            repository: None,
            flags: StackFlags::default(),
            capabilities: vec![],
            outputs_file: None,
            bucket_cleanup_tags: BTreeMap::new(),
        }
    }

    fn summary() -> TemplateSummary {
        TemplateSummary {
            parameters: vec![
                TemplateParameter {
                    key: "Env".to_string(),
                    has_default: false,
                },
                TemplateParameter {
                    key: "Size".to_string(),
                    has_default: true,
                },
            ],
            capabilities: vec![],
            declared_transforms: vec!["AWS::Serverless-2016-10-31".to_string()],
        }
    }

    fn change_set(status: &str, reason: Option<&str>) -> ChangeSetDescription {
        ChangeSetDescription {
            arn: "arn:aws:cloudformation:eu-west-1:1:changeSet/cs/1".to_string(),
            stack_id: "arn:aws:cloudformation:eu-west-1:1:stack/app/1".to_string(),
            status: status.to_string(),
            status_reason: reason.map(str::to_string),
        }
    }

    fn limit_exceeded() -> anyhow::Error {
        AwsError::LimitExceeded {
            message: "ChangeSet limit exceeded for stack app".to_string(),
        }
        .into()
    }

    fn manager(mock: MockStackApi) -> ChangeSetManager {
        let stacks: Arc<dyn StackApi> = Arc::new(mock);
        let poller = StatusPoller::new(stacks.clone(), Duration::from_millis(10));
        ChangeSetManager::new(stacks, poller, 3)
    }

    fn base_mock() -> MockStackApi {
        let mut mock = MockStackApi::new();
        mock.expect_describe_stack().returning(|_, _| Ok(None));
        mock.expect_get_template_summary()
            .returning(|_, _| Ok(summary()));
        mock
    }

    fn template() -> TemplateSource {
        TemplateSource::Url("https://example.com/t.json".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_builds_request() {
        let mut mock = base_mock();
        mock.expect_create_change_set()
            .times(1)
            .withf(|_, req| {
                req.change_set_type == ChangeSetType::Create
                    && req.parameters == BTreeMap::from([("Env".to_string(), "prod".to_string())])
                    && req.capabilities
                        == vec![
                            "CAPABILITY_AUTO_EXPAND".to_string(),
                            "CAPABILITY_IAM".to_string(),
                            "CAPABILITY_NAMED_IAM".to_string(),
                        ]
                    && req.tags.get("RootStackName").map(String::as_str) == Some("app")
                    && req.change_set_name.starts_with("stackherd-")
            })
            .returning(|_, _| Ok("arn:aws:cloudformation:eu-west-1:1:changeSet/cs/1".to_string()));
        mock.expect_describe_change_set()
            .returning(|_, _| Ok(Some(change_set("CREATE_COMPLETE", None))));

        let outcome = manager(mock)
            .create_change_set(&resolved(), &template())
            .await
            .unwrap();
        assert!(outcome.has_changes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_exceeded_gives_up_after_three_attempts() {
        let mut mock = base_mock();
        mock.expect_create_change_set()
            .times(3)
            .returning(|_, _| Err(limit_exceeded()));
        mock.expect_list_change_sets()
            .times(2)
            .returning(|_, _| Ok(vec!["old-1".to_string(), "old-2".to_string()]));
        mock.expect_delete_change_set().times(4).returning(|_, _| Ok(()));

        let err = manager(mock)
            .create_change_set(&resolved(), &template())
            .await
            .unwrap_err();
        assert!(classify_anyhow_error(&err).is_limit_exceeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_limit_then_success() {
        let mut mock = base_mock();
        let mut seq = mockall::Sequence::new();
        mock.expect_create_change_set()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(limit_exceeded()));
        mock.expect_create_change_set()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("arn:aws:cloudformation:eu-west-1:1:changeSet/cs/1".to_string()));
        mock.expect_list_change_sets().returning(|_, _| Ok(vec![]));
        mock.expect_describe_change_set()
            .returning(|_, _| Ok(Some(change_set("CREATE_COMPLETE", None))));

        let outcome = manager(mock)
            .create_change_set(&resolved(), &template())
            .await
            .unwrap();
        assert!(outcome.has_changes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_changes_is_benign() {
        let mut mock = base_mock();
        mock.expect_create_change_set()
            .returning(|_, _| Ok("arn:aws:cloudformation:eu-west-1:1:changeSet/cs/1".to_string()));
        mock.expect_describe_change_set().returning(|_, _| {
            Ok(Some(change_set(
                "FAILED",
                Some(
                    "The submitted information didn't contain changes. \
                     Submit different information to create a change set.",
                ),
            )))
        });
        mock.expect_delete_change_set().times(1).returning(|_, _| Ok(()));

        let outcome = manager(mock)
            .create_change_set(&resolved(), &template())
            .await
            .unwrap();
        assert!(!outcome.has_changes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failure_is_error() {
        let mut mock = base_mock();
        mock.expect_create_change_set()
            .returning(|_, _| Ok("arn:aws:cloudformation:eu-west-1:1:changeSet/cs/1".to_string()));
        mock.expect_describe_change_set()
            .returning(|_, _| Ok(Some(change_set("FAILED", Some("Template format error")))));

        let err = manager(mock)
            .create_change_set(&resolved(), &template())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Template format error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_required_parameter() {
        let mut stack = resolved();
        stack.parameters.clear();
        let mut mock = base_mock();
        mock.expect_create_change_set().never();

        let err = manager(mock)
            .create_change_set(&stack, &template())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Env"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolled_back_stack_is_replaced() {
        let mut mock = MockStackApi::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_describe_stack()
            .withf(|region, name| region == "eu-west-1" && name == "app")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(Some(StackDescription {
                    stack_id: "arn:aws:cloudformation:eu-west-1:1:stack/app/1".to_string(),
                    name: "app".to_string(),
                    status: "ROLLBACK_COMPLETE".to_string(),
                    status_reason: None,
                    outputs: BTreeMap::new(),
                    tags: BTreeMap::new(),
                }))
            });
        mock.expect_delete_stack().times(1).returning(|_, _| Ok(()));
        mock.expect_describe_stack()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        mock.expect_get_template_summary()
            .returning(|_, _| Ok(summary()));
        mock.expect_create_change_set()
            .withf(|_, req| req.change_set_type == ChangeSetType::Create)
            .returning(|_, _| Ok("arn:aws:cloudformation:eu-west-1:1:changeSet/cs/1".to_string()));
        mock.expect_describe_change_set()
            .returning(|_, _| Ok(Some(change_set("CREATE_COMPLETE", None))));

        let outcome = manager(mock)
            .create_change_set(&resolved(), &template())
            .await
            .unwrap();
        assert!(outcome.has_changes);
    }

    #[test]
    fn test_user_capabilities_are_merged() {
        let mut stack = resolved();
        stack.capabilities = vec!["CAPABILITY_RESOURCE_POLICY".to_string()];
        let caps = capabilities(&stack, &TemplateSummary::default());
        assert_eq!(
            caps,
            vec![
                "CAPABILITY_IAM".to_string(),
                "CAPABILITY_NAMED_IAM".to_string(),
                "CAPABILITY_RESOURCE_POLICY".to_string(),
            ]
        );
    }
}
