//! CloudFormation-backed [`StackApi`]

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_cloudformation::types::{
    Capability, ChangeSetType as SdkChangeSetType, Parameter, Tag,
    TemplateStage as SdkTemplateStage,
};
use chrono::{DateTime, Utc};
use tracing::debug;

use super::api::{
    ChangeSetDescription, ChangeSetRequest, ChangeSetType, StackApi, StackDescription,
    StackEvent, StackResource, TemplateParameter, TemplateSource, TemplateStage, TemplateSummary,
};
use super::context::AwsContext;
use super::error::classify_anyhow_error;
use super::send;
use crate::throttle::RateLimiter;

pub struct CloudFormationStacks {
    ctx: AwsContext,
    limiter: Arc<RateLimiter>,
}

impl CloudFormationStacks {
    pub fn new(ctx: AwsContext, limiter: Arc<RateLimiter>) -> Self {
        Self { ctx, limiter }
    }
}

/// Convert a CloudFormation timestamp into chrono.
fn to_chrono(ts: &aws_sdk_cloudformation::primitives::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos()).unwrap_or_default()
}

/// Map "does not exist" to `None`, keep every other error.
fn optional<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if classify_anyhow_error(&e).is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl StackApi for CloudFormationStacks {
    async fn describe_stack(&self, region: &str, stack: &str) -> Result<Option<StackDescription>> {
        let client = self.ctx.cloudformation(region);
        let request = client.describe_stacks().stack_name(stack);
        let Some(output) = optional(send(&self.limiter, || request.send()).await)? else {
            return Ok(None);
        };

        let Some(found) = output.stacks().first() else {
            return Ok(None);
        };

        Ok(Some(StackDescription {
            stack_id: found.stack_id().unwrap_or_default().to_string(),
            name: found.stack_name().to_string(),
            status: found.stack_status().as_str().to_string(),
            status_reason: found.stack_status_reason().map(str::to_string),
            outputs: found
                .outputs()
                .iter()
                .filter_map(|o| Some((o.output_key()?.to_string(), o.output_value()?.to_string())))
                .collect(),
            tags: found
                .tags()
                .iter()
                .map(|t| (t.key().to_string(), t.value().to_string()))
                .collect(),
        }))
    }

    async fn describe_change_set(
        &self,
        region: &str,
        arn: &str,
    ) -> Result<Option<ChangeSetDescription>> {
        let client = self.ctx.cloudformation(region);
        let request = client.describe_change_set().change_set_name(arn);
        let Some(output) = optional(send(&self.limiter, || request.send()).await)? else {
            return Ok(None);
        };

        Ok(Some(ChangeSetDescription {
            arn: output.change_set_id().unwrap_or(arn).to_string(),
            stack_id: output.stack_id().unwrap_or_default().to_string(),
            status: output
                .status()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            status_reason: output.status_reason().map(str::to_string),
        }))
    }

    async fn create_change_set(&self, region: &str, request: &ChangeSetRequest) -> Result<String> {
        let client = self.ctx.cloudformation(region);

        let parameters = request
            .parameters
            .iter()
            .map(|(k, v)| Parameter::builder().parameter_key(k).parameter_value(v).build())
            .collect::<Vec<_>>();
        let tags = request
            .tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect::<Vec<_>>();
        let capabilities = request
            .capabilities
            .iter()
            .map(|c| Capability::from(c.as_str()))
            .collect::<Vec<_>>();
        let change_set_type = match request.change_set_type {
            ChangeSetType::Create => SdkChangeSetType::Create,
            ChangeSetType::Update => SdkChangeSetType::Update,
        };

        let mut call = client
            .create_change_set()
            .stack_name(&request.stack_name)
            .change_set_name(&request.change_set_name)
            .change_set_type(change_set_type)
            .set_parameters(Some(parameters))
            .set_capabilities(Some(capabilities))
            .set_tags(Some(tags));
        call = match &request.template {
            TemplateSource::Body(body) => call.template_body(body),
            TemplateSource::Url(url) => call.template_url(url),
        };

        let output = send(&self.limiter, || call.send())
            .await
            .with_context(|| format!("Failed to create change set for {}", request.stack_name))?;
        let arn = output
            .id()
            .context("CreateChangeSet returned no change set id")?;
        debug!(stack = %request.stack_name, arn = %arn, "Change set created");
        Ok(arn.to_string())
    }

    async fn execute_change_set(&self, region: &str, arn: &str) -> Result<()> {
        let client = self.ctx.cloudformation(region);
        let request = client.execute_change_set().change_set_name(arn);
        send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to execute change set {arn}"))?;
        Ok(())
    }

    async fn delete_change_set(&self, region: &str, arn: &str) -> Result<()> {
        let client = self.ctx.cloudformation(region);
        let request = client.delete_change_set().change_set_name(arn);
        send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to delete change set {arn}"))?;
        Ok(())
    }

    async fn list_change_sets(&self, region: &str, stack: &str) -> Result<Vec<String>> {
        let client = self.ctx.cloudformation(region);
        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let request = client
                .list_change_sets()
                .stack_name(stack)
                .set_next_token(next_token.take());
            let output = send(&self.limiter, || request.send())
                .await
                .with_context(|| format!("Failed to list change sets of {stack}"))?;

            arns.extend(
                output
                    .summaries()
                    .iter()
                    .filter_map(|s| s.change_set_id().map(str::to_string)),
            );

            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(arns)
    }

    async fn delete_stack(&self, region: &str, stack: &str) -> Result<()> {
        let client = self.ctx.cloudformation(region);
        let request = client.delete_stack().stack_name(stack);
        send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to delete stack {stack}"))?;
        Ok(())
    }

    async fn list_stack_resources(&self, region: &str, stack: &str) -> Result<Vec<StackResource>> {
        let client = self.ctx.cloudformation(region);
        let mut resources = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let request = client
                .list_stack_resources()
                .stack_name(stack)
                .set_next_token(next_token.take());
            let output = send(&self.limiter, || request.send())
                .await
                .with_context(|| format!("Failed to list resources of {stack}"))?;

            resources.extend(output.stack_resource_summaries().iter().map(|r| {
                StackResource {
                    logical_id: r.logical_resource_id().to_string(),
                    physical_id: r.physical_resource_id().map(str::to_string),
                    resource_type: r.resource_type().to_string(),
                    status: r.resource_status().as_str().to_string(),
                }
            }));

            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(resources)
    }

    async fn get_template(
        &self,
        region: &str,
        stack: &str,
        stage: TemplateStage,
    ) -> Result<String> {
        let client = self.ctx.cloudformation(region);
        let stage = match stage {
            TemplateStage::Original => SdkTemplateStage::Original,
            TemplateStage::Processed => SdkTemplateStage::Processed,
        };
        let request = client.get_template().stack_name(stack).template_stage(stage);
        let output = send(&self.limiter, || request.send())
            .await
            .with_context(|| format!("Failed to get template of {stack}"))?;
        Ok(output.template_body().unwrap_or_default().to_string())
    }

    async fn validate_template(&self, region: &str, template: &TemplateSource) -> Result<()> {
        let client = self.ctx.cloudformation(region);
        let request = match template {
            TemplateSource::Body(body) => client.validate_template().template_body(body),
            TemplateSource::Url(url) => client.validate_template().template_url(url),
        };
        send(&self.limiter, || request.send())
            .await
            .context("Template validation failed")?;
        Ok(())
    }

    async fn get_template_summary(
        &self,
        region: &str,
        template: &TemplateSource,
    ) -> Result<TemplateSummary> {
        let client = self.ctx.cloudformation(region);
        let request = match template {
            TemplateSource::Body(body) => client.get_template_summary().template_body(body),
            TemplateSource::Url(url) => client.get_template_summary().template_url(url),
        };
        let output = send(&self.limiter, || request.send())
            .await
            .context("Failed to get template summary")?;

        Ok(TemplateSummary {
            parameters: output
                .parameters()
                .iter()
                .filter_map(|p| {
                    Some(TemplateParameter {
                        key: p.parameter_key()?.to_string(),
                        has_default: p.default_value().is_some(),
                    })
                })
                .collect(),
            capabilities: output
                .capabilities()
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
            declared_transforms: output.declared_transforms().to_vec(),
        })
    }

    async fn describe_stack_events(
        &self,
        region: &str,
        stack: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StackEvent>> {
        let client = self.ctx.cloudformation(region);
        let mut events = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let request = client
                .describe_stack_events()
                .stack_name(stack)
                .set_next_token(next_token.take());
            let output = send(&self.limiter, || request.send())
                .await
                .with_context(|| format!("Failed to describe events of {stack}"))?;

            let mut reached_since = false;
            for e in output.stack_events() {
                let timestamp = e.timestamp().map(to_chrono).unwrap_or_default();
                if since.is_some_and(|since| timestamp < since) {
                    reached_since = true;
                    break;
                }
                events.push(StackEvent {
                    stack_id: e.stack_id().unwrap_or_default().to_string(),
                    logical_id: e.logical_resource_id().unwrap_or_default().to_string(),
                    physical_id: e.physical_resource_id().map(str::to_string),
                    resource_type: e.resource_type().unwrap_or_default().to_string(),
                    status: e
                        .resource_status()
                        .map(|s| s.as_str().to_string())
                        .unwrap_or_default(),
                    reason: e.resource_status_reason().map(str::to_string),
                    timestamp,
                });
            }

            match output.next_token() {
                Some(token) if !reached_since => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(events)
    }
}
