//! Workflow execution.
//!
//! One run = one job row + its logs. Steps execute in ascending order and the
//! first failing step fails the job. Job logs are mirrored to `tracing` so an
//! operator tailing the process sees the same story as the UI.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::engine::storage::RemediationStore;
use crate::executor::ActionExecutor;
use crate::models::{
    Id, Job, JobStatus, LogLevel, MessageTemplate, NewJob, NewJobLog, TriggerContext, Workflow, WorkflowStep,
};
use crate::security::redact_str;
use crate::{RemediationError, Result};

const DEFAULT_LANGUAGE: &str = "en";

/// Result of asking the runner to execute a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A job for this (tenant, workflow, issue) already exists
    Duplicate,
    Completed { job_id: Id },
    Failed { job_id: Id },
}

impl RunOutcome {
    pub fn job_id(&self) -> Option<Id> {
        match self {
            RunOutcome::Duplicate => None,
            RunOutcome::Completed { job_id } | RunOutcome::Failed { job_id } => Some(*job_id),
        }
    }
}

/// Job suffix used when a manual rerun collides with the original job.
pub fn rerun_issue_id(issue_id: &str, now_millis: i64) -> String {
    format!("{}-rerun-{}", issue_id, now_millis)
}

/// Executes workflows against trigger contexts.
pub struct WorkflowRunner {
    store: Arc<dyn RemediationStore>,
    executor: Arc<dyn ActionExecutor>,
}

impl WorkflowRunner {
    pub fn new(store: Arc<dyn RemediationStore>, executor: Arc<dyn ActionExecutor>) -> Self {
        Self { store, executor }
    }

    /// Run `workflow` for the issue described by `context`.
    pub async fn run(&self, workflow: &Workflow, context: TriggerContext) -> Result<RunOutcome> {
        let tenant_id = workflow.tenant_id;
        let issue_id = context
            .issue_id()
            .ok_or_else(|| RemediationError::InvalidInput("trigger context has no IssueID".to_string()))?;
        let rerun = context.is_manual_rerun();

        if !rerun && self.store.job_exists(tenant_id, workflow.id, &issue_id).await? {
            debug!(
                tenant_id,
                "Job skipped: duplicate execution for workflow {} and issue {}", workflow.id, issue_id
            );
            return Ok(RunOutcome::Duplicate);
        }

        let job = match self.create_job(workflow, &issue_id, &context, rerun).await? {
            Some(job) => job,
            None => return Ok(RunOutcome::Duplicate),
        };

        info!(
            tenant_id,
            job_id = job.id,
            "Executing workflow '{}' for {} (issue {})",
            workflow.name,
            context.get(TriggerContext::USER_EMAIL).and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            issue_id
        );

        let messages = self.message_template(workflow, &context).await;
        let succeeded = self.run_steps(&job, workflow, &context, &messages).await;

        let status = if succeeded { JobStatus::Completed } else { JobStatus::Failed };
        match self.store.update_job_status(job.id, status).await {
            Ok(()) => info!(tenant_id, job_id = job.id, "Workflow '{}' finished: {}", workflow.name, status),
            Err(e) => error!(
                tenant_id,
                job_id = job.id,
                "Workflow '{}' finished ({}) but the job status could not be saved: {}",
                workflow.name,
                status,
                e
            ),
        }

        Ok(if succeeded {
            RunOutcome::Completed { job_id: job.id }
        } else {
            RunOutcome::Failed { job_id: job.id }
        })
    }

    /// Run a finished job's workflow again with its stored trigger context.
    pub async fn rerun_job(&self, tenant_id: Id, job_id: Id) -> Result<RunOutcome> {
        let job = self
            .store
            .get_job(tenant_id, job_id)
            .await?
            .ok_or_else(|| RemediationError::NotFound(format!("job {} for tenant {}", job_id, tenant_id)))?;
        let workflow = self
            .store
            .get_workflow(tenant_id, job.workflow_id)
            .await?
            .ok_or_else(|| RemediationError::NotFound(format!("workflow {} for tenant {}", job.workflow_id, tenant_id)))?;

        info!(tenant_id, job_id, "Manual rerun of workflow '{}'", workflow.name);

        let context = TriggerContext::for_rerun(job.trigger_context.as_ref(), tenant_id, &job.issue_id, Utc::now());
        self.run(&workflow, context).await
    }

    async fn create_job(
        &self,
        workflow: &Workflow,
        issue_id: &str,
        context: &TriggerContext,
        rerun: bool,
    ) -> Result<Option<Job>> {
        let new_job = NewJob {
            tenant_id: workflow.tenant_id,
            workflow_id: workflow.id,
            issue_id: issue_id.to_string(),
            trigger_context: Some(context.to_value()),
        };

        match self.store.create_job(new_job.clone()).await {
            Ok(job) => Ok(Some(job)),
            Err(RemediationError::DuplicateJob { .. }) if rerun => {
                let retry = NewJob {
                    issue_id: rerun_issue_id(issue_id, Utc::now().timestamp_millis()),
                    ..new_job
                };
                Ok(Some(self.store.create_job(retry).await?))
            }
            Err(RemediationError::DuplicateJob { .. }) => {
                debug!(tenant_id = workflow.tenant_id, "Job for issue {} created concurrently, skipping", issue_id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Tenant template for the issue type (or workflow name), falling back to English.
    async fn message_template(&self, workflow: &Workflow, context: &TriggerContext) -> MessageTemplate {
        let language = context.language().filter(|l| !l.is_empty()).unwrap_or(DEFAULT_LANGUAGE);
        let issue_type = context
            .issue_type()
            .filter(|t| !t.is_empty())
            .unwrap_or(&workflow.name);

        let mut languages = vec![language];
        if language != DEFAULT_LANGUAGE {
            languages.push(DEFAULT_LANGUAGE);
        }

        for language in languages {
            match self
                .store
                .find_message_template(workflow.tenant_id, issue_type, language)
                .await
            {
                Ok(Some(template)) => return template,
                Ok(None) => {}
                Err(e) => {
                    warn!(tenant_id = workflow.tenant_id, "Message template lookup failed: {}", e);
                    break;
                }
            }
        }
        MessageTemplate::default()
    }

    /// Returns whether every step succeeded (skipped steps count as success).
    async fn run_steps(
        &self,
        job: &Job,
        workflow: &Workflow,
        context: &TriggerContext,
        messages: &MessageTemplate,
    ) -> bool {
        let tenant_id = workflow.tenant_id;

        for step in workflow.ordered_steps() {
            let action = match self.store.get_action_definition(tenant_id, step.action_definition_id).await {
                Ok(Some(action)) => action,
                Ok(None) => {
                    self.log(NewJobLog::new(
                        job.id,
                        LogLevel::Error,
                        format!(
                            "Failed to find action definition {} for tenant {}",
                            step.action_definition_id, tenant_id
                        ),
                    ))
                    .await;
                    return false;
                }
                Err(e) => {
                    self.log(NewJobLog::new(
                        job.id,
                        LogLevel::Error,
                        format!("Failed to load action definition {}: {}", step.action_definition_id, e),
                    ))
                    .await;
                    return false;
                }
            };

            let integration = match self.store.get_integration(tenant_id, action.integration_id).await {
                Ok(Some(integration)) => integration,
                Ok(None) => {
                    self.log(NewJobLog::new(
                        job.id,
                        LogLevel::Error,
                        format!("Failed to find integration {} for tenant {}", action.integration_id, tenant_id),
                    ))
                    .await;
                    return false;
                }
                Err(e) => {
                    self.log(NewJobLog::new(
                        job.id,
                        LogLevel::Error,
                        format!("Failed to load integration {}: {}", action.integration_id, e),
                    ))
                    .await;
                    return false;
                }
            };

            if !integration.enabled {
                self.log(
                    NewJobLog::new(
                        job.id,
                        LogLevel::Warn,
                        format!("Integration {} is disabled, skipping step", integration.name),
                    )
                    .step(&action.name),
                )
                .await;
                continue;
            }

            let step_context = step_context(context, messages, step);

            match self.executor.execute(&integration, &action, &step_context).await {
                Ok(response) => {
                    let mut message = format!(
                        "Step {} ({}) completed successfully (Status: {})",
                        step.order,
                        action.name,
                        response.status_code.unwrap_or(0)
                    );
                    if !response.body.is_empty() {
                        message.push_str("\nResponse: ");
                        message.push_str(&response.pretty_body());
                    }
                    self.log(
                        NewJobLog::new(job.id, LogLevel::Info, message)
                            .step(&action.name)
                            .status(response.status_code),
                    )
                    .await;
                }
                Err(e) => {
                    self.log(
                        NewJobLog::new(
                            job.id,
                            LogLevel::Error,
                            format!(
                                "Step {} ({}) failed (Status: {}): {}",
                                step.order,
                                action.name,
                                e.status_code().unwrap_or(0),
                                e
                            ),
                        )
                        .step(&action.name)
                        .status(e.status_code())
                        .body(e.response_body().map(redact_str)),
                    )
                    .await;
                    return false;
                }
            }
        }
        true
    }

    /// Append a job log and mirror it to tracing. Storage failures are only traced.
    async fn log(&self, entry: NewJobLog) {
        match entry.level {
            LogLevel::Info => info!(job_id = entry.job_id, "{}", entry.message),
            LogLevel::Warn => warn!(job_id = entry.job_id, "{}", entry.message),
            LogLevel::Error => error!(job_id = entry.job_id, "{}", entry.message),
        }
        let job_id = entry.job_id;
        if let Err(e) = self.store.append_job_log(entry).await {
            error!(job_id, "Failed to persist job log: {}", e);
        }
    }
}

/// Trigger context, then message template fields, then the step's parameter mapping.
fn step_context(context: &TriggerContext, messages: &MessageTemplate, step: &WorkflowStep) -> Map<String, Value> {
    let mut merged = context.as_map().clone();
    merged.insert("Title".to_string(), Value::String(messages.title.clone()));
    merged.insert("Message".to_string(), Value::String(messages.message.clone()));
    merged.insert("Footer".to_string(), Value::String(messages.footer.clone()));
    for (key, value) in &step.parameter_mapping {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
