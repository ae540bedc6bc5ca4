//! One poll of one detector for one tenant.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::engine::runner::{RunOutcome, WorkflowRunner};
use crate::engine::storage::RemediationStore;
use crate::models::{Id, Integration, IssueDetails, TriggerContext, Workflow};
use crate::sources::IssueSourceConnector;
use crate::Result;

/// Initial cursor for a poller that has never run.
pub const INITIAL_CURSOR: &str = "0";

/// Unit of work handed from the scheduler to a worker.
#[derive(Debug, Clone)]
pub struct PollTask {
    pub tenant_id: Id,
    pub poller: Integration,
    pub workflows: Vec<Workflow>,
}

/// Counters for one completed poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub issues: usize,
    pub matched: usize,
    pub jobs: usize,
}

pub struct PollExecutor {
    store: Arc<dyn RemediationStore>,
    sources: Arc<dyn IssueSourceConnector>,
    runner: Arc<WorkflowRunner>,
}

impl PollExecutor {
    pub fn new(
        store: Arc<dyn RemediationStore>,
        sources: Arc<dyn IssueSourceConnector>,
        runner: Arc<WorkflowRunner>,
    ) -> Self {
        Self { store, sources, runner }
    }

    /// Fetch new issues since the stored cursor and run every matching workflow.
    ///
    /// The cursor advances past every issue seen, matched or not, so an issue
    /// is never fetched twice by the same poller.
    pub async fn run(&self, task: PollTask) -> Result<PollSummary> {
        let tenant_id = task.tenant_id;
        let poller = &task.poller;
        let source = self.sources.connect(poller)?;

        let cursor = match self.store.get_cursor(tenant_id, poller.id).await? {
            Some(cursor) => cursor,
            None => {
                self.store.put_cursor(tenant_id, poller.id, INITIAL_CURSOR).await?;
                INITIAL_CURSOR.to_string()
            }
        };

        let issues = source.fetch_issues(None, &cursor).await?;
        let mut summary = PollSummary {
            issues: issues.len(),
            ..PollSummary::default()
        };
        if issues.is_empty() {
            debug!(tenant_id, integration = %poller.name, "No new issues after {}", cursor);
            return Ok(summary);
        }
        info!(tenant_id, integration = %poller.name, "Processing {} new issue(s)", issues.len());

        for issue in issues {
            let matching: Vec<&Workflow> = task
                .workflows
                .iter()
                .filter(|wf| wf.matches(&issue.issue_type, issue.severity))
                .collect();

            if !matching.is_empty() {
                summary.matched += 1;
                let identity = issue.identity();
                let details = match source.fetch_issue_detail(&issue.issue_id).await {
                    Ok(details) => details,
                    Err(e) => {
                        warn!(tenant_id, "Failed to fetch details for issue {}: {}", issue.issue_id, e);
                        IssueDetails::unavailable()
                    }
                };
                let context = TriggerContext::from_issue(tenant_id, &issue, &identity, &details, Utc::now());

                for workflow in matching {
                    match self.runner.run(workflow, context.clone()).await {
                        Ok(RunOutcome::Duplicate) => {}
                        Ok(_) => summary.jobs += 1,
                        Err(e) => error!(
                            tenant_id,
                            "Workflow '{}' failed for issue {}: {}", workflow.name, issue.issue_id, e
                        ),
                    }
                }
            }

            if let Err(e) = self.store.record_processed_event(tenant_id, &issue.issue_id).await {
                warn!(tenant_id, "Failed to record processed event {}: {}", issue.issue_id, e);
            }
            self.store.put_cursor(tenant_id, poller.id, &issue.issue_id).await?;
        }

        Ok(summary)
    }
}
