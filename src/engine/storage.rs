// Storage abstraction for the remediation engine
// This defines the persistence contract the scheduler, runner and executor depend on

//! # Storage Abstraction Layer
//!
//! The engine never talks to a database directly. Everything goes through the
//! [`RemediationStore`] trait, which has two implementations:
//! - [`InMemoryStore`]: tests and single-process demos
//! - [`PgStore`](super::postgres::PgStore): production, backed by sqlx/Postgres
//!
//! ## Contract highlights
//!
//! - Every tenant-owned lookup takes the tenant id. A step must never resolve
//!   another tenant's action definition even if the numeric id collides.
//! - `create_job` enforces `(tenant, workflow, issue)` uniqueness and reports a
//!   violation as [`RemediationError::DuplicateJob`]. The runner depends on
//!   this for de-duplication under concurrent polls.
//! - Circuit-breaker counters and the OAuth token cache are only written by
//!   the dedicated methods below; `upsert_integration` preserves them.
//! - Credentials cross this boundary in plaintext. Encryption at rest is the
//!   backend's job (see [`CredentialVault`](crate::security::CredentialVault)).
//!
//! ## Rust Learning Notes:
//!
//! ### One lock, many maps
//! `InMemoryStore` keeps all tables in a single `tokio::sync::RwLock`. A
//! check-then-insert (job uniqueness) happens under one write guard, so two
//! concurrent runners cannot both pass the check.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::{
    cursor_key, ActionDefinition, CircuitState, Id, Integration, Job, JobLog, JobStatus,
    MessageTemplate, NewJob, NewJobLog, ProcessedEvent, Tenant, Workflow,
};
use crate::{RemediationError, Result};

/// Rows removed by a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub jobs: u64,
    pub logs: u64,
}

/// Persistence contract consumed by the engine.
#[async_trait::async_trait]
pub trait RemediationStore: Send + Sync {
    // Tenants

    /// Active (not soft-deleted) tenants.
    async fn list_tenants(&self) -> Result<Vec<Tenant>>;

    async fn upsert_tenant(&self, tenant: Tenant) -> Result<Tenant>;

    // Integrations

    /// Enabled integrations of a tenant whose name contains `marker`.
    async fn list_pollers(&self, tenant_id: Id, marker: &str) -> Result<Vec<Integration>>;

    async fn get_integration(&self, tenant_id: Id, id: Id) -> Result<Option<Integration>>;

    /// Create or update an integration. Circuit and OAuth cache fields of an
    /// existing row are never overwritten from the payload.
    async fn upsert_integration(&self, integration: Integration) -> Result<Integration>;

    /// Fresh circuit state, read straight from storage.
    async fn circuit_state(&self, integration_id: Id) -> Result<CircuitState>;

    /// Count one exhausted execution; opens the circuit at `threshold`.
    async fn record_circuit_failure(&self, integration_id: Id, threshold: i32) -> Result<CircuitState>;

    /// Zero the failure counter and mark the integration available.
    async fn reset_circuit(&self, integration_id: Id) -> Result<()>;

    async fn save_oauth_token(&self, integration_id: Id, token: &str, expires_at: Option<DateTime<Utc>>) -> Result<()>;

    // Actions and workflows

    async fn get_action_definition(&self, tenant_id: Id, id: Id) -> Result<Option<ActionDefinition>>;

    async fn upsert_action_definition(&self, definition: ActionDefinition) -> Result<ActionDefinition>;

    /// Enabled workflows of the tenant associated with the poller, steps included.
    async fn workflows_for_poller(&self, tenant_id: Id, poller_id: Id) -> Result<Vec<Workflow>>;

    async fn get_workflow(&self, tenant_id: Id, id: Id) -> Result<Option<Workflow>>;

    /// Save a workflow with its steps and poller associations as one unit.
    async fn save_workflow(&self, workflow: Workflow) -> Result<Workflow>;

    // Jobs

    async fn job_exists(&self, tenant_id: Id, workflow_id: Id, issue_id: &str) -> Result<bool>;

    /// Insert a running job. Fails with `DuplicateJob` on a uniqueness violation.
    async fn create_job(&self, job: NewJob) -> Result<Job>;

    async fn get_job(&self, tenant_id: Id, id: Id) -> Result<Option<Job>>;

    async fn list_jobs(&self, tenant_id: Id) -> Result<Vec<Job>>;

    async fn update_job_status(&self, id: Id, status: JobStatus) -> Result<()>;

    /// Mark every job still `running` as `failed`; returns how many changed.
    async fn fail_running_jobs(&self) -> Result<u64>;

    async fn append_job_log(&self, log: NewJobLog) -> Result<()>;

    async fn job_logs(&self, job_id: Id) -> Result<Vec<JobLog>>;

    /// Delete logs of jobs created before `cutoff`, then the jobs.
    async fn purge_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeStats>;

    /// Reclaim space after a purge.
    async fn compact(&self) -> Result<()>;

    // Cursor, templates, settings, metrics

    async fn get_cursor(&self, tenant_id: Id, poller_id: Id) -> Result<Option<String>>;

    async fn put_cursor(&self, tenant_id: Id, poller_id: Id, value: &str) -> Result<()>;

    async fn find_message_template(&self, tenant_id: Id, issue_type: &str, language: &str) -> Result<Option<MessageTemplate>>;

    async fn put_message_template(&self, template: MessageTemplate) -> Result<()>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    async fn record_processed_event(&self, tenant_id: Id, issue_id: &str) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    next_id: Id,
    tenants: BTreeMap<Id, Tenant>,
    integrations: BTreeMap<Id, Integration>,
    actions: BTreeMap<Id, ActionDefinition>,
    workflows: BTreeMap<Id, Workflow>,
    jobs: BTreeMap<Id, Job>,
    job_logs: Vec<JobLog>,
    state: HashMap<String, String>,
    templates: Vec<MessageTemplate>,
    settings: HashMap<String, String>,
    processed: Vec<ProcessedEvent>,
}

impl MemoryState {
    fn allocate(&mut self, requested: Id) -> Id {
        if requested > 0 {
            self.next_id = self.next_id.max(requested);
            return requested;
        }
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory store for tests and demos.
///
/// Ids passed in (`id > 0`) are kept; zero ids get the next free value.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of processed-event rows recorded for a tenant.
    pub async fn processed_event_count(&self, tenant_id: Id) -> usize {
        let state = self.inner.read().await;
        state.processed.iter().filter(|e| e.tenant_id == tenant_id).count()
    }

    /// Rewrite a job's creation time; used to exercise retention.
    pub async fn set_job_created_at(&self, job_id: Id, created_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.inner.write().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| RemediationError::NotFound(format!("job {}", job_id)))?;
        job.created_at = created_at;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemediationStore for InMemoryStore {
    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let state = self.inner.read().await;
        Ok(state.tenants.values().filter(|t| t.is_active()).cloned().collect())
    }

    async fn upsert_tenant(&self, mut tenant: Tenant) -> Result<Tenant> {
        let mut state = self.inner.write().await;
        tenant.id = state.allocate(tenant.id);
        state.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn list_pollers(&self, tenant_id: Id, marker: &str) -> Result<Vec<Integration>> {
        let state = self.inner.read().await;
        Ok(state
            .integrations
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.enabled && i.is_poller(marker))
            .cloned()
            .collect())
    }

    async fn get_integration(&self, tenant_id: Id, id: Id) -> Result<Option<Integration>> {
        let state = self.inner.read().await;
        Ok(state
            .integrations
            .get(&id)
            .filter(|i| i.tenant_id == tenant_id)
            .cloned())
    }

    async fn upsert_integration(&self, mut integration: Integration) -> Result<Integration> {
        let mut state = self.inner.write().await;

        let name_taken = state.integrations.values().any(|other| {
            other.tenant_id == integration.tenant_id
                && other.name == integration.name
                && other.id != integration.id
        });
        if name_taken {
            return Err(RemediationError::InvalidInput(format!(
                "integration '{}' already exists for tenant {}",
                integration.name, integration.tenant_id
            )));
        }

        match state.integrations.get(&integration.id).cloned() {
            Some(existing) => {
                integration.consecutive_failures = existing.consecutive_failures;
                integration.is_available = existing.is_available;
                integration.oauth_token = existing.oauth_token;
                integration.oauth_token_expires_at = existing.oauth_token_expires_at;
            }
            None => integration.id = state.allocate(integration.id),
        }

        state.integrations.insert(integration.id, integration.clone());
        Ok(integration)
    }

    async fn circuit_state(&self, integration_id: Id) -> Result<CircuitState> {
        let state = self.inner.read().await;
        state
            .integrations
            .get(&integration_id)
            .map(Integration::circuit)
            .ok_or_else(|| RemediationError::NotFound(format!("integration {}", integration_id)))
    }

    async fn record_circuit_failure(&self, integration_id: Id, threshold: i32) -> Result<CircuitState> {
        let mut state = self.inner.write().await;
        let integration = state
            .integrations
            .get_mut(&integration_id)
            .ok_or_else(|| RemediationError::NotFound(format!("integration {}", integration_id)))?;
        integration.consecutive_failures += 1;
        if integration.consecutive_failures >= threshold {
            integration.is_available = false;
        }
        Ok(integration.circuit())
    }

    async fn reset_circuit(&self, integration_id: Id) -> Result<()> {
        let mut state = self.inner.write().await;
        let integration = state
            .integrations
            .get_mut(&integration_id)
            .ok_or_else(|| RemediationError::NotFound(format!("integration {}", integration_id)))?;
        integration.consecutive_failures = 0;
        integration.is_available = true;
        Ok(())
    }

    async fn save_oauth_token(&self, integration_id: Id, token: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut state = self.inner.write().await;
        let integration = state
            .integrations
            .get_mut(&integration_id)
            .ok_or_else(|| RemediationError::NotFound(format!("integration {}", integration_id)))?;
        integration.oauth_token = Some(token.to_string());
        integration.oauth_token_expires_at = expires_at;
        Ok(())
    }

    async fn get_action_definition(&self, tenant_id: Id, id: Id) -> Result<Option<ActionDefinition>> {
        let state = self.inner.read().await;
        Ok(state.actions.get(&id).filter(|a| a.tenant_id == tenant_id).cloned())
    }

    async fn upsert_action_definition(&self, mut definition: ActionDefinition) -> Result<ActionDefinition> {
        let mut state = self.inner.write().await;
        definition.id = state.allocate(definition.id);
        state.actions.insert(definition.id, definition.clone());
        Ok(definition)
    }

    async fn workflows_for_poller(&self, tenant_id: Id, poller_id: Id) -> Result<Vec<Workflow>> {
        let state = self.inner.read().await;
        Ok(state
            .workflows
            .values()
            .filter(|w| w.tenant_id == tenant_id && w.enabled && w.is_fed_by(poller_id))
            .cloned()
            .collect())
    }

    async fn get_workflow(&self, tenant_id: Id, id: Id) -> Result<Option<Workflow>> {
        let state = self.inner.read().await;
        Ok(state.workflows.get(&id).filter(|w| w.tenant_id == tenant_id).cloned())
    }

    async fn save_workflow(&self, mut workflow: Workflow) -> Result<Workflow> {
        let mut state = self.inner.write().await;
        workflow.id = state.allocate(workflow.id);
        for step in workflow.steps.iter_mut() {
            step.id = state.allocate(step.id);
            step.workflow_id = workflow.id;
        }
        state.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn job_exists(&self, tenant_id: Id, workflow_id: Id, issue_id: &str) -> Result<bool> {
        let state = self.inner.read().await;
        Ok(state.jobs.values().any(|j| {
            j.tenant_id == tenant_id && j.workflow_id == workflow_id && j.issue_id == issue_id
        }))
    }

    async fn create_job(&self, job: NewJob) -> Result<Job> {
        let mut state = self.inner.write().await;
        let duplicate = state.jobs.values().any(|j| {
            j.tenant_id == job.tenant_id && j.workflow_id == job.workflow_id && j.issue_id == job.issue_id
        });
        if duplicate {
            return Err(RemediationError::DuplicateJob {
                workflow_id: job.workflow_id,
                issue_id: job.issue_id,
            });
        }

        let now = Utc::now();
        let created = Job {
            id: state.allocate(0),
            tenant_id: job.tenant_id,
            workflow_id: job.workflow_id,
            status: JobStatus::Running,
            issue_id: job.issue_id,
            trigger_context: job.trigger_context,
            created_at: now,
            updated_at: now,
        };
        state.jobs.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_job(&self, tenant_id: Id, id: Id) -> Result<Option<Job>> {
        let state = self.inner.read().await;
        Ok(state.jobs.get(&id).filter(|j| j.tenant_id == tenant_id).cloned())
    }

    async fn list_jobs(&self, tenant_id: Id) -> Result<Vec<Job>> {
        let state = self.inner.read().await;
        Ok(state.jobs.values().filter(|j| j.tenant_id == tenant_id).cloned().collect())
    }

    async fn update_job_status(&self, id: Id, status: JobStatus) -> Result<()> {
        let mut state = self.inner.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| RemediationError::NotFound(format!("job {}", id)))?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_running_jobs(&self) -> Result<u64> {
        let mut state = self.inner.write().await;
        let now = Utc::now();
        let mut changed = 0;
        for job in state.jobs.values_mut().filter(|j| j.status == JobStatus::Running) {
            job.status = JobStatus::Failed;
            job.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn append_job_log(&self, log: NewJobLog) -> Result<()> {
        let mut state = self.inner.write().await;
        let id = state.allocate(0);
        state.job_logs.push(JobLog {
            id,
            job_id: log.job_id,
            level: log.level,
            message: log.message,
            step_name: log.step_name,
            status_code: log.status_code,
            response_body: log.response_body,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn job_logs(&self, job_id: Id) -> Result<Vec<JobLog>> {
        let state = self.inner.read().await;
        Ok(state.job_logs.iter().filter(|l| l.job_id == job_id).cloned().collect())
    }

    async fn purge_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeStats> {
        let mut state = self.inner.write().await;
        let expired: Vec<Id> = state
            .jobs
            .values()
            .filter(|j| j.created_at < cutoff)
            .map(|j| j.id)
            .collect();

        let logs_before = state.job_logs.len();
        state.job_logs.retain(|l| !expired.contains(&l.job_id));
        let logs = (logs_before - state.job_logs.len()) as u64;

        for id in &expired {
            state.jobs.remove(id);
        }

        Ok(PurgeStats {
            jobs: expired.len() as u64,
            logs,
        })
    }

    async fn compact(&self) -> Result<()> {
        let mut state = self.inner.write().await;
        state.job_logs.shrink_to_fit();
        Ok(())
    }

    async fn get_cursor(&self, tenant_id: Id, poller_id: Id) -> Result<Option<String>> {
        let state = self.inner.read().await;
        Ok(state.state.get(&cursor_key(tenant_id, poller_id)).cloned())
    }

    async fn put_cursor(&self, tenant_id: Id, poller_id: Id, value: &str) -> Result<()> {
        let mut state = self.inner.write().await;
        state.state.insert(cursor_key(tenant_id, poller_id), value.to_string());
        Ok(())
    }

    async fn find_message_template(&self, tenant_id: Id, issue_type: &str, language: &str) -> Result<Option<MessageTemplate>> {
        let state = self.inner.read().await;
        Ok(state
            .templates
            .iter()
            .find(|t| t.tenant_id == tenant_id && t.issue_type == issue_type && t.language == language)
            .cloned())
    }

    async fn put_message_template(&self, template: MessageTemplate) -> Result<()> {
        let mut state = self.inner.write().await;
        state.templates.retain(|t| {
            !(t.tenant_id == template.tenant_id
                && t.issue_type == template.issue_type
                && t.language == template.language)
        });
        state.templates.push(template);
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let state = self.inner.read().await;
        Ok(state.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.inner.write().await;
        state.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn record_processed_event(&self, tenant_id: Id, issue_id: &str) -> Result<()> {
        let mut state = self.inner.write().await;
        state.processed.push(ProcessedEvent {
            tenant_id,
            issue_id: issue_id.to_string(),
            processed_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LogLevel, ProtocolKind};
    use chrono::Duration;

    fn new_job(issue_id: &str) -> NewJob {
        NewJob {
            tenant_id: 1,
            workflow_id: 10,
            issue_id: issue_id.to_string(),
            trigger_context: None,
        }
    }

    #[tokio::test]
    async fn job_uniqueness_is_enforced() {
        let store = InMemoryStore::new();
        store.create_job(new_job("999")).await.unwrap();

        let err = store.create_job(new_job("999")).await.unwrap_err();
        assert!(matches!(err, RemediationError::DuplicateJob { .. }));
        assert!(store.job_exists(1, 10, "999").await.unwrap());
        assert!(!store.job_exists(2, 10, "999").await.unwrap());

        let mut other_tenant = new_job("999");
        other_tenant.tenant_id = 2;
        assert!(store.create_job(other_tenant).await.is_ok());
    }

    #[tokio::test]
    async fn upsert_preserves_circuit_and_token_fields() {
        let store = InMemoryStore::new();
        let integration = store
            .upsert_integration(Integration::new(0, 1, "Okta", ProtocolKind::Rest, "https://okta.test"))
            .await
            .unwrap();

        store.record_circuit_failure(integration.id, 2).await.unwrap();
        let tripped = store.record_circuit_failure(integration.id, 2).await.unwrap();
        assert!(tripped.is_open());
        store.save_oauth_token(integration.id, "cached", None).await.unwrap();

        let mut update = integration.clone();
        update.base_url = "https://okta2.test".to_string();
        update.consecutive_failures = 0;
        update.is_available = true;
        update.oauth_token = None;
        store.upsert_integration(update).await.unwrap();

        let stored = store.get_integration(1, integration.id).await.unwrap().unwrap();
        assert_eq!(stored.base_url, "https://okta2.test");
        assert_eq!(stored.consecutive_failures, 2);
        assert!(!stored.is_available);
        assert_eq!(stored.oauth_token.as_deref(), Some("cached"));

        store.reset_circuit(integration.id).await.unwrap();
        assert_eq!(store.circuit_state(integration.id).await.unwrap(), CircuitState::default());
    }

    #[tokio::test]
    async fn integration_names_are_unique_per_tenant() {
        let store = InMemoryStore::new();
        store
            .upsert_integration(Integration::new(0, 1, "Okta", ProtocolKind::Rest, "https://a.test"))
            .await
            .unwrap();
        assert!(store
            .upsert_integration(Integration::new(0, 1, "Okta", ProtocolKind::Rest, "https://b.test"))
            .await
            .is_err());
        assert!(store
            .upsert_integration(Integration::new(0, 2, "Okta", ProtocolKind::Rest, "https://b.test"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn lookups_are_tenant_scoped() {
        let store = InMemoryStore::new();
        let integration = store
            .upsert_integration(Integration::new(0, 1, "Okta", ProtocolKind::Rest, "https://okta.test"))
            .await
            .unwrap();
        assert!(store.get_integration(2, integration.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_removes_old_jobs_and_their_logs() {
        let store = InMemoryStore::new();
        let old = store.create_job(new_job("1")).await.unwrap();
        let recent = store.create_job(new_job("2")).await.unwrap();
        store.append_job_log(NewJobLog::new(old.id, LogLevel::Info, "old")).await.unwrap();
        store.append_job_log(NewJobLog::new(recent.id, LogLevel::Info, "new")).await.unwrap();
        store
            .set_job_created_at(old.id, Utc::now() - Duration::days(40))
            .await
            .unwrap();

        let stats = store.purge_jobs_before(Utc::now() - Duration::days(30)).await.unwrap();
        assert_eq!(stats, PurgeStats { jobs: 1, logs: 1 });
        assert!(store.get_job(1, old.id).await.unwrap().is_none());
        assert_eq!(store.job_logs(recent.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_running_jobs_are_failed() {
        let store = InMemoryStore::new();
        let running = store.create_job(new_job("1")).await.unwrap();
        let done = store.create_job(new_job("2")).await.unwrap();
        store.update_job_status(done.id, JobStatus::Completed).await.unwrap();

        assert_eq!(store.fail_running_jobs().await.unwrap(), 1);
        assert_eq!(store.get_job(1, running.id).await.unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(store.get_job(1, done.id).await.unwrap().unwrap().status, JobStatus::Completed);
    }
}
