//! PostgreSQL storage backend.
//!
//! Uses the runtime query API (no compile-time checked macros) so the crate
//! builds without a live database. Credentials pass through the configured
//! [`CredentialVault`] on every load and save; the rest of the engine only
//! sees plaintext maps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Executor, FromRow, PgPool};
use tracing::{debug, info, warn};

use super::storage::{PurgeStats, RemediationStore};
use crate::config::DatabaseConfig;
use crate::models::{
    cursor_key, ActionDefinition, CircuitState, Credentials, Id, Integration, Job, JobLog,
    JobStatus, MessageTemplate, NewJob, NewJobLog, Tenant, Workflow, WorkflowStep,
};
use crate::security::CredentialVault;
use crate::{RemediationError, Result};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// `ILIKE` pattern matching `marker` anywhere, with wildcards in the marker taken literally.
fn contains_pattern(marker: &str) -> String {
    let mut pattern = String::with_capacity(marker.len() + 2);
    pattern.push('%');
    for c in marker.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Decode poller rows, dropping the ones that cannot be read.
fn decode_pollers(rows: Vec<IntegrationRow>, vault: &dyn CredentialVault) -> Vec<Integration> {
    rows.into_iter()
        .filter_map(|row| {
            let (id, tenant_id) = (row.id, row.tenant_id);
            match row.into_model(vault) {
                Ok(integration) => Some(integration),
                Err(e) => {
                    warn!(tenant_id, integration_id = id, "Skipping unreadable poller: {}", e);
                    None
                }
            }
        })
        .collect()
}

#[derive(FromRow)]
struct TenantRow {
    id: i64,
    name: String,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Tenant {
            id: row.id,
            name: row.name,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(FromRow)]
struct IntegrationRow {
    id: i64,
    tenant_id: i64,
    name: String,
    protocol: String,
    base_url: String,
    auth_type: String,
    credentials: String,
    enabled: bool,
    polling_interval: i64,
    rate_limit: f64,
    token_endpoint: Option<String>,
    oauth_token: Option<String>,
    oauth_token_expires_at: Option<DateTime<Utc>>,
    consecutive_failures: i32,
    is_available: bool,
}

impl IntegrationRow {
    fn into_model(self, vault: &dyn CredentialVault) -> Result<Integration> {
        let protocol = self.protocol.parse().map_err(|e| {
            RemediationError::Configuration(format!("integration {} ({}): {}", self.id, self.name, e))
        })?;
        let auth_type = self.auth_type.parse().map_err(|e| {
            RemediationError::Configuration(format!("integration {} ({}): {}", self.id, self.name, e))
        })?;
        let plaintext = vault.decrypt(&self.credentials)?;
        let credentials = Credentials::from_json_str(&plaintext).map_err(|e| {
            RemediationError::Configuration(format!(
                "integration {} ({}): credentials are not a JSON object: {}",
                self.id, self.name, e
            ))
        })?;

        Ok(Integration {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            protocol,
            base_url: self.base_url,
            auth_type,
            credentials,
            enabled: self.enabled,
            polling_interval_secs: self.polling_interval,
            rate_limit: self.rate_limit,
            token_endpoint: self.token_endpoint,
            oauth_token: self.oauth_token,
            oauth_token_expires_at: self.oauth_token_expires_at,
            consecutive_failures: self.consecutive_failures,
            is_available: self.is_available,
        })
    }
}

#[derive(FromRow)]
struct ActionRow {
    id: i64,
    tenant_id: i64,
    integration_id: i64,
    name: String,
    method: String,
    path_template: String,
    body_template: String,
    retry_count: i32,
}

impl From<ActionRow> for ActionDefinition {
    fn from(row: ActionRow) -> Self {
        ActionDefinition {
            id: row.id,
            tenant_id: row.tenant_id,
            integration_id: row.integration_id,
            name: row.name,
            method: row.method,
            path_template: row.path_template,
            body_template: row.body_template,
            retry_count: row.retry_count,
        }
    }
}

#[derive(FromRow)]
struct WorkflowRow {
    id: i64,
    tenant_id: i64,
    name: String,
    enabled: bool,
    trigger_type: String,
    min_severity: String,
}

#[derive(FromRow)]
struct StepRow {
    id: i64,
    workflow_id: i64,
    step_order: i32,
    action_definition_id: i64,
    parameter_mapping: Json<Value>,
}

impl From<StepRow> for WorkflowStep {
    fn from(row: StepRow) -> Self {
        let parameter_mapping = match row.parameter_mapping.0 {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        WorkflowStep {
            id: row.id,
            workflow_id: row.workflow_id,
            order: row.step_order,
            action_definition_id: row.action_definition_id,
            parameter_mapping,
        }
    }
}

#[derive(FromRow)]
struct PollerLinkRow {
    workflow_id: i64,
    integration_id: i64,
}

#[derive(FromRow)]
struct JobRow {
    id: i64,
    tenant_id: i64,
    workflow_id: i64,
    status: String,
    issue_id: String,
    trigger_context: Option<Json<Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = RemediationError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            tenant_id: row.tenant_id,
            workflow_id: row.workflow_id,
            status: row.status.parse().map_err(RemediationError::Internal)?,
            issue_id: row.issue_id,
            trigger_context: row.trigger_context.map(|json| json.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct JobLogRow {
    id: i64,
    job_id: i64,
    level: String,
    message: String,
    step_name: Option<String>,
    status_code: Option<i32>,
    response_body: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobLogRow> for JobLog {
    type Error = RemediationError;

    fn try_from(row: JobLogRow) -> Result<Self> {
        Ok(JobLog {
            id: row.id,
            job_id: row.job_id,
            level: row.level.parse().map_err(RemediationError::Internal)?,
            message: row.message,
            step_name: row.step_name,
            status_code: row.status_code,
            response_body: row.response_body,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct TemplateRow {
    tenant_id: i64,
    issue_type: String,
    language: String,
    title: String,
    message: String,
    footer: String,
}

/// Row counts shown by the admin CLI.
#[derive(Debug, Clone, Default, FromRow)]
pub struct StoreStats {
    pub tenants: i64,
    pub integrations: i64,
    pub open_circuits: i64,
    pub workflows: i64,
    pub running_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub processed_events: i64,
}

const INTEGRATION_COLUMNS: &str = "id, tenant_id, name, protocol, base_url, auth_type, credentials, enabled, \
     polling_interval, rate_limit, token_endpoint, oauth_token, oauth_token_expires_at, \
     consecutive_failures, is_available";

const JOB_COLUMNS: &str =
    "id, tenant_id, workflow_id, status, issue_id, trigger_context, created_at, updated_at";

/// Postgres-backed [`RemediationStore`].
pub struct PgStore {
    pool: PgPool,
    vault: Arc<dyn CredentialVault>,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig, vault: Arc<dyn CredentialVault>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.url)
            .await?;
        info!("Connected to Postgres ({} max connections)", config.max_connections);
        Ok(Self { pool, vault })
    }

    pub fn from_pool(pool: PgPool, vault: Arc<dyn CredentialVault>) -> Self {
        Self { pool, vault }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        self.pool.execute(SCHEMA).await?;
        debug!("Schema is up to date");
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let stats = sqlx::query_as::<_, StoreStats>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM tenants WHERE deleted_at IS NULL) AS tenants,
                (SELECT COUNT(*) FROM integrations) AS integrations,
                (SELECT COUNT(*) FROM integrations WHERE NOT is_available) AS open_circuits,
                (SELECT COUNT(*) FROM workflows) AS workflows,
                (SELECT COUNT(*) FROM jobs WHERE status = 'running') AS running_jobs,
                (SELECT COUNT(*) FROM jobs WHERE status = 'completed') AS completed_jobs,
                (SELECT COUNT(*) FROM jobs WHERE status = 'failed') AS failed_jobs,
                (SELECT COUNT(*) FROM processed_events) AS processed_events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn load_integration(&self, id: Id) -> Result<Option<Integration>> {
        let row = sqlx::query_as::<_, IntegrationRow>(&format!(
            "SELECT {} FROM integrations WHERE id = $1",
            INTEGRATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_model(self.vault.as_ref())).transpose()
    }

    /// Attach steps and poller links to workflow rows.
    async fn hydrate_workflows(&self, rows: Vec<WorkflowRow>) -> Result<Vec<Workflow>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();

        let steps = sqlx::query_as::<_, StepRow>(
            "SELECT id, workflow_id, step_order, action_definition_id, parameter_mapping \
             FROM workflow_steps WHERE workflow_id = ANY($1) ORDER BY workflow_id, step_order",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let links = sqlx::query_as::<_, PollerLinkRow>(
            "SELECT workflow_id, integration_id FROM workflow_pollers WHERE workflow_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut workflows: Vec<Workflow> = rows
            .into_iter()
            .map(|row| Workflow {
                id: row.id,
                tenant_id: row.tenant_id,
                name: row.name,
                enabled: row.enabled,
                trigger_type: row.trigger_type,
                min_severity: row.min_severity,
                steps: Vec::new(),
                poller_ids: Vec::new(),
            })
            .collect();

        for step in steps {
            if let Some(wf) = workflows.iter_mut().find(|w| w.id == step.workflow_id) {
                wf.steps.push(step.into());
            }
        }
        for link in links {
            if let Some(wf) = workflows.iter_mut().find(|w| w.id == link.workflow_id) {
                wf.poller_ids.push(link.integration_id);
            }
        }
        Ok(workflows)
    }
}

#[async_trait::async_trait]
impl RemediationStore for PgStore {
    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query_as::<_, TenantRow>(
            "SELECT id, name, deleted_at FROM tenants WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Tenant::from).collect())
    }

    async fn upsert_tenant(&self, tenant: Tenant) -> Result<Tenant> {
        let row = if tenant.id > 0 {
            sqlx::query_as::<_, TenantRow>(
                "INSERT INTO tenants (id, name, deleted_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, deleted_at = EXCLUDED.deleted_at \
                 RETURNING id, name, deleted_at",
            )
            .bind(tenant.id)
            .bind(&tenant.name)
            .bind(tenant.deleted_at)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, TenantRow>(
                "INSERT INTO tenants (name, deleted_at) VALUES ($1, $2) RETURNING id, name, deleted_at",
            )
            .bind(&tenant.name)
            .bind(tenant.deleted_at)
            .fetch_one(&self.pool)
            .await?
        };
        Ok(row.into())
    }

    async fn list_pollers(&self, tenant_id: Id, marker: &str) -> Result<Vec<Integration>> {
        let rows = sqlx::query_as::<_, IntegrationRow>(&format!(
            "SELECT {} FROM integrations WHERE tenant_id = $1 AND enabled AND name ILIKE $2 ESCAPE '\\' ORDER BY id",
            INTEGRATION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(contains_pattern(marker))
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_pollers(rows, self.vault.as_ref()))
    }

    async fn get_integration(&self, tenant_id: Id, id: Id) -> Result<Option<Integration>> {
        let row = sqlx::query_as::<_, IntegrationRow>(&format!(
            "SELECT {} FROM integrations WHERE id = $1 AND tenant_id = $2",
            INTEGRATION_COLUMNS
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_model(self.vault.as_ref())).transpose()
    }

    async fn upsert_integration(&self, integration: Integration) -> Result<Integration> {
        let credentials = self.vault.encrypt(&integration.credentials.to_json_string()?)?;

        // Circuit and OAuth cache columns are owned by the executor and never updated here
        let result = if integration.id > 0 {
            sqlx::query_scalar::<_, i64>(
                "UPDATE integrations SET name = $3, protocol = $4, base_url = $5, auth_type = $6, \
                 credentials = $7, enabled = $8, polling_interval = $9, rate_limit = $10, token_endpoint = $11 \
                 WHERE id = $1 AND tenant_id = $2 RETURNING id",
            )
            .bind(integration.id)
            .bind(integration.tenant_id)
            .bind(&integration.name)
            .bind(integration.protocol.as_str())
            .bind(&integration.base_url)
            .bind(integration.auth_type.as_str())
            .bind(&credentials)
            .bind(integration.enabled)
            .bind(integration.polling_interval_secs)
            .bind(integration.rate_limit)
            .bind(&integration.token_endpoint)
            .fetch_optional(&self.pool)
            .await
        } else {
            sqlx::query_scalar::<_, i64>(
                "INSERT INTO integrations (tenant_id, name, protocol, base_url, auth_type, credentials, \
                 enabled, polling_interval, rate_limit, token_endpoint) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
            )
            .bind(integration.tenant_id)
            .bind(&integration.name)
            .bind(integration.protocol.as_str())
            .bind(&integration.base_url)
            .bind(integration.auth_type.as_str())
            .bind(&credentials)
            .bind(integration.enabled)
            .bind(integration.polling_interval_secs)
            .bind(integration.rate_limit)
            .bind(&integration.token_endpoint)
            .fetch_optional(&self.pool)
            .await
        };

        let id = match result {
            Ok(Some(id)) => id,
            Ok(None) => {
                return Err(RemediationError::NotFound(format!(
                    "integration {} for tenant {}",
                    integration.id, integration.tenant_id
                )))
            }
            Err(e) if is_unique_violation(&e) => {
                return Err(RemediationError::InvalidInput(format!(
                    "integration '{}' already exists for tenant {}",
                    integration.name, integration.tenant_id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        self.load_integration(id)
            .await?
            .ok_or_else(|| RemediationError::NotFound(format!("integration {}", id)))
    }

    async fn circuit_state(&self, integration_id: Id) -> Result<CircuitState> {
        let row: Option<(i32, bool)> = sqlx::query_as(
            "SELECT consecutive_failures, is_available FROM integrations WHERE id = $1",
        )
        .bind(integration_id)
        .fetch_optional(&self.pool)
        .await?;
        let (consecutive_failures, is_available) =
            row.ok_or_else(|| RemediationError::NotFound(format!("integration {}", integration_id)))?;
        Ok(CircuitState {
            consecutive_failures,
            is_available,
        })
    }

    async fn record_circuit_failure(&self, integration_id: Id, threshold: i32) -> Result<CircuitState> {
        let row: Option<(i32, bool)> = sqlx::query_as(
            "UPDATE integrations SET consecutive_failures = consecutive_failures + 1, \
             is_available = CASE WHEN consecutive_failures + 1 >= $2 THEN FALSE ELSE is_available END \
             WHERE id = $1 RETURNING consecutive_failures, is_available",
        )
        .bind(integration_id)
        .bind(threshold)
        .fetch_optional(&self.pool)
        .await?;
        let (consecutive_failures, is_available) =
            row.ok_or_else(|| RemediationError::NotFound(format!("integration {}", integration_id)))?;
        Ok(CircuitState {
            consecutive_failures,
            is_available,
        })
    }

    async fn reset_circuit(&self, integration_id: Id) -> Result<()> {
        let result = sqlx::query(
            "UPDATE integrations SET consecutive_failures = 0, is_available = TRUE WHERE id = $1",
        )
        .bind(integration_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RemediationError::NotFound(format!("integration {}", integration_id)));
        }
        Ok(())
    }

    async fn save_oauth_token(&self, integration_id: Id, token: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE integrations SET oauth_token = $2, oauth_token_expires_at = $3 WHERE id = $1")
            .bind(integration_id)
            .bind(token)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_action_definition(&self, tenant_id: Id, id: Id) -> Result<Option<ActionDefinition>> {
        let row = sqlx::query_as::<_, ActionRow>(
            "SELECT id, tenant_id, integration_id, name, method, path_template, body_template, retry_count \
             FROM action_definitions WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ActionDefinition::from))
    }

    async fn upsert_action_definition(&self, definition: ActionDefinition) -> Result<ActionDefinition> {
        let row = if definition.id > 0 {
            sqlx::query_as::<_, ActionRow>(
                "UPDATE action_definitions SET integration_id = $3, name = $4, method = $5, \
                 path_template = $6, body_template = $7, retry_count = $8 \
                 WHERE id = $1 AND tenant_id = $2 \
                 RETURNING id, tenant_id, integration_id, name, method, path_template, body_template, retry_count",
            )
            .bind(definition.id)
            .bind(definition.tenant_id)
        } else {
            sqlx::query_as::<_, ActionRow>(
                "INSERT INTO action_definitions (tenant_id, integration_id, name, method, path_template, \
                 body_template, retry_count) VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 RETURNING id, tenant_id, integration_id, name, method, path_template, body_template, retry_count",
            )
            .bind(definition.tenant_id)
        }
        .bind(definition.integration_id)
        .bind(&definition.name)
        .bind(&definition.method)
        .bind(&definition.path_template)
        .bind(&definition.body_template)
        .bind(definition.retry_count)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ActionDefinition::from)
            .ok_or_else(|| RemediationError::NotFound(format!("action definition {}", definition.id)))
    }

    async fn workflows_for_poller(&self, tenant_id: Id, poller_id: Id) -> Result<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT w.id, w.tenant_id, w.name, w.enabled, w.trigger_type, w.min_severity \
             FROM workflows w JOIN workflow_pollers wp ON wp.workflow_id = w.id \
             WHERE w.tenant_id = $1 AND wp.integration_id = $2 AND w.enabled ORDER BY w.id",
        )
        .bind(tenant_id)
        .bind(poller_id)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_workflows(rows).await
    }

    async fn get_workflow(&self, tenant_id: Id, id: Id) -> Result<Option<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT id, tenant_id, name, enabled, trigger_type, min_severity \
             FROM workflows WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.hydrate_workflows(rows).await?.into_iter().next())
    }

    async fn save_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        let mut tx = self.pool.begin().await?;

        let workflow_id: i64 = if workflow.id > 0 {
            sqlx::query_scalar(
                "UPDATE workflows SET name = $3, enabled = $4, trigger_type = $5, min_severity = $6 \
                 WHERE id = $1 AND tenant_id = $2 RETURNING id",
            )
            .bind(workflow.id)
            .bind(workflow.tenant_id)
            .bind(&workflow.name)
            .bind(workflow.enabled)
            .bind(&workflow.trigger_type)
            .bind(&workflow.min_severity)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RemediationError::NotFound(format!("workflow {}", workflow.id)))?
        } else {
            sqlx::query_scalar(
                "INSERT INTO workflows (tenant_id, name, enabled, trigger_type, min_severity) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
            )
            .bind(workflow.tenant_id)
            .bind(&workflow.name)
            .bind(workflow.enabled)
            .bind(&workflow.trigger_type)
            .bind(&workflow.min_severity)
            .fetch_one(&mut *tx)
            .await?
        };

        sqlx::query("DELETE FROM workflow_steps WHERE workflow_id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        for step in &workflow.steps {
            sqlx::query(
                "INSERT INTO workflow_steps (workflow_id, step_order, action_definition_id, parameter_mapping) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(workflow_id)
            .bind(step.order)
            .bind(step.action_definition_id)
            .bind(Json(Value::Object(step.parameter_mapping.clone())))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM workflow_pollers WHERE workflow_id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        for poller_id in &workflow.poller_ids {
            sqlx::query("INSERT INTO workflow_pollers (workflow_id, integration_id) VALUES ($1, $2)")
                .bind(workflow_id)
                .bind(poller_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        self.get_workflow(workflow.tenant_id, workflow_id)
            .await?
            .ok_or_else(|| RemediationError::NotFound(format!("workflow {}", workflow_id)))
    }

    async fn job_exists(&self, tenant_id: Id, workflow_id: Id, issue_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM jobs WHERE tenant_id = $1 AND workflow_id = $2 AND issue_id = $3)",
        )
        .bind(tenant_id)
        .bind(workflow_id)
        .bind(issue_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_job(&self, job: NewJob) -> Result<Job> {
        let result = sqlx::query_as::<_, JobRow>(&format!(
            "INSERT INTO jobs (tenant_id, workflow_id, status, issue_id, trigger_context) \
             VALUES ($1, $2, 'running', $3, $4) RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(job.tenant_id)
        .bind(job.workflow_id)
        .bind(&job.issue_id)
        .bind(job.trigger_context.clone().map(Json))
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => row.try_into(),
            Err(e) if is_unique_violation(&e) => Err(RemediationError::DuplicateJob {
                workflow_id: job.workflow_id,
                issue_id: job.issue_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, tenant_id: Id, id: Id) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = $1 AND tenant_id = $2",
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, tenant_id: Id) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE tenant_id = $1 ORDER BY id DESC",
            JOB_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn update_job_status(&self, id: Id, status: JobStatus) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_running_jobs(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE jobs SET status = 'failed', updated_at = now() WHERE status = 'running'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_job_log(&self, log: NewJobLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_logs (job_id, level, message, step_name, status_code, response_body) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(log.job_id)
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(&log.step_name)
        .bind(log.status_code)
        .bind(&log.response_body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_logs(&self, job_id: Id) -> Result<Vec<JobLog>> {
        let rows = sqlx::query_as::<_, JobLogRow>(
            "SELECT id, job_id, level, message, step_name, status_code, response_body, created_at \
             FROM job_logs WHERE job_id = $1 ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobLog::try_from).collect()
    }

    async fn purge_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeStats> {
        let mut tx = self.pool.begin().await?;

        let logs = sqlx::query(
            "DELETE FROM job_logs WHERE job_id IN (SELECT id FROM jobs WHERE created_at < $1)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let jobs = sqlx::query("DELETE FROM jobs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(PurgeStats { jobs, logs })
    }

    async fn compact(&self) -> Result<()> {
        // VACUUM cannot run inside a transaction; the simple query protocol keeps it standalone
        self.pool.execute("VACUUM job_logs, jobs").await?;
        Ok(())
    }

    async fn get_cursor(&self, tenant_id: Id, poller_id: Id) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM state_store WHERE key = $1")
            .bind(cursor_key(tenant_id, poller_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put_cursor(&self, tenant_id: Id, poller_id: Id, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO state_store (key, tenant_id, value) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(cursor_key(tenant_id, poller_id))
        .bind(tenant_id)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_message_template(&self, tenant_id: Id, issue_type: &str, language: &str) -> Result<Option<MessageTemplate>> {
        let row = sqlx::query_as::<_, TemplateRow>(
            "SELECT tenant_id, issue_type, language, title, message, footer FROM message_templates \
             WHERE tenant_id = $1 AND issue_type = $2 AND language = $3",
        )
        .bind(tenant_id)
        .bind(issue_type)
        .bind(language)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| MessageTemplate {
            tenant_id: r.tenant_id,
            issue_type: r.issue_type,
            language: r.language,
            title: r.title,
            message: r.message,
            footer: r.footer,
        }))
    }

    async fn put_message_template(&self, template: MessageTemplate) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_templates (tenant_id, issue_type, language, title, message, footer) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (tenant_id, issue_type, language) \
             DO UPDATE SET title = EXCLUDED.title, message = EXCLUDED.message, footer = EXCLUDED.footer",
        )
        .bind(template.tenant_id)
        .bind(&template.issue_type)
        .bind(&template.language)
        .bind(&template.title)
        .bind(&template.message)
        .bind(&template.footer)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM system_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_settings (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_processed_event(&self, tenant_id: Id, issue_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO processed_events (tenant_id, issue_id) VALUES ($1, $2)")
            .bind(tenant_id)
            .bind(issue_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProtocolKind;
    use crate::security::PlaintextVault;

    fn row(id: i64, name: &str, protocol: &str) -> IntegrationRow {
        IntegrationRow {
            id,
            tenant_id: 1,
            name: name.to_string(),
            protocol: protocol.to_string(),
            base_url: "https://detector.test".to_string(),
            auth_type: "bearer".to_string(),
            credentials: r#"{"token":"t"}"#.to_string(),
            enabled: true,
            polling_interval: 60,
            rate_limit: 0.0,
            token_endpoint: None,
            oauth_token: None,
            oauth_token_expires_at: None,
            consecutive_failures: 0,
            is_available: true,
        }
    }

    #[test]
    fn marker_wildcards_are_literal() {
        assert_eq!(contains_pattern("Detector"), "%Detector%");
        assert_eq!(contains_pattern("50%_off"), "%50\\%\\_off%");
        assert_eq!(contains_pattern(r"a\b"), r"%a\\b%");
    }

    #[test]
    fn unreadable_poller_rows_are_skipped() {
        let mut broken = row(2, "Broken Detector", "REST");
        broken.credentials = "not json".to_string();
        let rows = vec![row(1, "Primary Detector", "REST"), broken, row(3, "Legacy Detector", "GOPHER")];

        let pollers = decode_pollers(rows, &PlaintextVault);
        assert_eq!(pollers.len(), 1);
        assert_eq!(pollers[0].id, 1);
        assert_eq!(pollers[0].protocol, ProtocolKind::Rest);
    }
}
