// Remediation Engine - Rust Edition
// Polls issue detectors and drives multi-step remediation workflows per tenant

//! # Remediation Engine Library
//!
//! This is the library root for the remediation engine. It polls an external
//! issue-detection API, matches detected issues to configured remediation
//! workflows, and executes each workflow's steps against third-party systems
//! (REST APIs, WinRM hosts, and Shared Signals receivers).
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`Integration`]: a configured third-party endpoint (and its circuit state)
//! - [`ActionDefinition`]: a reusable request template bound to one integration
//! - [`Workflow`]: an ordered list of [`WorkflowStep`]s fed by poller integrations
//! - [`Job`] / [`JobLog`]: one execution of a workflow against one issue
//!
//! ### Engine
//! - [`Scheduler`]: tick loop, due-poller selection and the bounded worker pool
//! - [`PollExecutor`]: fetches issues, matches workflows, advances the cursor
//! - [`WorkflowRunner`]: creates jobs and runs steps fail-fast
//! - [`RetentionSweeper`]: daily purge of old jobs
//!
//! ### Executor
//! [`HttpActionExecutor`] performs one action with retry, backoff, rate limiting,
//! circuit breaking and OAuth2 refresh. The runner only sees the
//! [`ActionExecutor`] trait, so tests swap in a double.
//!
//! ### Storage
//! [`RemediationStore`] is the persistence boundary. [`InMemoryStore`] backs tests
//! and [`PgStore`] backs production.
//!
//! ## Rust Learning Notes:
//!
//! ### Shared ownership
//! Every long-lived collaborator (store, executor, issue sources) is held as an
//! `Arc<dyn Trait>`. Worker tasks clone the `Arc`, never the underlying state.
//!
//! ### Re-exports
//! `pub use` statements flatten the API so callers can write
//! `use remediation_engine::Scheduler` instead of the full module path.

// Configuration loading (file + environment)
pub mod config;

// Core domain models
pub mod models;

// Scheduler, poller, runner, retention and storage
pub mod engine;

// Protocol handlers and reliability controls
pub mod executor;

// Issue source boundary and the HTTP detector client
pub mod sources;

// Credential vault and log redaction
pub mod security;

pub use config::EngineConfig;

pub use models::{
    ActionDefinition, AuthType, CircuitState, Credentials, Integration, Issue, IssueDetails,
    Job, JobLog, JobStatus, LogLevel, MessageTemplate, ProtocolKind, Severity, Tenant,
    TriggerContext, Workflow, WorkflowStep,
};

pub use engine::{
    postgres::PgStore,
    storage::{InMemoryStore, RemediationStore},
    PollExecutor, PollTask, RetentionSweeper, RunOutcome, Scheduler, WorkflowRunner,
};

pub use executor::{ActionError, ActionExecutor, ActionResponse, HttpActionExecutor};

pub use security::{redact, AesGcmVault, CredentialVault, PlaintextVault};

pub use sources::{DetectorConnector, IssueSource, IssueSourceConnector};

use thiserror::Error;

/// Errors raised by the engine outside of a single action attempt.
///
/// Action-level failures have their own type, [`ActionError`], because the
/// retry loop needs to inspect them (status codes, retryability). Everything
/// that reaches the runner or scheduler collapses into this enum.
#[derive(Error, Debug)]
pub enum RemediationError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing or malformed configuration (unknown protocol, missing credential key, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A job already exists for this (tenant, workflow, issue)
    #[error("Duplicate job for workflow {workflow_id} and issue {issue_id}")]
    DuplicateJob { workflow_id: i64, issue_id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Action failed: {0}")]
    Action(#[from] ActionError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for RemediationError {
    fn from(err: std::io::Error) -> Self {
        RemediationError::Internal(err.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, RemediationError>;
