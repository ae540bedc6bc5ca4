// Core domain models for the remediation engine

//! # Domain Models Module
//!
//! Plain data types shared by the scheduler, runner, executor and storage
//! backends. Everything here is `Serialize + Deserialize` so the same types
//! flow through the Postgres store, the in-memory store and job context
//! snapshots without separate DTOs.
//!
//! - [`tenant`]: the isolation boundary
//! - [`integration`]: third-party endpoints, protocol/auth kinds, credentials, circuit state
//! - [`action`]: request templates bound to an integration
//! - [`workflow`]: ordered remediation steps and severity thresholds
//! - [`job`]: executions and their append-only logs
//! - [`issue`]: detector payloads and the trigger context built from them
//! - [`settings`]: message templates, system settings, cursors, processed events

pub mod action;
pub mod integration;
pub mod issue;
pub mod job;
pub mod settings;
pub mod tenant;
pub mod workflow;

pub use action::ActionDefinition;
pub use integration::{AuthType, CircuitState, Credentials, Integration, MissingCredential, ProtocolKind};
pub use issue::{Issue, IssueDetailItem, IssueDetails, TriggerContext};
pub use job::{Job, JobLog, JobStatus, LogLevel, NewJob, NewJobLog};
pub use settings::{cursor_key, MessageTemplate, ProcessedEvent, SystemSetting, DATA_RETENTION_DAYS};
pub use tenant::Tenant;
pub use workflow::{Severity, Workflow, WorkflowStep, WILDCARD_WORKFLOW};

/// Database identifiers are `BIGSERIAL` columns.
pub type Id = i64;
