// Remediation Engine
// Scheduling, polling, workflow execution and persistence

//! # Engine Module
//!
//! The engine turns detected issues into remediation jobs. It sits between
//! the domain models (`models/`) and the outside world (`executor/` for
//! actions, `sources/` for issue detection).
//!
//! ## Flow
//!
//! ```text
//! Scheduler tick ──► PollTask queue ──► worker ──► PollExecutor
//!                                                    │ fetch issues since cursor
//!                                                    │ match workflows
//!                                                    ▼
//!                                             WorkflowRunner ──► ActionExecutor
//!                                                    │
//!                                                    ▼
//!                                           Job + JobLog rows
//! ```
//!
//! ## Engine Components
//!
//! ### Storage (`storage`, `postgres`)
//! - [`storage::RemediationStore`] is the persistence contract
//! - [`storage::InMemoryStore`] backs tests and local runs
//! - [`postgres::PgStore`] backs production
//!
//! ### Scheduler (`scheduler`)
//! - Tick loop, per-poller due tracking, bounded queue and worker pool
//! - Daily retention sweep, stale job cleanup on start
//!
//! ### Poll execution (`poller`)
//! - Cursor handling and workflow matching for one poller
//!
//! ### Workflow runner (`runner`)
//! - Job idempotency, message templates, fail-fast step execution, reruns
//!
//! ### Retention (`retention`)
//! - Purges jobs older than the `data_retention_days` setting
//!
//! ## Rust Learning Notes:
//!
//! ### Bounded channels as back-pressure
//! The scheduler uses `try_send` on a bounded `mpsc` channel. A full queue is
//! reported immediately instead of blocking the tick, and the caller decides
//! what to do with the rejected task.
//!
//! ### Sharing a receiver
//! `mpsc::Receiver` has a single owner. Workers share it through
//! `Arc<Mutex<Receiver>>`; whoever holds the lock waits for the next task.

/// Storage abstraction layer
///
/// Contains:
/// - Storage trait definition
/// - In-memory storage implementation
pub mod storage;

/// PostgreSQL storage backend
pub mod postgres;

/// Workflow runner: jobs, steps and reruns
pub mod runner;

/// Single poll of one detector integration
pub mod poller;

/// Tick loop and worker pool
pub mod scheduler;

/// Data retention sweeper
pub mod retention;

pub use poller::{PollExecutor, PollSummary, PollTask};
pub use retention::RetentionSweeper;
pub use runner::{RunOutcome, WorkflowRunner};
pub use scheduler::{Scheduler, TickSummary};
pub use storage::{InMemoryStore, PurgeStats, RemediationStore};
