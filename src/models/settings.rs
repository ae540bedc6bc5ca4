//! Small per-tenant records: message templates, settings, cursors and
//! processed-event counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Id;

/// System setting holding the job retention window in days.
pub const DATA_RETENTION_DAYS: &str = "data_retention_days";

/// Localized notification text merged into every step's render context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub tenant_id: Id,
    pub issue_type: String,
    pub language: String,
    pub title: String,
    pub message: String,
    pub footer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSetting {
    pub key: String,
    pub value: String,
}

/// Throughput counter row; nothing in the engine reads these back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub tenant_id: Id,
    pub issue_id: String,
    pub processed_at: DateTime<Utc>,
}

/// State-store key holding the polling cursor for a tenant's poller.
pub fn cursor_key(tenant_id: Id, poller_id: Id) -> String {
    format!("last_id_t{}_i{}", tenant_id, poller_id)
}
