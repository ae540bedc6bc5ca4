use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Id;

/// Isolation boundary. Every other entity carries a `tenant_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Id,
    pub name: String,
    /// Soft delete marker; deleted tenants are never scheduled
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Tenant {
    pub fn new(id: Id, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            deleted_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}
