use serde::{Deserialize, Serialize};

use super::Id;

/// A reusable request template bound to one integration.
///
/// `path_template` and `body_template` are rendered against the step context.
/// For WinRM integrations the body is the PowerShell script; for SSF it must
/// render to a `{"subject": ..., "events": ...}` JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub id: Id,
    pub tenant_id: Id,
    pub integration_id: Id,
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub path_template: String,
    #[serde(default)]
    pub body_template: String,
    /// Non-positive values fall back to the executor's default retry count
    #[serde(default = "default_retry_count")]
    pub retry_count: i32,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_retry_count() -> i32 {
    3
}

impl ActionDefinition {
    /// Number of attempts the executor will make for this action.
    pub fn attempts(&self, default_retries: u32) -> u32 {
        let retries = if self.retry_count <= 0 {
            default_retries
        } else {
            self.retry_count as u32
        };
        retries + 1
    }
}
