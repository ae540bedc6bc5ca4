//! Detector payloads and the trigger context built from them.
//!
//! The trigger context is the only data handed from the poller to the
//! runner. Its keys are part of the template contract (action bodies refer
//! to `{{ UserEmail }}`, `{{ IssueID }}`, ...), so they are fixed strings
//! rather than struct fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use super::workflow::Severity;
use super::Id;

/// Issue-key candidates for the identity label, in priority order.
pub const IDENTITY_KEYS: [&str; 4] = ["identity_name", "user_email", "username", "email"];

/// Identity label used when no candidate key carries a value.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// One issue as returned by the detector's issue listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(deserialize_with = "string_or_number")]
    pub issue_id: String,
    #[serde(default)]
    pub issue_type: String,
    /// Four-level ordinal; labels are accepted and mapped
    #[serde(default, deserialize_with = "severity_ordinal")]
    pub severity: i64,
    #[serde(default)]
    pub risk: Value,
    #[serde(default)]
    pub issue_keys: Map<String, Value>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub issue_time: String,
    #[serde(default)]
    pub playbook_name: String,
    #[serde(default)]
    pub flow_count: i64,
    #[serde(default)]
    pub incident_count: i64,
    #[serde(default)]
    pub incidents_url: String,
}

impl Issue {
    pub fn new(issue_id: impl Into<String>, issue_type: impl Into<String>, severity: i64) -> Self {
        Self {
            issue_id: issue_id.into(),
            issue_type: issue_type.into(),
            severity,
            risk: Value::Null,
            issue_keys: Map::new(),
            message: String::new(),
            issue_time: String::new(),
            playbook_name: String::new(),
            flow_count: 0,
            incident_count: 0,
            incidents_url: String::new(),
        }
    }

    /// First non-empty string among the identity candidate keys.
    pub fn identity(&self) -> String {
        IDENTITY_KEYS
            .iter()
            .filter_map(|key| self.issue_keys.get(*key).and_then(Value::as_str))
            .find(|value| !value.is_empty())
            .unwrap_or(UNKNOWN_IDENTITY)
            .to_string()
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

fn severity_ordinal<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64().unwrap_or(Severity::Low.ordinal()),
        Value::String(s) => match s.parse::<i64>() {
            Ok(n) => n,
            Err(_) => Severity::from_label(&s).ordinal(),
        },
        _ => Severity::Low.ordinal(),
    })
}

/// Enrichment record for one issue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueDetails {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub results: Vec<IssueDetailItem>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueDetailItem {
    #[serde(default)]
    pub first_seen: String,
    #[serde(default)]
    pub last_seen: String,
    #[serde(default)]
    pub risk: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub issue_type: String,
    #[serde(default)]
    pub issue_keys: Map<String, Value>,
    #[serde(default)]
    pub incidents_url: String,
    #[serde(default)]
    pub total_flow_count: i64,
    #[serde(default)]
    pub total_incident_count: i64,
    #[serde(default)]
    pub incidents: Vec<Value>,
}

impl IssueDetails {
    /// Substitute used when detail enrichment fails.
    pub fn unavailable() -> Self {
        Self {
            success: false,
            results: vec![IssueDetailItem {
                message: "Details unavailable (API Error)".to_string(),
                risk: "Unknown".to_string(),
                ..Default::default()
            }],
            metadata: Map::new(),
        }
    }

    pub fn summary(&self) -> &str {
        self.results.first().map(|r| r.message.as_str()).unwrap_or("")
    }

    pub fn risk_score(&self) -> &str {
        self.results.first().map(|r| r.risk.as_str()).unwrap_or("")
    }

    /// Serialized form exposed to templates, with `summary` and `risk_score` shortcuts.
    pub fn to_context_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut value {
            map.insert("summary".to_string(), Value::String(self.summary().to_string()));
            map.insert("risk_score".to_string(), Value::String(self.risk_score().to_string()));
        }
        value
    }
}

/// Execution context handed to the workflow runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerContext(Map<String, Value>);

impl TriggerContext {
    pub const TENANT_ID: &'static str = "TenantID";
    pub const ISSUE_ID: &'static str = "IssueID";
    pub const ISSUE_TYPE: &'static str = "IssueType";
    pub const USER_EMAIL: &'static str = "UserEmail";
    pub const TIMESTAMP: &'static str = "Timestamp";
    pub const LANGUAGE: &'static str = "Language";
    pub const MANUAL_RERUN: &'static str = "ManualRerun";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build the context for one matched issue.
    pub fn from_issue(tenant_id: Id, issue: &Issue, identity: &str, details: &IssueDetails, now: DateTime<Utc>) -> Self {
        let mut map = Map::new();
        map.insert(Self::TENANT_ID.into(), json!(tenant_id));
        map.insert(Self::ISSUE_ID.into(), json!(issue.issue_id));
        map.insert(Self::USER_EMAIL.into(), json!(identity));
        map.insert(Self::TIMESTAMP.into(), json!(now.to_rfc3339()));
        map.insert("Severity".into(), json!(issue.severity));
        map.insert("Risk".into(), issue.risk.clone());
        map.insert("PlaybookName".into(), json!(issue.playbook_name));
        map.insert("IssueMessage".into(), json!(issue.message));
        map.insert("FlowCount".into(), json!(issue.flow_count));
        map.insert("IncidentCount".into(), json!(issue.incident_count));
        map.insert("IncidentsURL".into(), json!(issue.incidents_url));
        map.insert("Details".into(), details.to_context_value());
        map.insert(Self::ISSUE_TYPE.into(), json!(issue.issue_type));
        map.insert("IssueKeys".into(), Value::Object(issue.issue_keys.clone()));
        map.insert("FirstSeen".into(), json!(issue.issue_time));
        Self(map)
    }

    /// Context for a manual rerun: the stored snapshot when it parses, a
    /// minimal stand-in otherwise, stamped with a fresh timestamp and the rerun flag.
    pub fn for_rerun(stored: Option<&Value>, tenant_id: Id, issue_id: &str, now: DateTime<Utc>) -> Self {
        let mut ctx = match stored {
            Some(Value::Object(map)) => Self(map.clone()),
            _ => {
                let mut map = Map::new();
                map.insert(Self::ISSUE_ID.into(), json!(issue_id));
                map.insert(Self::USER_EMAIL.into(), json!("rerun-task@example.com"));
                Self(map)
            }
        };
        ctx.insert(Self::TENANT_ID, json!(tenant_id));
        ctx.insert(Self::TIMESTAMP, json!(now.to_rfc3339()));
        ctx.insert(Self::MANUAL_RERUN, Value::Bool(true));
        ctx
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn tenant_id(&self) -> Option<Id> {
        match self.0.get(Self::TENANT_ID)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn issue_id(&self) -> Option<String> {
        match self.0.get(Self::ISSUE_ID)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn issue_type(&self) -> Option<&str> {
        self.0.get(Self::ISSUE_TYPE).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn language(&self) -> Option<&str> {
        self.0.get(Self::LANGUAGE).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn is_manual_rerun(&self) -> bool {
        matches!(self.0.get(Self::MANUAL_RERUN), Some(Value::Bool(true)))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}
