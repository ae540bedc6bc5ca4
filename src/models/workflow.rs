// Workflow definitions - flat, ordered remediation recipes

//! A workflow is a named, ordered list of steps per tenant. It is fed by one
//! or more poller integrations and triggered when an issue's type matches its
//! name (or the name is the [`WILDCARD_WORKFLOW`]) and the issue's severity
//! clears the workflow's threshold.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Id;

/// A workflow with this name matches every issue type.
pub const WILDCARD_WORKFLOW: &str = "All";

/// Four-level severity scale used for workflow thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    /// Map a label to its severity. Unknown labels count as `Low`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn ordinal(&self) -> i64 {
        *self as i64
    }
}

/// One step of a workflow: a pointer to an action definition plus
/// parameter overrides merged into the render context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Id,
    pub workflow_id: Id,
    /// Position in the workflow; steps run in ascending order
    pub order: i32,
    pub action_definition_id: Id,
    #[serde(default)]
    pub parameter_mapping: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Id,
    pub tenant_id: Id,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub trigger_type: String,
    /// Label such as "High"; compared by ordinal
    #[serde(default)]
    pub min_severity: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    /// Poller integrations that feed this workflow
    #[serde(default)]
    pub poller_ids: Vec<Id>,
}

impl Workflow {
    pub fn min_severity(&self) -> Severity {
        Severity::from_label(&self.min_severity)
    }

    /// Whether an issue of `issue_type` with severity ordinal `severity` triggers this workflow.
    pub fn matches(&self, issue_type: &str, severity: i64) -> bool {
        let type_matches = self.name == issue_type || self.name == WILDCARD_WORKFLOW;
        type_matches && severity >= self.min_severity().ordinal()
    }

    /// Steps sorted by their `order` field.
    pub fn ordered_steps(&self) -> Vec<&WorkflowStep> {
        let mut steps: Vec<&WorkflowStep> = self.steps.iter().collect();
        steps.sort_by_key(|step| step.order);
        steps
    }

    pub fn is_fed_by(&self, poller_id: Id) -> bool {
        self.poller_ids.contains(&poller_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(name: &str, min_severity: &str) -> Workflow {
        Workflow {
            id: 1,
            tenant_id: 1,
            name: name.to_string(),
            enabled: true,
            trigger_type: "issue".to_string(),
            min_severity: min_severity.to_string(),
            steps: vec![],
            poller_ids: vec![],
        }
    }

    #[test]
    fn severity_labels_map_to_ordinals() {
        assert_eq!(Severity::from_label("Critical").ordinal(), 4);
        assert_eq!(Severity::from_label("High").ordinal(), 3);
        assert_eq!(Severity::from_label("Medium").ordinal(), 2);
        assert_eq!(Severity::from_label("Low").ordinal(), 1);
        assert_eq!(Severity::from_label("whatever").ordinal(), 1);
        assert_eq!(Severity::from_label("").ordinal(), 1);
    }

    #[test]
    fn medium_issue_does_not_trigger_high_workflow() {
        assert!(!workflow("Weak Password", "High").matches("Weak Password", 2));
        assert!(workflow("Weak Password", "Medium").matches("Weak Password", 2));
        assert!(workflow("Weak Password", "Low").matches("Weak Password", 2));
    }

    #[test]
    fn wildcard_matches_any_type_but_keeps_severity_gate() {
        let all = workflow("All", "High");
        assert!(all.matches("Compromised User", 4));
        assert!(all.matches("Something New", 3));
        assert!(!all.matches("Something New", 1));
    }

    #[test]
    fn type_match_is_exact() {
        assert!(!workflow("Compromised User", "Low").matches("compromised user", 4));
    }

    #[test]
    fn steps_are_ordered() {
        let mut wf = workflow("Compromised User", "Low");
        for (id, order) in [(1, 3), (2, 1), (3, 2)] {
            wf.steps.push(WorkflowStep {
                id,
                workflow_id: 1,
                order,
                action_definition_id: id,
                parameter_mapping: Map::new(),
            });
        }
        let ids: Vec<i64> = wf.ordered_steps().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }
}
