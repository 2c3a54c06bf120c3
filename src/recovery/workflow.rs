use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::executor::ActionRegistry;
use super::issues::IssueType;
use crate::state_machine::PipelineState;

/// Shared key/value context threaded through a workflow's actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecoveryContext {
    values: serde_json::Map<String, serde_json::Value>,
}

impl RecoveryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.insert(key, value);
        self
    }

    /// Later values win
    pub fn merge(&mut self, other: RecoveryContext) {
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::Value::Object(self.values)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOrigin {
    Catalog,
    Synthesized,
}

/// Ordered remedy for one failure classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub actions: Vec<Action>,
    pub success_state: PipelineState,
    pub failure_state: PipelineState,
    #[serde(default = "default_origin")]
    pub origin: WorkflowOrigin,
}

fn default_origin() -> WorkflowOrigin {
    WorkflowOrigin::Catalog
}

impl Workflow {
    pub fn new(
        name: impl Into<String>,
        actions: Vec<Action>,
        success_state: PipelineState,
        failure_state: PipelineState,
    ) -> Self {
        Self {
            name: name.into(),
            actions,
            success_state,
            failure_state,
            origin: WorkflowOrigin::Catalog,
        }
    }

    pub fn synthesized(mut self) -> Self {
        self.origin = WorkflowOrigin::Synthesized;
        self
    }

    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(|action| action.name.as_str())
    }
}

/// One workflow per issue type, built once at startup
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<IssueType, Workflow>,
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder::default()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, issue_type: IssueType) -> Option<&Workflow> {
        self.workflows.get(&issue_type)
    }

    pub fn contains(&self, issue_type: IssueType) -> bool {
        self.workflows.contains_key(&issue_type)
    }

    /// Install or replace the workflow for `issue_type`; returns the previous entry
    pub fn install(&mut self, issue_type: IssueType, workflow: Workflow) -> Option<Workflow> {
        info!(
            issue_type = %issue_type,
            workflow = %workflow.name,
            origin = ?workflow.origin,
            actions = workflow.actions.len(),
            "Installing recovery workflow"
        );
        self.workflows.insert(issue_type, workflow)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IssueType, &Workflow)> {
        self.workflows.iter()
    }

    /// Issue types whose workflow references an action missing from `actions`
    pub fn validate_actions(&self, actions: &ActionRegistry) -> Vec<(IssueType, String)> {
        let mut missing = Vec::new();
        for (issue_type, workflow) in &self.workflows {
            for name in workflow.action_names() {
                if !actions.contains(name) {
                    missing.push((*issue_type, name.to_string()));
                }
            }
        }
        if !missing.is_empty() {
            warn!(count = missing.len(), "Workflows reference unregistered actions");
        }
        missing
    }
}

#[derive(Debug, Default)]
pub struct WorkflowRegistryBuilder {
    workflows: BTreeMap<IssueType, Workflow>,
}

impl WorkflowRegistryBuilder {
    pub fn workflow(mut self, issue_type: IssueType, workflow: Workflow) -> Self {
        self.workflows.insert(issue_type, workflow);
        self
    }

    pub fn extend(mut self, workflows: impl IntoIterator<Item = (IssueType, Workflow)>) -> Self {
        self.workflows.extend(workflows);
        self
    }

    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            workflows: self.workflows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn restart_workflow() -> Workflow {
        Workflow::new(
            "restart",
            vec![Action::new("restart_stage").with_param("graceful", json!(true))],
            PipelineState::Running,
            PipelineState::Critical,
        )
    }

    #[test]
    fn builder_keeps_last_entry_per_issue() {
        let replacement = Workflow::new(
            "replacement",
            vec![Action::new("notify_operator")],
            PipelineState::Healthy,
            PipelineState::Failed,
        );
        let registry = WorkflowRegistry::builder()
            .workflow(IssueType::StageCrash, restart_workflow())
            .workflow(IssueType::StageCrash, replacement.clone())
            .build();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(IssueType::StageCrash), Some(&replacement));
    }

    #[test]
    fn install_returns_previous_entry() {
        let mut registry = WorkflowRegistry::empty();
        assert!(registry.install(IssueType::StageCrash, restart_workflow()).is_none());

        let previous = registry
            .install(IssueType::StageCrash, restart_workflow().synthesized())
            .unwrap();
        assert_eq!(previous.origin, WorkflowOrigin::Catalog);
        assert_eq!(
            registry.get(IssueType::StageCrash).unwrap().origin,
            WorkflowOrigin::Synthesized
        );
    }

    #[test]
    fn context_merge_prefers_newer_values() {
        let mut context = RecoveryContext::new().with("attempt", json!(1)).with("stage", json!("tests"));
        context.merge(RecoveryContext::new().with("attempt", json!(2)));

        assert_eq!(context.get("attempt"), Some(&json!(2)));
        assert_eq!(context.len(), 2);
    }

    #[test]
    fn workflow_serializes_states_by_name() {
        let value = serde_json::to_value(restart_workflow()).unwrap();
        assert_eq!(value["success_state"], json!("RUNNING"));
        assert_eq!(value["origin"], json!("catalog"));
        assert_eq!(value["actions"][0]["params"]["graceful"], json!(true));
    }
}
