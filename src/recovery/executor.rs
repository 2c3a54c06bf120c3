use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::issues::IssueType;
use super::workflow::{Action, RecoveryContext, Workflow, WorkflowOrigin, WorkflowRegistry};

/// Failure reported by an action handler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("action failed: {0}")]
    Failed(String),

    #[error("action timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },

    #[error("action cancelled")]
    Cancelled,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Workflow '{workflow}' references unknown action '{action}'")]
    UnknownAction { workflow: String, action: String },
}

/// Executes one named recovery action. Supplied by the embedding application.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run the action; on success return the (possibly enriched) context.
    async fn execute(
        &self,
        action: &Action,
        context: RecoveryContext,
    ) -> Result<RecoveryContext, ActionError>;
}

/// Handlers resolved by action name
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("ActionRegistry").field("actions", &names).finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn with_handler(mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.register(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Observability record for one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionRecord {
    pub execution_id: String,
    pub issue_type: IssueType,
    pub workflow: String,
    pub origin: WorkflowOrigin,
    pub success: bool,
    pub actions_executed: usize,
    pub failed_action: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Result of running a workflow's action list
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub success: bool,
    pub context: RecoveryContext,
    pub record: WorkflowExecutionRecord,
}

/// Runs workflows fail-fast and keeps an append-only execution history
#[derive(Debug)]
pub struct WorkflowExecutor {
    actions: ActionRegistry,
    action_timeout: Option<Duration>,
    history: Vec<WorkflowExecutionRecord>,
}

impl WorkflowExecutor {
    pub fn new(actions: ActionRegistry) -> Self {
        Self {
            actions,
            action_timeout: None,
            history: Vec::new(),
        }
    }

    pub fn with_action_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn history(&self) -> &[WorkflowExecutionRecord] {
        &self.history
    }

    /// Run the registered workflow for `issue_type`.
    ///
    /// `Ok(false)` when nothing is registered; deciding whether to synthesize
    /// one is the caller's business.
    pub async fn execute_workflow(
        &mut self,
        registry: &WorkflowRegistry,
        issue_type: IssueType,
        context: RecoveryContext,
    ) -> Result<bool, ExecutionError> {
        let Some(workflow) = registry.get(issue_type) else {
            debug!(issue_type = %issue_type, "No registered workflow");
            return Ok(false);
        };
        let run = self.run(issue_type, workflow, context).await?;
        Ok(run.success)
    }

    /// Run `workflow`'s actions strictly in order; the first failure aborts the rest.
    pub async fn run(
        &mut self,
        issue_type: IssueType,
        workflow: &Workflow,
        context: RecoveryContext,
    ) -> Result<WorkflowRun, ExecutionError> {
        // Resolve everything up front so a misconfigured workflow runs nothing
        let mut handlers = Vec::with_capacity(workflow.actions.len());
        for action in &workflow.actions {
            match self.actions.get(&action.name) {
                Some(handler) => handlers.push(handler),
                None => {
                    error!(
                        issue_type = %issue_type,
                        workflow = %workflow.name,
                        action = %action.name,
                        "Workflow references an unregistered action"
                    );
                    return Err(ExecutionError::UnknownAction {
                        workflow: workflow.name.clone(),
                        action: action.name.clone(),
                    });
                }
            }
        }

        let execution_id = format!("recovery-{}-{}", Utc::now().timestamp(), rand::random::<u16>());
        let started_at = Utc::now();
        let start_instant = std::time::Instant::now();

        info!(
            execution_id = %execution_id,
            issue_type = %issue_type,
            workflow = %workflow.name,
            origin = ?workflow.origin,
            actions = workflow.actions.len(),
            "Starting recovery workflow"
        );

        let mut context = context;
        let mut actions_executed = 0;
        let mut failed_action = None;
        let mut failure = None;

        for (action, handler) in workflow.actions.iter().zip(handlers) {
            actions_executed += 1;
            match self.invoke(handler.as_ref(), action, context.clone()).await {
                Ok(enriched) => {
                    debug!(execution_id = %execution_id, action = %action.name, "Action succeeded");
                    context = enriched;
                }
                Err(e) => {
                    warn!(
                        execution_id = %execution_id,
                        action = %action.name,
                        error = %e,
                        "Action failed, aborting workflow"
                    );
                    failed_action = Some(action.name.clone());
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        let success = failure.is_none();
        let completed_at = Utc::now().max(started_at);
        let record = WorkflowExecutionRecord {
            execution_id,
            issue_type,
            workflow: workflow.name.clone(),
            origin: workflow.origin,
            success,
            actions_executed,
            failed_action,
            error: failure,
            started_at,
            completed_at,
            duration_ms: start_instant.elapsed().as_millis() as u64,
        };

        info!(
            execution_id = %record.execution_id,
            workflow = %record.workflow,
            success = record.success,
            actions_executed = record.actions_executed,
            duration_ms = record.duration_ms,
            "Recovery workflow finished"
        );

        self.history.push(record.clone());

        Ok(WorkflowRun {
            success,
            context,
            record,
        })
    }

    async fn invoke(
        &self,
        handler: &dyn ActionHandler,
        action: &Action,
        context: RecoveryContext,
    ) -> Result<RecoveryContext, ActionError> {
        match self.action_timeout {
            Some(limit) => match tokio::time::timeout(limit, handler.execute(action, context)).await {
                Ok(result) => result,
                Err(_) => Err(ActionError::TimedOut {
                    after_ms: limit.as_millis() as u64,
                }),
            },
            None => handler.execute(action, context).await,
        }
    }
}
