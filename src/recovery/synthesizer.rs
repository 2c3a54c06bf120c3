use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::executor::ActionRegistry;
use super::issues::IssueType;
use super::workflow::{RecoveryContext, Workflow};
use crate::state_machine::PipelineState;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("synthesis backend unavailable: {0}")]
    Unavailable(String),

    #[error("synthesis failed: {0}")]
    Failed(String),

    #[error("synthesis timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },
}

/// Produces a workflow on demand when none is registered or the registered one failed.
///
/// Implementations may be backed by any reasoning service. Returning `Ok(None)`
/// means "no idea"; errors are treated the same way by the core.
#[async_trait]
pub trait WorkflowSynthesizer: Send + Sync {
    async fn generate_workflow(
        &self,
        issue_type: IssueType,
        context: &RecoveryContext,
    ) -> Result<Option<Workflow>, SynthesisError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnusableWorkflow {
    #[error("workflow has no actions")]
    NoActions,

    #[error("success and failure states are both {0}")]
    SelfReferential(PipelineState),

    #[error("success state is FAILED")]
    FailingSuccessState,

    #[error("action '{0}' is not registered")]
    UnknownAction(String),
}

/// Reject workflows the core could not meaningfully run
pub fn validate_workflow(workflow: &Workflow, actions: &ActionRegistry) -> Result<(), UnusableWorkflow> {
    if workflow.actions.is_empty() {
        return Err(UnusableWorkflow::NoActions);
    }
    if workflow.success_state == workflow.failure_state {
        return Err(UnusableWorkflow::SelfReferential(workflow.success_state));
    }
    if workflow.success_state == PipelineState::Failed {
        return Err(UnusableWorkflow::FailingSuccessState);
    }
    if let Some(name) = workflow.action_names().find(|name| !actions.contains(name)) {
        return Err(UnusableWorkflow::UnknownAction(name.to_string()));
    }
    Ok(())
}

/// Wraps a synthesizer with a timeout and validation; every failure mode
/// collapses to `None`.
#[derive(Clone)]
pub struct SynthesisAdapter {
    synthesizer: Arc<dyn WorkflowSynthesizer>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for SynthesisAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisAdapter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SynthesisAdapter {
    pub fn new(synthesizer: Arc<dyn WorkflowSynthesizer>) -> Self {
        Self {
            synthesizer,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn synthesize(
        &self,
        issue_type: IssueType,
        context: &RecoveryContext,
        actions: &ActionRegistry,
    ) -> Option<Workflow> {
        let generated = match self.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.synthesizer.generate_workflow(issue_type, context)).await {
                    Ok(result) => result,
                    Err(_) => Err(SynthesisError::TimedOut {
                        after_ms: limit.as_millis() as u64,
                    }),
                }
            }
            None => self.synthesizer.generate_workflow(issue_type, context).await,
        };

        let workflow = match generated {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                info!(issue_type = %issue_type, "Synthesizer had no workflow to offer");
                return None;
            }
            Err(e) => {
                warn!(issue_type = %issue_type, error = %e, "Workflow synthesis failed");
                return None;
            }
        };

        match validate_workflow(&workflow, actions) {
            Ok(()) => {
                info!(
                    issue_type = %issue_type,
                    workflow = %workflow.name,
                    actions = workflow.actions.len(),
                    "Synthesized recovery workflow"
                );
                Some(workflow.synthesized())
            }
            Err(reason) => {
                warn!(
                    issue_type = %issue_type,
                    workflow = %workflow.name,
                    reason = %reason,
                    "Discarding unusable synthesized workflow"
                );
                None
            }
        }
    }
}
