//! Failure classification and workflow-driven recovery
//!
//! - **Issues**: closed catalog of failure classes and the active issue set
//! - **Health**: aggregate health derivation and the health-driven edge table
//! - **Workflows**: typed registry of ordered remedies, built once at startup
//! - **Executor**: fail-fast action execution with an append-only history
//! - **Synthesizer**: best-effort fallback when no usable workflow exists

pub mod catalog;
pub mod executor;
pub mod health;
pub mod issues;
pub mod synthesizer;
pub mod workflow;

pub use catalog::default_registry;
pub use executor::{
    ActionError, ActionHandler, ActionRegistry, ExecutionError, WorkflowExecutionRecord,
    WorkflowExecutor, WorkflowRun,
};
pub use health::{compute_health_status, HealthPolicy, HealthStatus};
pub use issues::{ActiveIssue, IssueCategory, IssueMetadata, IssueTracker, IssueType, Severity};
pub use synthesizer::{SynthesisAdapter, SynthesisError, UnusableWorkflow, WorkflowSynthesizer};
pub use workflow::{Action, RecoveryContext, Workflow, WorkflowOrigin, WorkflowRegistry};
