// Conductor - control plane for an autonomous multi-stage pipeline
// Tracks pipeline and stage lifecycle, classifies failures, runs recovery
// workflows and persists progress so a crashed run can resume.

pub mod config;
pub mod coordinator;
pub mod persistence;
pub mod recovery;
pub mod state_machine;
pub mod telemetry;

// Re-export key types for easy access
pub use config::ConductorConfig;
pub use coordinator::{CoreError, RecoveryOutcome, Snapshot, StateMachineCore, StateMachineCoreBuilder};
pub use persistence::{
    CheckpointSet, FileSystemPersistence, InMemoryPersistence, PersistenceError, Progress,
    StatePersistence,
};
pub use recovery::{
    Action, ActionError, ActionHandler, ActionRegistry, HealthStatus, IssueMetadata, IssueType,
    RecoveryContext, Severity, SynthesisError, Workflow, WorkflowRegistry, WorkflowSynthesizer,
};
pub use state_machine::{Event, PipelineState, StageStatus, StageUpdate};
pub use telemetry::{create_recovery_span, generate_correlation_id, init_telemetry};
