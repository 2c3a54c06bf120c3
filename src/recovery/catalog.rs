//! Built-in recovery workflows, one per [`IssueType`].
//!
//! Each category contributes its own table; [`default_registry`] aggregates
//! them once at startup.

use serde_json::json;

use super::issues::{IssueCategory, IssueType};
use super::workflow::{Action, Workflow, WorkflowRegistry};
use crate::state_machine::PipelineState::{self, Critical, Failed, Healthy, Running};

/// Action names the built-in workflows rely on. The embedding application
/// registers a handler for each in its `ActionRegistry`.
pub mod actions {
    pub const TERMINATE_PROCESS: &str = "terminate_process";
    pub const CLEANUP_RESOURCES: &str = "cleanup_resources";
    pub const FREE_DISK_SPACE: &str = "free_disk_space";
    pub const REDUCE_CONCURRENCY: &str = "reduce_concurrency";
    pub const RETRY_WITH_BACKOFF: &str = "retry_with_backoff";
    pub const RESTART_STAGE: &str = "restart_stage";
    pub const RERUN_STAGE: &str = "rerun_stage";
    pub const REQUEST_CODE_FIX: &str = "request_code_fix";
    pub const RUN_FORMATTER: &str = "run_formatter";
    pub const REINSTALL_DEPENDENCIES: &str = "reinstall_dependencies";
    pub const PIN_DEPENDENCY_VERSION: &str = "pin_dependency_version";
    pub const WAIT_FOR_SERVICE: &str = "wait_for_service";
    pub const REFRESH_CREDENTIALS: &str = "refresh_credentials";
    pub const REGENERATE_ARTIFACT: &str = "regenerate_artifact";
    pub const VALIDATE_SCHEMA: &str = "validate_schema";
    pub const ROLLBACK_CHECKPOINT: &str = "rollback_checkpoint";
    pub const VALIDATE_STATE: &str = "validate_state";
    pub const PATCH_CONFIGURATION: &str = "patch_configuration";
    pub const ISOLATE_AGENT: &str = "isolate_agent";
    pub const RESYNC_AGENTS: &str = "resync_agents";
    pub const RESET_CIRCUIT_BREAKER: &str = "reset_circuit_breaker";
    pub const NOTIFY_OPERATOR: &str = "notify_operator";

    pub const ALL: [&str; 22] = [
        TERMINATE_PROCESS,
        CLEANUP_RESOURCES,
        FREE_DISK_SPACE,
        REDUCE_CONCURRENCY,
        RETRY_WITH_BACKOFF,
        RESTART_STAGE,
        RERUN_STAGE,
        REQUEST_CODE_FIX,
        RUN_FORMATTER,
        REINSTALL_DEPENDENCIES,
        PIN_DEPENDENCY_VERSION,
        WAIT_FOR_SERVICE,
        REFRESH_CREDENTIALS,
        REGENERATE_ARTIFACT,
        VALIDATE_SCHEMA,
        ROLLBACK_CHECKPOINT,
        VALIDATE_STATE,
        PATCH_CONFIGURATION,
        ISOLATE_AGENT,
        RESYNC_AGENTS,
        RESET_CIRCUIT_BREAKER,
        NOTIFY_OPERATOR,
    ];
}

use actions::*;

fn workflow(
    name: &str,
    steps: Vec<Action>,
    success_state: PipelineState,
    failure_state: PipelineState,
) -> Workflow {
    Workflow::new(name, steps, success_state, failure_state)
}

fn step(name: &str) -> Action {
    Action::new(name)
}

fn backoff(max_attempts: u32, base_delay_ms: u64) -> Action {
    Action::new(RETRY_WITH_BACKOFF)
        .with_param("max_attempts", json!(max_attempts))
        .with_param("base_delay_ms", json!(base_delay_ms))
}

fn infrastructure_workflows() -> Vec<(IssueType, Workflow)> {
    vec![
        (
            IssueType::ProcessHang,
            workflow(
                "process_hang_recovery",
                vec![
                    step(TERMINATE_PROCESS).with_param("signal", json!("SIGTERM")),
                    step(CLEANUP_RESOURCES),
                    step(RESTART_STAGE),
                ],
                Running,
                Critical,
            ),
        ),
        (
            IssueType::ZombieProcess,
            workflow(
                "zombie_process_cleanup",
                vec![
                    step(TERMINATE_PROCESS).with_param("signal", json!("SIGKILL")),
                    step(CLEANUP_RESOURCES),
                ],
                Healthy,
                Critical,
            ),
        ),
        (
            IssueType::MemoryExhaustion,
            workflow(
                "memory_exhaustion_recovery",
                vec![
                    step(CLEANUP_RESOURCES),
                    step(REDUCE_CONCURRENCY).with_param("factor", json!(0.5)),
                    step(RESTART_STAGE),
                ],
                Running,
                Failed,
            ),
        ),
        (
            IssueType::DiskSpaceLow,
            workflow(
                "disk_space_recovery",
                vec![step(FREE_DISK_SPACE), step(CLEANUP_RESOURCES)],
                Healthy,
                Critical,
            ),
        ),
        (
            IssueType::CpuOverload,
            workflow(
                "cpu_overload_mitigation",
                vec![step(REDUCE_CONCURRENCY).with_param("factor", json!(0.75))],
                Healthy,
                Critical,
            ),
        ),
        (
            IssueType::NetworkTimeout,
            workflow(
                "network_timeout_retry",
                vec![backoff(5, 1_000)],
                Healthy,
                Critical,
            ),
        ),
    ]
}

fn code_workflows() -> Vec<(IssueType, Workflow)> {
    vec![
        (
            IssueType::CompilationError,
            workflow(
                "compilation_error_fix",
                vec![
                    step(REQUEST_CODE_FIX).with_param("scope", json!("compile")),
                    step(RERUN_STAGE),
                ],
                Running,
                Critical,
            ),
        ),
        (
            IssueType::TestFailure,
            workflow(
                "test_failure_fix",
                vec![
                    step(REQUEST_CODE_FIX).with_param("scope", json!("tests")),
                    step(RERUN_STAGE),
                ],
                Running,
                Critical,
            ),
        ),
        (
            IssueType::LintFailure,
            workflow(
                "lint_autofix",
                vec![step(RUN_FORMATTER), step(RERUN_STAGE)],
                Healthy,
                Critical,
            ),
        ),
        (
            IssueType::SyntaxError,
            workflow(
                "syntax_error_fix",
                vec![
                    step(REQUEST_CODE_FIX).with_param("scope", json!("syntax")),
                    step(RUN_FORMATTER),
                    step(RERUN_STAGE),
                ],
                Running,
                Critical,
            ),
        ),
        (
            IssueType::TypeError,
            workflow(
                "type_error_fix",
                vec![
                    step(REQUEST_CODE_FIX).with_param("scope", json!("types")),
                    step(RERUN_STAGE),
                ],
                Running,
                Critical,
            ),
        ),
        (
            IssueType::RuntimeException,
            workflow(
                "runtime_exception_recovery",
                vec![
                    step(ROLLBACK_CHECKPOINT),
                    step(REQUEST_CODE_FIX).with_param("scope", json!("runtime")),
                    step(RERUN_STAGE),
                ],
                Running,
                Critical,
            ),
        ),
    ]
}

fn dependency_workflows() -> Vec<(IssueType, Workflow)> {
    vec![
        (
            IssueType::DependencyConflict,
            workflow(
                "dependency_conflict_resolution",
                vec![step(PIN_DEPENDENCY_VERSION), step(REINSTALL_DEPENDENCIES)],
                Healthy,
                Critical,
            ),
        ),
        (
            IssueType::MissingDependency,
            workflow(
                "missing_dependency_install",
                vec![step(REINSTALL_DEPENDENCIES), step(RERUN_STAGE)],
                Running,
                Critical,
            ),
        ),
        (
            IssueType::VersionMismatch,
            workflow(
                "version_mismatch_alignment",
                vec![step(PIN_DEPENDENCY_VERSION), step(REINSTALL_DEPENDENCIES)],
                Healthy,
                Critical,
            ),
        ),
    ]
}

fn external_service_workflows() -> Vec<(IssueType, Workflow)> {
    vec![
        (
            IssueType::ApiRateLimit,
            workflow(
                "rate_limit_backoff",
                vec![backoff(5, 2_000), step(REDUCE_CONCURRENCY).with_param("factor", json!(0.5))],
                Healthy,
                Critical,
            ),
        ),
        (
            IssueType::ApiUnavailable,
            workflow(
                "service_outage_wait",
                vec![
                    step(WAIT_FOR_SERVICE).with_param("timeout_secs", json!(300)),
                    backoff(3, 5_000),
                ],
                Healthy,
                Critical,
            ),
        ),
        (
            IssueType::AuthenticationFailure,
            workflow(
                "credential_refresh",
                vec![step(REFRESH_CREDENTIALS), backoff(2, 1_000)],
                Healthy,
                Failed,
            ),
        ),
    ]
}

fn stage_workflows() -> Vec<(IssueType, Workflow)> {
    vec![
        (
            IssueType::StageTimeout,
            workflow(
                "stage_timeout_restart",
                vec![step(TERMINATE_PROCESS), step(RESTART_STAGE)],
                Running,
                Critical,
            ),
        ),
        (
            IssueType::StageCrash,
            workflow(
                "stage_crash_restart",
                vec![step(CLEANUP_RESOURCES), step(ROLLBACK_CHECKPOINT), step(RESTART_STAGE)],
                Running,
                Critical,
            ),
        ),
        (
            IssueType::InvalidStageOutput,
            workflow(
                "invalid_output_regeneration",
                vec![step(VALIDATE_SCHEMA), step(RERUN_STAGE)],
                Running,
                Critical,
            ),
        ),
        (
            IssueType::StageCircuitOpen,
            workflow(
                "circuit_open_escalation",
                vec![
                    step(NOTIFY_OPERATOR).with_param("urgency", json!("high")),
                    step(RESET_CIRCUIT_BREAKER),
                ],
                Running,
                Failed,
            ),
        ),
    ]
}

fn multi_agent_workflows() -> Vec<(IssueType, Workflow)> {
    vec![
        (
            IssueType::AgentDeadlock,
            workflow(
                "agent_deadlock_break",
                vec![step(ISOLATE_AGENT), step(TERMINATE_PROCESS), step(RESYNC_AGENTS)],
                Running,
                Failed,
            ),
        ),
        (
            IssueType::AgentCommunicationFailure,
            workflow(
                "agent_channel_recovery",
                vec![backoff(3, 500), step(RESYNC_AGENTS)],
                Healthy,
                Critical,
            ),
        ),
        (
            IssueType::AgentConflict,
            workflow(
                "agent_conflict_resolution",
                vec![step(ISOLATE_AGENT), step(RESYNC_AGENTS)],
                Healthy,
                Critical,
            ),
        ),
    ]
}

fn data_workflows() -> Vec<(IssueType, Workflow)> {
    vec![
        (
            IssueType::DataCorruption,
            workflow(
                "data_corruption_restore",
                vec![step(ROLLBACK_CHECKPOINT), step(VALIDATE_STATE), step(RERUN_STAGE)],
                Running,
                Failed,
            ),
        ),
        (
            IssueType::SchemaValidationFailure,
            workflow(
                "schema_repair",
                vec![step(VALIDATE_SCHEMA), step(REGENERATE_ARTIFACT)],
                Healthy,
                Critical,
            ),
        ),
        (
            IssueType::MissingArtifact,
            workflow(
                "artifact_regeneration",
                vec![step(REGENERATE_ARTIFACT), step(VALIDATE_SCHEMA)],
                Running,
                Critical,
            ),
        ),
    ]
}

fn system_workflows() -> Vec<(IssueType, Workflow)> {
    vec![
        (
            IssueType::ConfigurationError,
            workflow(
                "configuration_patch",
                vec![step(PATCH_CONFIGURATION), step(VALIDATE_STATE)],
                Healthy,
                Critical,
            ),
        ),
        (
            IssueType::PermissionDenied,
            workflow(
                "permission_escalation",
                vec![step(NOTIFY_OPERATOR).with_param("urgency", json!("critical"))],
                Critical,
                Failed,
            ),
        ),
        (
            IssueType::StateInconsistency,
            workflow(
                "state_resynchronization",
                vec![step(VALIDATE_STATE), step(ROLLBACK_CHECKPOINT)],
                Healthy,
                Failed,
            ),
        ),
        (
            IssueType::CheckpointCorruption,
            workflow(
                "checkpoint_rebuild",
                vec![step(VALIDATE_STATE), step(NOTIFY_OPERATOR)],
                Critical,
                Failed,
            ),
        ),
        (
            IssueType::UnknownFailure,
            workflow(
                "unknown_failure_escalation",
                vec![step(CLEANUP_RESOURCES), step(NOTIFY_OPERATOR)],
                Critical,
                Failed,
            ),
        ),
    ]
}

pub fn workflows_for(category: IssueCategory) -> Vec<(IssueType, Workflow)> {
    match category {
        IssueCategory::Infrastructure => infrastructure_workflows(),
        IssueCategory::Code => code_workflows(),
        IssueCategory::Dependency => dependency_workflows(),
        IssueCategory::ExternalService => external_service_workflows(),
        IssueCategory::Stage => stage_workflows(),
        IssueCategory::MultiAgent => multi_agent_workflows(),
        IssueCategory::Data => data_workflows(),
        IssueCategory::System => system_workflows(),
    }
}

/// Registry holding the built-in workflow for every issue type
pub fn default_registry() -> WorkflowRegistry {
    [
        IssueCategory::Infrastructure,
        IssueCategory::Code,
        IssueCategory::Dependency,
        IssueCategory::ExternalService,
        IssueCategory::Stage,
        IssueCategory::MultiAgent,
        IssueCategory::Data,
        IssueCategory::System,
    ]
    .into_iter()
    .fold(WorkflowRegistry::builder(), |builder, category| {
        builder.extend(workflows_for(category))
    })
    .build()
}
