// Integration tests for the StateMachineCore facade
// Drives the public API the way a pipeline orchestrator and health monitors would

use async_trait::async_trait;
use conductor::persistence::FileSystemPersistence;
use conductor::recovery::{WorkflowOrigin, WorkflowRegistry};
use conductor::{
    Action, ActionError, ActionHandler, ActionRegistry, ConductorConfig, CoreError, Event,
    HealthStatus, InMemoryPersistence, IssueMetadata, IssueType, PipelineState, RecoveryContext,
    RecoveryOutcome, StageStatus, StageUpdate, StateMachineCore, SynthesisError, Workflow,
    WorkflowSynthesizer,
};
use futures::future::join_all;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct CountingAction {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ActionHandler for CountingAction {
    async fn execute(
        &self,
        action: &Action,
        context: RecoveryContext,
    ) -> Result<RecoveryContext, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(context.with(action.name.clone(), json!("done")))
    }
}

struct FailingAction;

#[async_trait]
impl ActionHandler for FailingAction {
    async fn execute(
        &self,
        _action: &Action,
        _context: RecoveryContext,
    ) -> Result<RecoveryContext, ActionError> {
        Err(ActionError::Failed("simulated failure".to_string()))
    }
}

struct SlowAction;

#[async_trait]
impl ActionHandler for SlowAction {
    async fn execute(
        &self,
        _action: &Action,
        context: RecoveryContext,
    ) -> Result<RecoveryContext, ActionError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(context)
    }
}

struct FixedSynthesizer {
    workflow: Option<Workflow>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkflowSynthesizer for FixedSynthesizer {
    async fn generate_workflow(
        &self,
        _issue_type: IssueType,
        _context: &RecoveryContext,
    ) -> Result<Option<Workflow>, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.workflow.clone())
    }
}

struct Counters {
    first: Arc<AtomicUsize>,
    last: Arc<AtomicUsize>,
}

fn test_actions() -> (ActionRegistry, Counters) {
    let counters = Counters {
        first: Arc::new(AtomicUsize::new(0)),
        last: Arc::new(AtomicUsize::new(0)),
    };
    let actions = ActionRegistry::new()
        .with_handler("first", Arc::new(CountingAction { calls: counters.first.clone() }))
        .with_handler("broken", Arc::new(FailingAction))
        .with_handler("last", Arc::new(CountingAction { calls: counters.last.clone() }))
        .with_handler("slow", Arc::new(SlowAction));
    (actions, counters)
}

fn workflow(name: &str, steps: &[&str], success: PipelineState, failure: PipelineState) -> Workflow {
    Workflow::new(
        name,
        steps.iter().map(|step| Action::new(*step)).collect(),
        success,
        failure,
    )
}

async fn drive_to_running(core: &StateMachineCore) {
    assert!(core.transition(PipelineState::Ready, Event::Initialized, None, None).await.unwrap());
    assert!(core.transition(PipelineState::Running, Event::Start, None, None).await.unwrap());
}

#[tokio::test]
async fn test_health_scenario_high_issues_go_critical_then_recover() {
    let core = StateMachineCore::builder("health-scenario")
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .build()
        .unwrap();
    drive_to_running(&core).await;

    core.register_issue(IssueType::CompilationError, IssueMetadata::default()).await.unwrap();
    core.register_issue(IssueType::CompilationError, IssueMetadata::default()).await.unwrap();
    let health = core
        .register_issue(IssueType::TestFailure, IssueMetadata::default().with_stage("tests"))
        .await
        .unwrap();

    assert_eq!(health, HealthStatus::Critical);
    assert_eq!(core.compute_health_status().await, HealthStatus::Critical);
    assert_eq!(core.current_state().await, PipelineState::Critical);
    assert_eq!(core.active_issues().await.len(), 2);

    core.resolve_issue(IssueType::CompilationError).await.unwrap();
    assert_eq!(core.compute_health_status().await, HealthStatus::Degraded);
    assert_eq!(core.current_state().await, PipelineState::DegradedHealth);

    core.resolve_issue(IssueType::TestFailure).await.unwrap();
    assert_eq!(core.compute_health_status().await, HealthStatus::Healthy);
    assert_eq!(core.current_state().await, PipelineState::Healthy);

    let events: Vec<_> = core.history().await.iter().map(|record| record.event).collect();
    assert_eq!(
        events,
        vec![
            Event::Initialized,
            Event::Start,
            Event::HealthDegraded,
            Event::HealthCritical,
            Event::HealthDegraded,
            Event::HealthRestored,
        ]
    );
}

#[tokio::test]
async fn test_open_circuit_is_critical_until_reset() {
    let core = StateMachineCore::builder("circuit")
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .build()
        .unwrap();
    drive_to_running(&core).await;

    core.update_stage_state("codegen", StageStatus::Running, StageUpdate::default())
        .await
        .unwrap();
    let health = core
        .update_stage_state("codegen", StageStatus::Failed, StageUpdate::default().open_circuit())
        .await
        .unwrap();

    assert_eq!(health, HealthStatus::Critical);
    assert_eq!(core.current_state().await, PipelineState::Critical);
    assert!(!core.is_schedulable("codegen").await);

    let refused = core
        .update_stage_state("codegen", StageStatus::Running, StageUpdate::default())
        .await;
    assert!(matches!(refused, Err(CoreError::CircuitOpen { stage }) if stage == "codegen"));

    assert!(core.reset_stage("codegen").await.unwrap());
    assert_eq!(core.compute_health_status().await, HealthStatus::Healthy);
    assert_eq!(core.current_state().await, PipelineState::Healthy);
    assert_eq!(core.stage("codegen").await.unwrap().failure_count, 0);
}

#[tokio::test]
async fn test_registered_workflow_recovers_and_resolves_issue() {
    let (actions, counters) = test_actions();
    let registry = WorkflowRegistry::builder()
        .workflow(
            IssueType::StageCrash,
            workflow("restart", &["first", "last"], PipelineState::Running, PipelineState::Failed),
        )
        .build();

    let core = StateMachineCore::builder("recovered")
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .with_actions(actions)
        .with_registry(registry)
        .build()
        .unwrap();
    drive_to_running(&core).await;
    core.register_issue(IssueType::StageCrash, IssueMetadata::default()).await.unwrap();
    assert_eq!(core.current_state().await, PipelineState::DegradedHealth);

    let outcome = core
        .execute_workflow(IssueType::StageCrash, RecoveryContext::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RecoveryOutcome::Recovered {
            workflow: "restart".to_string(),
            target: PipelineState::Running,
            transitioned: true,
        }
    );
    assert_eq!(core.current_state().await, PipelineState::Running);
    assert!(core.active_issues().await.is_empty());
    assert_eq!(counters.first.load(Ordering::SeqCst), 1);
    assert_eq!(counters.last.load(Ordering::SeqCst), 1);

    let last = core.history().await.pop().unwrap();
    assert_eq!(last.event, Event::RecoverySuccess);
}

#[tokio::test]
async fn test_first_failing_action_aborts_the_rest() {
    let (actions, counters) = test_actions();
    let registry = WorkflowRegistry::builder()
        .workflow(
            IssueType::CompilationError,
            workflow(
                "fix_build",
                &["first", "broken", "last"],
                PipelineState::Running,
                PipelineState::Failed,
            ),
        )
        .build();

    let core = StateMachineCore::builder("fail-fast")
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .with_actions(actions)
        .with_registry(registry)
        .build()
        .unwrap();
    drive_to_running(&core).await;

    let outcome = core
        .execute_workflow(IssueType::CompilationError, RecoveryContext::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RecoveryOutcome::Exhausted {
            target: PipelineState::Failed,
            transitioned: true,
        }
    );
    assert_eq!(counters.first.load(Ordering::SeqCst), 1);
    assert_eq!(counters.last.load(Ordering::SeqCst), 0);
    assert_eq!(core.current_state().await, PipelineState::Failed);

    let history = core.workflow_history().await;
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(history[0].actions_executed, 2);
    assert_eq!(history[0].failed_action.as_deref(), Some("broken"));
}

#[tokio::test]
async fn test_synthesized_workflow_replaces_failed_registration() {
    let (actions, counters) = test_actions();
    let registry = WorkflowRegistry::builder()
        .workflow(
            IssueType::ApiUnavailable,
            workflow("wait", &["broken"], PipelineState::Running, PipelineState::Critical),
        )
        .build();
    let synth_calls = Arc::new(AtomicUsize::new(0));
    let synthesizer = FixedSynthesizer {
        workflow: Some(workflow(
            "reroute",
            &["first"],
            PipelineState::Running,
            PipelineState::Critical,
        )),
        calls: synth_calls.clone(),
    };

    let core = StateMachineCore::builder("synthesized")
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .with_actions(actions)
        .with_registry(registry)
        .with_synthesizer(Arc::new(synthesizer))
        .build()
        .unwrap();
    drive_to_running(&core).await;

    let outcome = core
        .execute_workflow(IssueType::ApiUnavailable, RecoveryContext::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RecoveryOutcome::Synthesized {
            workflow: "reroute".to_string(),
            target: PipelineState::Running,
            transitioned: false,
        }
    );
    // Already running, and Running -> Running is not an edge
    assert_eq!(core.current_state().await, PipelineState::Running);
    assert_eq!(synth_calls.load(Ordering::SeqCst), 1);
    assert_eq!(counters.first.load(Ordering::SeqCst), 1);

    let installed = core.registered_workflow(IssueType::ApiUnavailable).await.unwrap();
    assert_eq!(installed.name, "reroute");
    assert_eq!(installed.origin, WorkflowOrigin::Synthesized);

    let history = core.workflow_history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].workflow, "wait");
    assert!(!history[0].success);
    assert_eq!(history[1].origin, WorkflowOrigin::Synthesized);
    assert!(history[1].success);
}

#[tokio::test]
async fn test_unusable_synthesis_falls_back_to_unrecoverable_state() {
    let (actions, _counters) = test_actions();
    let synthesizer = FixedSynthesizer {
        workflow: Some(workflow(
            "nonsense",
            &["no_such_action"],
            PipelineState::Running,
            PipelineState::Critical,
        )),
        calls: Arc::new(AtomicUsize::new(0)),
    };

    let core = StateMachineCore::builder("unusable")
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .with_actions(actions)
        .with_registry(WorkflowRegistry::empty())
        .with_synthesizer(Arc::new(synthesizer))
        .build()
        .unwrap();
    drive_to_running(&core).await;

    let outcome = core
        .execute_workflow(IssueType::UnknownFailure, RecoveryContext::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RecoveryOutcome::Exhausted {
            target: PipelineState::Critical,
            transitioned: true,
        }
    );
    assert!(core.registered_workflow(IssueType::UnknownFailure).await.is_none());
    assert!(core.workflow_history().await.is_empty());
}

#[tokio::test]
async fn test_unknown_action_is_a_configuration_error() {
    let (actions, counters) = test_actions();
    let registry = WorkflowRegistry::builder()
        .workflow(
            IssueType::DiskSpaceLow,
            workflow("cleanup", &["first", "ghost"], PipelineState::Running, PipelineState::Critical),
        )
        .build();

    let core = StateMachineCore::builder("unknown-action")
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .with_actions(actions)
        .with_registry(registry)
        .build()
        .unwrap();

    let result = core
        .execute_workflow(IssueType::DiskSpaceLow, RecoveryContext::new())
        .await;

    assert!(matches!(result, Err(CoreError::UnknownAction { action, .. }) if action == "ghost"));
    assert_eq!(counters.first.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_action_timeout_counts_as_failure() {
    let (actions, _counters) = test_actions();
    let registry = WorkflowRegistry::builder()
        .workflow(
            IssueType::ProcessHang,
            workflow("wait_it_out", &["slow"], PipelineState::Running, PipelineState::Critical),
        )
        .build();
    let mut config = ConductorConfig::default();
    config.recovery.action_timeout_secs = Some(1);

    let core = StateMachineCore::builder("timeout")
        .with_config(config)
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .with_actions(actions)
        .with_registry(registry)
        .build()
        .unwrap();
    drive_to_running(&core).await;

    let outcome = core
        .execute_workflow(IssueType::ProcessHang, RecoveryContext::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RecoveryOutcome::Exhausted {
            target: PipelineState::Critical,
            transitioned: true,
        }
    );
    let history = core.workflow_history().await;
    assert!(history[0].error.as_deref().unwrap_or_default().contains("timed out"));
}

#[tokio::test]
async fn test_rollback_scenario_through_facade() {
    let core = StateMachineCore::builder("rollback")
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .build()
        .unwrap();
    drive_to_running(&core).await;

    core.push_state(PipelineState::Running, Some(json!({ "checkpoint": "before-refactor" })))
        .await
        .unwrap();
    core.transition(PipelineState::DegradedHealth, Event::HealthDegraded, None, None)
        .await
        .unwrap();
    core.push_state(PipelineState::DegradedHealth, None).await.unwrap();
    core.transition(PipelineState::Critical, Event::HealthCritical, None, None)
        .await
        .unwrap();
    core.push_state(PipelineState::Critical, None).await.unwrap();

    let missing = core.rollback_to_state(PipelineState::Paused).await.unwrap();
    assert!(missing.is_empty());
    assert_eq!(core.stack_depth().await, 3);

    let frames = core.rollback_to_state(PipelineState::Running).await.unwrap();
    let states: Vec<_> = frames.iter().map(|frame| frame.state).collect();
    assert_eq!(
        states,
        vec![PipelineState::Critical, PipelineState::DegradedHealth, PipelineState::Running]
    );
    assert_eq!(core.stack_depth().await, 0);
    assert!(core.peek_state().await.is_none());
    assert_eq!(core.current_state().await, PipelineState::Running);
    assert_eq!(core.history().await.pop().unwrap().event, Event::RollbackComplete);
}

#[tokio::test]
async fn test_recovery_reports_rejected_success_edge() {
    let (actions, counters) = test_actions();
    let registry = WorkflowRegistry::builder()
        .workflow(
            IssueType::ConfigurationError,
            workflow("patch", &["first"], PipelineState::Healthy, PipelineState::Failed),
        )
        .build();

    let core = StateMachineCore::builder("rejected-edge")
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .with_actions(actions)
        .with_registry(registry)
        .build()
        .unwrap();
    core.transition(PipelineState::Ready, Event::Initialized, None, None)
        .await
        .unwrap();
    let history_before = core.history().await.len();

    let outcome = core
        .execute_workflow(IssueType::ConfigurationError, RecoveryContext::new())
        .await
        .unwrap();

    assert!(outcome.is_recovered());
    assert_eq!(outcome.target(), PipelineState::Healthy);
    assert!(!outcome.transitioned());
    assert_eq!(counters.first.load(Ordering::SeqCst), 1);
    assert_eq!(core.current_state().await, PipelineState::Ready);
    assert_eq!(core.history().await.len(), history_before);
}

#[tokio::test]
async fn test_deep_stack_rolls_back_to_first_frame() {
    let core = StateMachineCore::builder("deep-rollback")
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .build()
        .unwrap();
    drive_to_running(&core).await;

    core.push_state(PipelineState::Paused, Some(json!({ "checkpoint": "safe-point" })))
        .await
        .unwrap();
    for attempt in 0..64 {
        core.push_state(PipelineState::Critical, Some(json!({ "attempt": attempt })))
            .await
            .unwrap();
    }
    assert_eq!(core.stack_depth().await, 65);

    let frames = core.rollback_to_state(PipelineState::Paused).await.unwrap();

    assert_eq!(frames.len(), 65);
    let bottom = frames.last().unwrap();
    assert_eq!(bottom.state, PipelineState::Paused);
    assert_eq!(bottom.context, json!({ "checkpoint": "safe-point" }));
    assert_eq!(core.stack_depth().await, 0);
    assert_eq!(core.current_state().await, PipelineState::Paused);
}

#[tokio::test]
async fn test_bounded_stack_refuses_push_when_full() {
    let mut config = ConductorConfig::default();
    config.rollback.max_depth = Some(2);

    let core = StateMachineCore::builder("bounded-stack")
        .with_config(config)
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .build()
        .unwrap();
    drive_to_running(&core).await;

    core.push_state(PipelineState::Running, None).await.unwrap();
    core.push_state(PipelineState::Healthy, None).await.unwrap();
    let refused = core.push_state(PipelineState::Critical, None).await;

    assert!(matches!(
        refused,
        Err(CoreError::StackFull { state: PipelineState::Critical, max_depth: 2 })
    ));
    assert_eq!(core.stack_depth().await, 2);
    assert_eq!(core.peek_state().await.unwrap().state, PipelineState::Healthy);

    let frames = core.rollback_to_state(PipelineState::Running).await.unwrap();
    assert_eq!(frames.len(), 2);
}

#[tokio::test]
async fn test_rollback_refused_without_edge_even_with_frame_present() {
    let core = StateMachineCore::builder("rollback-no-edge")
        .with_persistence(Arc::new(InMemoryPersistence::new()))
        .build()
        .unwrap();
    drive_to_running(&core).await;
    assert!(core.transition(PipelineState::Healthy, Event::HealthRestored, None, None).await.unwrap());

    core.push_state(PipelineState::Healthy, Some(json!({ "checkpoint": "green" })))
        .await
        .unwrap();
    assert!(core.transition(PipelineState::Paused, Event::Pause, None, None).await.unwrap());
    let history_before = core.history().await.len();

    // Paused can only resume to Running, so the Healthy frame is out of reach
    let frames = core.rollback_to_state(PipelineState::Healthy).await.unwrap();

    assert!(frames.is_empty());
    assert_eq!(core.stack_depth().await, 1);
    assert_eq!(core.peek_state().await.unwrap().state, PipelineState::Healthy);
    assert_eq!(core.current_state().await, PipelineState::Paused);
    assert_eq!(core.history().await.len(), history_before);
}

#[tokio::test]
async fn test_resume_round_trip_through_filesystem() {
    let temp_dir = TempDir::new().unwrap();
    let persistence = Arc::new(FileSystemPersistence::new(temp_dir.path()));

    {
        let core = StateMachineCore::builder("nightly-42")
            .with_persistence(persistence.clone())
            .build()
            .unwrap();
        drive_to_running(&core).await;
        core.create_checkpoint(3, json!({ "project": "demo" })).await.unwrap();

        for stage in ["requirements", "architecture"] {
            core.update_stage_state(stage, StageStatus::Running, StageUpdate::default())
                .await
                .unwrap();
            core.update_stage_state(stage, StageStatus::Completed, StageUpdate::default())
                .await
                .unwrap();
            core.save_stage_checkpoint(stage, StageStatus::Completed, Some(json!({ "ok": true })), None, None)
                .await
                .unwrap();
        }
        core.register_issue(IssueType::NetworkTimeout, IssueMetadata::default())
            .await
            .unwrap();
    }

    let resumed = StateMachineCore::builder("nightly-42")
        .with_persistence(persistence.clone())
        .build()
        .unwrap();
    assert!(resumed.can_resume("nightly-42").await);
    assert!(!resumed.can_resume("never-ran").await);

    let set = resumed.resume_from_checkpoint().await.unwrap().unwrap();
    let completed: Vec<_> = set.completed_stages().into_iter().collect();
    assert_eq!(completed, vec!["architecture", "requirements"]);
    assert_eq!(set.snapshot.health_status, HealthStatus::Degraded);

    assert_eq!(resumed.current_state().await, PipelineState::DegradedHealth);
    assert_eq!(resumed.compute_health_status().await, HealthStatus::Degraded);
    assert_eq!(resumed.history().await.len(), 1);

    let progress = resumed.progress().await;
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.total, 3);
}

#[tokio::test]
async fn test_finished_run_is_not_resumable() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let core = StateMachineCore::builder("finished")
        .with_persistence(persistence.clone())
        .build()
        .unwrap();
    drive_to_running(&core).await;
    core.transition(PipelineState::Completed, Event::Complete, None, None)
        .await
        .unwrap();

    let fresh = StateMachineCore::builder("finished")
        .with_persistence(persistence)
        .build()
        .unwrap();
    assert!(!fresh.can_resume("finished").await);
    assert!(fresh.resume_from_checkpoint().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_health_producers_are_serialized() {
    let core = Arc::new(
        StateMachineCore::builder("concurrent")
            .with_persistence(Arc::new(InMemoryPersistence::new()))
            .build()
            .unwrap(),
    );
    drive_to_running(&core).await;

    let producers = [
        IssueType::NetworkTimeout,
        IssueType::CpuOverload,
        IssueType::LintFailure,
        IssueType::ApiRateLimit,
    ];
    let handles: Vec<_> = (0..40)
        .map(|i| {
            let core = core.clone();
            let issue_type = producers[i % producers.len()];
            tokio::spawn(async move {
                core.register_issue(issue_type, IssueMetadata::default().with_source(format!("monitor-{i}")))
                    .await
            })
        })
        .collect();

    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    let issues = core.active_issues().await;
    assert_eq!(issues.len(), producers.len());
    assert_eq!(issues.iter().map(|issue| issue.occurrences).sum::<u32>(), 40);

    let history = core.history().await;
    for pair in history.windows(2) {
        assert_eq!(pair[0].to_state, pair[1].from_state);
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
    assert_eq!(core.current_state().await, PipelineState::DegradedHealth);
}
