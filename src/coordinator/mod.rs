//! Single-writer facade over the pipeline control plane
//!
//! [`StateMachineCore`] owns every component behind one async mutex. Each
//! public method locks, delegates, re-derives health where issues or stages
//! changed, and persists a fresh snapshot before returning.

mod snapshot;

pub use snapshot::Snapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};

use crate::config::ConductorConfig;
use crate::persistence::{
    validate_run_id, CheckpointManager, CheckpointSet, FileSystemPersistence, PersistedRun,
    PersistenceError, Progress, StageCheckpoint, StatePersistence,
};
use crate::recovery::{
    catalog, compute_health_status, health::auto_transition_for, ActionRegistry, ActiveIssue,
    ExecutionError, HealthPolicy, HealthStatus, IssueMetadata, IssueTracker, IssueType,
    RecoveryContext, SynthesisAdapter, Workflow, WorkflowExecutionRecord, WorkflowExecutor,
    WorkflowRegistry, WorkflowSynthesizer,
};
use crate::state_machine::{
    AutomatonError, Event, PipelineState, PushdownAutomaton, StackFrame, StageError, StageState,
    StageStateManager, StageStatus, StageUpdate, StateTransitionEngine, TransitionRecord,
};
use crate::telemetry::{create_recovery_span, generate_correlation_id};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Stage '{stage}' has an open circuit breaker and cannot be scheduled")]
    CircuitOpen { stage: String },

    #[error("Workflow '{workflow}' references unknown action '{action}'")]
    UnknownAction { workflow: String, action: String },

    #[error("Rollback stack is full ({max_depth} frames); cannot push {state}")]
    StackFull { state: PipelineState, max_depth: usize },

    #[error("Persistence failure: {0}")]
    Persistence(#[from] PersistenceError),
}

impl From<StageError> for CoreError {
    fn from(error: StageError) -> Self {
        match error {
            StageError::CircuitOpen { stage } => CoreError::CircuitOpen { stage },
        }
    }
}

impl From<AutomatonError> for CoreError {
    fn from(error: AutomatonError) -> Self {
        match error {
            AutomatonError::StackFull { state, max_depth } => {
                CoreError::StackFull { state, max_depth }
            }
        }
    }
}

impl From<ExecutionError> for CoreError {
    fn from(error: ExecutionError) -> Self {
        match error {
            ExecutionError::UnknownAction { workflow, action } => {
                CoreError::UnknownAction { workflow, action }
            }
        }
    }
}

/// How `execute_workflow` ended. `target` is the state recovery aimed for;
/// `transitioned` is false when the engine rejected that edge from the state
/// the pipeline was in, in which case the pipeline did not move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The registered workflow succeeded
    Recovered {
        workflow: String,
        target: PipelineState,
        transitioned: bool,
    },
    /// A synthesized workflow succeeded and now replaces the registry entry
    Synthesized {
        workflow: String,
        target: PipelineState,
        transitioned: bool,
    },
    /// Nothing worked; the core tried to move to a failure state
    Exhausted {
        target: PipelineState,
        transitioned: bool,
    },
}

impl RecoveryOutcome {
    pub fn is_recovered(&self) -> bool {
        !matches!(self, RecoveryOutcome::Exhausted { .. })
    }

    pub fn target(&self) -> PipelineState {
        match self {
            RecoveryOutcome::Recovered { target, .. }
            | RecoveryOutcome::Synthesized { target, .. }
            | RecoveryOutcome::Exhausted { target, .. } => *target,
        }
    }

    pub fn transitioned(&self) -> bool {
        match self {
            RecoveryOutcome::Recovered { transitioned, .. }
            | RecoveryOutcome::Synthesized { transitioned, .. }
            | RecoveryOutcome::Exhausted { transitioned, .. } => *transitioned,
        }
    }
}

struct CoreState {
    engine: StateTransitionEngine,
    stages: StageStateManager,
    automaton: PushdownAutomaton,
    issues: IssueTracker,
    registry: WorkflowRegistry,
    executor: WorkflowExecutor,
    checkpoints: CheckpointManager,
    synthesis: Option<SynthesisAdapter>,
    health_policy: HealthPolicy,
    unrecoverable_state: PipelineState,
}

impl CoreState {
    fn health(&self) -> HealthStatus {
        compute_health_status(&self.issues, self.stages.any_circuit_open(), &self.health_policy)
    }

    /// Every transition the core performs goes through here so terminal
    /// states always drop the active issue set.
    fn apply_transition(
        &mut self,
        to_state: PipelineState,
        event: Event,
        reason: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> bool {
        let moved = self.engine.transition(to_state, event, reason, metadata);
        if moved && to_state.is_terminal() {
            let cleared = self.issues.clear();
            if cleared > 0 {
                info!(state = %to_state, cleared, "Pipeline terminated, active issues cleared");
            }
        }
        moved
    }

    /// Re-derive health and follow the health edge table from the current state
    fn sync_health(&mut self) -> HealthStatus {
        let status = self.health();
        let current = self.engine.current_state();

        if let Some((target, event)) = auto_transition_for(status, current) {
            info!(health = %status, from = %current, to = %target, "Health-driven transition");
            self.apply_transition(target, event, Some(format!("health is {status}")), None);
        }
        status
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.engine.current_state(),
            stages: self.stages.all_stages().clone(),
            active_stage: self.stages.active_stage().map(str::to_string),
            health_status: self.health(),
            circuit_open_stages: self.stages.circuit_breakers_open(),
            active_issues: self.issues.active_issues().cloned().collect(),
            rollback_depth: self.automaton.depth(),
            timestamp: Utc::now(),
        }
    }
}

/// Builder for [`StateMachineCore`]
pub struct StateMachineCoreBuilder {
    run_id: String,
    config: ConductorConfig,
    persistence: Option<Arc<dyn StatePersistence>>,
    actions: ActionRegistry,
    synthesizer: Option<Arc<dyn WorkflowSynthesizer>>,
    registry: Option<WorkflowRegistry>,
}

impl StateMachineCoreBuilder {
    pub fn with_config(mut self, config: ConductorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this backend instead of the configured state directory
    pub fn with_persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn WorkflowSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// Replace the default catalog
    pub fn with_registry(mut self, registry: WorkflowRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<StateMachineCore, CoreError> {
        validate_run_id(&self.run_id)?;

        let config = self.config;
        let persistence = if config.persistence.enabled {
            Some(self.persistence.unwrap_or_else(|| {
                Arc::new(FileSystemPersistence::new(config.persistence.state_dir.clone()))
                    as Arc<dyn StatePersistence>
            }))
        } else {
            None
        };

        let registry = self.registry.unwrap_or_else(catalog::default_registry);
        let missing = registry.validate_actions(&self.actions);
        if !missing.is_empty() {
            warn!(
                run_id = %self.run_id,
                unresolved = missing.len(),
                "Some recovery workflows reference actions with no registered handler"
            );
        }

        let synthesis = match (config.recovery.enable_synthesis, self.synthesizer) {
            (true, Some(synthesizer)) => Some(
                SynthesisAdapter::new(synthesizer).with_timeout(config.recovery.synthesis_timeout()),
            ),
            _ => None,
        };

        let state = CoreState {
            engine: StateTransitionEngine::new(),
            stages: StageStateManager::new(config.circuit_breaker.policy()),
            automaton: PushdownAutomaton::new(config.rollback.max_depth),
            issues: IssueTracker::new(),
            registry,
            executor: WorkflowExecutor::new(self.actions)
                .with_action_timeout(config.recovery.action_timeout()),
            checkpoints: CheckpointManager::new(),
            synthesis,
            health_policy: config.health.policy(),
            unrecoverable_state: config.recovery.unrecoverable_state,
        };

        info!(
            run_id = %self.run_id,
            persistence = persistence.is_some(),
            synthesis = state.synthesis.is_some(),
            workflows = state.registry.len(),
            "State machine core created"
        );

        Ok(StateMachineCore {
            run_id: self.run_id,
            persistence,
            inner: Mutex::new(state),
        })
    }
}

/// Control plane for one pipeline run
pub struct StateMachineCore {
    run_id: String,
    persistence: Option<Arc<dyn StatePersistence>>,
    inner: Mutex<CoreState>,
}

impl StateMachineCore {
    pub fn builder(run_id: impl Into<String>) -> StateMachineCoreBuilder {
        StateMachineCoreBuilder {
            run_id: run_id.into(),
            config: ConductorConfig::default(),
            persistence: None,
            actions: ActionRegistry::new(),
            synthesizer: None,
            registry: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Write the current snapshot; called with the lock held so writes are
    /// ordered exactly like the mutations that caused them.
    async fn persist(&self, state: &CoreState) -> Result<(), CoreError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        let run = PersistedRun::new(
            self.run_id.clone(),
            state.snapshot(),
            state.checkpoints.pipeline().cloned(),
            state.checkpoints.checkpoints().to_vec(),
        );

        if let Err(e) = persistence.save(&run).await {
            warn!(run_id = %self.run_id, error = %e, "Failed to persist run state");
            return Err(e.into());
        }
        Ok(())
    }

    // ---- state machine -------------------------------------------------

    /// Validated transition. `Ok(false)` means the edge is not legal from the
    /// current state and nothing changed.
    pub async fn transition(
        &self,
        to_state: PipelineState,
        event: Event,
        reason: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<bool, CoreError> {
        let mut state = self.inner.lock().await;
        if !state.apply_transition(to_state, event, reason, metadata) {
            return Ok(false);
        }
        self.persist(&state).await?;
        Ok(true)
    }

    pub async fn current_state(&self) -> PipelineState {
        self.inner.lock().await.engine.current_state()
    }

    pub async fn can_transition(&self, to_state: PipelineState) -> bool {
        self.inner.lock().await.engine.can_transition(to_state)
    }

    pub async fn history(&self) -> Vec<TransitionRecord> {
        self.inner.lock().await.engine.history().to_vec()
    }

    // ---- stages --------------------------------------------------------

    pub async fn update_stage_state(
        &self,
        stage_name: &str,
        status: StageStatus,
        update: StageUpdate,
    ) -> Result<HealthStatus, CoreError> {
        let mut state = self.inner.lock().await;
        state.stages.update_stage_state(stage_name, status, update)?;
        let health = state.sync_health();
        self.persist(&state).await?;
        Ok(health)
    }

    /// Operator action: close the circuit and zero the stage's counters
    pub async fn reset_stage(&self, stage_name: &str) -> Result<bool, CoreError> {
        let mut state = self.inner.lock().await;
        if !state.stages.reset_stage(stage_name) {
            return Ok(false);
        }
        state.sync_health();
        self.persist(&state).await?;
        Ok(true)
    }

    pub async fn set_active_stage(&self, stage_name: Option<String>) -> Result<(), CoreError> {
        let mut state = self.inner.lock().await;
        state.stages.set_active_stage(stage_name);
        self.persist(&state).await
    }

    pub async fn stage(&self, stage_name: &str) -> Option<StageState> {
        self.inner.lock().await.stages.stage(stage_name).cloned()
    }

    pub async fn is_schedulable(&self, stage_name: &str) -> bool {
        self.inner.lock().await.stages.is_schedulable(stage_name)
    }

    // ---- issues and health ---------------------------------------------

    pub async fn register_issue(
        &self,
        issue_type: IssueType,
        metadata: IssueMetadata,
    ) -> Result<HealthStatus, CoreError> {
        let mut state = self.inner.lock().await;
        state.issues.register(issue_type, metadata);
        let health = state.sync_health();
        self.persist(&state).await?;
        Ok(health)
    }

    pub async fn resolve_issue(&self, issue_type: IssueType) -> Result<Option<ActiveIssue>, CoreError> {
        let mut state = self.inner.lock().await;
        let Some(resolved) = state.issues.resolve(issue_type) else {
            return Ok(None);
        };
        state.sync_health();
        self.persist(&state).await?;
        Ok(Some(resolved))
    }

    pub async fn compute_health_status(&self) -> HealthStatus {
        self.inner.lock().await.health()
    }

    pub async fn active_issues(&self) -> Vec<ActiveIssue> {
        self.inner.lock().await.issues.active_issues().cloned().collect()
    }

    // ---- recovery ------------------------------------------------------

    /// Try the registered workflow, then a synthesized one, then give up.
    /// Performs the resulting transition itself.
    pub async fn execute_workflow(
        &self,
        issue_type: IssueType,
        context: RecoveryContext,
    ) -> Result<RecoveryOutcome, CoreError> {
        let correlation_id = generate_correlation_id();
        let span = create_recovery_span(&self.run_id, &issue_type.to_string(), Some(&correlation_id));

        self.recover(issue_type, context).instrument(span).await
    }

    async fn recover(
        &self,
        issue_type: IssueType,
        context: RecoveryContext,
    ) -> Result<RecoveryOutcome, CoreError> {
        let mut state = self.inner.lock().await;
        let mut failure_state = None;

        if let Some(workflow) = state.registry.get(issue_type).cloned() {
            let run = state.executor.run(issue_type, &workflow, context.clone()).await?;
            if run.success {
                let (target, transitioned) =
                    self.finish_recovery(&mut state, issue_type, &workflow).await?;
                return Ok(RecoveryOutcome::Recovered {
                    workflow: workflow.name,
                    target,
                    transitioned,
                });
            }
            failure_state = Some(workflow.failure_state);
        } else {
            debug!(issue_type = %issue_type, "No registered workflow");
        }

        let synthesized = match &state.synthesis {
            Some(adapter) => {
                adapter
                    .synthesize(issue_type, &context, state.executor.actions())
                    .await
            }
            None => None,
        };

        if let Some(workflow) = synthesized {
            state.registry.install(issue_type, workflow.clone());
            let run = state.executor.run(issue_type, &workflow, context).await?;
            if run.success {
                let (target, transitioned) =
                    self.finish_recovery(&mut state, issue_type, &workflow).await?;
                return Ok(RecoveryOutcome::Synthesized {
                    workflow: workflow.name,
                    target,
                    transitioned,
                });
            }
            failure_state = Some(workflow.failure_state);
        }

        let target = failure_state.unwrap_or(state.unrecoverable_state);
        warn!(issue_type = %issue_type, target = %target, "Recovery exhausted");
        let transitioned = state.apply_transition(
            target,
            Event::RecoveryFail,
            Some(format!("no recovery for {issue_type}")),
            None,
        );
        if !transitioned {
            warn!(
                from = %state.engine.current_state(),
                to = %target,
                "Failure state not reachable, pipeline state unchanged"
            );
        }
        self.persist(&state).await?;
        Ok(RecoveryOutcome::Exhausted {
            target,
            transitioned,
        })
    }

    async fn finish_recovery(
        &self,
        state: &mut CoreState,
        issue_type: IssueType,
        workflow: &Workflow,
    ) -> Result<(PipelineState, bool), CoreError> {
        let target = workflow.success_state;
        let transitioned = state.apply_transition(
            target,
            Event::RecoverySuccess,
            Some(format!("{} recovered {issue_type}", workflow.name)),
            Some(serde_json::json!({ "workflow": workflow.name, "origin": workflow.origin })),
        );
        if !transitioned {
            warn!(
                workflow = %workflow.name,
                from = %state.engine.current_state(),
                to = %target,
                "Success state not reachable, pipeline state unchanged"
            );
        }
        state.issues.resolve(issue_type);
        state.sync_health();
        self.persist(state).await?;
        Ok((target, transitioned))
    }

    pub async fn workflow_history(&self) -> Vec<WorkflowExecutionRecord> {
        self.inner.lock().await.executor.history().to_vec()
    }

    pub async fn registered_workflow(&self, issue_type: IssueType) -> Option<Workflow> {
        self.inner.lock().await.registry.get(issue_type).cloned()
    }

    // ---- rollback ------------------------------------------------------

    pub async fn push_state(
        &self,
        pipeline_state: PipelineState,
        context: Option<serde_json::Value>,
    ) -> Result<(), CoreError> {
        let mut state = self.inner.lock().await;
        state.automaton.push_state(pipeline_state, context)?;
        self.persist(&state).await
    }

    pub async fn pop_state(&self) -> Result<Option<StackFrame>, CoreError> {
        let mut state = self.inner.lock().await;
        let frame = state.automaton.pop_state();
        if frame.is_some() {
            self.persist(&state).await?;
        }
        Ok(frame)
    }

    pub async fn peek_state(&self) -> Option<StackFrame> {
        self.inner.lock().await.automaton.peek_state().cloned()
    }

    pub async fn stack_depth(&self) -> usize {
        self.inner.lock().await.automaton.depth()
    }

    /// Pop back to the most recent frame for `target` and move there.
    ///
    /// Refused (empty result, stack untouched) when the pipeline could not
    /// legally end up in `target` from where it is now, even if a frame for
    /// `target` is on the stack.
    pub async fn rollback_to_state(&self, target: PipelineState) -> Result<Vec<StackFrame>, CoreError> {
        let mut state = self.inner.lock().await;
        let current = state.engine.current_state();

        if current != target && !state.engine.can_transition(target) {
            warn!(from = %current, to = %target, "Rollback target unreachable from current state");
            return Ok(Vec::new());
        }

        let frames = state.automaton.rollback_to_state(target);
        if frames.is_empty() {
            return Ok(frames);
        }

        if current != target {
            state.apply_transition(
                target,
                Event::RollbackComplete,
                Some(format!("rolled back {} frame(s)", frames.len())),
                frames.last().map(|frame| frame.context.clone()),
            );
        }
        self.persist(&state).await?;
        Ok(frames)
    }

    // ---- checkpoints ---------------------------------------------------

    pub async fn create_checkpoint(
        &self,
        total_stages: usize,
        execution_context: serde_json::Value,
    ) -> Result<(), CoreError> {
        let mut state = self.inner.lock().await;
        state.checkpoints.create_checkpoint(total_stages, execution_context);
        self.persist(&state).await
    }

    pub async fn save_stage_checkpoint(
        &self,
        stage: &str,
        status: StageStatus,
        result: Option<serde_json::Value>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<StageCheckpoint, CoreError> {
        let mut state = self.inner.lock().await;
        let checkpoint = state
            .checkpoints
            .save_stage_checkpoint(stage, status, result, start, end)
            .clone();
        self.persist(&state).await?;
        Ok(checkpoint)
    }

    /// Whether a resumable (present, matching, non-terminal) document exists
    pub async fn can_resume(&self, run_id: &str) -> bool {
        let Some(persistence) = &self.persistence else {
            return false;
        };

        match persistence.load(run_id).await {
            Ok(Some(run)) => run.run_id == run_id && !run.snapshot.is_terminal(),
            Ok(None) => false,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Stored run is not resumable");
                false
            }
        }
    }

    /// Load this run's document and adopt it. Only a core that has not been
    /// driven yet can resume; stages already completed are reported in the
    /// returned set so the driver can skip them.
    pub async fn resume_from_checkpoint(&self) -> Result<Option<CheckpointSet>, CoreError> {
        let Some(persistence) = &self.persistence else {
            return Ok(None);
        };

        let Some(run) = persistence.load(&self.run_id).await? else {
            info!(run_id = %self.run_id, "No checkpoint to resume from");
            return Ok(None);
        };

        if run.snapshot.is_terminal() {
            info!(run_id = %self.run_id, state = %run.snapshot.state, "Run already finished");
            return Ok(None);
        }

        let mut state = self.inner.lock().await;
        if !state.engine.restore(run.snapshot.state, format!("resumed run {}", run.run_id)) {
            return Ok(None);
        }

        state
            .stages
            .restore(run.snapshot.stages.clone(), run.snapshot.active_stage.clone());
        state.issues.restore(run.snapshot.active_issues.clone());
        state
            .checkpoints
            .restore(run.pipeline.clone(), run.checkpoints.clone());

        let set = CheckpointSet {
            run_id: run.run_id,
            pipeline: run.pipeline,
            checkpoints: run.checkpoints,
            snapshot: state.snapshot(),
        };

        info!(
            run_id = %self.run_id,
            state = %set.snapshot.state,
            completed = set.completed_stages().len(),
            saved_at = %run.updated_at,
            "Resumed run from checkpoint"
        );
        Ok(Some(set))
    }

    pub async fn progress(&self) -> Progress {
        self.inner.lock().await.checkpoints.progress()
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.lock().await.snapshot()
    }
}
