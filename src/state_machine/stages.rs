use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageStatus::Pending => "PENDING",
            StageStatus::Running => "RUNNING",
            StageStatus::Completed => "COMPLETED",
            StageStatus::Failed => "FAILED",
            StageStatus::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    #[serde(rename = "state")]
    pub status: StageStatus,
    pub execution_count: u32,
    pub failure_count: u32,
    pub total_duration_ms: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub circuit_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Failure timestamps still inside the circuit breaker window
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub recent_failures: VecDeque<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Default for StageState {
    fn default() -> Self {
        Self {
            status: StageStatus::Pending,
            execution_count: 0,
            failure_count: 0,
            total_duration_ms: 0,
            last_failure: None,
            circuit_open: false,
            started_at: None,
            recent_failures: VecDeque::new(),
            details: None,
        }
    }
}

/// Optional extras accompanying a status change
#[derive(Debug, Clone, Default)]
pub struct StageUpdate {
    /// Overrides the measured running time when the stage leaves `Running`
    pub duration: Option<std::time::Duration>,
    /// Explicit circuit-open signal from the stage executor
    pub open_circuit: bool,
    pub details: Option<serde_json::Value>,
}

impl StageUpdate {
    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn open_circuit(mut self) -> Self {
        self.open_circuit = true;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerPolicy {
    pub failure_threshold: u32,
    pub window: Duration,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::seconds(300),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("Stage '{stage}' has an open circuit breaker and cannot be scheduled")]
    CircuitOpen { stage: String },
}

/// Per-stage bookkeeping: status, counters and circuit breakers
#[derive(Debug, Clone, Default)]
pub struct StageStateManager {
    stages: BTreeMap<String, StageState>,
    active_stage: Option<String>,
    policy: CircuitBreakerPolicy,
}

impl StageStateManager {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self {
            stages: BTreeMap::new(),
            active_stage: None,
            policy,
        }
    }

    pub fn update_stage_state(
        &mut self,
        stage_name: &str,
        status: StageStatus,
        update: StageUpdate,
    ) -> Result<(), StageError> {
        let now = Utc::now();
        let policy = self.policy;

        if status == StageStatus::Running && !self.is_schedulable(stage_name) {
            warn!(stage = %stage_name, "Refusing to schedule stage with open circuit");
            return Err(StageError::CircuitOpen {
                stage: stage_name.to_string(),
            });
        }

        let stage = self.stages.entry(stage_name.to_string()).or_default();
        let previous = stage.status;

        if previous == StageStatus::Running && status != StageStatus::Running {
            let elapsed = match (update.duration, stage.started_at) {
                (Some(duration), _) => duration.as_millis() as u64,
                (None, Some(started)) => (now - started).num_milliseconds().max(0) as u64,
                (None, None) => 0,
            };
            stage.total_duration_ms = stage.total_duration_ms.saturating_add(elapsed);
            stage.started_at = None;
        } else if previous != StageStatus::Running && status != StageStatus::Running {
            if let Some(duration) = update.duration {
                stage.total_duration_ms =
                    stage.total_duration_ms.saturating_add(duration.as_millis() as u64);
            }
        }

        if status == StageStatus::Running {
            stage.execution_count = stage.execution_count.saturating_add(1);
            stage.started_at = Some(now);
        }

        let mut circuit_tripped = false;
        if status == StageStatus::Failed {
            stage.failure_count = stage.failure_count.saturating_add(1);
            stage.last_failure = Some(now);
            stage.recent_failures.push_back(now);
            while let Some(oldest) = stage.recent_failures.front() {
                if now - *oldest > policy.window {
                    stage.recent_failures.pop_front();
                } else {
                    break;
                }
            }
            if !stage.circuit_open && stage.recent_failures.len() as u32 >= policy.failure_threshold {
                circuit_tripped = true;
            }
        }
        if update.open_circuit && !stage.circuit_open {
            circuit_tripped = true;
        }
        if circuit_tripped {
            stage.circuit_open = true;
            warn!(
                stage = %stage_name,
                failure_count = stage.failure_count,
                recent_failures = stage.recent_failures.len(),
                "Stage circuit breaker opened"
            );
        }

        if update.details.is_some() {
            stage.details = update.details;
        }
        stage.status = status;

        info!(
            stage = %stage_name,
            from = %previous,
            to = %status,
            execution_count = stage.execution_count,
            failure_count = stage.failure_count,
            "Stage state updated"
        );

        if status == StageStatus::Running {
            self.active_stage = Some(stage_name.to_string());
        } else if self.active_stage.as_deref() == Some(stage_name) {
            self.active_stage = None;
        }

        Ok(())
    }

    /// Operator action: close the circuit and zero the counters.
    pub fn reset_stage(&mut self, stage_name: &str) -> bool {
        match self.stages.get_mut(stage_name) {
            Some(stage) => {
                *stage = StageState::default();
                if self.active_stage.as_deref() == Some(stage_name) {
                    self.active_stage = None;
                }
                info!(stage = %stage_name, "Stage reset by operator");
                true
            }
            None => false,
        }
    }

    pub fn is_schedulable(&self, stage_name: &str) -> bool {
        self.stages
            .get(stage_name)
            .map(|stage| !stage.circuit_open)
            .unwrap_or(true)
    }

    pub fn stage(&self, stage_name: &str) -> Option<&StageState> {
        self.stages.get(stage_name)
    }

    pub fn all_stages(&self) -> &BTreeMap<String, StageState> {
        &self.stages
    }

    pub fn active_stage(&self) -> Option<&str> {
        self.active_stage.as_deref()
    }

    pub fn set_active_stage(&mut self, stage_name: Option<String>) {
        self.active_stage = stage_name;
    }

    pub fn circuit_breakers_open(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|(_, stage)| stage.circuit_open)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn any_circuit_open(&self) -> bool {
        self.stages.values().any(|stage| stage.circuit_open)
    }

    pub(crate) fn restore(&mut self, stages: BTreeMap<String, StageState>, active_stage: Option<String>) {
        self.stages = stages;
        self.active_stage = active_stage;
    }
}
