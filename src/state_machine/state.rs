use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle marker of the control plane itself, distinct from any stage status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Initializing,
    Ready,
    Running,
    Paused,
    Healthy,
    DegradedHealth,
    Critical,
    Completed,
    Failed,
}

impl PipelineState {
    pub const ALL: [PipelineState; 9] = [
        PipelineState::Initializing,
        PipelineState::Ready,
        PipelineState::Running,
        PipelineState::Paused,
        PipelineState::Healthy,
        PipelineState::DegradedHealth,
        PipelineState::Critical,
        PipelineState::Completed,
        PipelineState::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }

    /// Static adjacency table. Terminal states have no outgoing edges.
    ///
    /// ```text
    /// Initializing   -> Ready | Failed
    /// Ready          -> Running | Failed
    /// Running        -> Paused | Healthy | DegradedHealth | Critical | Completed | Failed
    /// Paused         -> Running | Failed
    /// Healthy        -> Running | Paused | DegradedHealth | Critical | Completed | Failed
    /// DegradedHealth -> Running | Healthy | Critical | Paused | Failed
    /// Critical       -> Running | Healthy | DegradedHealth | Failed
    /// ```
    pub fn allowed_targets(self) -> &'static [PipelineState] {
        use PipelineState::*;

        match self {
            Initializing => &[Ready, Failed],
            Ready => &[Running, Failed],
            Running => &[Paused, Healthy, DegradedHealth, Critical, Completed, Failed],
            Paused => &[Running, Failed],
            Healthy => &[Running, Paused, DegradedHealth, Critical, Completed, Failed],
            DegradedHealth => &[Running, Healthy, Critical, Paused, Failed],
            Critical => &[Running, Healthy, DegradedHealth, Failed],
            Completed | Failed => &[],
        }
    }

    pub fn can_transition_to(self, target: PipelineState) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Initializing => "INITIALIZING",
            PipelineState::Ready => "READY",
            PipelineState::Running => "RUNNING",
            PipelineState::Paused => "PAUSED",
            PipelineState::Healthy => "HEALTHY",
            PipelineState::DegradedHealth => "DEGRADED_HEALTH",
            PipelineState::Critical => "CRITICAL",
            PipelineState::Completed => "COMPLETED",
            PipelineState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Triggers recorded alongside every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Initialized,
    Start,
    Pause,
    Resume,
    HealthDegraded,
    HealthCritical,
    HealthRestored,
    RecoverySuccess,
    RecoveryFail,
    RollbackComplete,
    Complete,
    Fail,
    /// Seeds a fresh engine with a state read back from persistence.
    Restore,
}

impl Event {
    pub const ALL: [Event; 13] = [
        Event::Initialized,
        Event::Start,
        Event::Pause,
        Event::Resume,
        Event::HealthDegraded,
        Event::HealthCritical,
        Event::HealthRestored,
        Event::RecoverySuccess,
        Event::RecoveryFail,
        Event::RollbackComplete,
        Event::Complete,
        Event::Fail,
        Event::Restore,
    ];
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::Initialized => "INITIALIZED",
            Event::Start => "START",
            Event::Pause => "PAUSE",
            Event::Resume => "RESUME",
            Event::HealthDegraded => "HEALTH_DEGRADED",
            Event::HealthCritical => "HEALTH_CRITICAL",
            Event::HealthRestored => "HEALTH_RESTORED",
            Event::RecoverySuccess => "RECOVERY_SUCCESS",
            Event::RecoveryFail => "RECOVERY_FAIL",
            Event::RollbackComplete => "ROLLBACK_COMPLETE",
            Event::Complete => "COMPLETE",
            Event::Fail => "FAIL",
            Event::Restore => "RESTORE",
        };
        f.write_str(name)
    }
}
