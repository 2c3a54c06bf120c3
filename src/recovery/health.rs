use serde::{Deserialize, Serialize};
use std::fmt;

use super::issues::{IssueTracker, Severity};
use crate::state_machine::{Event, PipelineState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Active occurrences at or above `critical_severity` that make health critical
    pub critical_issue_threshold: u32,
    pub critical_severity: Severity,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            critical_issue_threshold: 3,
            critical_severity: Severity::High,
        }
    }
}

/// Aggregate health, derived fresh from the active issues and circuit flags.
///
/// An open circuit dominates everything else.
pub fn compute_health_status(
    issues: &IssueTracker,
    any_circuit_open: bool,
    policy: &HealthPolicy,
) -> HealthStatus {
    if any_circuit_open {
        return HealthStatus::Critical;
    }
    if issues.occurrences_at_least(policy.critical_severity) >= policy.critical_issue_threshold {
        return HealthStatus::Critical;
    }
    if !issues.is_empty() {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

/// Edge driven by a health tier: target state, event, and the states it fires from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub target: PipelineState,
    pub event: Event,
    pub applies_from: &'static [PipelineState],
}

/// Health tier → pipeline edge. `Healthy` only restores from a degraded or
/// critical state; it never pushes an idle pipeline into motion.
pub fn health_transition(status: HealthStatus) -> HealthTransition {
    use PipelineState::*;

    match status {
        HealthStatus::Degraded => HealthTransition {
            target: DegradedHealth,
            event: Event::HealthDegraded,
            applies_from: &[Running, Healthy, Critical],
        },
        HealthStatus::Critical => HealthTransition {
            target: Critical,
            event: Event::HealthCritical,
            applies_from: &[Running, Healthy, DegradedHealth],
        },
        HealthStatus::Healthy => HealthTransition {
            target: Healthy,
            event: Event::HealthRestored,
            applies_from: &[DegradedHealth, Critical],
        },
    }
}

/// The auto-transition to attempt from `current`, if any
pub fn auto_transition_for(
    status: HealthStatus,
    current: PipelineState,
) -> Option<(PipelineState, Event)> {
    let edge = health_transition(status);
    edge.applies_from
        .contains(&current)
        .then_some((edge.target, edge.event))
}
