use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::recovery::{ActiveIssue, HealthStatus};
use crate::state_machine::{PipelineState, StageState};

/// Point-in-time view of a run. Derived from the live components, never
/// mutated on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: PipelineState,
    pub stages: BTreeMap<String, StageState>,
    pub active_stage: Option<String>,
    pub health_status: HealthStatus,
    pub circuit_open_stages: Vec<String>,
    pub active_issues: Vec<ActiveIssue>,
    #[serde(default)]
    pub rollback_depth: usize,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn completed_stages(&self) -> impl Iterator<Item = &str> {
        self.stages
            .iter()
            .filter(|(_, stage)| stage.status == crate::state_machine::StageStatus::Completed)
            .map(|(name, _)| name.as_str())
    }
}
