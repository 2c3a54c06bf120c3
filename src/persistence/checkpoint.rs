use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

use crate::coordinator::Snapshot;
use crate::state_machine::StageStatus;

/// Durable record of a stage reaching a status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCheckpoint {
    pub stage: String,
    pub status: StageStatus,
    pub result: Option<serde_json::Value>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

/// Pipeline-level metadata written by `create_checkpoint`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    pub total_stages: usize,
    pub execution_context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percent: f64,
}

impl Progress {
    fn new(completed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            (completed as f64 / total as f64 * 100.0).min(100.0)
        };
        Self {
            completed,
            total,
            percent,
        }
    }
}

/// Latest checkpoint per stage wins; earlier ones are kept for audit.
fn latest_status<'a>(
    checkpoints: &'a [StageCheckpoint],
) -> impl Iterator<Item = (&'a str, StageStatus)> + 'a {
    let mut seen = BTreeSet::new();
    checkpoints.iter().rev().filter_map(move |checkpoint| {
        seen.insert(checkpoint.stage.as_str())
            .then_some((checkpoint.stage.as_str(), checkpoint.status))
    })
}

fn completed_stage_names(checkpoints: &[StageCheckpoint]) -> BTreeSet<String> {
    latest_status(checkpoints)
        .filter(|(_, status)| *status == StageStatus::Completed)
        .map(|(stage, _)| stage.to_string())
        .collect()
}

/// The unit of resume: everything needed to skip already-completed stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSet {
    pub run_id: String,
    pub pipeline: Option<PipelineCheckpoint>,
    pub checkpoints: Vec<StageCheckpoint>,
    pub snapshot: Snapshot,
}

impl CheckpointSet {
    pub fn completed_stages(&self) -> BTreeSet<String> {
        completed_stage_names(&self.checkpoints)
    }

    pub fn progress(&self) -> Progress {
        let total = self.pipeline.as_ref().map(|p| p.total_stages).unwrap_or(0);
        Progress::new(self.completed_stages().len(), total)
    }
}

/// In-memory checkpoint bookkeeping for one run; the facade persists it
#[derive(Debug, Clone, Default)]
pub struct CheckpointManager {
    pipeline: Option<PipelineCheckpoint>,
    checkpoints: Vec<StageCheckpoint>,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_checkpoint(&mut self, total_stages: usize, execution_context: serde_json::Value) {
        info!(total_stages, "Pipeline checkpoint created");
        self.pipeline = Some(PipelineCheckpoint {
            total_stages,
            execution_context,
            created_at: Utc::now(),
        });
    }

    pub fn save_stage_checkpoint(
        &mut self,
        stage: &str,
        status: StageStatus,
        result: Option<serde_json::Value>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> &StageCheckpoint {
        let superseded = self.checkpoints.iter().any(|c| c.stage == stage);
        info!(stage = %stage, status = %status, superseded, "Stage checkpoint saved");

        self.checkpoints.push(StageCheckpoint {
            stage: stage.to_string(),
            status,
            result,
            start,
            end,
            recorded_at: Utc::now(),
        });
        &self.checkpoints[self.checkpoints.len() - 1]
    }

    pub fn latest(&self, stage: &str) -> Option<&StageCheckpoint> {
        self.checkpoints.iter().rev().find(|c| c.stage == stage)
    }

    pub fn pipeline(&self) -> Option<&PipelineCheckpoint> {
        self.pipeline.as_ref()
    }

    pub fn checkpoints(&self) -> &[StageCheckpoint] {
        &self.checkpoints
    }

    pub fn completed_stages(&self) -> BTreeSet<String> {
        completed_stage_names(&self.checkpoints)
    }

    pub fn progress(&self) -> Progress {
        let total = self.pipeline.as_ref().map(|p| p.total_stages).unwrap_or(0);
        Progress::new(self.completed_stages().len(), total)
    }

    pub(crate) fn restore(
        &mut self,
        pipeline: Option<PipelineCheckpoint>,
        checkpoints: Vec<StageCheckpoint>,
    ) {
        self.pipeline = pipeline;
        self.checkpoints = checkpoints;
    }
}
