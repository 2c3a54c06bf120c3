use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::state::PipelineState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub state: PipelineState,
    pub context: serde_json::Value,
    pub pushed_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AutomatonError {
    #[error("Rollback stack is full ({max_depth} frames); refusing to push {state}")]
    StackFull {
        state: PipelineState,
        max_depth: usize,
    },
}

/// Pushdown automaton over pipeline states, used for exploratory rollback.
///
/// Rollback is all-or-nothing: either the target is found and everything down
/// to and including it is popped, or the stack is left exactly as it was.
/// Frames are never discarded behind the caller's back; with a depth limit a
/// push onto a full stack is refused instead.
#[derive(Debug, Clone, Default)]
pub struct PushdownAutomaton {
    // last() is the top of the stack
    frames: Vec<StackFrame>,
    max_depth: Option<usize>,
}

impl PushdownAutomaton {
    /// `None` means unbounded
    pub fn new(max_depth: Option<usize>) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    pub fn push_state(
        &mut self,
        state: PipelineState,
        context: Option<serde_json::Value>,
    ) -> Result<(), AutomatonError> {
        if let Some(max_depth) = self.max_depth {
            if self.frames.len() >= max_depth {
                warn!(max_depth, state = %state, "Rollback stack full, push refused");
                return Err(AutomatonError::StackFull { state, max_depth });
            }
        }

        self.frames.push(StackFrame {
            state,
            context: context.unwrap_or(serde_json::Value::Null),
            pushed_at: Utc::now(),
        });
        debug!(state = %state, depth = self.frames.len(), "Pushed rollback frame");
        Ok(())
    }

    pub fn pop_state(&mut self) -> Option<StackFrame> {
        self.frames.pop()
    }

    pub fn peek_state(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn contains(&self, state: PipelineState) -> bool {
        self.frames.iter().any(|frame| frame.state == state)
    }

    /// Frames bottom-to-top
    pub fn frames(&self) -> impl Iterator<Item = &StackFrame> {
        self.frames.iter()
    }

    /// Pop down to the nearest frame holding `target`, inclusive.
    ///
    /// Returns the popped frames in top-to-bottom order, or an empty vector
    /// (stack untouched) when `target` is not on the stack.
    pub fn rollback_to_state(&mut self, target: PipelineState) -> Vec<StackFrame> {
        let Some(position) = self.frames.iter().rposition(|frame| frame.state == target) else {
            debug!(target = %target, depth = self.frames.len(), "Rollback target not on stack");
            return Vec::new();
        };

        let popped: Vec<StackFrame> = self.frames.drain(position..).rev().collect();

        info!(
            target = %target,
            popped = popped.len(),
            remaining = self.frames.len(),
            "Rolled back automaton"
        );
        popped
    }
}
