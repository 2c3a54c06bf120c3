use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::state::{Event, PipelineState};

/// Audit record for one accepted transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from_state: PipelineState,
    pub to_state: PipelineState,
    pub event: Event,
    pub reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Validated pipeline-level state machine with append-only history.
///
/// `transition` doubles as a query: an edge missing from the
/// adjacency table is answered with `false` and leaves the engine untouched.
#[derive(Debug, Clone)]
pub struct StateTransitionEngine {
    current_state: PipelineState,
    history: Vec<TransitionRecord>,
}

impl Default for StateTransitionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTransitionEngine {
    pub fn new() -> Self {
        Self {
            current_state: PipelineState::Initializing,
            history: Vec::new(),
        }
    }

    pub fn current_state(&self) -> PipelineState {
        self.current_state
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn can_transition(&self, to_state: PipelineState) -> bool {
        self.current_state.can_transition_to(to_state)
    }

    pub fn allowed_targets(&self) -> &'static [PipelineState] {
        self.current_state.allowed_targets()
    }

    pub fn transition(
        &mut self,
        to_state: PipelineState,
        event: Event,
        reason: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> bool {
        if !self.can_transition(to_state) {
            debug!(
                from = %self.current_state,
                to = %to_state,
                event = %event,
                "Rejected pipeline transition"
            );
            return false;
        }

        self.record_transition(to_state, event, reason, metadata);
        true
    }

    /// Seed a fresh engine with a state loaded from persistence.
    ///
    /// Bypasses the adjacency table, so it is only honoured while the history is
    /// still empty; the restore itself becomes the first history entry.
    pub fn restore(&mut self, state: PipelineState, reason: impl Into<String>) -> bool {
        if !self.history.is_empty() {
            warn!(
                current = %self.current_state,
                requested = %state,
                "Refusing to restore an engine that already has history"
            );
            return false;
        }

        self.record_transition(state, Event::Restore, Some(reason.into()), None);
        true
    }

    fn record_transition(
        &mut self,
        to_state: PipelineState,
        event: Event,
        reason: Option<String>,
        metadata: Option<serde_json::Value>,
    ) {
        // Keep timestamps monotonic even if the wall clock steps backwards.
        let now = Utc::now();
        let timestamp = match self.history.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };

        let record = TransitionRecord {
            from_state: self.current_state,
            to_state,
            event,
            reason,
            metadata,
            timestamp,
        };

        info!(
            from = %record.from_state,
            to = %record.to_state,
            event = %record.event,
            reason = ?record.reason,
            "Pipeline state transition"
        );

        self.current_state = to_state;
        self.history.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_engine() -> StateTransitionEngine {
        let mut engine = StateTransitionEngine::new();
        assert!(engine.transition(PipelineState::Ready, Event::Initialized, None, None));
        assert!(engine.transition(PipelineState::Running, Event::Start, None, None));
        engine
    }

    #[test]
    fn starts_in_initializing_with_empty_history() {
        let engine = StateTransitionEngine::new();
        assert_eq!(engine.current_state(), PipelineState::Initializing);
        assert!(engine.history().is_empty());
    }

    #[test]
    fn records_accepted_transitions() {
        let engine = running_engine();
        let history = engine.history();

        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from_state, PipelineState::Initializing);
        assert_eq!(history[1].to_state, PipelineState::Running);
        assert_eq!(history[1].event, Event::Start);
        assert!(history[0].timestamp <= history[1].timestamp);
    }

    #[test]
    fn rejected_transition_leaves_state_untouched() {
        let mut engine = StateTransitionEngine::new();

        assert!(!engine.transition(PipelineState::Running, Event::Start, None, None));
        assert_eq!(engine.current_state(), PipelineState::Initializing);
        assert!(engine.history().is_empty());
    }

    #[test]
    fn terminal_state_rejects_everything() {
        let mut engine = running_engine();
        assert!(engine.transition(PipelineState::Completed, Event::Complete, None, None));

        for target in PipelineState::ALL {
            assert!(!engine.transition(target, Event::Resume, None, None));
        }
        assert_eq!(engine.history().len(), 3);
    }

    #[test]
    fn reason_and_metadata_are_kept() {
        let mut engine = running_engine();
        engine.transition(
            PipelineState::Paused,
            Event::Pause,
            Some("operator request".to_string()),
            Some(serde_json::json!({ "ticket": 42 })),
        );

        let last = engine.history().last().unwrap();
        assert_eq!(last.reason.as_deref(), Some("operator request"));
        assert_eq!(last.metadata, Some(serde_json::json!({ "ticket": 42 })));
    }

    #[test]
    fn restore_only_applies_to_fresh_engine() {
        let mut fresh = StateTransitionEngine::new();
        assert!(fresh.restore(PipelineState::Running, "resumed"));
        assert_eq!(fresh.current_state(), PipelineState::Running);
        assert_eq!(fresh.history()[0].event, Event::Restore);

        let mut used = running_engine();
        assert!(!used.restore(PipelineState::Critical, "resumed"));
        assert_eq!(used.current_state(), PipelineState::Running);
    }
}
