//! Pipeline lifecycle tracking
//!
//! The engine owns the pipeline-level state and its audit history, the stage
//! manager owns per-stage bookkeeping, and the automaton keeps rollback frames.

pub mod automaton;
pub mod engine;
pub mod stages;
pub mod state;

pub use automaton::{AutomatonError, PushdownAutomaton, StackFrame};
pub use engine::{StateTransitionEngine, TransitionRecord};
pub use stages::{
    CircuitBreakerPolicy, StageError, StageState, StageStateManager, StageStatus, StageUpdate,
};
pub use state::{Event, PipelineState};
