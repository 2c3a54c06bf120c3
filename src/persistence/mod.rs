//! Checkpoint bookkeeping and durable run storage

pub mod checkpoint;
pub mod store;

pub use checkpoint::{CheckpointManager, CheckpointSet, PipelineCheckpoint, Progress, StageCheckpoint};
pub use store::{
    validate_run_id, FileSystemPersistence, InMemoryPersistence, PersistedRun, PersistenceError,
    StatePersistence,
};

#[cfg(any(test, feature = "testing"))]
pub use store::MockStatePersistence;
