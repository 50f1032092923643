//! Process-level plumbing: snapshot persistence and the background
//! lifecycle worker that drives the timed sweeps.

pub mod snapshot;
pub mod worker;

pub use snapshot::{RestoredState, Snapshot, SnapshotError, SnapshotStore};
pub use worker::{LifecycleWorker, LifecycleWorkerConfig, WorkerHandle, WorkerStats};
