//! Checkpoint persistence.
//!
//! [`CheckpointStore`] snapshots a run's [`ExecutionState`] through a
//! [`KvStore`]; [`FsKvStore`] writes atomically to disk and
//! [`MemoryKvStore`] backs tests.

pub mod kv;
pub mod store;

pub use kv::{FsKvStore, KvError, KvStore, MemoryKvStore};
pub use store::{
    Checkpoint, CheckpointError, CheckpointMeta, CheckpointRef, CheckpointStore, ExecutionState,
    RunCounters,
};
