//! State management for deployment units.
//!
//! Every unit owns one versioned snapshot recording what was provisioned,
//! the outputs the provider returned, and a bounded operation history.
//! Stores only accept a write based on the version they currently hold.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{FileLock, LockInfo, writer_id};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{HistoryEntry, Operation, ResourceState, STATE_FORMAT, SnapshotScope, StateSnapshot};
