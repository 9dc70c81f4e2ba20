//! Application Layer
//!
//! Connections, the registry that owns them, and the sync machinery that
//! runs on their behalf.

mod connection;
mod registry;
mod scheduler;
mod sync_executor;

pub use connection::ReplicaConnection;
pub use registry::{ConnectionLease, ConnectionRegistry};
pub use scheduler::{SchedulerHandle, SchedulerPhase, SchedulerSnapshot, SchedulerState, SyncScheduler};
pub use sync_executor::SyncExecutor;
