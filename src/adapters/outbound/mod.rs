mod dashmap_sync_monitor;
mod http_remote;
mod memory_remote;
mod sqlite_replica_store;

pub use dashmap_sync_monitor::{DashMapSyncMonitor, DEFAULT_CAPACITY, DEFAULT_RETIRED_CAPACITY};
pub use http_remote::{HttpRemoteConnector, HttpRemotePrimary, PROTOCOL_HEADER};
pub use memory_remote::{MemoryRemote, MemorySession};
pub use sqlite_replica_store::{SqliteReplicaStore, StatementKind};
