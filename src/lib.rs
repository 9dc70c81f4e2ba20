//! replica-sync Library
//!
//! Embedded replica synchronization engine: a local SQLite replica serves
//! reads and writes immediately while a per-connection scheduler pushes and
//! pulls changes to and from a remote primary.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use adapters::outbound::{DashMapSyncMonitor, HttpRemoteConnector, MemoryRemote, SqliteReplicaStore};
pub use application::{ConnectionLease, ConnectionRegistry, ReplicaConnection, SyncExecutor, SyncScheduler};
pub use config::{load_config, ConcurrencyMode};
pub use domain::entities::{ContextId, SqlValue, SyncAttempt, SyncOutcome, SyncStats, SyncTrigger};
pub use domain::errors::{ReplicaError, RemoteError};
pub use domain::ports::{RemoteConnector, RemotePrimary, SyncMonitor};
pub use domain::value_objects::SyncConfig;
