//! Domain Layer
//!
//! Plain replication types, the error taxonomy and the ports the
//! application layer talks through.

pub mod entities;
pub mod errors;
pub mod ports;
pub mod value_objects;

pub use entities::{
    ChangeFrame, ConnectionId, ContextId, FailureKind, RemoteFrame, ReplicaId, SqlValue,
    StatementResult, SyncAttempt, SyncOutcome, SyncStats, SyncTrigger, Transfer,
};
pub use errors::{ConfigError, RegistryError, RemoteError, ReplicaError, StatementError};
pub use value_objects::{AuthToken, EncryptionKey, RemoteEndpoint, SyncConfig, SyncConfigBuilder};
