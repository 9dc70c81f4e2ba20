//! Error Taxonomy
//!
//! Local-store errors surface synchronously to the caller that triggered
//! them. Remote errors are classified into transient and fatal sync outcomes.

use crate::domain::entities::{ContextId, FailureKind, SyncAttempt};
use std::time::Duration;

/// Errors returned by replica connections and the registry.
///
/// Cloneable so every caller coalesced onto one exchange receives the result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicaError {
    /// Local file I/O, permission or corruption. Fatal to the connection.
    #[error("storage error: {0}")]
    Storage(String),

    /// Bad statement input. Not retryable.
    #[error("statement error: {0}")]
    Statement(#[from] StatementError),

    /// A conflicting exclusive operation (sync apply) held the replica.
    #[error("replica locked: {0}")]
    Lock(String),

    /// Manual sync requested on a local-only connection.
    #[error("connection is not replicated: configure a remote endpoint to sync")]
    NotReplicated,

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Caller deadline expired; the exchange keeps running.
    #[error("sync did not complete within {0:?}")]
    Timeout(Duration),

    #[error("connection is closed")]
    Closed,

    /// A manual sync exchange failed.
    #[error("sync failed ({kind:?}): {detail}")]
    SyncFailed {
        kind: FailureKind,
        detail: String,
        attempt: Box<SyncAttempt>,
    },

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ReplicaError {
    /// True when retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicaError::Lock(_) | ReplicaError::Timeout(_) => true,
            ReplicaError::SyncFailed { kind, .. } => *kind == FailureKind::Transient,
            _ => false,
        }
    }
}

/// Errors caused by the statement itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatementError {
    #[error("malformed statement: {0}")]
    Malformed(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Every statement autocommits; explicit transaction control is refused.
    #[error("transaction control statements are not supported: {0}")]
    TransactionControl(String),

    #[error("parameter mismatch: {0}")]
    Parameters(String),
}

/// Misuse of the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("context {0} already holds a connection with a different configuration")]
    ConfigMismatch(ContextId),

    #[error("registry is shutting down")]
    ShuttingDown,
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("local path is required")]
    MissingLocalPath,
    #[error("remote endpoint is empty")]
    EmptyEndpoint,
    #[error("unsupported remote endpoint scheme: {0}")]
    UnsupportedScheme(String),
    #[error("in-memory databases cannot be replicated")]
    MemoryReplica,
    #[error("batch sizes must be positive")]
    InvalidBatchSize,
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("remote client: {0}")]
    Client(String),
}

/// Errors reported by the remote primary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote busy: {0}")]
    Busy(String),

    #[error("remote server error: {0}")]
    Server(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("protocol version mismatch: local={local}, remote={remote}")]
    ProtocolMismatch { local: u16, remote: u16 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("batch checksum mismatch")]
    Integrity,
}

impl RemoteError {
    /// Classify for the sync outcome.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RemoteError::Network(_) | RemoteError::Busy(_) | RemoteError::Server(_) => {
                FailureKind::Transient
            }
            RemoteError::Authentication(_)
            | RemoteError::ProtocolMismatch { .. }
            | RemoteError::Protocol(_)
            | RemoteError::Integrity => FailureKind::Fatal,
        }
    }
}

/// Map a rusqlite error onto the local error taxonomy.
impl From<rusqlite::Error> for ReplicaError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::ConstraintViolation => {
                    StatementError::Constraint(err.to_string()).into()
                }
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    ReplicaError::Lock(err.to_string())
                }
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::PermissionDenied
                | ErrorCode::ReadOnly
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::OutOfMemory => ReplicaError::Storage(err.to_string()),
                _ => StatementError::Malformed(err.to_string()).into(),
            },
            rusqlite::Error::InvalidParameterCount(_, _)
            | rusqlite::Error::InvalidParameterName(_) => {
                StatementError::Parameters(err.to_string()).into()
            }
            _ => StatementError::Malformed(err.to_string()).into(),
        }
    }
}
