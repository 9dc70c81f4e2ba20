//! Domain Entities - Core replication objects
//!
//! These entities describe sync attempts, change frames and the identities
//! that tie connections to execution contexts. They have no I/O of their own.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Identity of an execution context (thread or task) holding a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity derived from the calling OS thread.
    pub fn current_thread() -> Self {
        let thread = std::thread::current();
        match thread.name() {
            Some(name) => Self(format!("thread:{}:{:?}", name, thread.id())),
            None => Self(format!("thread:{:?}", thread.id())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique identifier of one opened ReplicaConnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a local replica file, persisted inside the file itself.
///
/// The remote primary uses it to deduplicate re-pushed frames and the
/// replica uses it to skip its own frames when pulling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub String);

impl ReplicaId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bound statement parameter or a column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Result of executing one statement against the local replica.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementResult {
    /// Column names for read statements (empty for writes)
    pub columns: Vec<String>,
    /// Rows returned by read statements
    pub rows: Vec<Vec<SqlValue>>,
    /// Rows changed by a write statement
    pub rows_affected: usize,
    /// Rowid of the last insert on this connection
    pub last_insert_rowid: i64,
}

/// A locally committed write, recorded for replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFrame {
    /// Monotonic per-replica sequence (outbox row id)
    pub origin_seq: u64,
    /// Statement text exactly as executed locally
    pub sql: String,
    /// Bound parameters
    pub params: Vec<SqlValue>,
}

impl ChangeFrame {
    /// Approximate wire size, used for transfer metrics.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|b| b.len()).unwrap_or(0)
    }
}

/// A frame as sequenced by the remote primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFrame {
    /// Global sequence assigned by the remote
    pub seq: u64,
    /// Replica that produced the frame
    pub origin: ReplicaId,
    pub frame: ChangeFrame,
}

/// CRC32 over a batch of frames, carried with every push and pull.
pub fn frames_checksum<T: Serialize>(frames: &[T]) -> u32 {
    let bytes = bincode::serialize(frames).unwrap_or_default();
    crc32fast::hash(&bytes)
}

/// What started a sync exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncTrigger {
    /// Caller requested an immediate sync
    Manual,
    /// Background scheduler tick
    Scheduled,
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncTrigger::Manual => write!(f, "manual"),
            SyncTrigger::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Retry class of a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Network, remote busy: retried by the next tick or an explicit retry
    Transient,
    /// Authentication, protocol mismatch, integrity: never retried automatically
    Fatal,
}

/// Outcome of one sync exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOutcome {
    Success,
    TransientFailure,
    FatalFailure,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            SyncOutcome::Success => None,
            SyncOutcome::TransientFailure => Some(FailureKind::Transient),
            SyncOutcome::FatalFailure => Some(FailureKind::Fatal),
        }
    }
}

impl From<FailureKind> for SyncOutcome {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Transient => SyncOutcome::TransientFailure,
            FailureKind::Fatal => SyncOutcome::FatalFailure,
        }
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOutcome::Success => write!(f, "success"),
            SyncOutcome::TransientFailure => write!(f, "transient-failure"),
            SyncOutcome::FatalFailure => write!(f, "fatal-failure"),
        }
    }
}

/// Amount of data moved by one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Local frames sent to the remote
    pub frames_pushed: usize,
    /// Remote frames applied locally (own frames excluded)
    pub frames_pulled: usize,
    /// Encoded payload bytes in both directions
    pub bytes: usize,
}

impl Transfer {
    pub fn frames(&self) -> usize {
        self.frames_pushed + self.frames_pulled
    }
}

/// Record of one executed synchronization.
///
/// Created when an exchange starts and finalized exactly once; the monitor
/// only ever stores finalized attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub connection: ConnectionId,
    pub trigger: SyncTrigger,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub duration: Duration,
    pub outcome: SyncOutcome,
    pub error: Option<String>,
    pub transfer: Transfer,
    /// Scheduled attempt that took longer than the sync interval
    pub overran_interval: bool,
}

impl SyncAttempt {
    pub fn is_noop(&self) -> bool {
        self.outcome.is_success() && self.transfer.frames() == 0
    }
}

/// Aggregate counters for one connection's attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total: u64,
    pub successes: u64,
    pub transient_failures: u64,
    pub fatal_failures: u64,
    /// Scheduled attempts whose duration exceeded the interval
    pub overruns: u64,
    pub frames_transferred: u64,
    pub last_success_at: Option<SystemTime>,
    pub last_failure_at: Option<SystemTime>,
    pub mean_duration: Duration,
}
