//! Sync Monitor Port
//!
//! Append-only record of sync attempts, queried by operators to tune the
//! sync interval.

use crate::domain::entities::{ConnectionId, SyncAttempt, SyncStats};

/// Store for finalized sync attempts.
///
/// Appends from different connections are independent and must not require
/// external locking.
pub trait SyncMonitor: Send + Sync {
    /// Append a finalized attempt.
    fn record(&self, attempt: SyncAttempt);

    /// Most recent attempts for a connection, newest first.
    fn recent(&self, connection: ConnectionId, limit: usize) -> Vec<SyncAttempt>;

    /// Aggregate counters for a connection.
    fn stats(&self, connection: ConnectionId) -> SyncStats;

    /// Connections with at least one recorded attempt.
    fn connections(&self) -> Vec<ConnectionId>;

    /// The connection is closed and will record nothing more. Its history
    /// may be dropped from here on.
    fn retire(&self, _connection: ConnectionId) {}
}
