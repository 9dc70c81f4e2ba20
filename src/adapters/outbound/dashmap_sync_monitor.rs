//! DashMap Sync Monitor
//!
//! Implements SyncMonitor using DashMap so executors of different
//! connections append concurrently without a global lock.

use crate::domain::entities::{ConnectionId, SyncAttempt, SyncOutcome, SyncStats};
use crate::domain::ports::SyncMonitor;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Attempts kept per connection unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 256;

/// Closed connections whose history is kept before the oldest is dropped.
pub const DEFAULT_RETIRED_CAPACITY: usize = 64;

/// Attempt log for a single connection.
#[derive(Debug, Default)]
struct AttemptLog {
    attempts: VecDeque<SyncAttempt>,
    stats: SyncStats,
    total_duration: Duration,
}

impl AttemptLog {
    fn append(&mut self, attempt: SyncAttempt, capacity: usize) {
        let stats = &mut self.stats;
        stats.total += 1;
        match attempt.outcome {
            SyncOutcome::Success => {
                stats.successes += 1;
                stats.last_success_at = Some(attempt.finished_at);
            }
            SyncOutcome::TransientFailure => {
                stats.transient_failures += 1;
                stats.last_failure_at = Some(attempt.finished_at);
            }
            SyncOutcome::FatalFailure => {
                stats.fatal_failures += 1;
                stats.last_failure_at = Some(attempt.finished_at);
            }
        }
        if attempt.overran_interval {
            stats.overruns += 1;
        }
        stats.frames_transferred += attempt.transfer.frames() as u64;

        self.total_duration += attempt.duration;
        stats.mean_duration = self.total_duration / stats.total.min(u32::MAX as u64) as u32;

        // Eviction only bounds memory; totals keep counting.
        if self.attempts.len() >= capacity {
            self.attempts.pop_front();
        }
        self.attempts.push_back(attempt);
    }
}

/// DashMap-backed sync monitor with a bounded per-connection history.
///
/// Logs of live connections are never dropped. Once a connection retires,
/// its log stays queryable until `retired_capacity` newer ones have retired.
pub struct DashMapSyncMonitor {
    capacity: usize,
    retired_capacity: usize,
    logs: DashMap<ConnectionId, AttemptLog>,
    retired: Mutex<VecDeque<ConnectionId>>,
}

impl DashMapSyncMonitor {
    /// Create a monitor keeping the default number of attempts per connection.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a monitor keeping at most `capacity` attempts per connection.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_limits(capacity, DEFAULT_RETIRED_CAPACITY)
    }

    /// Create a monitor bounding both per-connection history and the number
    /// of closed connections remembered.
    pub fn with_limits(capacity: usize, retired_capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            retired_capacity,
            logs: DashMap::new(),
            retired: Mutex::new(VecDeque::new()),
        }
    }

    /// Drop all history for a connection.
    pub fn forget(&self, connection: ConnectionId) {
        self.retired.lock().retain(|id| *id != connection);
        self.logs.remove(&connection);
    }
}

impl Default for DashMapSyncMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMonitor for DashMapSyncMonitor {
    fn record(&self, attempt: SyncAttempt) {
        let capacity = self.capacity;
        self.logs
            .entry(attempt.connection)
            .or_default()
            .append(attempt, capacity);
    }

    fn recent(&self, connection: ConnectionId, limit: usize) -> Vec<SyncAttempt> {
        self.logs
            .get(&connection)
            .map(|log| log.attempts.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    fn stats(&self, connection: ConnectionId) -> SyncStats {
        self.logs
            .get(&connection)
            .map(|log| log.stats.clone())
            .unwrap_or_default()
    }

    fn connections(&self) -> Vec<ConnectionId> {
        self.logs.iter().map(|e| *e.key()).collect()
    }

    fn retire(&self, connection: ConnectionId) {
        if !self.logs.contains_key(&connection) {
            return;
        }
        let mut retired = self.retired.lock();
        if retired.contains(&connection) {
            return;
        }
        retired.push_back(connection);
        while retired.len() > self.retired_capacity {
            if let Some(oldest) = retired.pop_front() {
                self.logs.remove(&oldest);
                tracing::debug!("dropped sync history of closed connection {}", oldest);
            }
        }
    }
}
