//! Sync Executor - One push/pull/apply exchange
//!
//! Performs exactly one synchronization exchange for a connection:
//! 1. Probe the remote head; skip everything when nothing is pending
//! 2. Push outbox frames in pages
//! 3. Pull remote frames in pages, verifying each page checksum
//! 4. Apply pulled frames and acknowledge pushed ones in one local commit
//!
//! The outcome is classified, recorded by the monitor and returned.

use crate::application::connection::ReplicaConnection;
use crate::domain::entities::{
    FailureKind, RemoteFrame, SyncAttempt, SyncOutcome, SyncTrigger, Transfer,
};
use crate::domain::errors::{RemoteError, ReplicaError};
use crate::domain::ports::{RemotePrimary, SyncMonitor};
use crate::adapters::outbound::SqliteReplicaStore;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::Instrument;

/// Why an exchange stopped, and what it had moved by then.
#[derive(Debug)]
struct ExchangeFailure {
    kind: FailureKind,
    detail: String,
    transfer: Transfer,
}

impl ExchangeFailure {
    fn remote(err: RemoteError, transfer: Transfer) -> Self {
        Self {
            kind: err.failure_kind(),
            detail: err.to_string(),
            transfer,
        }
    }

    /// Local failures are never retried automatically.
    fn local(err: ReplicaError, transfer: Transfer) -> Self {
        Self {
            kind: FailureKind::Fatal,
            detail: err.to_string(),
            transfer,
        }
    }
}

/// Runs sync exchanges and reports them to the monitor.
pub struct SyncExecutor {
    monitor: Arc<dyn SyncMonitor>,
}

impl SyncExecutor {
    pub fn new(monitor: Arc<dyn SyncMonitor>) -> Self {
        Self { monitor }
    }

    pub fn monitor(&self) -> &Arc<dyn SyncMonitor> {
        &self.monitor
    }

    /// Perform one exchange for `connection`.
    ///
    /// Fails only with `NotReplicated` for local-only connections. Every
    /// other problem is reported as a failed [`SyncAttempt`], which is also
    /// appended to the monitor. The dirty counter is reset only by the
    /// final local commit, so a failed attempt never skips unsent writes.
    pub async fn run_once(
        &self,
        connection: &Arc<ReplicaConnection>,
        trigger: SyncTrigger,
    ) -> Result<SyncAttempt, ReplicaError> {
        let remote = connection.remote().ok_or(ReplicaError::NotReplicated)?;

        let _exclusive = connection.exchange_lock().lock().await;
        let span = tracing::info_span!(
            "sync_exchange",
            connection = %connection.id(),
            trigger = %trigger
        );

        let started_at = SystemTime::now();
        let clock = Instant::now();
        let result = exchange(connection, remote.as_ref())
            .instrument(span.clone())
            .await;
        let duration = clock.elapsed();

        let interval = connection.config().sync_interval();
        let overran_interval =
            trigger == SyncTrigger::Scheduled && !interval.is_zero() && duration > interval;

        let (outcome, error, transfer) = match result {
            Ok(transfer) => (SyncOutcome::Success, None, transfer),
            Err(failure) => (
                SyncOutcome::from(failure.kind),
                Some(failure.detail),
                failure.transfer,
            ),
        };

        let attempt = SyncAttempt {
            connection: connection.id(),
            trigger,
            started_at,
            finished_at: SystemTime::now(),
            duration,
            outcome,
            error,
            transfer,
            overran_interval,
        };

        span.in_scope(|| log_attempt(&attempt, interval));
        self.monitor.record(attempt.clone());
        Ok(attempt)
    }
}

fn log_attempt(attempt: &SyncAttempt, interval: std::time::Duration) {
    let error = attempt.error.as_deref().unwrap_or("");
    match attempt.outcome {
        SyncOutcome::Success if attempt.is_noop() => {
            tracing::debug!("sync no-op in {:?}", attempt.duration);
        }
        SyncOutcome::Success => {
            tracing::info!(
                "sync ok pushed={} pulled={} bytes={} in {:?}",
                attempt.transfer.frames_pushed,
                attempt.transfer.frames_pulled,
                attempt.transfer.bytes,
                attempt.duration
            );
        }
        SyncOutcome::TransientFailure => {
            tracing::warn!("sync transient failure after {:?}: {}", attempt.duration, error);
        }
        SyncOutcome::FatalFailure => {
            tracing::error!("sync fatal failure after {:?}: {}", attempt.duration, error);
        }
    }
    if attempt.overran_interval {
        tracing::warn!(
            "sync took {:?}, longer than the {:?} interval",
            attempt.duration,
            interval
        );
    }
}

/// Run a store operation off the async workers.
async fn blocking<T, F>(connection: &Arc<ReplicaConnection>, f: F) -> Result<T, ReplicaError>
where
    T: Send + 'static,
    F: FnOnce(&SqliteReplicaStore) -> Result<T, ReplicaError> + Send + 'static,
{
    let connection = connection.clone();
    tokio::task::spawn_blocking(move || f(connection.store()))
        .await
        .map_err(|e| ReplicaError::Storage(format!("spawn_blocking error: {:?}", e)))?
}

async fn exchange(
    connection: &Arc<ReplicaConnection>,
    remote: &dyn RemotePrimary,
) -> Result<Transfer, ExchangeFailure> {
    let mut transfer = Transfer::default();
    let store = connection.store();
    let config = connection.config();

    // 1. Best-effort "anything pending?" check against the persisted state
    let (cursor, dirty) = blocking(connection, |s| s.refresh())
        .await
        .map_err(|e| ExchangeFailure::local(e, transfer))?;
    let head = remote
        .head()
        .await
        .map_err(|e| ExchangeFailure::remote(e, transfer))?;
    if dirty == 0 && head <= cursor {
        return Ok(transfer);
    }

    // 2. Push
    let replica = store.replica_id().clone();
    let push_limit = config.push_batch_size();
    let mut acknowledged = 0u64;
    loop {
        let after = acknowledged;
        let frames = blocking(connection, move |s| s.pending_frames(after, push_limit))
            .await
            .map_err(|e| ExchangeFailure::local(e, transfer))?;
        if frames.is_empty() {
            break;
        }

        let page = frames.len();
        let last = frames[page - 1].origin_seq;
        let ack = remote
            .push(&replica, &frames)
            .await
            .map_err(|e| ExchangeFailure::remote(e, transfer))?;

        tracing::debug!(
            "pushed {} frames ({} new) remote head={}",
            page,
            ack.accepted,
            ack.head
        );
        transfer.frames_pushed += page;
        transfer.bytes += frames.iter().map(|f| f.encoded_len()).sum::<usize>();
        acknowledged = last;

        if page < push_limit {
            break;
        }
    }

    // 3. Pull
    let pull_limit = config.pull_batch_size();
    let mut since = cursor;
    let mut pulled: Vec<RemoteFrame> = Vec::new();
    loop {
        let batch = remote
            .pull(since, pull_limit)
            .await
            .map_err(|e| ExchangeFailure::remote(e, transfer))?;
        if !batch.verify() {
            return Err(ExchangeFailure::remote(RemoteError::Integrity, transfer));
        }
        if batch.frames.is_empty() {
            break;
        }

        for frame in &batch.frames {
            if frame.seq <= since {
                return Err(ExchangeFailure::remote(
                    RemoteError::Protocol(format!(
                        "remote returned seq {} after cursor {}",
                        frame.seq, since
                    )),
                    transfer,
                ));
            }
            since = frame.seq;
            transfer.bytes += frame.frame.encoded_len();
        }

        let reached_head = since >= batch.head;
        pulled.extend(batch.frames);
        if reached_head {
            break;
        }
    }

    // 4. Apply and acknowledge; writes on this connection wait here
    let applied = blocking(connection, move |s| {
        s.commit_exchange(&pulled, since, acknowledged)
    })
    .await
    .map_err(|e| ExchangeFailure::local(e, transfer))?;
    transfer.frames_pulled = applied;

    Ok(transfer)
}
