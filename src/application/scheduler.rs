//! Sync Scheduler - Background tick loop per replicated connection
//!
//! State machine: `Idle` (sleeping until next-due) → `Running` (exchange in
//! progress) → `Idle` with next-due recomputed as `now + interval`.
//! `Cancelled` is terminal and reached on connection close or process
//! shutdown. A running exchange is never interrupted; cancellation is
//! checked at the top of each tick and again before starting an exchange.

use crate::application::connection::ReplicaConnection;
use crate::domain::entities::{SyncOutcome, SyncTrigger};
use crate::domain::errors::ReplicaError;
use crate::infrastructure::ShutdownController;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Scheduler lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Running,
    Cancelled,
}

/// Point-in-time view of a scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub interval: Duration,
    pub phase: SchedulerPhase,
    pub next_due: Instant,
    /// Ticks that reached the exchange step
    pub ticks: u64,
}

/// Per-connection scheduler state. Never shared between connections.
pub struct SchedulerState {
    interval: Duration,
    phase: Mutex<SchedulerPhase>,
    next_due: Mutex<Instant>,
    ticks: AtomicU64,
    cancel: watch::Sender<bool>,
}

impl SchedulerState {
    fn new(interval: Duration) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            interval,
            phase: Mutex::new(SchedulerPhase::Idle),
            next_due: Mutex::new(Instant::now() + interval),
            ticks: AtomicU64::new(0),
            cancel,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.lock()
    }

    pub fn next_due(&self) -> Instant {
        *self.next_due.lock()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Request cancellation. The task stops at its next check point.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Move `Idle → Running`; refused once cancelled.
    fn start_tick(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase == SchedulerPhase::Cancelled || self.is_cancelled() {
            return false;
        }
        *phase = SchedulerPhase::Running;
        self.ticks.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Move `Running → Idle` and schedule the next tick from now.
    fn finish_tick(&self) {
        let mut phase = self.phase.lock();
        if *phase == SchedulerPhase::Running {
            *phase = SchedulerPhase::Idle;
        }
        *self.next_due.lock() = Instant::now() + self.interval;
    }

    fn mark_cancelled(&self) {
        *self.phase.lock() = SchedulerPhase::Cancelled;
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            interval: self.interval,
            phase: self.phase(),
            next_due: self.next_due(),
            ticks: self.ticks(),
        }
    }
}

/// Owner-side handle to a spawned scheduler task.
pub struct SchedulerHandle {
    state: Arc<SchedulerState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerHandle {
    pub fn state(&self) -> &Arc<SchedulerState> {
        &self.state
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.state.snapshot()
    }

    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Wait for the task to exit. Returns immediately if already joined.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("sync scheduler task failed: {:?}", e);
            }
        }
    }
}

/// Spawns background sync loops.
pub struct SyncScheduler;

impl SyncScheduler {
    /// Start the tick loop for `connection` on `runtime`.
    ///
    /// The task holds only a weak reference, so it never keeps a released
    /// connection alive.
    pub fn spawn(
        connection: &Arc<ReplicaConnection>,
        shutdown: &ShutdownController,
        runtime: &Handle,
    ) -> SchedulerHandle {
        let state = Arc::new(SchedulerState::new(connection.config().sync_interval()));
        let task = runtime.spawn(run(
            Arc::downgrade(connection),
            state.clone(),
            shutdown.clone(),
        ));

        tracing::info!(
            "sync scheduler started for connection {} interval={:?}",
            connection.id(),
            state.interval()
        );

        SchedulerHandle {
            state,
            task: Mutex::new(Some(task)),
        }
    }
}

async fn run(
    connection: Weak<ReplicaConnection>,
    state: Arc<SchedulerState>,
    shutdown: ShutdownController,
) {
    let _guard = shutdown.task_guard();
    let mut cancel_rx = state.cancel.subscribe();
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        if state.is_cancelled() || shutdown.is_shutdown() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(state.next_due()) => {}
            _ = cancel_rx.changed() => continue,
            _ = shutdown_rx.recv() => break,
        }

        let Some(connection) = connection.upgrade() else {
            break;
        };
        if shutdown.is_shutdown() || !state.start_tick() {
            break;
        }

        match connection.begin_or_join(SyncTrigger::Scheduled) {
            Ok(in_flight) => match connection.wait(in_flight).await {
                Ok(attempt) => match attempt.outcome {
                    // The executor already logged the details.
                    SyncOutcome::Success => {}
                    SyncOutcome::TransientFailure => {
                        tracing::warn!(
                            "connection {} scheduled sync failed, retrying in {:?}",
                            connection.id(),
                            state.interval()
                        );
                    }
                    SyncOutcome::FatalFailure => {
                        tracing::error!(
                            "connection {} scheduled sync failed fatally, will try again in {:?}",
                            connection.id(),
                            state.interval()
                        );
                    }
                },
                Err(e) => {
                    tracing::error!("connection {} scheduled sync error: {}", connection.id(), e);
                }
            },
            Err(ReplicaError::Closed) => break,
            Err(e) => {
                tracing::error!("connection {} cannot sync: {}", connection.id(), e);
            }
        }

        drop(connection);
        state.finish_tick();
    }

    state.mark_cancelled();
    tracing::debug!("sync scheduler stopped after {} ticks", state.ticks());
}
