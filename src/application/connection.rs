//! Replica Connection - One context's session with a local replica
//!
//! Bundles the local store, the optional remote session and the sync
//! machinery for a single execution context. Local reads and writes go
//! straight to the store; sync requests are coalesced so at most one
//! exchange runs per connection.

use crate::adapters::outbound::SqliteReplicaStore;
use crate::application::scheduler::{SchedulerHandle, SchedulerSnapshot};
use crate::application::sync_executor::SyncExecutor;
use crate::domain::entities::{
    ConnectionId, ContextId, ReplicaId, SqlValue, StatementResult, SyncAttempt, SyncTrigger,
};
use crate::domain::errors::{ConfigError, ReplicaError};
use crate::domain::ports::{RemoteConnector, RemotePrimary, SyncMonitor};
use crate::domain::value_objects::SyncConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub(crate) type SyncResult = Result<SyncAttempt, ReplicaError>;

/// Receiver side of the exchange currently running on a connection.
pub(crate) type InFlight = watch::Receiver<Option<SyncResult>>;

/// Exclusive session bound to one execution context.
///
/// Created and released only by the [`ConnectionRegistry`](crate::application::ConnectionRegistry).
pub struct ReplicaConnection {
    id: ConnectionId,
    context: ContextId,
    config: SyncConfig,
    store: SqliteReplicaStore,
    remote: Option<Arc<dyn RemotePrimary>>,
    executor: SyncExecutor,
    /// Serializes exchanges, including direct `SyncExecutor::run_once` calls
    exchange_lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<Option<InFlight>>,
    scheduler: Mutex<Option<SchedulerHandle>>,
    closing: AtomicBool,
    released: AtomicBool,
}

impl ReplicaConnection {
    /// Open the local replica and, for replicated configs, a remote session.
    pub fn open(
        context: ContextId,
        config: SyncConfig,
        connector: &dyn RemoteConnector,
        monitor: Arc<dyn SyncMonitor>,
    ) -> Result<Arc<Self>, ReplicaError> {
        let store = SqliteReplicaStore::open(&config)?;

        let remote = match config.remote_endpoint() {
            Some(endpoint) => {
                let session = connector.connect(endpoint, &config).map_err(|e| {
                    store.close();
                    ReplicaError::Config(ConfigError::Client(e.to_string()))
                })?;
                Some(session)
            }
            None => None,
        };

        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            context,
            config,
            store,
            remote,
            executor: SyncExecutor::new(monitor),
            exchange_lock: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(None),
            scheduler: Mutex::new(None),
            closing: AtomicBool::new(false),
            released: AtomicBool::new(false),
        });

        tracing::info!(
            "connection {} opened for context {} path={} replicated={}",
            connection.id,
            connection.context,
            connection.config.local_path(),
            connection.is_replicated()
        );
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn context(&self) -> &ContextId {
        &self.context
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn replica_id(&self) -> &ReplicaId {
        self.store.replica_id()
    }

    pub fn is_replicated(&self) -> bool {
        self.remote.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Local writes not yet acknowledged by a committed exchange.
    pub fn dirty(&self) -> u64 {
        self.store.dirty()
    }

    /// Last remote sequence applied locally.
    pub fn cursor(&self) -> u64 {
        self.store.cursor()
    }

    /// True while an exchange is running.
    pub fn is_syncing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// State of the background scheduler, if one is attached.
    pub fn scheduler(&self) -> Option<SchedulerSnapshot> {
        self.scheduler.lock().as_ref().map(|h| h.snapshot())
    }

    pub(crate) fn store(&self) -> &SqliteReplicaStore {
        &self.store
    }

    pub(crate) fn remote(&self) -> Option<Arc<dyn RemotePrimary>> {
        self.remote.clone()
    }

    pub(crate) fn executor(&self) -> &SyncExecutor {
        &self.executor
    }

    pub(crate) fn exchange_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.exchange_lock
    }

    pub(crate) fn attach_scheduler(&self, handle: SchedulerHandle) {
        if self.is_closed() {
            handle.cancel();
            return;
        }
        *self.scheduler.lock() = Some(handle);
    }

    /// Run one statement against the local replica.
    ///
    /// Never touches the network; sync failures are invisible here.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<StatementResult, ReplicaError> {
        if self.is_closed() {
            return Err(ReplicaError::Closed);
        }
        self.store.execute(sql, params)
    }

    /// Synchronize now and wait for the result.
    ///
    /// Joins the running exchange if there is one. Failed exchanges come back
    /// as `ReplicaError::SyncFailed` carrying the recorded attempt.
    pub async fn sync(self: &Arc<Self>) -> Result<SyncAttempt, ReplicaError> {
        let in_flight = self.begin_or_join(SyncTrigger::Manual)?;
        manual_result(self.wait(in_flight).await?)
    }

    /// Like [`sync`](Self::sync) but gives up waiting after `deadline`.
    ///
    /// On expiry the exchange keeps running in the background and is still
    /// recorded by the monitor.
    pub async fn sync_with_deadline(
        self: &Arc<Self>,
        deadline: Duration,
    ) -> Result<SyncAttempt, ReplicaError> {
        let in_flight = self.begin_or_join(SyncTrigger::Manual)?;
        match tokio::time::timeout(deadline, self.wait(in_flight)).await {
            Ok(result) => manual_result(result?),
            Err(_) => {
                tracing::warn!(
                    "connection {} sync still running after {:?}, returning to caller",
                    self.id,
                    deadline
                );
                Err(ReplicaError::Timeout(deadline))
            }
        }
    }

    /// Start an exchange, or join the one already running.
    pub(crate) fn begin_or_join(self: &Arc<Self>, trigger: SyncTrigger) -> Result<InFlight, ReplicaError> {
        if self.is_closed() {
            return Err(ReplicaError::Closed);
        }
        let mut slot = self.in_flight.lock();
        if let Some(running) = slot.as_ref() {
            tracing::debug!("connection {} {} sync joins running exchange", self.id, trigger);
            return Ok(running.clone());
        }
        if self.remote.is_none() {
            return Err(ReplicaError::NotReplicated);
        }

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());
        drop(slot);

        let connection = self.clone();
        tokio::spawn(async move {
            let result = connection.executor().run_once(&connection, trigger).await;
            {
                let mut slot = connection.in_flight.lock();
                *slot = None;
                tx.send_replace(Some(result));
            }
            // close() deferred releasing the store to us.
            if connection.is_closed() {
                connection.release_resources();
            }
        });
        Ok(rx)
    }

    /// Wait for the exchange behind `in_flight` to publish its result.
    pub(crate) async fn wait(&self, mut in_flight: InFlight) -> SyncResult {
        let result = in_flight
            .wait_for(Option::is_some)
            .await
            .map(|published| (*published).clone());

        match result {
            Ok(Some(result)) => result,
            _ => {
                let mut slot = self.in_flight.lock();
                if slot.as_ref().map_or(false, |s| s.same_channel(&in_flight)) {
                    *slot = None;
                }
                Err(ReplicaError::Scheduler(
                    "sync task ended without publishing a result".to_string(),
                ))
            }
        }
    }

    /// Close the connection. Idempotent.
    ///
    /// Cancels the scheduler first; any sync requested afterwards fails with
    /// `ReplicaError::Closed`. A running exchange finishes and then releases
    /// the store.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.scheduler.lock().take() {
            handle.cancel();
        }

        let syncing = self.in_flight.lock().is_some();
        if syncing {
            tracing::info!(
                "connection {} closing, waiting for running exchange",
                self.id
            );
        } else {
            self.release_resources();
        }
        tracing::info!("connection {} closed for context {}", self.id, self.context);
    }

    fn release_resources(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.store.close();
        if let Some(remote) = &self.remote {
            remote.close();
        }
        self.executor.monitor().retire(self.id);
    }
}

impl Drop for ReplicaConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.scheduler.get_mut().take() {
            handle.cancel();
        }
        self.release_resources();
    }
}

impl std::fmt::Debug for ReplicaConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaConnection")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn manual_result(attempt: SyncAttempt) -> Result<SyncAttempt, ReplicaError> {
    match attempt.outcome.failure_kind() {
        None => Ok(attempt),
        Some(kind) => Err(ReplicaError::SyncFailed {
            kind,
            detail: attempt.error.clone().unwrap_or_default(),
            attempt: Box::new(attempt),
        }),
    }
}
