//! Connection Registry - One connection per execution context
//!
//! The registry is the only place connections are created or released.
//! Each context id maps to its own connection, so a native handle is never
//! shared between two contexts.

use crate::adapters::outbound::{DashMapSyncMonitor, HttpRemoteConnector};
use crate::application::connection::ReplicaConnection;
use crate::application::scheduler::SyncScheduler;
use crate::domain::entities::ContextId;
use crate::domain::errors::{RegistryError, ReplicaError};
use crate::domain::ports::{RemoteConnector, SyncMonitor};
use crate::domain::value_objects::SyncConfig;
use crate::infrastructure::ShutdownController;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// Maps execution contexts to their exclusive connections.
pub struct ConnectionRegistry {
    connections: DashMap<ContextId, Arc<ReplicaConnection>>,
    connector: Arc<dyn RemoteConnector>,
    monitor: Arc<dyn SyncMonitor>,
    shutdown: ShutdownController,
}

impl ConnectionRegistry {
    /// Create a registry that reaches remotes through `connector` and
    /// records every attempt in `monitor`.
    pub fn new(connector: Arc<dyn RemoteConnector>, monitor: Arc<dyn SyncMonitor>) -> Self {
        Self {
            connections: DashMap::new(),
            connector,
            monitor,
            shutdown: ShutdownController::new(),
        }
    }

    pub fn monitor(&self) -> &Arc<dyn SyncMonitor> {
        &self.monitor
    }

    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    /// Return the open connection for `context`, opening one if needed.
    ///
    /// Background sync is started here when the config enables it, which
    /// requires a Tokio runtime. Fails with `RegistryError::ConfigMismatch`
    /// if the context already holds a connection with another config.
    pub fn acquire(
        &self,
        context: &ContextId,
        config: &SyncConfig,
    ) -> Result<Arc<ReplicaConnection>, ReplicaError> {
        if self.shutdown.is_shutdown() {
            return Err(RegistryError::ShuttingDown.into());
        }

        match self.connections.entry(context.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if !existing.is_closed() {
                    if existing.config() != config {
                        tracing::warn!(
                            "context {} requested a different configuration for its connection",
                            context
                        );
                        return Err(RegistryError::ConfigMismatch(context.clone()).into());
                    }
                    return Ok(existing.clone());
                }
                let connection = self.open(context, config)?;
                entry.insert(connection.clone());
                Ok(connection)
            }
            Entry::Vacant(entry) => {
                let connection = self.open(context, config)?;
                entry.insert(connection.clone());
                Ok(connection)
            }
        }
    }

    /// [`acquire`](Self::acquire) for the calling thread.
    pub fn acquire_current(&self, config: &SyncConfig) -> Result<Arc<ReplicaConnection>, ReplicaError> {
        self.acquire(&ContextId::current_thread(), config)
    }

    /// Acquire a connection that is released when the lease is dropped.
    pub fn lease(
        &self,
        context: &ContextId,
        config: &SyncConfig,
    ) -> Result<ConnectionLease<'_>, ReplicaError> {
        let connection = self.acquire(context, config)?;
        Ok(ConnectionLease {
            registry: self,
            context: context.clone(),
            connection,
        })
    }

    fn open(&self, context: &ContextId, config: &SyncConfig) -> Result<Arc<ReplicaConnection>, ReplicaError> {
        let connection = ReplicaConnection::open(
            context.clone(),
            config.clone(),
            self.connector.as_ref(),
            self.monitor.clone(),
        )?;

        if config.background_sync_enabled() {
            let runtime = match tokio::runtime::Handle::try_current() {
                Ok(runtime) => runtime,
                Err(_) => {
                    connection.close();
                    return Err(ReplicaError::Scheduler(
                        "background sync requires a Tokio runtime".to_string(),
                    ));
                }
            };
            let handle = SyncScheduler::spawn(&connection, &self.shutdown, &runtime);
            connection.attach_scheduler(handle);
        }

        Ok(connection)
    }

    /// Close and forget the connection held by `context`.
    ///
    /// Returns false if the context held nothing.
    pub fn release(&self, context: &ContextId) -> bool {
        match self.connections.remove(context) {
            Some((_, connection)) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    fn release_exact(&self, context: &ContextId, connection: &Arc<ReplicaConnection>) {
        let removed = self
            .connections
            .remove_if(context, |_, held| Arc::ptr_eq(held, connection));
        if removed.is_some() {
            connection.close();
        }
    }

    pub fn get(&self, context: &ContextId) -> Option<Arc<ReplicaConnection>> {
        self.connections.get(context).map(|c| c.value().clone())
    }

    pub fn contexts(&self) -> Vec<ContextId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Stop every scheduler, let running exchanges finish, close everything.
    ///
    /// Returns false if schedulers were still busy after `drain_timeout`.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        self.shutdown.shutdown();
        let drained = self.shutdown.wait_for_drain(drain_timeout).await;

        let contexts = self.contexts();
        for context in &contexts {
            self.release(context);
        }
        tracing::info!(
            "registry shut down, released {} connections (drained={})",
            contexts.len(),
            drained
        );
        drained
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(
            Arc::new(HttpRemoteConnector::new()),
            Arc::new(DashMapSyncMonitor::new()),
        )
    }
}

/// Scoped connection; dropping it releases the context's mapping.
pub struct ConnectionLease<'a> {
    registry: &'a ConnectionRegistry,
    context: ContextId,
    connection: Arc<ReplicaConnection>,
}

impl ConnectionLease<'_> {
    pub fn context(&self) -> &ContextId {
        &self.context
    }
}

impl Deref for ConnectionLease<'_> {
    type Target = Arc<ReplicaConnection>;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        self.registry.release_exact(&self.context, &self.connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryRemote;
    use tempfile::TempDir;

    fn registry(remote: &MemoryRemote) -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(remote.clone()), Arc::new(DashMapSyncMonitor::new()))
    }

    fn config(dir: &TempDir, name: &str) -> SyncConfig {
        SyncConfig::builder(dir.path().join(name).to_str().unwrap())
            .remote("libsql://primary.example.io")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_same_context_same_config_returns_same_connection() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&MemoryRemote::new());
        let ctx = ContextId::new("worker-1");
        let cfg = config(&dir, "a.db");

        let a = registry.acquire(&ctx, &cfg).unwrap();
        let b = registry.acquire(&ctx, &cfg).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_same_context_different_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&MemoryRemote::new());
        let ctx = ContextId::new("worker-1");

        registry.acquire(&ctx, &config(&dir, "a.db")).unwrap();
        let err = registry.acquire(&ctx, &config(&dir, "b.db")).unwrap_err();
        assert!(matches!(
            err,
            ReplicaError::Registry(RegistryError::ConfigMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_contexts_get_distinct_connections() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&MemoryRemote::new());
        let cfg = config(&dir, "shared.db");

        let a = registry.acquire(&ContextId::new("a"), &cfg).unwrap();
        let b = registry.acquire(&ContextId::new("b"), &cfg).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_release_closes_and_allows_reacquire() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let registry = registry(&remote);
        let ctx = ContextId::new("worker-1");

        let first = registry.acquire(&ctx, &config(&dir, "a.db")).unwrap();
        assert!(registry.release(&ctx));
        assert!(!registry.release(&ctx));
        assert!(first.is_closed());
        assert!(registry.get(&ctx).is_none());

        // A released context may come back with a new configuration.
        let second = registry.acquire(&ctx, &config(&dir, "b.db")).unwrap();
        assert!(!second.is_closed());
        assert_eq!(remote.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_short_lived_leases_do_not_grow_the_monitor() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let monitor = Arc::new(DashMapSyncMonitor::with_limits(16, 2));
        let registry = ConnectionRegistry::new(Arc::new(remote.clone()), monitor.clone());
        let cfg = config(&dir, "a.db");

        let mut ids = Vec::new();
        for i in 0..5 {
            let lease = registry.lease(&ContextId::new(format!("job-{}", i)), &cfg).unwrap();
            lease.sync().await.unwrap();
            ids.push(lease.id());
        }

        assert!(registry.is_empty());
        assert_eq!(monitor.connections().len(), 2);
        assert_eq!(monitor.stats(ids[0]).total, 0);
        assert_eq!(monitor.stats(ids[4]).total, 1);
    }

    #[tokio::test]
    async fn test_closed_entry_is_replaced() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&MemoryRemote::new());
        let ctx = ContextId::new("worker-1");
        let cfg = config(&dir, "a.db");

        let first = registry.acquire(&ctx, &cfg).unwrap();
        first.close();
        let second = registry.acquire(&ctx, &cfg).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_lease_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&MemoryRemote::new());
        let ctx = ContextId::new("request-7");
        let cfg = config(&dir, "a.db");

        let held = {
            let lease = registry.lease(&ctx, &cfg).unwrap();
            lease.execute("CREATE TABLE t (v)", &[]).unwrap();
            assert_eq!(lease.context(), &ctx);
            Arc::clone(&lease)
        };
        assert!(held.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_no_mapping() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&MemoryRemote::new());
        let ctx = ContextId::new("worker-1");
        let bad = SyncConfig::local(dir.path().join("missing/dir/a.db").to_str().unwrap()).unwrap();

        assert!(matches!(
            registry.acquire(&ctx, &bad),
            Err(ReplicaError::Storage(_))
        ));
        assert!(registry.get(&ctx).is_none());
    }

    #[test]
    fn test_background_sync_needs_runtime() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&MemoryRemote::new());
        let cfg = SyncConfig::builder(dir.path().join("a.db").to_str().unwrap())
            .remote("libsql://primary.example.io")
            .sync_interval(Duration::from_secs(1))
            .build()
            .unwrap();

        assert!(matches!(
            registry.acquire(&ContextId::new("no-runtime"), &cfg),
            Err(ReplicaError::Scheduler(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_acquires() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&MemoryRemote::new());
        let ctx = ContextId::new("worker-1");
        let conn = registry.acquire(&ctx, &config(&dir, "a.db")).unwrap();

        assert!(registry.shutdown(Duration::from_millis(100)).await);
        assert!(conn.is_closed());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.acquire(&ctx, &config(&dir, "a.db")),
            Err(ReplicaError::Registry(RegistryError::ShuttingDown))
        ));
    }
}
