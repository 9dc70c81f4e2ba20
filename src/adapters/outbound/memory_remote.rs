//! In-Process Remote Primary
//!
//! A complete remote primary living in the same process. Several replicas
//! can share one `MemoryRemote` to observe each other's writes, which makes
//! it the default remote for tests and local development. Fault injection
//! hooks simulate outages, bad credentials and slow links.

use crate::domain::entities::{ChangeFrame, RemoteFrame, ReplicaId, SqlValue};
use crate::domain::errors::RemoteError;
use crate::domain::ports::{PullBatch, PushAck, RemoteConnector, RemotePrimary};
use crate::domain::value_objects::{RemoteEndpoint, SyncConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Log {
    frames: Vec<RemoteFrame>,
    /// Highest origin_seq accepted per replica
    high_water: HashMap<ReplicaId, u64>,
    external_seq: u64,
}

#[derive(Default)]
struct Inner {
    log: Mutex<Log>,
    required_token: Mutex<Option<String>>,
    queued_faults: Mutex<VecDeque<RemoteError>>,
    pull_faults: Mutex<VecDeque<RemoteError>>,
    persistent_fault: Mutex<Option<RemoteError>>,
    latency: Mutex<Duration>,
    corrupt_next_pull: AtomicBool,
    pushes: AtomicUsize,
    pulls: AtomicUsize,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
}

/// Shared handle to an in-process primary. Clones refer to the same log.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject sessions whose token differs from `token`.
    pub fn require_token(&self, token: impl Into<String>) {
        *self.inner.required_token.lock() = Some(token.into());
    }

    /// Stop checking credentials.
    pub fn accept_any_token(&self) {
        *self.inner.required_token.lock() = None;
    }

    /// Fail the next remote call with `err`. Queued faults fire in order.
    pub fn fail_next(&self, err: RemoteError) {
        self.inner.queued_faults.lock().push_back(err);
    }

    /// Fail the next pull with `err`, after head and push succeeded.
    pub fn fail_next_pull(&self, err: RemoteError) {
        self.inner.pull_faults.lock().push_back(err);
    }

    /// Fail every remote call with `err` until cleared with `None`.
    pub fn fail_always(&self, err: Option<RemoteError>) {
        *self.inner.persistent_fault.lock() = err;
    }

    /// Delay added to every remote call.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Tamper with the checksum of the next pulled page.
    pub fn corrupt_next_pull(&self) {
        self.inner.corrupt_next_pull.store(true, Ordering::SeqCst);
    }

    /// Append a write made by some other replica directly on the primary.
    pub fn append_external(&self, origin: &str, sql: &str, params: Vec<SqlValue>) -> u64 {
        let mut log = self.inner.log.lock();
        log.external_seq += 1;
        let seq = log.frames.len() as u64 + 1;
        let frame = RemoteFrame {
            seq,
            origin: ReplicaId(origin.to_string()),
            frame: ChangeFrame {
                origin_seq: log.external_seq,
                sql: sql.to_string(),
                params,
            },
        };
        log.frames.push(frame);
        seq
    }

    pub fn head(&self) -> u64 {
        self.inner.log.lock().frames.len() as u64
    }

    /// Snapshot of the sequenced log.
    pub fn frames(&self) -> Vec<RemoteFrame> {
        self.inner.log.lock().frames.clone()
    }

    pub fn push_count(&self) -> usize {
        self.inner.pushes.load(Ordering::SeqCst)
    }

    pub fn pull_count(&self) -> usize {
        self.inner.pulls.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.inner.sessions_opened.load(Ordering::SeqCst)
            - self.inner.sessions_closed.load(Ordering::SeqCst)
    }

    async fn gate(&self, token: Option<&str>) -> Result<(), RemoteError> {
        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = self.inner.queued_faults.lock().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.inner.persistent_fault.lock().clone() {
            return Err(err);
        }

        let required = self.inner.required_token.lock().clone();
        if let Some(required) = required {
            if token != Some(required.as_str()) {
                return Err(RemoteError::Authentication(
                    "token rejected by remote primary".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl RemoteConnector for MemoryRemote {
    fn connect(
        &self,
        endpoint: &RemoteEndpoint,
        config: &SyncConfig,
    ) -> Result<Arc<dyn RemotePrimary>, RemoteError> {
        self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("memory remote session opened for {}", endpoint);
        Ok(Arc::new(MemorySession {
            remote: self.clone(),
            token: config.auth_token().map(|t| t.expose().to_string()),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One connection's session with a [`MemoryRemote`].
pub struct MemorySession {
    remote: MemoryRemote,
    token: Option<String>,
    closed: AtomicBool,
}

#[async_trait]
impl RemotePrimary for MemorySession {
    async fn head(&self) -> Result<u64, RemoteError> {
        self.remote.gate(self.token.as_deref()).await?;
        Ok(self.remote.head())
    }

    async fn push(&self, replica: &ReplicaId, frames: &[ChangeFrame]) -> Result<PushAck, RemoteError> {
        self.remote.gate(self.token.as_deref()).await?;
        self.remote.inner.pushes.fetch_add(1, Ordering::SeqCst);

        let mut log = self.remote.inner.log.lock();
        let mut high = log.high_water.get(replica).copied().unwrap_or(0);
        let mut accepted = 0;
        for frame in frames {
            // Re-pushed frames after a lost acknowledgement are dropped here.
            if frame.origin_seq <= high {
                continue;
            }
            let seq = log.frames.len() as u64 + 1;
            log.frames.push(RemoteFrame {
                seq,
                origin: replica.clone(),
                frame: frame.clone(),
            });
            high = frame.origin_seq;
            accepted += 1;
        }
        log.high_water.insert(replica.clone(), high);

        Ok(PushAck {
            accepted,
            head: log.frames.len() as u64,
        })
    }

    async fn pull(&self, since: u64, limit: usize) -> Result<PullBatch, RemoteError> {
        self.remote.gate(self.token.as_deref()).await?;
        if let Some(err) = self.remote.inner.pull_faults.lock().pop_front() {
            return Err(err);
        }
        self.remote.inner.pulls.fetch_add(1, Ordering::SeqCst);

        let mut batch = {
            let log = self.remote.inner.log.lock();
            let start = (since as usize).min(log.frames.len());
            let frames: Vec<RemoteFrame> = log.frames[start..].iter().take(limit).cloned().collect();
            PullBatch::new(frames, log.frames.len() as u64)
        };
        if self.remote.inner.corrupt_next_pull.swap(false, Ordering::SeqCst) {
            batch.checksum = batch.checksum.wrapping_add(1);
        }
        Ok(batch)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.remote.inner.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> ChangeFrame {
        ChangeFrame {
            origin_seq: seq,
            sql: format!("INSERT INTO t VALUES ({})", seq),
            params: vec![],
        }
    }

    fn session(remote: &MemoryRemote, token: Option<&str>) -> Arc<dyn RemotePrimary> {
        let mut builder = SyncConfig::builder("replica.db").remote("http://memory");
        if let Some(token) = token {
            builder = builder.auth_token(token);
        }
        let config = builder.build().unwrap();
        remote
            .connect(config.remote_endpoint().unwrap(), &config)
            .unwrap()
    }

    #[tokio::test]
    async fn test_push_sequences_frames() {
        let remote = MemoryRemote::new();
        let s = session(&remote, None);
        let replica = ReplicaId("a".into());

        let ack = s.push(&replica, &[frame(1), frame(2)]).await.unwrap();
        assert_eq!(ack.accepted, 2);
        assert_eq!(ack.head, 2);
        assert_eq!(s.head().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_repush_is_idempotent() {
        let remote = MemoryRemote::new();
        let s = session(&remote, None);
        let replica = ReplicaId("a".into());

        s.push(&replica, &[frame(1), frame(2)]).await.unwrap();
        let ack = s.push(&replica, &[frame(1), frame(2), frame(3)]).await.unwrap();

        assert_eq!(ack.accepted, 1);
        assert_eq!(remote.head(), 3);
    }

    #[tokio::test]
    async fn test_pull_pages_and_checksum() {
        let remote = MemoryRemote::new();
        for i in 0..5 {
            remote.append_external("other", &format!("INSERT INTO t VALUES ({})", i), vec![]);
        }
        let s = session(&remote, None);

        let first = s.pull(0, 2).await.unwrap();
        assert_eq!(first.frames.len(), 2);
        assert_eq!(first.head, 5);
        assert!(first.verify());

        let rest = s.pull(2, 10).await.unwrap();
        assert_eq!(rest.frames.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![3, 4, 5]);

        assert!(s.pull(5, 10).await.unwrap().frames.is_empty());
        assert!(s.pull(99, 10).await.unwrap().frames.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_pull_fails_verification_once() {
        let remote = MemoryRemote::new();
        remote.append_external("other", "INSERT INTO t VALUES (1)", vec![]);
        let s = session(&remote, None);

        remote.corrupt_next_pull();
        assert!(!s.pull(0, 10).await.unwrap().verify());
        assert!(s.pull(0, 10).await.unwrap().verify());
    }

    #[tokio::test]
    async fn test_token_is_checked() {
        let remote = MemoryRemote::new();
        remote.require_token("good");

        let bad = session(&remote, Some("bad"));
        assert!(matches!(bad.head().await, Err(RemoteError::Authentication(_))));

        let missing = session(&remote, None);
        assert!(matches!(missing.head().await, Err(RemoteError::Authentication(_))));

        let good = session(&remote, Some("good"));
        assert!(good.head().await.is_ok());

        remote.accept_any_token();
        assert!(bad.head().await.is_ok());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let remote = MemoryRemote::new();
        let s = session(&remote, None);

        remote.fail_next(RemoteError::Network("reset".into()));
        assert!(matches!(s.head().await, Err(RemoteError::Network(_))));
        assert!(s.head().await.is_ok());

        remote.fail_always(Some(RemoteError::Busy("overloaded".into())));
        assert!(s.head().await.is_err());
        assert!(s.head().await.is_err());
        remote.fail_always(None);
        assert!(s.head().await.is_ok());

        remote.fail_next_pull(RemoteError::Server("502".into()));
        assert!(s.head().await.is_ok());
        assert!(s.pull(0, 1).await.is_err());
        assert!(s.pull(0, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_sessions_are_counted() {
        let remote = MemoryRemote::new();
        let a = session(&remote, None);
        let _b = session(&remote, None);
        assert_eq!(remote.open_sessions(), 2);

        a.close();
        a.close();
        assert_eq!(remote.open_sessions(), 1);
    }
}
