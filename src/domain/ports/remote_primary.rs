//! Remote Primary Port
//!
//! Defines the client capability used to reach the authoritative remote
//! database. Implementations may speak HTTP, run in-process, or wrap a
//! vendor driver; the sync executor only sees this interface.

use crate::domain::entities::{frames_checksum, ChangeFrame, RemoteFrame, ReplicaId};
use crate::domain::errors::RemoteError;
use crate::domain::value_objects::{RemoteEndpoint, SyncConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Version of the push/pull protocol spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// Acknowledgement of a pushed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// Frames newly sequenced by the remote (re-pushed frames are not counted)
    pub accepted: usize,
    /// Remote head sequence after the push
    pub head: u64,
}

/// One page of remote frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullBatch {
    /// Frames with `seq` greater than the requested cursor, ascending
    pub frames: Vec<RemoteFrame>,
    /// Remote head sequence when the page was produced
    pub head: u64,
    /// CRC32 of `frames`
    pub checksum: u32,
}

impl PullBatch {
    pub fn new(frames: Vec<RemoteFrame>, head: u64) -> Self {
        let checksum = frames_checksum(&frames);
        Self {
            frames,
            head,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        self.checksum == frames_checksum(&self.frames)
    }
}

/// An open session with the remote primary.
///
/// The session carries the credential it was opened with and presents it
/// on every call.
#[async_trait]
pub trait RemotePrimary: Send + Sync {
    /// Latest sequence known to the remote. Used as the cheap
    /// "anything pending?" probe before a full exchange.
    async fn head(&self) -> Result<u64, RemoteError>;

    /// Send locally buffered frames. Must be idempotent per
    /// `(replica, origin_seq)` so a retried push never duplicates writes.
    async fn push(&self, replica: &ReplicaId, frames: &[ChangeFrame])
        -> Result<PushAck, RemoteError>;

    /// Fetch up to `limit` frames with `seq > since`.
    async fn pull(&self, since: u64, limit: usize) -> Result<PullBatch, RemoteError>;

    /// Release remote resources held by the session.
    fn close(&self) {}
}

/// Opens remote sessions for replicated connections.
pub trait RemoteConnector: Send + Sync {
    fn connect(
        &self,
        endpoint: &RemoteEndpoint,
        config: &SyncConfig,
    ) -> Result<Arc<dyn RemotePrimary>, RemoteError>;
}
