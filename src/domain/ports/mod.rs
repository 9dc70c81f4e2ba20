mod remote_primary;
mod sync_monitor;

pub use remote_primary::{PullBatch, PushAck, RemoteConnector, RemotePrimary, PROTOCOL_VERSION};
pub use sync_monitor::SyncMonitor;
