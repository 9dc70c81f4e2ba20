//! Value Objects - Immutable configuration primitives
//!
//! A `SyncConfig` is fixed when a connection is opened. Changing sync
//! behavior means building a new config and reconnecting.

use crate::domain::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Path used for a private in-memory replica.
pub const MEMORY_PATH: &str = ":memory:";

const REMOTE_SCHEMES: [&str; 5] = ["libsql://", "wss://", "ws://", "https://", "http://"];

/// URL of the remote primary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteEndpoint(String);

impl RemoteEndpoint {
    /// Parse an endpoint, accepting only the schemes the replica can dial.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }
        if !REMOTE_SCHEMES.iter().any(|s| url.starts_with(s)) {
            return Err(ConfigError::UnsupportedScheme(url.to_string()));
        }
        Ok(Self(url.trim_end_matches('/').to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// HTTP base URL used to reach the endpoint.
    ///
    /// `libsql://` and `wss://` are served over TLS, `ws://` over plain HTTP.
    pub fn http_base(&self) -> String {
        if let Some(rest) = self.0.strip_prefix("libsql://") {
            format!("https://{}", rest)
        } else if let Some(rest) = self.0.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = self.0.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else {
            self.0.clone()
        }
    }
}

impl std::fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Credential presented to the remote on every exchange. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthToken(***)")
    }
}

/// Key for the encrypted local replica. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey(String);

impl EncryptionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey(***)")
    }
}

/// Immutable configuration bundle for one replica connection.
///
/// Two variants exist, selected once at open time: replicated (remote
/// endpoint present) and local-only (no endpoint).
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    local_path: String,
    remote: Option<RemoteEndpoint>,
    auth_token: Option<AuthToken>,
    sync_interval: Duration,
    encryption_key: Option<EncryptionKey>,
    lock_timeout: Duration,
    pull_batch_size: usize,
    push_batch_size: usize,
    request_timeout: Duration,
}

impl SyncConfig {
    /// Start a builder for a replica stored at `path`.
    pub fn builder(path: impl Into<String>) -> SyncConfigBuilder {
        SyncConfigBuilder::new(path)
    }

    /// Local-only config with defaults.
    pub fn local(path: impl Into<String>) -> Result<Self, ConfigError> {
        Self::builder(path).build()
    }

    pub fn local_path(&self) -> &str {
        &self.local_path
    }

    pub fn remote_endpoint(&self) -> Option<&RemoteEndpoint> {
        self.remote.as_ref()
    }

    pub fn auth_token(&self) -> Option<&AuthToken> {
        self.auth_token.as_ref()
    }

    pub fn encryption_key(&self) -> Option<&EncryptionKey> {
        self.encryption_key.as_ref()
    }

    /// Background tick period; zero disables the scheduler.
    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    /// How long a local write waits for an apply phase before `LockError`.
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn pull_batch_size(&self) -> usize {
        self.pull_batch_size
    }

    pub fn push_batch_size(&self) -> usize {
        self.push_batch_size
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn is_replicated(&self) -> bool {
        self.remote.is_some()
    }

    pub fn is_memory(&self) -> bool {
        is_memory_path(&self.local_path)
    }

    /// True when a background scheduler should run for this config.
    pub fn background_sync_enabled(&self) -> bool {
        self.is_replicated() && !self.sync_interval.is_zero()
    }
}

/// Builder for [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct SyncConfigBuilder {
    local_path: String,
    remote: Option<String>,
    auth_token: Option<AuthToken>,
    sync_interval: Duration,
    encryption_key: Option<EncryptionKey>,
    lock_timeout: Duration,
    pull_batch_size: usize,
    push_batch_size: usize,
    request_timeout: Duration,
}

impl SyncConfigBuilder {
    fn new(path: impl Into<String>) -> Self {
        Self {
            local_path: path.into(),
            remote: None,
            auth_token: None,
            sync_interval: Duration::ZERO,
            encryption_key: None,
            lock_timeout: Duration::from_secs(5),
            pull_batch_size: 500,
            push_batch_size: 500,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Enable replication against `url`.
    pub fn remote(mut self, url: impl Into<String>) -> Self {
        self.remote = Some(url.into());
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(AuthToken::new(token));
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(EncryptionKey::new(key));
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size;
        self
    }

    pub fn push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<SyncConfig, ConfigError> {
        if self.local_path.trim().is_empty() {
            return Err(ConfigError::MissingLocalPath);
        }
        if self.pull_batch_size == 0 || self.push_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }

        let remote = self.remote.as_deref().map(RemoteEndpoint::parse).transpose()?;
        if remote.is_some() && is_memory_path(&self.local_path) {
            return Err(ConfigError::MemoryReplica);
        }

        Ok(SyncConfig {
            local_path: self.local_path,
            remote,
            auth_token: self.auth_token,
            sync_interval: self.sync_interval,
            encryption_key: self.encryption_key,
            lock_timeout: self.lock_timeout,
            pull_batch_size: self.pull_batch_size,
            push_batch_size: self.push_batch_size,
            request_timeout: self.request_timeout,
        })
    }
}

fn is_memory_path(path: &str) -> bool {
    path == MEMORY_PATH
        || path.starts_with("file::memory:")
        || path.starts_with("file:memory")
        || path.contains("mode=memory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_accepts_known_schemes() {
        for url in [
            "libsql://db.example.io",
            "wss://db.example.io",
            "ws://127.0.0.1:8080",
            "https://db.example.io",
            "http://localhost:8080/",
        ] {
            assert!(RemoteEndpoint::parse(url).is_ok(), "rejected {}", url);
        }
    }

    #[test]
    fn test_endpoint_rejects_unknown_scheme() {
        assert!(matches!(
            RemoteEndpoint::parse("ftp://db.example.io"),
            Err(ConfigError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            RemoteEndpoint::parse("  "),
            Err(ConfigError::EmptyEndpoint)
        ));
    }

    #[test]
    fn test_endpoint_http_base() {
        let cases = [
            ("libsql://db.turso.io", "https://db.turso.io"),
            ("wss://db.turso.io", "https://db.turso.io"),
            ("ws://localhost:8080", "http://localhost:8080"),
            ("http://localhost:8080/", "http://localhost:8080"),
        ];
        for (input, expected) in cases {
            assert_eq!(RemoteEndpoint::parse(input).unwrap().http_base(), expected);
        }
    }

    #[test]
    fn test_secrets_are_redacted() {
        let config = SyncConfig::builder("local.db")
            .remote("libsql://db.example.io")
            .auth_token("super-secret")
            .encryption_key("hunter2")
            .build()
            .unwrap();

        let debug = format!("{:?}", config);
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("AuthToken(***)"));
    }

    #[test]
    fn test_defaults_disable_background_sync() {
        let config = SyncConfig::local("local.db").unwrap();
        assert!(!config.is_replicated());
        assert!(!config.background_sync_enabled());
        assert_eq!(config.sync_interval(), Duration::ZERO);
    }

    #[test]
    fn test_replicated_with_zero_interval_has_no_scheduler() {
        let config = SyncConfig::builder("local.db")
            .remote("https://db.example.io")
            .build()
            .unwrap();
        assert!(config.is_replicated());
        assert!(!config.background_sync_enabled());
    }

    #[test]
    fn test_background_sync_enabled_with_interval() {
        let config = SyncConfig::builder("local.db")
            .remote("https://db.example.io")
            .sync_interval(Duration::from_secs(5))
            .build()
            .unwrap();
        assert!(config.background_sync_enabled());
    }

    #[test]
    fn test_memory_replica_cannot_sync() {
        let result = SyncConfig::builder(MEMORY_PATH)
            .remote("https://db.example.io")
            .build();
        assert!(matches!(result, Err(ConfigError::MemoryReplica)));

        let local = SyncConfig::local(MEMORY_PATH).unwrap();
        assert!(local.is_memory());
    }

    #[test]
    fn test_missing_path_and_batch_validation() {
        assert!(matches!(
            SyncConfig::local(""),
            Err(ConfigError::MissingLocalPath)
        ));
        assert!(matches!(
            SyncConfig::builder("a.db").pull_batch_size(0).build(),
            Err(ConfigError::InvalidBatchSize)
        ));
    }

    #[test]
    fn test_configs_compare_by_value() {
        let a = SyncConfig::builder("a.db").auth_token("t").build().unwrap();
        let b = SyncConfig::builder("a.db").auth_token("t").build().unwrap();
        let c = SyncConfig::builder("a.db").auth_token("u").build().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
