//! Daemon configuration
//!
//! Environment loader for `replica-syncd`. The library never reads the
//! environment itself; the values here are turned into a [`SyncConfig`]
//! and handed to the registry.

use crate::domain::errors::ConfigError;
use crate::domain::value_objects::SyncConfig;
use std::time::Duration;

/// Level of parallelism used by the callers driving the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// Single-threaded runtime; all contexts share one OS thread
    Serial,
    /// Multi-threaded runtime with `max_workers` threads
    Threaded,
}

impl ConcurrencyMode {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "serial" | "single" => Ok(ConcurrencyMode::Serial),
            "threaded" | "multi" | "parallel" => Ok(ConcurrencyMode::Threaded),
            other => Err(ConfigError::InvalidValue {
                key: "REPLICA_CONCURRENCY".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub local_path: String,
    pub database_url: Option<String>,
    pub auth_token: Option<String>,
    pub sync_interval_secs: f64,
    pub encryption_key: Option<String>,
    pub use_embedded_replica: bool,
    pub concurrency: ConcurrencyMode,
    pub max_workers: usize,
    pub drain_timeout_secs: u64,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_path: "local_replica.db".to_string(),
            database_url: None,
            auth_token: None,
            sync_interval_secs: 1.0,
            encryption_key: None,
            use_embedded_replica: true,
            concurrency: ConcurrencyMode::Threaded,
            max_workers: 4,
            drain_timeout_secs: 10,
            debug: false,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("local_path", &self.local_path)
            .field("database_url", &self.database_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "***"))
            .field("sync_interval_secs", &self.sync_interval_secs)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "***"))
            .field("use_embedded_replica", &self.use_embedded_replica)
            .field("concurrency", &self.concurrency)
            .field("max_workers", &self.max_workers)
            .field("drain_timeout_secs", &self.drain_timeout_secs)
            .field("debug", &self.debug)
            .finish()
    }
}

impl Config {
    /// Remote URL in effect; embedded replication can be switched off.
    pub fn remote_url(&self) -> Option<&str> {
        if !self.use_embedded_replica {
            return None;
        }
        self.database_url.as_deref().filter(|u| !u.trim().is_empty())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Build the connection configuration.
    pub fn sync_config(&self) -> Result<SyncConfig, ConfigError> {
        let mut builder = SyncConfig::builder(self.local_path.clone());
        if let Some(url) = self.remote_url() {
            builder = builder
                .remote(url)
                .sync_interval(Duration::from_secs_f64(self.sync_interval_secs));
            if let Some(token) = &self.auth_token {
                builder = builder.auth_token(token.clone());
            }
        }
        if let Some(key) = &self.encryption_key {
            builder = builder.encryption_key(key.clone());
        }
        builder.build()
    }
}

fn flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    load_config_from(|key| std::env::var(key).ok())
}

/// Load configuration through `lookup` instead of the process environment.
pub fn load_config_from<F>(lookup: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = Config::default();

    let local_path = lookup("REPLICA_LOCAL_PATH").unwrap_or(defaults.local_path);

    let database_url = lookup("TURSO_DATABASE_URL");
    let auth_token = lookup("TURSO_AUTH_TOKEN");
    let encryption_key = lookup("ENCRYPTION_KEY").filter(|k| !k.is_empty());

    let sync_interval_secs = match lookup("TURSO_SYNC_INTERVAL") {
        Some(raw) => {
            let secs: f64 = raw
                .trim()
                .parse()
                .map_err(|_| invalid("TURSO_SYNC_INTERVAL", &raw))?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(invalid("TURSO_SYNC_INTERVAL", &raw).into());
            }
            secs
        }
        None => defaults.sync_interval_secs,
    };

    let use_embedded_replica = lookup("USE_EMBEDDED_REPLICA")
        .map(|v| flag(&v))
        .unwrap_or(defaults.use_embedded_replica);

    let concurrency = match lookup("REPLICA_CONCURRENCY") {
        Some(raw) => ConcurrencyMode::parse(&raw)?,
        None => defaults.concurrency,
    };

    let max_workers = match lookup("MAX_WORKERS") {
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => return Err(invalid("MAX_WORKERS", &raw).into()),
        },
        None => defaults.max_workers,
    };

    let drain_timeout_secs = match lookup("REPLICA_DRAIN_TIMEOUT_SECS") {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid("REPLICA_DRAIN_TIMEOUT_SECS", &raw))?,
        None => defaults.drain_timeout_secs,
    };

    let debug = lookup("DEBUG").is_some();

    Ok(Config {
        local_path,
        database_url,
        auth_token,
        sync_interval_secs,
        encryption_key,
        use_embedded_replica,
        concurrency,
        max_workers,
        drain_timeout_secs,
        debug,
    })
}
