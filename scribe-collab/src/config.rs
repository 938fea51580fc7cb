//! Engine and server configuration.
//!
//! Every struct has a `Default` tuned for production and a
//! `for_testing()` variant with short timeouts. Files are TOML; missing
//! keys fall back to the defaults:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! storage_path = "scribe_data"
//!
//! [engine.session]
//! append_timeout_ms = 2000
//! snapshot_every = 100
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-document session tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on snapshot + log replay during Loading.
    pub load_timeout_ms: u64,
    /// Upper bound on one durable append.
    pub append_timeout_ms: u64,
    /// Upper bound on writing a snapshot and compacting behind it.
    pub flush_timeout_ms: u64,
    /// Default bound on a whole submit when the caller gives none.
    pub submit_timeout_ms: u64,
    /// Session with no participants and nothing to flush is evicted
    /// after this long without commands.
    pub idle_timeout_ms: u64,
    /// Periodic snapshot check.
    pub flush_interval_ms: u64,
    /// Snapshot once this many entries are unflushed.
    pub snapshot_every: u64,
    /// Log entries kept behind a snapshot when compacting.
    pub retain_entries_after_snapshot: u64,
    /// Entries kept in memory for rebasing stale submissions.
    pub rebase_window: usize,
    /// Remembered (author, client op id) pairs for idempotent resubmission.
    pub dedupe_capacity: usize,
    /// Command mailbox depth per session.
    pub mailbox_capacity: usize,
    /// Broadcast channel depth per document.
    pub broadcast_capacity: usize,
    pub max_participants: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: 5_000,
            append_timeout_ms: 2_000,
            flush_timeout_ms: 10_000,
            submit_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            flush_interval_ms: 10_000,
            snapshot_every: 100,
            retain_entries_after_snapshot: 1_000,
            rebase_window: 1_024,
            dedupe_capacity: 4_096,
            mailbox_capacity: 256,
            broadcast_capacity: 256,
            max_participants: 100,
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            load_timeout_ms: 1_000,
            append_timeout_ms: 500,
            flush_timeout_ms: 2_000,
            submit_timeout_ms: 2_000,
            idle_timeout_ms: 5_000,
            flush_interval_ms: 1_000,
            snapshot_every: 10,
            retain_entries_after_snapshot: 20,
            rebase_window: 64,
            dedupe_capacity: 128,
            mailbox_capacity: 64,
            broadcast_capacity: 64,
            max_participants: 16,
        }
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("load_timeout_ms", self.load_timeout_ms),
            ("append_timeout_ms", self.append_timeout_ms),
            ("flush_timeout_ms", self.flush_timeout_ms),
            ("submit_timeout_ms", self.submit_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("flush_interval_ms", self.flush_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.snapshot_every == 0 {
            return Err(ConfigError::Invalid("snapshot_every must be positive".into()));
        }
        if self.mailbox_capacity == 0 || self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid("channel capacities must be positive".into()));
        }
        if self.max_participants == 0 {
            return Err(ConfigError::Invalid("max_participants must be positive".into()));
        }
        Ok(())
    }
}

/// Process-wide engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub session: SessionConfig,
    /// Depth of the cache invalidation channel.
    pub invalidation_capacity: usize,
    /// Depth of the internal accepted-operation stream.
    pub accepted_capacity: usize,
    /// Depth of the external change feed.
    pub change_feed_capacity: usize,
    /// Attempts for a command that hits a session mid-eviction.
    pub max_dispatch_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            invalidation_capacity: 1_024,
            accepted_capacity: 4_096,
            change_feed_capacity: 1_024,
            max_dispatch_attempts: 3,
        }
    }
}

impl EngineConfig {
    pub fn for_testing() -> Self {
        Self {
            session: SessionConfig::for_testing(),
            invalidation_capacity: 256,
            accepted_capacity: 256,
            change_feed_capacity: 256,
            max_dispatch_attempts: 3,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        if self.invalidation_capacity == 0
            || self.accepted_capacity == 0
            || self.change_feed_capacity == 0
        {
            return Err(ConfigError::Invalid("channel capacities must be positive".into()));
        }
        if self.max_dispatch_attempts == 0 {
            return Err(ConfigError::Invalid("max_dispatch_attempts must be positive".into()));
        }
        Ok(())
    }
}

/// WebSocket server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:9090")
    pub bind_addr: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// RocksDB directory; `None` keeps everything in memory.
    pub storage_path: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9090".to_string(),
            max_connections: 10_000,
            heartbeat_interval_secs: 30,
            storage_path: None,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_connections: 64,
            heartbeat_interval_secs: 5,
            storage_path: None,
            engine: EngineConfig::for_testing(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.is_empty() {
            return Err(ConfigError::Invalid("bind_addr is empty".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive".into()));
        }
        self.engine.validate()
    }
}
