use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::OpenFlags;

use crate::core::{DbError, Result};

const JOURNAL_MODES: &[&str] = &["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Config {
    pub pool: PoolConfig,
    pub log: Option<LogConfig>,
}

/// Logging configuration for the binary.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LogConfig {
    /// An `EnvFilter` directive such as `"handlepool=debug"`; `RUST_LOG` wins when set
    pub filter: Option<String>,
}

/// Settings for one handle pool.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PoolConfig {
    /// Database file every handle in the pool opens
    pub path: PathBuf,
    /// Upper bound on simultaneously open handles
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Default wait for `acquire`; `None` waits indefinitely
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_true")]
    pub create: bool,
    #[serde(default = "default_true")]
    pub foreign_keys: bool,
    #[serde(default)]
    pub journal_mode: Option<String>,
    /// Statements run on every newly opened handle
    #[serde(default)]
    pub init_sql: Vec<String>,
}

fn default_max_size() -> usize {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl PoolConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        PoolConfig {
            path: path.into(),
            max_size: default_max_size(),
            acquire_timeout_ms: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            read_only: false,
            create: true,
            foreign_keys: true,
            journal_mode: None,
            init_sql: Vec::new(),
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_journal_mode(mut self, mode: &str) -> Self {
        self.journal_mode = Some(mode.to_string());
        self
    }

    pub fn with_init_sql(mut self, sql: &str) -> Self {
        self.init_sql.push(sql.to_string());
        self
    }

    /// Parses a bare `[pool]`-less TOML document into a pool configuration.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PoolConfig = toml::from_str(content).map_err(|e| DbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(DbError::Config("pool path must not be empty".to_string()));
        }
        if self.max_size == 0 {
            return Err(DbError::Config("max_size must be at least 1".to_string()));
        }
        if let Some(mode) = &self.journal_mode {
            if !JOURNAL_MODES.contains(&mode.to_uppercase().as_str()) {
                return Err(DbError::Config(format!(
                    "unknown journal_mode {:?}; expected one of {}",
                    mode,
                    JOURNAL_MODES.join(", ")
                )));
            }
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn open_flags(&self) -> OpenFlags {
        let base = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if self.read_only {
            base | OpenFlags::SQLITE_OPEN_READ_ONLY
        } else if self.create {
            base | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        } else {
            base | OpenFlags::SQLITE_OPEN_READ_WRITE
        }
    }
}

/// Loads configuration from a TOML file at the given path.
///
/// # Example
///
/// ```no_run
/// let config = handlepool::config::load_config("handlepool.toml")?;
/// println!("{:?}", config.pool);
/// # Ok::<(), handlepool::DbError>(())
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content).map_err(|e| DbError::Config(e.to_string()))?;
    config.pool.validate()?;
    Ok(config)
}
