use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Result, ShardMemError};

/// Main configuration for a shardmem context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardMemConfig {
    pub runtime: RuntimeConfig,
    pub rendezvous: RendezvousConfig,
    pub memory: MemoryConfig,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

/// Runtime owned by the context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub worker_threads: usize,
}

/// Rendezvous and collective timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Address the rendezvous root listens on when a token is generated
    pub bind_addr: String,
    /// Bounded wait for the full rank set to join
    pub timeout_secs: u64,
    /// Bounded wait for any single collective (barrier, all-gather)
    pub collective_timeout_secs: u64,
}

/// Host shared-memory placement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub shm_dir: PathBuf,
    pub shm_prefix: String,
}

/// File transfer staging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub io_chunk_bytes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: 2 }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            timeout_secs: 60,
            collective_timeout_secs: 300,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            shm_dir: PathBuf::from("/dev/shm"),
            shm_prefix: "shardmem".to_string(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            io_chunk_bytes: 16 * 1024 * 1024, // 16 MiB
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl RendezvousConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn collective_timeout(&self) -> Duration {
        Duration::from_secs(self.collective_timeout_secs)
    }

    /// Parsed listen address for the rendezvous root
    pub fn bind_socket_addr(&self) -> Result<SocketAddr> {
        self.bind_addr.parse().map_err(|e| {
            ShardMemError::Config(format!("Invalid bind address '{}': {}", self.bind_addr, e))
        })
    }
}

impl ShardMemConfig {
    /// Get default configuration file path: `~/.shardmem/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| ShardMemError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".shardmem").join("config.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: ShardMemConfig = toml::from_str(&content)?;

        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Default configuration with `SHARDMEM_*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SHARDMEM_BIND_ADDR") {
            config.rendezvous.bind_addr = addr;
        }
        if let Ok(secs) = std::env::var("SHARDMEM_RENDEZVOUS_TIMEOUT_SECS") {
            config.rendezvous.timeout_secs = parse_env("SHARDMEM_RENDEZVOUS_TIMEOUT_SECS", &secs)?;
        }
        if let Ok(secs) = std::env::var("SHARDMEM_COLLECTIVE_TIMEOUT_SECS") {
            config.rendezvous.collective_timeout_secs =
                parse_env("SHARDMEM_COLLECTIVE_TIMEOUT_SECS", &secs)?;
        }
        if let Ok(dir) = std::env::var("SHARDMEM_SHM_DIR") {
            config.memory.shm_dir = PathBuf::from(dir);
        }
        if let Ok(threads) = std::env::var("SHARDMEM_WORKER_THREADS") {
            config.runtime.worker_threads = parse_env("SHARDMEM_WORKER_THREADS", &threads)?;
        }
        if let Ok(level) = std::env::var("SHARDMEM_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.runtime.worker_threads == 0 {
            return Err(ShardMemError::Config(
                "runtime.worker_threads must be at least 1".into(),
            ));
        }

        if self.rendezvous.timeout_secs == 0 || self.rendezvous.collective_timeout_secs == 0 {
            return Err(ShardMemError::Config(
                "rendezvous timeouts must be at least 1 second".into(),
            ));
        }

        self.rendezvous.bind_socket_addr()?;

        if self.memory.shm_prefix.is_empty() || self.memory.shm_prefix.contains('/') {
            return Err(ShardMemError::Config(
                "memory.shm_prefix must be a non-empty file name component".into(),
            ));
        }

        if self.transfer.io_chunk_bytes == 0 {
            return Err(ShardMemError::Config(
                "transfer.io_chunk_bytes must be at least 1".into(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ShardMemError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ShardMemError::Config(format!("{} has invalid value '{}'", name, value)))
}
