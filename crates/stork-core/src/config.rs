//! Configuration resolution for the Stork server.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. JSON config file (`--config`)
//! 3. Environment variables (`STORK_*`)
//! 4. CLI arguments (applied by the binary, highest priority)
//!
//! Runtime-tunable knobs such as puller intervals are not part of this file;
//! they live in the `settings` table and are read on every puller tick.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub agents: AgentConfig,
    #[serde(default)]
    pub transactions: TransactionConfig,
    #[serde(default)]
    pub zones: ZoneFetchConfig,
    #[serde(default)]
    pub pullers: PullerConfig,
    #[serde(default)]
    pub pki: PkiConfig,
}

/// REST listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub rest_addr: SocketAddr,
    pub log_level: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
        }
    }
}

/// Database location.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

/// Agent communication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Per-call timeout for agent requests (seconds).
    pub request_timeout_secs: u64,
    /// Use HTTPS towards agents.
    pub use_tls: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            use_tls: false,
        }
    }
}

/// Configuration transaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Lifetime of a remembered transaction context (seconds).
    pub ttl_secs: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self { ttl_secs: 10 * 60 }
    }
}

/// Zone inventory fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneFetchConfig {
    pub concurrency: usize,
    pub batch_size: usize,
}

impl Default for ZoneFetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_size: 100,
        }
    }
}

/// Background puller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullerConfig {
    /// How long shutdown waits for in-flight ticks (seconds).
    pub shutdown_grace_secs: u64,
    /// How often a disabled puller re-reads its interval setting (seconds).
    pub disabled_recheck_secs: u64,
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: 5,
            disabled_recheck_secs: 10,
        }
    }
}

/// Certificate authority settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkiConfig {
    pub organization: String,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            organization: "Stork".to_string(),
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => ServerConfig::default(),
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Default database path under the user's data directory.
pub fn default_database_path() -> Option<PathBuf> {
    std::env::var("XDG_DATA_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".local").join("share"))
        })
        .map(|p| p.join("stork").join("stork.db"))
}

fn load_config_file(path: &Path) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut ServerConfig) {
    if let Ok(val) = std::env::var("STORK_REST_ADDR")
        && let Ok(addr) = val.parse()
    {
        config.server.rest_addr = addr;
    }
    if let Ok(val) = std::env::var("STORK_DB_PATH") {
        config.database.path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("STORK_LOG_LEVEL") {
        config.server.log_level = val;
    }
    if let Ok(val) = std::env::var("STORK_AGENT_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.agents.request_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("STORK_TRANSACTION_TTL")
        && let Ok(n) = val.parse()
    {
        config.transactions.ttl_secs = n;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_transaction_ttl_is_ten_minutes() {
        let config = ServerConfig::default();
        assert_eq!(config.transactions.ttl_secs, 600);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(&path, r#"{"zones": {"concurrency": 3, "batch_size": 7}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.zones.concurrency, 3);
        assert_eq!(config.zones.batch_size, 7);
        assert_eq!(config.agents.request_timeout_secs, 30);
        assert_eq!(config.pki.organization, "Stork");
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
