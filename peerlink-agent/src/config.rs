//! Configuration for the peerlink agent.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use peerlink_core::{DirectoryConfig, ManagerConfig, PairingConfig, ReadAheadConfig, RpcConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub pairing: PairingSection,
    pub vfs: VfsConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// TCP endpoints and link liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the serving/offering side binds.
    pub listen: SocketAddr,
    /// Default peer for `ls`, `get` and `pair accept`.
    pub peer: SocketAddr,
    pub heartbeat_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Reconnect policy for stream sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub reconnect_delay_ms: u64,
    /// Bound on one-shot sessions (`ls`, `get`).
    pub connect_timeout_secs: u64,
    pub rpc_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingSection {
    pub pin_length: usize,
    pub offer_timeout_secs: u64,
    pub accept_timeout_secs: u64,
    /// Offer a dedicated publish room.
    pub isolated_room: bool,
    /// Empty means `peerlink/<version>`.
    pub user_agent: String,
}

/// What `serve` exports and how the browser side reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    pub root: PathBuf,
    pub writable: bool,
    pub page_size: usize,
    pub cache_pages: usize,
    pub block_size: usize,
    pub read_ahead: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Paired device records (JSON).
    pub registry: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7331)),
            peer: SocketAddr::from(([127, 0, 0, 1], 7331)),
            heartbeat_secs: 5,
            idle_timeout_secs: 20,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 1000,
            connect_timeout_secs: 30,
            rpc_timeout_secs: 10,
        }
    }
}

impl Default for PairingSection {
    fn default() -> Self {
        let core = PairingConfig::default();
        Self {
            pin_length: core.pin_length,
            offer_timeout_secs: core.offer_timeout.as_secs(),
            accept_timeout_secs: core.accept_timeout.as_secs(),
            isolated_room: core.isolated_room,
            user_agent: String::new(),
        }
    }
}

impl Default for VfsConfig {
    fn default() -> Self {
        let dir = DirectoryConfig::default();
        let read = ReadAheadConfig::default();
        Self {
            root: PathBuf::from("."),
            writable: false,
            page_size: dir.page_size,
            cache_pages: dir.capacity,
            block_size: read.block_size,
            read_ahead: read.depth,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            registry: PathBuf::from("peerlink-devices.json"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        std::fs::write(path, Self::default_toml()?)
    }

    pub fn default_toml() -> std::io::Result<String> {
        toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.network.heartbeat_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.network.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.session.connect_timeout_secs.max(1))
    }

    pub fn to_manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            permanent_reconnect_delay: Duration::from_millis(self.session.reconnect_delay_ms),
            transient_connect_timeout: self.connect_timeout(),
        }
    }

    pub fn to_pairing_config(&self) -> PairingConfig {
        let mut config = PairingConfig {
            pin_length: self.pairing.pin_length.clamp(4, 12),
            offer_timeout: Duration::from_secs(self.pairing.offer_timeout_secs),
            accept_timeout: Duration::from_secs(self.pairing.accept_timeout_secs),
            isolated_room: self.pairing.isolated_room,
            ..PairingConfig::default()
        };
        if !self.pairing.user_agent.is_empty() {
            config.user_agent = self.pairing.user_agent.clone();
        }
        config
    }

    pub fn to_directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            page_size: self.vfs.page_size.max(1),
            capacity: self.vfs.cache_pages.max(1),
        }
    }

    pub fn to_read_ahead_config(&self) -> ReadAheadConfig {
        ReadAheadConfig {
            block_size: self.vfs.block_size.clamp(1024, 1024 * 1024),
            depth: self.vfs.read_ahead.max(1),
        }
    }

    pub fn to_rpc_config(&self) -> RpcConfig {
        RpcConfig {
            timeout: Duration::from_secs(self.session.rpc_timeout_secs.max(1)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = AgentConfig::default_toml().unwrap();
        assert!(text.contains("[network]"));
        assert!(text.contains("listen"));
        assert!(text.contains("page_size"));
    }

    #[test]
    fn roundtrip_config() {
        let text = AgentConfig::default_toml().unwrap();
        let parsed: AgentConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.listen.port(), 7331);
        assert_eq!(parsed.pairing.pin_length, 6);
        assert_eq!(parsed.vfs.page_size, 100);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: AgentConfig = toml::from_str("[vfs]\nwritable = true\n").unwrap();
        assert!(parsed.vfs.writable);
        assert_eq!(parsed.vfs.cache_pages, 8);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig::load(&dir.path().join("absent.toml"));
        assert_eq!(cfg.session.connect_timeout_secs, 30);
    }

    #[test]
    fn write_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        AgentConfig::write_default(&path).unwrap();
        let cfg = AgentConfig::load(&path);
        assert_eq!(cfg.storage.registry, PathBuf::from("peerlink-devices.json"));
    }

    #[test]
    fn conversions_clamp() {
        let mut cfg = AgentConfig::default();
        cfg.vfs.block_size = 10;
        cfg.vfs.page_size = 0;
        cfg.pairing.user_agent = "desk".into();
        assert_eq!(cfg.to_read_ahead_config().block_size, 1024);
        assert_eq!(cfg.to_directory_config().page_size, 1);
        assert_eq!(cfg.to_pairing_config().user_agent, "desk");
        assert_eq!(
            cfg.to_manager_config().transient_connect_timeout,
            Duration::from_secs(30)
        );
    }
}
