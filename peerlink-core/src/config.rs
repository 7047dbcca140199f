//! Tunables for the core components.
//!
//! Plain structs with `Default`; the agent fills them from its TOML file.

use std::time::Duration;

/// Per-session reconnect and connect-timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachineConfig {
    /// Delay before retrying after an unexpected disconnect.
    /// `None` disables reconnecting.
    pub reconnect_delay: Option<Duration>,

    /// Give up on a `connect()` that has not reached `Connected` in time.
    pub connect_timeout: Option<Duration>,
}

impl MachineConfig {
    /// Reconnect forever, never time out.
    pub fn permanent(reconnect_delay: Duration) -> Self {
        Self {
            reconnect_delay: Some(reconnect_delay),
            connect_timeout: None,
        }
    }

    /// One attempt, bounded.
    pub fn transient(connect_timeout: Duration) -> Self {
        Self {
            reconnect_delay: None,
            connect_timeout: Some(connect_timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub permanent_reconnect_delay: Duration,
    pub transient_connect_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            permanent_reconnect_delay: Duration::from_secs(1),
            transient_connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    pub fn machine(&self, permanent: bool) -> MachineConfig {
        if permanent {
            MachineConfig::permanent(self.permanent_reconnect_delay)
        } else {
            MachineConfig::transient(self.transient_connect_timeout)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingConfig {
    /// Number of PIN digits.
    pub pin_length: usize,
    /// How long the offering side waits for a credential.
    pub offer_timeout: Duration,
    /// How long the accepting side waits for a hello.
    pub accept_timeout: Duration,
    /// Offer a dedicated publish room instead of letting the peer pick.
    pub isolated_room: bool,
    /// Device identity sent in hello/credential.
    pub user_agent: String,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            pin_length: 6,
            offer_timeout: Duration::from_secs(60 * 60),
            accept_timeout: Duration::from_secs(10),
            isolated_room: false,
            user_agent: format!("peerlink/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Directory page cache shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryConfig {
    pub page_size: usize,
    pub capacity: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            capacity: 8,
        }
    }
}

/// Chunked read pipeline shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadAheadConfig {
    pub block_size: usize,
    pub depth: usize,
}

impl Default for ReadAheadConfig {
    fn default() -> Self {
        Self {
            block_size: 32 * 1024,
            depth: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcConfig {
    pub timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}
