//! Agent operations behind the CLI subcommands.
//!
//! The serving side listens for TCP peers and hosts one permanent stream
//! session (`main`) carrying the control and files channels. The viewer
//! side dials, authenticates with its pairing token and browses through
//! the page cache.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use peerlink_core::protocol::file::FILES_CHANNEL;
use peerlink_core::state::CONTROL_CHANNEL;
use peerlink_core::{
    ConnectionManager, ConnectionState, ConnectionStateMachine, ControlClient, ControlServer,
    DeviceRecord, DeviceRegistry, FileEntry, FileReader, LocalBackend, LoggingInputSink,
    MachineConfig, Pairing, PairingSession, PeerError, SessionParams, StreamOptions,
    TcpTransport, Transport, VfsClient, VfsServer,
};

use crate::config::AgentConfig;

pub type AgentResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Name of the stream `serve` publishes.
pub const MAIN_STREAM: &str = "main";

// ── Agent ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Agent {
    config: AgentConfig,
    registry: DeviceRegistry,
}

impl Agent {
    /// Open the device registry named by the config.
    pub fn new(config: AgentConfig) -> Result<Self, PeerError> {
        let registry = DeviceRegistry::open(&config.storage.registry)?;
        Ok(Self::with_registry(config, registry))
    }

    pub fn with_registry(config: AgentConfig, registry: DeviceRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    fn listener(&self) -> Arc<dyn Transport> {
        Arc::new(
            TcpTransport::listen(self.config.network.listen)
                .with_liveness(self.config.heartbeat(), self.config.idle_timeout()),
        )
    }

    fn dialer(&self, peer: SocketAddr) -> Arc<dyn Transport> {
        Arc::new(
            TcpTransport::dial(peer)
                .with_liveness(self.config.heartbeat(), self.config.idle_timeout()),
        )
    }

    /// The named device, or the only one when there is exactly one.
    pub fn device(&self, room_id: Option<&str>) -> AgentResult<DeviceRecord> {
        if let Some(room_id) = room_id {
            return self
                .registry
                .get(room_id)
                .ok_or_else(|| format!("no paired device with room {room_id}").into());
        }
        match self.registry.devices().as_slice() {
            [only] => Ok(only.clone()),
            [] => Err("no paired devices; run `pair` first".into()),
            _ => Err("several paired devices; pick one with --device".into()),
        }
    }

    // ── Pairing ──────────────────────────────────────────────────

    /// Listen for a peer under a fresh PIN.
    pub fn pair_offer(&self) -> AgentResult<PairingSession> {
        let pairing = Pairing::new(
            self.listener(),
            self.registry.clone(),
            self.config.to_pairing_config(),
        );
        Ok(pairing.offer()?)
    }

    /// Dial `peer` and answer the offer behind `pin`.
    pub fn pair_accept(&self, pin: &str, peer: SocketAddr) -> AgentResult<PairingSession> {
        let pairing = Pairing::new(
            self.dialer(peer),
            self.registry.clone(),
            self.config.to_pairing_config(),
        );
        Ok(pairing.accept(pin)?)
    }

    // ── Serving ──────────────────────────────────────────────────

    /// Host the configured directory for `device` until `shutdown`
    /// resolves.
    pub async fn serve<F>(&self, device: Option<&str>, shutdown: F) -> AgentResult<()>
    where
        F: Future<Output = ()>,
    {
        let record = self.device(device)?;
        let backend = LocalBackend::open(&self.config.vfs.root).await?;
        let writable = self.config.vfs.writable;

        let manager = ConnectionManager::new(
            self.listener(),
            record.stream_base(),
            Some(record.signaling_key.clone()),
            self.config.to_manager_config(),
        );
        let control = ControlServer::new(self.registry.clone(), Arc::new(LoggingInputSink));
        let session = manager.add_stream_with(
            StreamOptions::new(MAIN_STREAM)
                .permanent(true)
                .channel(CONTROL_CHANNEL, Arc::new(control))
                .channel(FILES_CHANNEL, Arc::new(VfsServer::new(backend.mount(writable)))),
        );
        info!(
            device = record.display_name(),
            stream = session.id,
            root = %backend.path().display(),
            writable,
            "serving on {}",
            self.config.network.listen
        );

        shutdown.await;
        info!("shutting down");
        manager.dispose();
        Ok(())
    }

    // ── Browsing ─────────────────────────────────────────────────

    /// Dial `peer` and join stream `stream` of `device`.
    pub async fn connect(
        &self,
        device: Option<&str>,
        stream: u32,
        peer: Option<SocketAddr>,
    ) -> AgentResult<PeerSession> {
        let record = self.device(device)?;
        let peer = peer.unwrap_or(self.config.network.peer);
        let timeout = self.config.connect_timeout();

        let files = VfsClient::new();
        let control = Arc::new(ControlClient::new(
            record.token.clone(),
            self.config.to_rpc_config(),
        ));
        let params = SessionParams::new(format!("{}.{stream}", record.stream_base()))
            .with_signaling_key(record.signaling_key.clone());
        let machine = ConnectionStateMachine::new(
            self.dialer(peer),
            params,
            MachineConfig::transient(timeout),
        )
        .with_channel(CONTROL_CHANNEL, control.clone())
        .with_channel(FILES_CHANNEL, Arc::new(files.clone()));
        machine.connect()?;

        let session = PeerSession {
            machine,
            files,
            control,
        };
        tokio::time::timeout(timeout, session.ready())
            .await
            .map_err(|_| PeerError::Timeout(timeout))??;
        info!(%peer, room = session.machine.room_id(), "connected");
        Ok(session)
    }

    /// Every entry of `path`, fetched page by page.
    pub async fn list(&self, session: &PeerSession, path: &str) -> AgentResult<Vec<FileEntry>> {
        let dir = session
            .files
            .directory(path, self.config.to_directory_config());
        let mut entries = Vec::new();
        loop {
            match dir.get(entries.len() as i64).await {
                Ok(entry) => entries.push(entry),
                Err(PeerError::OutOfRange) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }

    /// Copy remote `path` into local `dest`. Returns the bytes written.
    pub async fn download(
        &self,
        session: &PeerSession,
        path: &str,
        dest: &Path,
    ) -> AgentResult<u64> {
        let reader = FileReader::open(
            session.files.clone(),
            path,
            self.config.to_read_ahead_config(),
        )
        .await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let copied = reader.copy_to(&mut file).await?;
        info!(path, dest = %dest.display(), copied, "downloaded");
        Ok(copied)
    }
}

// ── PeerSession ──────────────────────────────────────────────────

/// A dialed session. Dropping it disposes the connection.
pub struct PeerSession {
    pub machine: ConnectionStateMachine,
    pub files: VfsClient,
    pub control: Arc<ControlClient>,
}

impl PeerSession {
    async fn ready(&self) -> Result<(), PeerError> {
        self.machine.wait_for(ConnectionState::Connected).await?;
        while !self.files.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.machine.dispose();
    }
}

// ── Tests ────────────────────────────────────────────────────────
