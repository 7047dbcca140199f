//! File protocol client.
//!
//! Every operation is one round trip through a [`RequestRouter`]. File
//! requests carry no timeout; a lost channel fails them with `Reset`.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use super::directory::RemoteDirectory;
use super::reader::FileReader;
use crate::channel::{Channel, ChannelObserver, Message};
use crate::config::{DirectoryConfig, ReadAheadConfig};
use crate::error::PeerError;
use crate::protocol::file::{FileCommand, FileOp, FileReply, StatRecord};
use crate::router::{Reply, RequestRouter};

/// Cloneable handle to the remote file system behind one sub-channel.
#[derive(Clone, Default)]
pub struct VfsClient {
    router: RequestRouter,
}

impl VfsClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.router.is_bound()
    }

    /// Requests waiting for a reply.
    pub fn pending(&self) -> usize {
        self.router.pending_count()
    }

    async fn request(&self, op: FileOp) -> Result<Reply, PeerError> {
        trace!(op = op.name(), path = op.path(), "file request");
        self.router
            .send(
                move |rid| Ok(Message::Text(FileCommand { rid, op }.to_json()?)),
                None,
            )
            .await
    }

    pub async fn stat(&self, path: &str) -> Result<StatRecord, PeerError> {
        self.request(FileOp::Stat { path: path.into() })
            .await?
            .decode()
    }

    /// Up to `limit` children of `path` after skipping `offset`. A
    /// negative limit lists everything.
    pub async fn list(
        &self,
        path: &str,
        offset: u64,
        limit: i64,
    ) -> Result<Vec<StatRecord>, PeerError> {
        self.request(FileOp::Files {
            path: path.into(),
            offset,
            limit,
        })
        .await?
        .decode()
    }

    pub async fn read(&self, path: &str, offset: u64, length: u64) -> Result<Bytes, PeerError> {
        self.request(FileOp::Read {
            path: path.into(),
            offset,
            length,
        })
        .await?
        .into_bytes()
    }

    /// Returns the number of bytes written.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u64, PeerError> {
        self.request(FileOp::Write {
            path: path.into(),
            offset,
            data: data.to_vec(),
        })
        .await?
        .decode()
    }

    pub async fn truncate(&self, path: &str, size: u64) -> Result<(), PeerError> {
        self.done(FileOp::Truncate {
            path: path.into(),
            size,
        })
        .await
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), PeerError> {
        self.done(FileOp::Mkdir { path: path.into() }).await
    }

    pub async fn remove(&self, path: &str) -> Result<(), PeerError> {
        self.done(FileOp::Remove { path: path.into() }).await
    }

    pub async fn rename(&self, path: &str, new_path: &str) -> Result<(), PeerError> {
        self.done(FileOp::Rename {
            path: path.into(),
            path2: new_path.into(),
        })
        .await
    }

    async fn done(&self, op: FileOp) -> Result<(), PeerError> {
        let _: bool = self.request(op).await?.decode()?;
        Ok(())
    }

    /// A page-cached view of the directory at `path`.
    pub fn directory(&self, path: &str, config: DirectoryConfig) -> RemoteDirectory {
        RemoteDirectory::new(self.clone(), path, config)
    }

    /// A read-ahead reader over the first `size` bytes of `path`.
    pub fn reader(&self, path: &str, size: u64, config: ReadAheadConfig) -> FileReader {
        FileReader::new(self.clone(), path, size, config)
    }
}

#[async_trait]
impl ChannelObserver for VfsClient {
    async fn on_open(&self, channel: Channel) {
        debug!("file channel bound");
        self.router.bind(channel);
    }

    async fn on_message(&self, message: Message) {
        match message {
            Message::Binary(frame) => {
                self.router.resolve_binary(&frame);
            }
            Message::Text(raw) => match serde_json::from_str::<FileReply>(&raw) {
                Ok(reply) => {
                    let rid = reply.rid;
                    self.router.resolve(rid, reply.into_outcome());
                }
                Err(e) => debug!("ignoring malformed file reply: {e}"),
            },
        }
    }

    async fn on_close(&self) {
        debug!("file channel unbound");
        self.router.unbind();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorCode;
    use crate::vfs::VfsServer;
    use crate::vfs::backend::MemoryBackend;
    use crate::vfs::testing::wire;

    struct Silent;

    #[async_trait]
    impl ChannelObserver for Silent {
        async fn on_open(&self, _channel: Channel) {}
        async fn on_message(&self, _message: Message) {}
        async fn on_close(&self) {}
    }

    #[tokio::test]
    async fn unbound_client_is_not_connected() {
        let client = VfsClient::new();
        assert!(!client.is_connected());
        assert!(matches!(client.stat("/").await, Err(PeerError::NotConnected)));
    }

    #[tokio::test]
    async fn operations_round_trip() {
        let backend = MemoryBackend::new();
        let (client, _guard) = wire(Arc::new(VfsServer::new(backend.mount(true)))).await;

        client.mkdir("/notes").await.unwrap();
        assert_eq!(client.write("/notes/today", 0, b"hello").await.unwrap(), 5);
        assert_eq!(client.write("/notes/today", 5, b" world").await.unwrap(), 6);
        assert_eq!(&client.read("/notes/today", 0, 11).await.unwrap()[..], b"hello world");
        assert_eq!(&client.read("/notes/today", 6, 5).await.unwrap()[..], b"world");

        client.truncate("/notes/today", 5).await.unwrap();
        assert_eq!(client.stat("/notes/today").await.unwrap().size, 5);

        client.rename("/notes/today", "/notes/yesterday").await.unwrap();
        let listed = client.list("/notes", 0, -1).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "yesterday");

        client.remove("/notes").await.unwrap();
        assert!(matches!(client.stat("/notes").await, Err(PeerError::NotFound)));
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn read_only_mount_rejects_writes() {
        let backend = MemoryBackend::new();
        backend.add_file("/a", "x");
        let (client, _guard) = wire(Arc::new(VfsServer::new(backend.mount(false)))).await;

        assert!(matches!(
            client.write("/a", 0, b"y").await,
            Err(PeerError::ReadOnly)
        ));
        assert!(matches!(
            client.rename("/a", "/b").await,
            Err(PeerError::ReadOnly)
        ));
        assert!(matches!(
            client.mkdir("/d").await,
            Err(PeerError::ReadOnly)
        ));
        assert!(matches!(
            client.list("/a", 0, -1).await,
            Err(PeerError::Remote(ErrorCode::NotDirectory))
        ));
    }

    #[tokio::test]
    async fn lost_link_resets_pending_reads() {
        let (client, guard) = wire(Arc::new(Silent)).await;
        let read = tokio::spawn({
            let client = client.clone();
            async move { client.read("/big", 0, 1 << 15).await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.pending() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        guard.hub.sever("room:vfs");
        assert!(matches!(read.await.unwrap(), Err(PeerError::Reset)));
        assert_eq!(client.pending(), 0);
    }
}
