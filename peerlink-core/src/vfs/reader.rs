//! Chunked reads with read-ahead.
//!
//! A byte range is split into fixed-size blocks and up to `depth` block
//! requests are kept in flight, so a long read costs one round trip per
//! `depth` blocks instead of one per block. Blocks are yielded in order.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::client::VfsClient;
use crate::config::ReadAheadConfig;
use crate::error::PeerError;

pub struct FileReader {
    client: VfsClient,
    path: String,
    size: u64,
    config: ReadAheadConfig,
    cancel: CancellationToken,
}

impl FileReader {
    pub fn new(client: VfsClient, path: impl Into<String>, size: u64, config: ReadAheadConfig) -> Self {
        Self {
            client,
            path: path.into(),
            size,
            config: ReadAheadConfig {
                block_size: config.block_size.max(1),
                depth: config.depth.max(1),
            },
            cancel: CancellationToken::new(),
        }
    }

    /// Stat `path` and read up to its current size.
    pub async fn open(
        client: VfsClient,
        path: impl Into<String>,
        config: ReadAheadConfig,
    ) -> Result<Self, PeerError> {
        let path = path.into();
        let size = client.stat(&path).await?.size;
        Ok(Self::new(client, path, size, config))
    }

    /// Stop reads in progress and refuse new ones once `token` fires.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Blocks covering `[start, end)`, as `(requested length, payload)`.
    fn requests(
        &self,
        start: u64,
        end: u64,
    ) -> impl Stream<Item = Result<(u64, Bytes), PeerError>> + Send + 'static {
        let block = self.config.block_size as u64;
        let client = self.client.clone();
        let path = self.path.clone();
        let ranges = (start..end)
            .step_by(self.config.block_size)
            .map(move |offset| (offset, block.min(end - offset)));
        stream::iter(ranges)
            .map(move |(offset, len)| {
                let client = client.clone();
                let path = path.clone();
                async move {
                    trace!(%path, offset, len, "read block");
                    client.read(&path, offset, len).await.map(|bytes| (len, bytes))
                }
            })
            .buffered(self.config.depth)
    }

    /// In-order blocks of `[offset, offset + length)`, clipped to the
    /// file size.
    pub fn blocks(&self, offset: u64, length: u64) -> Blocks {
        let end = offset.saturating_add(length).min(self.size);
        let stream = if offset < end {
            self.requests(offset, end).boxed()
        } else {
            stream::empty().boxed()
        };
        Blocks {
            stream,
            cancel: self.cancel.clone(),
            done: false,
        }
    }

    /// Bytes `[offset, offset + length)`, clipped to the file size.
    pub async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes, PeerError> {
        let mut blocks = self.blocks(offset, length);
        let mut out = BytesMut::new();
        while let Some(bytes) = blocks.next().await? {
            out.extend_from_slice(&bytes);
        }
        Ok(out.freeze())
    }

    pub async fn read_all(&self) -> Result<Bytes, PeerError> {
        self.read_range(0, self.size).await
    }

    /// Stream the whole file into `writer`. Returns the bytes copied.
    pub async fn copy_to<W>(&self, writer: &mut W) -> Result<u64, PeerError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut blocks = self.blocks(0, self.size);
        let mut copied = 0u64;
        while let Some(bytes) = blocks.next().await? {
            writer.write_all(&bytes).await?;
            copied += bytes.len() as u64;
        }
        writer.flush().await?;
        Ok(copied)
    }
}

/// Pipelined block reads. Dropping it abandons the requests in flight.
pub struct Blocks {
    stream: BoxStream<'static, Result<(u64, Bytes), PeerError>>,
    cancel: CancellationToken,
    done: bool,
}

impl Blocks {
    /// The next block, or `None` once the range or the file ends.
    pub async fn next(&mut self) -> Result<Option<Bytes>, PeerError> {
        if self.done {
            return Ok(None);
        }
        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PeerError::Cancelled),
            next = self.stream.next() => next,
        };
        let Some(block) = next else {
            self.done = true;
            return Ok(None);
        };
        let (requested, bytes) = block?;
        if (bytes.len() as u64) < requested {
            // End of file came early.
            self.done = true;
        }
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::vfs::VfsServer;
    use crate::vfs::backend::MemoryBackend;
    use crate::vfs::testing::{Wired, wire};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn served(len: usize) -> (VfsClient, Wired) {
        let backend = MemoryBackend::new();
        backend.add_file("/blob", pattern(len));
        wire(Arc::new(VfsServer::new(backend.mount(false)))).await
    }

    fn small_blocks() -> ReadAheadConfig {
        ReadAheadConfig {
            block_size: 1000,
            depth: 4,
        }
    }

    #[tokio::test]
    async fn read_all_reassembles_blocks_in_order() {
        let (client, _guard) = served(10_500).await;
        let reader = FileReader::open(client.clone(), "/blob", small_blocks())
            .await
            .unwrap();
        assert_eq!(reader.size(), 10_500);
        assert_eq!(&reader.read_all().await.unwrap()[..], &pattern(10_500)[..]);
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn ranges_are_clipped_to_the_file() {
        let (client, _guard) = served(3_000).await;
        let reader = client.reader("/blob", 3_000, small_blocks());
        let expected = pattern(3_000);
        assert_eq!(
            &reader.read_range(2_500, 1_000).await.unwrap()[..],
            &expected[2_500..]
        );
        assert_eq!(
            &reader.read_range(999, 2).await.unwrap()[..],
            &expected[999..1_001]
        );
        assert!(reader.read_range(5_000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shrunken_file_stops_early() {
        let (client, _guard) = served(1_500).await;
        // The caller believes the file is larger than it is.
        let reader = client.reader("/blob", 5_000, small_blocks());
        assert_eq!(reader.read_all().await.unwrap().len(), 1_500);
    }

    #[tokio::test]
    async fn cancelled_reader_refuses_work() {
        let (client, _guard) = served(4_000).await;
        let token = CancellationToken::new();
        let reader = client
            .reader("/blob", 4_000, small_blocks())
            .with_cancel(token.clone());
        token.cancel();
        assert!(matches!(
            reader.read_all().await,
            Err(PeerError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn copy_to_writes_everything() {
        let (client, _guard) = served(2_345).await;
        let reader = client.reader("/blob", 2_345, small_blocks());
        let mut out = Vec::new();
        assert_eq!(reader.copy_to(&mut out).await.unwrap(), 2_345);
        assert_eq!(out, pattern(2_345));
    }
}
