//! File protocol server.
//!
//! Answers [`FileOp`] requests against a [`Mount`]. Paths are walked one
//! segment at a time; intermediate directories are created only for
//! write-class operations. Each request runs as its own task, so a slow
//! read never holds up a `stat` behind it, and closing the channel
//! cancels whatever is still running.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::backend::{DirectoryHandle, FileHandle, Handle, Mount, StorageError};
use super::thumbnail::{ThumbnailCache, is_image};
use crate::channel::{Channel, ChannelObserver, Message};
use crate::error::ErrorCode;
use crate::protocol::file::{
    EntryKind, FileCommand, FileOp, FileReply, ParsedCommand, StatMetadata, StatRecord,
    join_path, thumbnail_path, thumbnail_source,
};
use crate::router::encode_binary_reply;
use crate::sync::MutexExt;
use crate::task::TaskPool;

/// What a successful operation sends back.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Json(Value),
    Binary(Bytes),
}

fn json<T: Serialize>(value: T) -> Result<Outcome, StorageError> {
    serde_json::to_value(value)
        .map(Outcome::Json)
        .map_err(|e| StorageError::Other(e.to_string()))
}

fn clamp(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

/// Split a request path into segments. Empty and `.` segments vanish.
fn segments(path: &str) -> Result<Vec<&str>, StorageError> {
    let mut out = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(StorageError::InvalidName(segment.to_string())),
            _ => out.push(segment),
        }
    }
    Ok(out)
}

// ── Resolver ─────────────────────────────────────────────────────

struct Shared {
    mount: Mount,
    thumbnails: ThumbnailCache,
}

impl Shared {
    async fn walk(
        &self,
        parents: &[&str],
        create: bool,
    ) -> Result<Arc<dyn DirectoryHandle>, StorageError> {
        let mut dir = Arc::clone(&self.mount.root);
        for segment in parents {
            dir = dir.directory(segment, create).await?;
        }
        Ok(dir)
    }

    /// Resolve `path`, trying `want` first and the other kind second.
    async fn resolve(
        &self,
        path: &str,
        want: EntryKind,
        create: bool,
    ) -> Result<Handle, StorageError> {
        let segments = segments(path)?;
        let Some((last, parents)) = segments.split_last() else {
            return Ok(Handle::Directory(Arc::clone(&self.mount.root)));
        };
        let dir = self.walk(parents, create).await?;

        let first = match want {
            EntryKind::File => dir.file(last, create).await.map(Handle::File),
            EntryKind::Directory => dir.directory(last, create).await.map(Handle::Directory),
        };
        match first {
            Err(
                e @ (StorageError::NotFound | StorageError::IsDirectory | StorageError::NotDirectory),
            ) => {
                let other = match want {
                    EntryKind::File => dir.directory(last, false).await.map(Handle::Directory),
                    EntryKind::Directory => dir.file(last, false).await.map(Handle::File),
                };
                other.map_err(|_| e)
            }
            result => result,
        }
    }

    async fn resolve_file(
        &self,
        path: &str,
        create: bool,
    ) -> Result<Arc<dyn FileHandle>, StorageError> {
        match self.resolve(path, EntryKind::File, create).await? {
            Handle::File(file) => Ok(file),
            Handle::Directory(_) => Err(StorageError::IsDirectory),
        }
    }

    async fn resolve_dir(
        &self,
        path: &str,
        create: bool,
    ) -> Result<Arc<dyn DirectoryHandle>, StorageError> {
        match self.resolve(path, EntryKind::Directory, create).await? {
            Handle::Directory(dir) => Ok(dir),
            Handle::File(_) => Err(StorageError::NotDirectory),
        }
    }

    /// The parent directory of `path` and the final segment.
    async fn parent_of<'p>(
        &self,
        path: &'p str,
        create: bool,
    ) -> Result<(Arc<dyn DirectoryHandle>, &'p str), StorageError> {
        let segments = segments(path)?;
        let Some((&last, parents)) = segments.split_last() else {
            return Err(StorageError::InvalidName(path.to_string()));
        };
        Ok((self.walk(parents, create).await?, last))
    }

    async fn record(&self, path: &str, handle: &Handle) -> Result<StatRecord, StorageError> {
        let mut record = handle.metadata().await?.to_record();
        if record.kind == EntryKind::File && is_image(&record.name) {
            record.metadata = Some(StatMetadata {
                thumbnail: Some(thumbnail_path(path)),
            });
        }
        Ok(record)
    }

    async fn execute(&self, op: FileOp) -> Result<Outcome, StorageError> {
        if op.is_write() && !self.mount.writable {
            return Err(StorageError::ReadOnly);
        }

        match op {
            FileOp::Stat { path } => {
                let handle = self.resolve(&path, EntryKind::File, false).await?;
                json(self.record(&path, &handle).await?)
            }
            FileOp::Files {
                path,
                offset,
                limit,
            } => {
                let dir = self.resolve_dir(&path, false).await?;
                let limit = usize::try_from(limit).unwrap_or(usize::MAX);
                let mut records = Vec::new();
                for child in dir.entries().await?.into_iter().skip(clamp(offset)).take(limit) {
                    let child_path = join_path(&path, child.name());
                    records.push(self.record(&child_path, &child).await?);
                }
                json(records)
            }
            FileOp::Read {
                path,
                offset,
                length,
            } => {
                if let Some(source) = thumbnail_source(&path) {
                    let file = self.resolve_file(&source, false).await?;
                    let rendered = self.thumbnails.get_or_render(&source, file.as_ref()).await?;
                    let start = clamp(offset).min(rendered.len());
                    let end = start.saturating_add(clamp(length)).min(rendered.len());
                    return Ok(Outcome::Binary(rendered.slice(start..end)));
                }
                let file = self.resolve_file(&path, false).await?;
                Ok(Outcome::Binary(Bytes::from(file.read(offset, length).await?)))
            }
            FileOp::Write { path, offset, data } => {
                let file = self.resolve_file(&path, true).await?;
                json(file.write(offset, &data).await?)
            }
            FileOp::Truncate { path, size } => {
                self.resolve_file(&path, false).await?.truncate(size).await?;
                json(true)
            }
            FileOp::Mkdir { path } => {
                self.resolve_dir(&path, true)
                    .await
                    .map_err(|e| match e {
                        StorageError::NotDirectory => StorageError::Exists,
                        e => e,
                    })?;
                json(true)
            }
            FileOp::Remove { path } => {
                let (parent, name) = self.parent_of(&path, false).await?;
                parent.remove(name).await?;
                json(true)
            }
            FileOp::Rename { path, path2 } => {
                let (from, name) = self.parent_of(&path, false).await?;
                let (to, new_name) = self.parent_of(&path2, true).await?;
                from.rename(name, to.as_ref(), new_name).await?;
                json(true)
            }
        }
    }
}

// ── VfsServer ────────────────────────────────────────────────────

/// Serves one mount over the `files` sub-channel.
pub struct VfsServer {
    shared: Arc<Shared>,
    pool: TaskPool,
    channel: Mutex<Option<Channel>>,
}

impl VfsServer {
    pub fn new(mount: Mount) -> Self {
        Self {
            shared: Arc::new(Shared {
                mount,
                thumbnails: ThumbnailCache::default(),
            }),
            pool: TaskPool::new(),
            channel: Mutex::new(None),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.shared.mount.writable
    }

    /// Requests still running.
    pub fn in_flight(&self) -> usize {
        self.pool.len()
    }

    /// Run one operation directly, without a channel.
    pub async fn execute(&self, op: FileOp) -> Result<Outcome, StorageError> {
        self.shared.execute(op).await
    }

    fn dispatch(&self, channel: Channel, command: FileCommand) {
        let FileCommand { rid, op } = command;
        let shared = Arc::clone(&self.shared);
        self.pool.spawn(rid, move |_| async move {
            let name = op.name();
            let outcome = shared.execute(op).await;
            send_reply(&channel, rid, name, outcome);
        });
    }
}

fn send_reply(channel: &Channel, rid: u32, op: &str, outcome: Result<Outcome, StorageError>) {
    let sent = match outcome {
        Ok(Outcome::Binary(bytes)) => channel.send_binary(encode_binary_reply(rid, &bytes)),
        Ok(Outcome::Json(value)) => FileReply::ok(rid, value)
            .to_json()
            .and_then(|raw| channel.send_text(raw)),
        Err(e) => {
            let code = e.code().unwrap_or_else(|| {
                error!(rid, op, "storage failure: {e}");
                ErrorCode::InternalError
            });
            debug!(rid, op, %code, "request failed");
            FileReply::err(rid, code)
                .to_json()
                .and_then(|raw| channel.send_text(raw))
        }
    };
    if let Err(e) = sent {
        debug!(rid, op, "reply not delivered: {e}");
    }
}

#[async_trait]
impl ChannelObserver for VfsServer {
    async fn on_open(&self, channel: Channel) {
        debug!(writable = self.is_writable(), "file channel open");
        *self.channel.locked() = Some(channel);
    }

    async fn on_message(&self, message: Message) {
        let Some(channel) = self.channel.locked().clone() else {
            return;
        };
        let raw = match message {
            Message::Text(raw) => raw,
            Message::Binary(frame) => {
                debug!(len = frame.len(), "ignoring binary frame on file channel");
                return;
            }
        };

        match FileCommand::parse(&raw) {
            Ok(ParsedCommand::Command(command)) => self.dispatch(channel, command),
            Ok(ParsedCommand::Unknown { rid, op }) => {
                debug!(rid, %op, "unknown file operation");
                send_reply_code(&channel, rid, ErrorCode::UnknownOperation);
            }
            Err(e) => {
                warn!("malformed file request: {e}");
                let rid = serde_json::from_str::<Value>(&raw)
                    .ok()
                    .and_then(|v| v.get("rid")?.as_u64())
                    .and_then(|rid| u32::try_from(rid).ok());
                if let Some(rid) = rid {
                    send_reply_code(&channel, rid, ErrorCode::InternalError);
                }
            }
        }
    }

    async fn on_close(&self) {
        self.channel.locked().take();
        self.pool.cancel_all();
        debug!("file channel closed");
    }
}

fn send_reply_code(channel: &Channel, rid: u32, code: ErrorCode) {
    let sent = FileReply::err(rid, code)
        .to_json()
        .and_then(|raw| channel.send_text(raw));
    if let Err(e) = sent {
        debug!(rid, "reply not delivered: {e}");
    }
}
