//! Abstract hierarchical storage the VFS server answers from.
//!
//! A backend is a tree of [`DirectoryHandle`]s and [`FileHandle`]s. The
//! server only ever walks it one segment at a time, so a backend needs
//! no notion of full paths.

pub mod local;
pub mod memory;

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::ErrorCode;
use crate::protocol::file::{EntryKind, StatRecord};

pub use local::LocalBackend;
pub use memory::MemoryBackend;

// ── StorageError ─────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("entry already exists")]
    Exists,

    #[error("read-only mount")]
    ReadOnly,

    #[error("range outside the file")]
    OutOfRange,

    #[error("invalid path segment: {0:?}")]
    InvalidName(String),

    #[error("cannot move entries between different backends")]
    CrossBackend,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// The protocol tag for this failure, or `None` when the cause is
    /// unexpected and must be reported as an internal error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            StorageError::NotFound | StorageError::InvalidName(_) => Some(ErrorCode::NotFound),
            StorageError::NotDirectory => Some(ErrorCode::NotDirectory),
            StorageError::IsDirectory => Some(ErrorCode::IsDirectory),
            StorageError::Exists => Some(ErrorCode::Exists),
            StorageError::ReadOnly => Some(ErrorCode::ReadOnly),
            StorageError::OutOfRange => Some(ErrorCode::OutOfRange),
            StorageError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => Some(ErrorCode::NotFound),
                std::io::ErrorKind::AlreadyExists => Some(ErrorCode::Exists),
                std::io::ErrorKind::PermissionDenied => Some(ErrorCode::ReadOnly),
                _ => None,
            },
            StorageError::CrossBackend | StorageError::Other(_) => None,
        }
    }
}

/// Reject names a single path segment may not take.
pub fn check_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ── Metadata ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: SystemTime,
}

impl EntryMeta {
    /// Milliseconds since the Unix epoch, zero for earlier times.
    pub fn modified_ms(&self) -> u64 {
        self.modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn to_record(&self) -> StatRecord {
        StatRecord {
            kind: self.kind,
            name: self.name.clone(),
            size: self.size,
            updated_time: self.modified_ms(),
            metadata: None,
        }
    }
}

// ── Handles ──────────────────────────────────────────────────────

/// One file in a backend.
#[async_trait]
pub trait FileHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn metadata(&self) -> Result<EntryMeta, StorageError>;

    /// Up to `length` bytes starting at `offset`. Reading at or past the
    /// end yields an empty buffer.
    async fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, StorageError>;

    /// Write `data` at `offset`, growing the file as needed. Returns the
    /// number of bytes written.
    async fn write(&self, offset: u64, data: &[u8]) -> Result<u64, StorageError>;

    async fn truncate(&self, size: u64) -> Result<(), StorageError>;
}

/// One directory in a backend.
#[async_trait]
pub trait DirectoryHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn metadata(&self) -> Result<EntryMeta, StorageError>;

    /// Children in the backend's native order.
    async fn entries(&self) -> Result<Vec<Handle>, StorageError>;

    /// The child directory `name`, created when missing and `create` is set.
    async fn directory(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Arc<dyn DirectoryHandle>, StorageError>;

    /// The child file `name`, created empty when missing and `create` is set.
    async fn file(&self, name: &str, create: bool) -> Result<Arc<dyn FileHandle>, StorageError>;

    /// Remove the child `name`, recursively for directories.
    async fn remove(&self, name: &str) -> Result<(), StorageError>;

    /// Move child `name` into `target` as `new_name`. `target` must
    /// belong to the same backend.
    async fn rename(
        &self,
        name: &str,
        target: &dyn DirectoryHandle,
        new_name: &str,
    ) -> Result<(), StorageError>;

    fn as_any(&self) -> &dyn Any;
}

/// Either kind of entry.
#[derive(Clone)]
pub enum Handle {
    File(Arc<dyn FileHandle>),
    Directory(Arc<dyn DirectoryHandle>),
}

impl Handle {
    pub fn name(&self) -> &str {
        match self {
            Handle::File(f) => f.name(),
            Handle::Directory(d) => d.name(),
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            Handle::File(_) => EntryKind::File,
            Handle::Directory(_) => EntryKind::Directory,
        }
    }

    pub async fn metadata(&self) -> Result<EntryMeta, StorageError> {
        match self {
            Handle::File(f) => f.metadata().await,
            Handle::Directory(d) => d.metadata().await,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

// ── Mount ────────────────────────────────────────────────────────

/// A backend root plus the permission granted to remote callers.
#[derive(Clone)]
pub struct Mount {
    pub root: Arc<dyn DirectoryHandle>,
    pub writable: bool,
}

impl Mount {
    pub fn read_only(root: Arc<dyn DirectoryHandle>) -> Self {
        Self {
            root,
            writable: false,
        }
    }

    pub fn writable(root: Arc<dyn DirectoryHandle>) -> Self {
        Self {
            root,
            writable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_single_segments() {
        assert!(check_name("a.txt").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(matches!(check_name(bad), Err(StorageError::InvalidName(_))));
        }
    }

    #[test]
    fn io_errors_map_to_codes() {
        let missing = StorageError::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(missing.code(), Some(ErrorCode::NotFound));
        let odd = StorageError::from(std::io::Error::other("disk on fire"));
        assert_eq!(odd.code(), None);
        assert_eq!(StorageError::ReadOnly.code(), Some(ErrorCode::ReadOnly));
    }
}
