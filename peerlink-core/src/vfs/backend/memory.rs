//! In-process storage backend for tests and demos.
//!
//! Children keep insertion order, which is the order `entries` reports.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;

use super::{DirectoryHandle, EntryMeta, FileHandle, Handle, Mount, StorageError, check_name};
use crate::protocol::file::EntryKind;
use crate::sync::MutexExt;

struct FileState {
    bytes: Vec<u8>,
    modified: SystemTime,
}

struct DirState {
    children: Vec<(String, Node)>,
    modified: SystemTime,
}

#[derive(Clone)]
enum Node {
    File(Arc<SharedFile>),
    Dir(Arc<SharedDir>),
}

type SharedFile = Mutex<FileState>;
type SharedDir = Mutex<DirState>;

impl Node {
    fn handle(&self, name: &str) -> Handle {
        match self {
            Node::File(state) => Handle::File(Arc::new(MemoryFile {
                name: name.to_string(),
                state: Arc::clone(state),
            })),
            Node::Dir(state) => Handle::Directory(Arc::new(MemoryDirectory {
                name: name.to_string(),
                state: Arc::clone(state),
            })),
        }
    }
}

fn new_dir() -> Arc<SharedDir> {
    Arc::new(Mutex::new(DirState {
        children: Vec::new(),
        modified: SystemTime::now(),
    }))
}

fn new_file(bytes: Vec<u8>) -> Arc<SharedFile> {
    Arc::new(Mutex::new(FileState {
        bytes,
        modified: SystemTime::now(),
    }))
}

/// Largest file a write or truncate may grow to.
pub const MAX_FILE_SIZE: usize = 64 * 1024 * 1024;

fn to_index(value: u64) -> Result<usize, StorageError> {
    usize::try_from(value).map_err(|_| StorageError::OutOfRange)
}

fn check_size(size: usize) -> Result<usize, StorageError> {
    if size > MAX_FILE_SIZE {
        return Err(StorageError::OutOfRange);
    }
    Ok(size)
}

// ── MemoryBackend ────────────────────────────────────────────────

/// A tree held entirely in memory.
#[derive(Clone)]
pub struct MemoryBackend {
    root: Arc<SharedDir>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self { root: new_dir() }
    }

    pub fn root(&self) -> Arc<dyn DirectoryHandle> {
        Arc::new(MemoryDirectory {
            name: String::new(),
            state: Arc::clone(&self.root),
        })
    }

    pub fn mount(&self, writable: bool) -> Mount {
        Mount {
            root: self.root(),
            writable,
        }
    }

    /// Seed a file at a slash-separated path, creating parent directories.
    pub fn add_file(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((&last, parents)) = segments.split_last() else {
            return;
        };
        let mut dir = Arc::clone(&self.root);
        for segment in parents {
            dir = dir_child(&dir, segment);
        }
        let mut state = dir.locked();
        state.children.retain(|(n, _)| n != last);
        state
            .children
            .push((last.to_string(), Node::File(new_file(bytes.into()))));
        state.modified = SystemTime::now();
    }

    /// Seed an empty directory at a slash-separated path.
    pub fn add_dir(&self, path: &str) {
        let mut dir = Arc::clone(&self.root);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            dir = dir_child(&dir, segment);
        }
    }
}

fn dir_child(dir: &Arc<SharedDir>, name: &str) -> Arc<SharedDir> {
    let mut state = dir.locked();
    if let Some((_, Node::Dir(existing))) = state.children.iter().find(|(n, _)| n == name) {
        return Arc::clone(existing);
    }
    state.children.retain(|(n, _)| n != name);
    let child = new_dir();
    state
        .children
        .push((name.to_string(), Node::Dir(Arc::clone(&child))));
    child
}

// ── MemoryDirectory ──────────────────────────────────────────────

pub struct MemoryDirectory {
    name: String,
    state: Arc<SharedDir>,
}

impl MemoryDirectory {
    fn lookup(&self, name: &str) -> Result<Option<Node>, StorageError> {
        check_name(name)?;
        Ok(self
            .state
            .locked()
            .children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node.clone()))
    }
}

#[async_trait]
impl DirectoryHandle for MemoryDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn metadata(&self) -> Result<EntryMeta, StorageError> {
        let state = self.state.locked();
        Ok(EntryMeta {
            name: self.name.clone(),
            kind: EntryKind::Directory,
            size: 0,
            modified: state.modified,
        })
    }

    async fn entries(&self) -> Result<Vec<Handle>, StorageError> {
        let state = self.state.locked();
        Ok(state
            .children
            .iter()
            .map(|(name, node)| node.handle(name))
            .collect())
    }

    async fn directory(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Arc<dyn DirectoryHandle>, StorageError> {
        check_name(name)?;
        let mut state = self.state.locked();
        let found = state
            .children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node.clone());
        let child = match found {
            Some(Node::Dir(dir)) => dir,
            Some(Node::File(_)) => return Err(StorageError::NotDirectory),
            None if create => {
                let dir = new_dir();
                state
                    .children
                    .push((name.to_string(), Node::Dir(Arc::clone(&dir))));
                state.modified = SystemTime::now();
                dir
            }
            None => return Err(StorageError::NotFound),
        };
        Ok(Arc::new(MemoryDirectory {
            name: name.to_string(),
            state: child,
        }))
    }

    async fn file(&self, name: &str, create: bool) -> Result<Arc<dyn FileHandle>, StorageError> {
        check_name(name)?;
        let mut state = self.state.locked();
        let found = state
            .children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node.clone());
        let child = match found {
            Some(Node::File(file)) => file,
            Some(Node::Dir(_)) => return Err(StorageError::IsDirectory),
            None if create => {
                let file = new_file(Vec::new());
                state
                    .children
                    .push((name.to_string(), Node::File(Arc::clone(&file))));
                state.modified = SystemTime::now();
                file
            }
            None => return Err(StorageError::NotFound),
        };
        Ok(Arc::new(MemoryFile {
            name: name.to_string(),
            state: child,
        }))
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        check_name(name)?;
        let mut state = self.state.locked();
        let before = state.children.len();
        state.children.retain(|(n, _)| n != name);
        if state.children.len() == before {
            return Err(StorageError::NotFound);
        }
        state.modified = SystemTime::now();
        Ok(())
    }

    async fn rename(
        &self,
        name: &str,
        target: &dyn DirectoryHandle,
        new_name: &str,
    ) -> Result<(), StorageError> {
        check_name(new_name)?;
        let target = target
            .as_any()
            .downcast_ref::<MemoryDirectory>()
            .ok_or(StorageError::CrossBackend)?;
        let node = self.lookup(name)?.ok_or(StorageError::NotFound)?;
        if let Node::Dir(moved) = &node {
            if Arc::ptr_eq(moved, &target.state) {
                return Err(StorageError::InvalidName(new_name.to_string()));
            }
        }

        // One lock at a time, so opposite renames cannot deadlock.
        {
            let mut source = self.state.locked();
            source.children.retain(|(n, _)| n != name);
            source.modified = SystemTime::now();
        }
        let mut dest = target.state.locked();
        dest.children.retain(|(n, _)| n != new_name);
        dest.children.push((new_name.to_string(), node));
        dest.modified = SystemTime::now();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── MemoryFile ───────────────────────────────────────────────────

pub struct MemoryFile {
    name: String,
    state: Arc<SharedFile>,
}

#[async_trait]
impl FileHandle for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn metadata(&self) -> Result<EntryMeta, StorageError> {
        let state = self.state.locked();
        Ok(EntryMeta {
            name: self.name.clone(),
            kind: EntryKind::File,
            size: state.bytes.len() as u64,
            modified: state.modified,
        })
    }

    async fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, StorageError> {
        let state = self.state.locked();
        let len = state.bytes.len();
        let start = to_index(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(to_index(length).unwrap_or(usize::MAX)).min(len);
        Ok(state.bytes[start..end].to_vec())
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<u64, StorageError> {
        let start = to_index(offset)?;
        let end = start.checked_add(data.len()).ok_or(StorageError::OutOfRange)?;
        check_size(end)?;
        let mut state = self.state.locked();
        if state.bytes.len() < end {
            state.bytes.resize(end, 0);
        }
        state.bytes[start..end].copy_from_slice(data);
        state.modified = SystemTime::now();
        Ok(data.len() as u64)
    }

    async fn truncate(&self, size: u64) -> Result<(), StorageError> {
        let size = check_size(to_index(size)?)?;
        let mut state = self.state.locked();
        state.bytes.resize(size, 0);
        state.modified = SystemTime::now();
        Ok(())
    }
}
