//! Storage backend over a directory of the local file system.
//!
//! Every handle carries its absolute path. Names are validated one
//! segment at a time, so `..` and embedded separators never leave the
//! root. Symlinks are followed only when they resolve inside the root;
//! anything else behind a link reads as missing.

use std::any::Any;
use std::fs::Metadata;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::{DirectoryHandle, EntryMeta, FileHandle, Handle, Mount, StorageError, check_name};
use crate::protocol::file::EntryKind;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Root a backend at an existing directory.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = fs::canonicalize(root.as_ref()).await?;
        if !fs::metadata(&root).await?.is_dir() {
            return Err(StorageError::NotDirectory);
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn root(&self) -> Arc<dyn DirectoryHandle> {
        Arc::new(LocalDirectory {
            name: String::new(),
            path: self.root.clone(),
            root: Arc::from(self.root.as_path()),
        })
    }

    pub fn mount(&self, writable: bool) -> Mount {
        Mount {
            root: self.root(),
            writable,
        }
    }
}

async fn meta_of(name: &str, path: &Path) -> Result<EntryMeta, StorageError> {
    let meta = fs::metadata(path).await?;
    Ok(EntryMeta {
        name: name.to_string(),
        kind: if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        size: if meta.is_dir() { 0 } else { meta.len() },
        modified: meta.modified().unwrap_or(UNIX_EPOCH),
    })
}

/// Metadata of `path`, following a final symlink only when its target
/// lies under `root`. `Ok(None)` when nothing exists at `path`; a
/// dangling or escaping link is `NotFound`, so it is never created
/// through either.
async fn confined_metadata(root: &Path, path: &Path) -> Result<Option<Metadata>, StorageError> {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !meta.file_type().is_symlink() {
        return Ok(Some(meta));
    }
    let target = fs::canonicalize(path)
        .await
        .map_err(|_| StorageError::NotFound)?;
    if !target.starts_with(root) {
        debug!(path = %path.display(), "symlink leaves the root");
        return Err(StorageError::NotFound);
    }
    Ok(Some(fs::metadata(&target).await?))
}

// ── LocalDirectory ───────────────────────────────────────────────

pub struct LocalDirectory {
    name: String,
    path: PathBuf,
    root: Arc<Path>,
}

impl LocalDirectory {
    fn child(&self, name: &str) -> Result<PathBuf, StorageError> {
        check_name(name)?;
        Ok(self.path.join(name))
    }

    fn subdirectory(&self, name: String, path: PathBuf) -> LocalDirectory {
        LocalDirectory {
            name,
            path,
            root: Arc::clone(&self.root),
        }
    }
}

#[async_trait]
impl DirectoryHandle for LocalDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn metadata(&self) -> Result<EntryMeta, StorageError> {
        meta_of(&self.name, &self.path).await
    }

    async fn entries(&self) -> Result<Vec<Handle>, StorageError> {
        let mut dir = fs::read_dir(&self.path).await?;
        let mut handles = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                debug!(path = %entry.path().display(), "skipping non-UTF-8 name");
                continue;
            };
            let path = entry.path();
            // Dangling links and links out of the root are skipped.
            let meta = match confined_metadata(&self.root, &path).await {
                Ok(Some(meta)) => meta,
                Ok(None) => continue,
                Err(e) => {
                    debug!(%name, "skipping entry: {e}");
                    continue;
                }
            };
            handles.push(if meta.is_dir() {
                Handle::Directory(Arc::new(self.subdirectory(name, path)))
            } else {
                Handle::File(Arc::new(LocalFile { name, path }))
            });
        }
        Ok(handles)
    }

    async fn directory(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Arc<dyn DirectoryHandle>, StorageError> {
        let path = self.child(name)?;
        match confined_metadata(&self.root, &path).await? {
            Some(meta) if meta.is_dir() => {}
            Some(_) => return Err(StorageError::NotDirectory),
            None if create => fs::create_dir(&path).await?,
            None => return Err(StorageError::NotFound),
        }
        Ok(Arc::new(self.subdirectory(name.to_string(), path)))
    }

    async fn file(&self, name: &str, create: bool) -> Result<Arc<dyn FileHandle>, StorageError> {
        let path = self.child(name)?;
        match confined_metadata(&self.root, &path).await? {
            Some(meta) if meta.is_dir() => return Err(StorageError::IsDirectory),
            Some(_) => {}
            None if create => {
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .await?;
            }
            None => return Err(StorageError::NotFound),
        }
        Ok(Arc::new(LocalFile {
            name: name.to_string(),
            path,
        }))
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        let path = self.child(name)?;
        if fs::symlink_metadata(&path).await?.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn rename(
        &self,
        name: &str,
        target: &dyn DirectoryHandle,
        new_name: &str,
    ) -> Result<(), StorageError> {
        let target = target
            .as_any()
            .downcast_ref::<LocalDirectory>()
            .ok_or(StorageError::CrossBackend)?;
        let from = self.child(name)?;
        let to = target.child(new_name)?;
        fs::rename(from, to).await?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── LocalFile ────────────────────────────────────────────────────

pub struct LocalFile {
    name: String,
    path: PathBuf,
}

#[async_trait]
impl FileHandle for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn metadata(&self) -> Result<EntryMeta, StorageError> {
        meta_of(&self.name, &self.path).await
    }

    async fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, StorageError> {
        let mut file = fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        file.take(length).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<u64, StorageError> {
        let mut file = OpenOptions::new().write(true).open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len() as u64)
    }

    async fn truncate(&self, size: u64) -> Result<(), StorageError> {
        let file = OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len(size).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_and_writes_real_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();
        let backend = LocalBackend::open(dir.path()).await.unwrap();
        let root = backend.root();

        let file = root.file("hello.txt", false).await.unwrap();
        assert_eq!(file.read(6, 5).await.unwrap(), b"world");
        assert_eq!(file.read(100, 5).await.unwrap(), b"");

        let created = root
            .directory("nested", true)
            .await
            .unwrap()
            .file("new.bin", true)
            .await
            .unwrap();
        created.write(2, b"xy").await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("nested/new.bin")).unwrap(),
            b"\0\0xy"
        );
        created.truncate(1).await.unwrap();
        assert_eq!(created.metadata().await.unwrap().size, 1);
    }

    #[tokio::test]
    async fn parent_segments_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path()).await.unwrap();
        let root = backend.root();
        assert!(matches!(
            root.directory("..", false).await,
            Err(StorageError::InvalidName(_))
        ));
        assert!(matches!(
            root.file("a/../../etc", false).await,
            Err(StorageError::InvalidName(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_stay_inside_the_root() {
        use std::os::unix::fs::symlink;

        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"top secret").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), b"inside").unwrap();
        symlink(outside.path(), dir.path().join("link")).unwrap();
        symlink(outside.path().join("secret.txt"), dir.path().join("secret")).unwrap();
        symlink(outside.path().join("new.txt"), dir.path().join("dangling")).unwrap();
        symlink(dir.path().join("docs/a.txt"), dir.path().join("alias")).unwrap();

        let backend = LocalBackend::open(dir.path()).await.unwrap();
        let root = backend.root();

        assert!(matches!(
            root.directory("link", false).await,
            Err(StorageError::NotFound)
        ));
        assert!(matches!(
            root.file("secret", false).await,
            Err(StorageError::NotFound)
        ));
        assert!(matches!(
            root.file("dangling", true).await,
            Err(StorageError::NotFound)
        ));
        assert!(!outside.path().join("new.txt").exists());

        let alias = root.file("alias", false).await.unwrap();
        assert_eq!(alias.read(0, 64).await.unwrap(), b"inside");

        let mut names: Vec<String> = root
            .entries()
            .await
            .unwrap()
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, ["alias", "docs"]);
    }

    #[tokio::test]
    async fn remove_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a"), b"1").unwrap();
        std::fs::write(dir.path().join("b"), b"2").unwrap();
        let backend = LocalBackend::open(dir.path()).await.unwrap();
        let root = backend.root();

        let sub = root.directory("sub", false).await.unwrap();
        root.rename("b", sub.as_ref(), "c").await.unwrap();
        assert!(dir.path().join("sub/c").exists());

        root.remove("sub").await.unwrap();
        assert!(!dir.path().join("sub").exists());
        assert!(matches!(
            root.remove("sub").await,
            Err(StorageError::Io(e)) if e.kind() == ErrorKind::NotFound
        ));
    }
}
