//! Paged, cached view of one remote directory.
//!
//! The listing is fetched in fixed-size pages on demand. At most
//! `capacity` pages are held; a miss at capacity evicts the least
//! recently touched resident page, or, when every slot is still
//! loading, cancels the oldest load. The total entry count is unknown
//! until a short page shows up:
//!
//! ```text
//!  loadPage(0) → 100 entries   size ≥ 101
//!  loadPage(1) → 100 entries   size ≥ 201
//!  loadPage(2) →  50 entries   size = 250
//! ```

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use lru::LruCache;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::client::VfsClient;
use super::reader::FileReader;
use crate::config::{DirectoryConfig, ReadAheadConfig};
use crate::error::{ErrorCode, PeerError};
use crate::protocol::file::{EntryKind, StatRecord, join_path};
use crate::sync::MutexExt;

// ── FileEntry ────────────────────────────────────────────────────

/// Snapshot of one listed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub modified: u64,
    pub thumbnail: Option<String>,
}

impl FileEntry {
    pub fn from_record(dir: &str, record: StatRecord) -> Self {
        let thumbnail = record.thumbnail().map(str::to_string);
        Self {
            path: join_path(dir, &record.name),
            name: record.name,
            kind: record.kind,
            size: record.size,
            modified: record.updated_time,
            thumbnail,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Lazy chunked access to this entry's bytes.
    pub fn reader(&self, client: &VfsClient, config: ReadAheadConfig) -> FileReader {
        client.reader(&self.path, self.size, config)
    }
}

// ── SizeHint ─────────────────────────────────────────────────────

/// What is known about the number of entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeHint {
    #[default]
    Unknown,
    /// A lower bound; more entries may follow.
    AtLeast(usize),
    Exact(usize),
}

impl SizeHint {
    /// Fold in a page of `count` entries at index `page`.
    fn observe(&mut self, page: usize, page_size: usize, count: usize) {
        let start = page * page_size;
        if count == 0 && start > 0 {
            // Only an upper bound, unless everything before `start` is
            // already known to exist.
            *self = match *self {
                SizeHint::Exact(n) => SizeHint::Exact(n.min(start)),
                SizeHint::AtLeast(n) if n > start => SizeHint::Exact(start),
                other => other,
            };
            return;
        }
        if count < page_size {
            *self = SizeHint::Exact(start + count);
            return;
        }
        let lower = start + count + 1;
        *self = match *self {
            SizeHint::Exact(n) if n >= start + count => SizeHint::Exact(n),
            SizeHint::AtLeast(n) => SizeHint::AtLeast(n.max(lower)),
            _ => SizeHint::AtLeast(lower),
        };
    }

    pub fn exact(&self) -> Option<usize> {
        match self {
            SizeHint::Exact(n) => Some(*n),
            _ => None,
        }
    }

    /// The count as currently known, a lower bound unless exact.
    pub fn lower_bound(&self) -> usize {
        match self {
            SizeHint::Unknown => 0,
            SizeHint::AtLeast(n) | SizeHint::Exact(n) => *n,
        }
    }
}

// ── Page cache ───────────────────────────────────────────────────

/// One loaded page of entries.
pub type Page = Arc<[FileEntry]>;
type LoadOutcome = Option<Result<Page, ErrorCode>>;

enum Slot {
    Loading {
        load_id: u64,
        token: CancellationToken,
        done: watch::Receiver<LoadOutcome>,
    },
    Ready(Page),
}

struct CacheState {
    pages: LruCache<usize, Slot>,
    size: SizeHint,
}

enum Lookup {
    Ready(Page),
    Pending(watch::Receiver<LoadOutcome>),
}

struct DirectoryInner {
    client: VfsClient,
    path: String,
    config: DirectoryConfig,
    next_load: AtomicU64,
    state: Mutex<CacheState>,
}

/// Cloneable, lazily loaded listing of a remote directory.
#[derive(Clone)]
pub struct RemoteDirectory {
    inner: Arc<DirectoryInner>,
}

impl fmt::Debug for RemoteDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDirectory")
            .field("path", &self.inner.path)
            .field("size", &self.size())
            .finish()
    }
}

impl RemoteDirectory {
    pub fn new(client: VfsClient, path: impl Into<String>, config: DirectoryConfig) -> Self {
        let config = DirectoryConfig {
            page_size: config.page_size.max(1),
            capacity: config.capacity.max(1),
        };
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(DirectoryInner {
                client,
                path: path.into(),
                config,
                next_load: AtomicU64::new(1),
                state: Mutex::new(CacheState {
                    pages: LruCache::new(capacity),
                    size: SizeHint::Unknown,
                }),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn page_size(&self) -> usize {
        self.inner.config.page_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    pub fn size(&self) -> SizeHint {
        self.inner.state.locked().size
    }

    /// Resident and loading page indices, most recently touched first.
    pub fn cached_pages(&self) -> Vec<usize> {
        self.inner.state.locked().pages.iter().map(|(k, _)| *k).collect()
    }

    /// Indices of pages whose load is still in flight.
    pub fn loading_pages(&self) -> Vec<usize> {
        self.inner
            .state
            .locked()
            .pages
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Loading { .. }))
            .map(|(k, _)| *k)
            .collect()
    }

    /// The entry at `position`.
    pub async fn get(&self, position: i64) -> Result<FileEntry, PeerError> {
        let position = usize::try_from(position).map_err(|_| PeerError::OutOfRange)?;
        if self.size().exact().is_some_and(|n| position >= n) {
            return Err(PeerError::OutOfRange);
        }
        let page_size = self.page_size();
        let entries = self.load_page(position / page_size).await?;
        entries
            .get(position % page_size)
            .cloned()
            .ok_or(PeerError::OutOfRange)
    }

    /// The entries of page `page`, loading it if needed.
    ///
    /// Fails with [`PeerError::Cancelled`] when the load is evicted before
    /// it completes; calling again starts a fresh load.
    pub async fn load_page(&self, page: usize) -> Result<Page, PeerError> {
        let mut rx = match self.lookup(page) {
            Lookup::Ready(entries) => return Ok(entries),
            Lookup::Pending(rx) => rx,
        };
        let outcome = rx.wait_for(Option::is_some).await.map(|v| v.clone());
        match outcome {
            Ok(Some(Ok(entries))) => Ok(entries),
            Ok(Some(Err(code))) => Err(code.into()),
            Ok(None) | Err(_) => {
                trace!(page, "page load cancelled");
                Err(PeerError::Cancelled)
            }
        }
    }

    /// Drop every page and forget the size, cancelling in-flight loads.
    pub fn invalidate(&self) {
        let mut state = self.inner.state.locked();
        while let Some((_, slot)) = state.pages.pop_lru() {
            if let Slot::Loading { token, .. } = slot {
                token.cancel();
            }
        }
        state.size = SizeHint::Unknown;
    }

    /// Find `page` or start loading it. Touches the page either way.
    fn lookup(&self, page: usize) -> Lookup {
        let mut state = self.inner.state.locked();
        match state.pages.get(&page) {
            Some(Slot::Ready(entries)) => return Lookup::Ready(Arc::clone(entries)),
            Some(Slot::Loading { done, .. }) => return Lookup::Pending(done.clone()),
            None => {}
        }

        if state.pages.len() >= self.inner.config.capacity {
            evict(&mut state);
        }

        let load_id = self.inner.next_load.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(None);
        state.pages.put(
            page,
            Slot::Loading {
                load_id,
                token: token.clone(),
                done: rx.clone(),
            },
        );
        drop(state);

        trace!(path = %self.inner.path, page, "loading page");
        tokio::spawn(load(
            Arc::downgrade(&self.inner),
            page,
            load_id,
            token,
            tx,
        ));
        Lookup::Pending(rx)
    }
}

/// Make room for one page.
fn evict(state: &mut CacheState) {
    let resident = state
        .pages
        .iter()
        .rev()
        .find(|(_, slot)| matches!(slot, Slot::Ready(_)))
        .map(|(k, _)| *k);
    if let Some(page) = resident {
        state.pages.pop(&page);
        debug!(page, "evicted page");
        return;
    }
    if let Some((page, Slot::Loading { token, .. })) = state.pages.pop_lru() {
        token.cancel();
        debug!(page, "evicted loading page");
    }
}

async fn load(
    inner: Weak<DirectoryInner>,
    page: usize,
    load_id: u64,
    token: CancellationToken,
    tx: watch::Sender<LoadOutcome>,
) {
    let Some(dir) = inner.upgrade() else {
        return;
    };
    let client = dir.client.clone();
    let path = dir.path.clone();
    let page_size = dir.config.page_size;
    drop(dir);

    let offset = (page * page_size) as u64;
    let result = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        result = client.list(&path, offset, page_size as i64) => result,
    };

    let Some(dir) = inner.upgrade() else {
        return;
    };
    let mut state = dir.state.locked();
    let current = matches!(
        state.pages.peek(&page),
        Some(Slot::Loading { load_id: id, .. }) if *id == load_id
    );
    if !current || token.is_cancelled() {
        return;
    }

    match result {
        Ok(records) => {
            let count = records.len();
            state.size.observe(page, page_size, count);
            let entries: Page = records
                .into_iter()
                .map(|r| FileEntry::from_record(&path, r))
                .collect();
            if let Some(slot) = state.pages.peek_mut(&page) {
                *slot = Slot::Ready(Arc::clone(&entries));
            }
            let size = state.size;
            drop(state);
            debug!(%path, page, count, ?size, "page loaded");
            tx.send_replace(Some(Ok(entries)));
        }
        Err(e) => {
            state.pages.pop(&page);
            drop(state);
            debug!(%path, page, "page load failed: {e}");
            tx.send_replace(Some(Err(e.code())));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::channel::{Channel, ChannelObserver, Message};
    use crate::protocol::file::{FileCommand, FileOp, FileReply, ParsedCommand};
    use crate::vfs::VfsServer;
    use crate::vfs::backend::MemoryBackend;
    use crate::vfs::testing::{Wired, wire};

    fn config(page_size: usize, capacity: usize) -> DirectoryConfig {
        DirectoryConfig {
            page_size,
            capacity,
        }
    }

    async fn served(entries: usize) -> (VfsClient, Wired) {
        let backend = MemoryBackend::new();
        for i in 0..entries {
            backend.add_file(&format!("/big/f{i:03}"), vec![0u8; i]);
        }
        wire(Arc::new(VfsServer::new(backend.mount(false)))).await
    }

    #[test]
    fn size_hint_rules() {
        let mut hint = SizeHint::Unknown;
        hint.observe(0, 100, 100);
        assert_eq!(hint, SizeHint::AtLeast(101));
        hint.observe(1, 100, 100);
        assert_eq!(hint, SizeHint::AtLeast(201));
        hint.observe(0, 100, 100);
        assert_eq!(hint, SizeHint::AtLeast(201));
        hint.observe(2, 100, 50);
        assert_eq!(hint, SizeHint::Exact(250));
        hint.observe(1, 100, 100);
        assert_eq!(hint, SizeHint::Exact(250));
    }

    #[tokio::test]
    async fn pages_fix_the_size() {
        let (client, _guard) = served(250).await;
        let dir = client.directory("/big", config(100, 8));

        let first = dir.load_page(0).await.unwrap();
        assert_eq!(first.len(), 100);
        assert_eq!(first[0].path, "/big/f000");
        assert!(dir.size().lower_bound() >= 101);
        assert_eq!(dir.size().exact(), None);

        let last = dir.load_page(2).await.unwrap();
        assert_eq!(last.len(), 50);
        assert_eq!(dir.size(), SizeHint::Exact(250));

        assert_eq!(dir.get(249).await.unwrap().name, "f249");
        assert!(matches!(dir.get(250).await, Err(PeerError::OutOfRange)));
        assert!(matches!(dir.get(-1).await, Err(PeerError::OutOfRange)));
    }

    #[tokio::test]
    async fn past_the_end_of_an_unknown_size_is_out_of_range() {
        let (client, _guard) = served(200).await;
        let dir = client.directory("/big", config(100, 8));
        assert_eq!(dir.get(150).await.unwrap().size, 150);
        assert!(matches!(dir.get(200).await, Err(PeerError::OutOfRange)));
        assert_eq!(dir.size(), SizeHint::Exact(200));
    }

    #[test]
    fn empty_page_past_the_end_is_only_an_upper_bound() {
        let mut hint = SizeHint::Unknown;
        hint.observe(5, 100, 0);
        assert_eq!(hint, SizeHint::Unknown);

        hint.observe(0, 100, 100);
        hint.observe(5, 100, 0);
        assert_eq!(hint, SizeHint::AtLeast(101));

        hint.observe(1, 100, 100);
        hint.observe(2, 100, 0);
        assert_eq!(hint, SizeHint::Exact(200));

        let mut shrunk = SizeHint::Exact(250);
        shrunk.observe(2, 100, 0);
        assert_eq!(shrunk, SizeHint::Exact(200));

        let mut empty = SizeHint::Unknown;
        empty.observe(0, 100, 0);
        assert_eq!(empty, SizeHint::Exact(0));
    }

    #[tokio::test]
    async fn far_miss_does_not_fix_the_size() {
        let (client, _guard) = served(250).await;
        let dir = client.directory("/big", config(100, 8));

        dir.load_page(0).await.unwrap();
        assert!(matches!(dir.get(550).await, Err(PeerError::OutOfRange)));
        assert_eq!(dir.size(), SizeHint::AtLeast(101));
        assert!(matches!(dir.get(300).await, Err(PeerError::OutOfRange)));
        assert_eq!(dir.size().exact(), None);

        assert_eq!(dir.get(249).await.unwrap().name, "f249");
        assert_eq!(dir.size(), SizeHint::Exact(250));
    }

    #[tokio::test]
    async fn capacity_is_never_exceeded_and_hits_promote() {
        let (client, _guard) = served(50).await;
        let dir = client.directory("/big", config(10, 3));

        for page in 0..3 {
            dir.load_page(page).await.unwrap();
        }
        // Touch page 0 so page 1 becomes the eviction victim.
        dir.get(5).await.unwrap();
        dir.load_page(3).await.unwrap();

        let mut pages = dir.cached_pages();
        assert_eq!(pages.len(), 3);
        pages.sort();
        assert_eq!(pages, [0, 2, 3]);
    }

    #[tokio::test]
    async fn missing_directory_surfaces_the_remote_code() {
        let (client, _guard) = served(0).await;
        let dir = client.directory("/nope", config(10, 2));
        assert!(matches!(dir.load_page(0).await, Err(PeerError::NotFound)));
        assert!(dir.cached_pages().is_empty());
    }

    // ── Cancellation ─────────────────────────────────────────────

    /// Answers `files` only for the pages it is told to release.
    #[derive(Default)]
    struct Gate {
        channel: Mutex<Option<Channel>>,
        held: Mutex<Vec<(u32, u64)>>,
    }

    impl Gate {
        fn held_offsets(&self) -> Vec<u64> {
            self.held.locked().iter().map(|(_, off)| *off).collect()
        }

        fn release(&self, offset: u64, count: usize) {
            let rid = {
                let mut held = self.held.locked();
                let index = held.iter().position(|(_, off)| *off == offset).unwrap();
                held.remove(index).0
            };
            let records: Vec<_> = (0..count)
                .map(|i| json!({"type": "file", "name": format!("e{}", offset as usize + i), "size": 0, "updatedTime": 0}))
                .collect();
            let reply = FileReply::ok(rid, json!(records)).to_json().unwrap();
            self.channel
                .locked()
                .as_ref()
                .unwrap()
                .send_text(reply)
                .unwrap();
        }
    }

    #[async_trait]
    impl ChannelObserver for Gate {
        async fn on_open(&self, channel: Channel) {
            *self.channel.locked() = Some(channel);
        }

        async fn on_message(&self, message: Message) {
            let Message::Text(raw) = message else { return };
            if let Ok(ParsedCommand::Command(FileCommand {
                rid,
                op: FileOp::Files { offset, .. },
            })) = FileCommand::parse(&raw)
            {
                self.held.locked().push((rid, offset));
            }
        }

        async fn on_close(&self) {}
    }

    async fn until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn evicting_a_loading_page_cancels_it() {
        let gate = Arc::new(Gate::default());
        let (client, _guard) = wire(gate.clone()).await;
        let dir = client.directory("/", config(10, 1));

        let first = tokio::spawn({
            let dir = dir.clone();
            async move { dir.load_page(0).await }
        });
        until(|| gate.held_offsets() == [0]).await;

        // Capacity 1 with nothing resident: the loading page 0 is evicted.
        let second = tokio::spawn({
            let dir = dir.clone();
            async move { dir.load_page(1).await }
        });
        until(|| gate.held_offsets().contains(&10)).await;
        assert_eq!(dir.cached_pages(), [1]);
        assert!(matches!(first.await.unwrap(), Err(PeerError::Cancelled)));

        // The stale reply for page 0 must not land in the cache.
        gate.release(0, 10);
        gate.release(10, 3);
        let page1 = second.await.unwrap().unwrap();
        assert_eq!(page1.len(), 3);
        assert_eq!(page1[0].name, "e10");
        assert_eq!(dir.cached_pages(), [1]);
        assert_eq!(dir.size(), SizeHint::Exact(13));

        // Asking again loads page 0 afresh, evicting resident page 1.
        let again = tokio::spawn({
            let dir = dir.clone();
            async move { dir.load_page(0).await }
        });
        until(|| gate.held_offsets() == [0]).await;
        gate.release(0, 10);
        assert_eq!(again.await.unwrap().unwrap()[0].name, "e0");
        assert_eq!(dir.cached_pages(), [0]);
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_load() {
        let gate = Arc::new(Gate::default());
        let (client, _guard) = wire(gate.clone()).await;
        let dir = client.directory("/", config(10, 4));

        let a = tokio::spawn({
            let dir = dir.clone();
            async move { dir.get(3).await }
        });
        let b = tokio::spawn({
            let dir = dir.clone();
            async move { dir.get(7).await }
        });
        until(|| !gate.held_offsets().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.held_offsets(), [0]);
        assert_eq!(dir.loading_pages(), [0]);

        gate.release(0, 10);
        assert_eq!(a.await.unwrap().unwrap().name, "e3");
        assert_eq!(b.await.unwrap().unwrap().name, "e7");
    }

    #[tokio::test]
    async fn invalidate_forgets_everything() {
        let (client, _guard) = served(30).await;
        let dir = client.directory("/big", config(10, 4));
        dir.load_page(0).await.unwrap();
        dir.invalidate();
        assert!(dir.cached_pages().is_empty());
        assert_eq!(dir.size(), SizeHint::Unknown);
    }
}
