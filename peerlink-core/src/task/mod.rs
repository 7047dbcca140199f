//! Per-request task tracking with cancellation.
//!
//! Every request a server answers runs as its own task, keyed by the
//! request id. Closing the channel cancels whatever is still running.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::sync::MutexExt;

struct Entry {
    serial: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct PoolInner {
    next_serial: AtomicU64,
    tasks: Mutex<HashMap<u32, Entry>>,
}

/// Tracks spawned request tasks by request id.
#[derive(Clone, Default)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the future produced by `f` under request id `rid`.
    ///
    /// `f` receives the task's cancellation token so long-running work can
    /// stop early. A cancelled task is dropped at its next suspension
    /// point either way. A second spawn with a live `rid` cancels the
    /// first.
    pub fn spawn<F, Fut>(&self, rid: u32, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let previous = self.inner.tasks.locked().insert(
            rid,
            Entry {
                serial,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(rid, "request id reused while in flight; cancelling the older task");
            previous.token.cancel();
        }

        let fut = f(token.clone());
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => trace!(rid, "task cancelled"),
                _ = fut => trace!(rid, "task finished"),
            }
            let mut tasks = inner.tasks.locked();
            if tasks.get(&rid).is_some_and(|e| e.serial == serial) {
                tasks.remove(&rid);
            }
        });
    }

    /// Cancel the task running under `rid`. Returns `false` if none is.
    pub fn cancel(&self, rid: u32) -> bool {
        match self.inner.tasks.locked().remove(&rid) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running task.
    pub fn cancel_all(&self) {
        let drained: Vec<Entry> = self.inner.tasks.locked().drain().map(|(_, e)| e).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "cancelling running tasks");
        }
        for entry in drained {
            entry.token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
