//! Request/response correlation over one sub-channel.
//!
//! Every outgoing request gets the next id from a per-router counter.
//! The pending table maps that id to a oneshot completion; each entry is
//! removed exactly once, by the matching reply, by its timeout, or by
//! [`RequestRouter::reset`] when the channel goes away.
//!
//! Bulk replies may skip JSON and arrive as a binary frame:
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────┐
//! │ reserved (4) │ rid u32 LE   │ payload ...         │
//! └──────────────┴──────────────┴─────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::channel::{Channel, Message};
use crate::error::{ErrorCode, PeerError};
use crate::sync::MutexExt;

/// Size of the binary reply prefix.
pub const BINARY_REPLY_HEADER: usize = 8;

// ── Reply ────────────────────────────────────────────────────────

/// A successful reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(serde_json::Value),
    Binary(Bytes),
}

impl Reply {
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, PeerError> {
        match self {
            Reply::Value(value) => Ok(serde_json::from_value(value)?),
            Reply::Binary(_) => Err(PeerError::Encoding("expected a JSON reply".into())),
        }
    }

    pub fn into_bytes(self) -> Result<Bytes, PeerError> {
        match self {
            Reply::Binary(bytes) => Ok(bytes),
            Reply::Value(_) => Err(PeerError::Encoding("expected a binary reply".into())),
        }
    }
}

/// Build a binary reply frame. The reserved bytes are written as zero.
pub fn encode_binary_reply(rid: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(BINARY_REPLY_HEADER + payload.len());
    buf.put_u32_le(0);
    buf.put_u32_le(rid);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a binary reply frame into `(rid, payload)`. The reserved bytes
/// are ignored.
pub fn decode_binary_reply(frame: &Bytes) -> Option<(u32, Bytes)> {
    if frame.len() < BINARY_REPLY_HEADER {
        return None;
    }
    let rid = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
    Some((rid, frame.slice(BINARY_REPLY_HEADER..)))
}

// ── RequestRouter ────────────────────────────────────────────────

type Completion = oneshot::Sender<Result<Reply, PeerError>>;

#[derive(Default)]
struct Table {
    channel: Option<Channel>,
    pending: HashMap<u32, Completion>,
}

struct RouterInner {
    next_id: AtomicU32,
    table: Mutex<Table>,
}

/// Cloneable request/response correlator.
#[derive(Clone)]
pub struct RequestRouter {
    inner: Arc<RouterInner>,
}

impl Default for RequestRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRouter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                next_id: AtomicU32::new(1),
                table: Mutex::new(Table::default()),
            }),
        }
    }

    /// Route requests through `channel` from now on.
    pub fn bind(&self, channel: Channel) {
        self.inner.table.locked().channel = Some(channel);
    }

    /// Forget the channel and fail everything in flight with `Reset`.
    pub fn unbind(&self) {
        self.inner.table.locked().channel = None;
        self.reset();
    }

    pub fn is_bound(&self) -> bool {
        self.inner
            .table
            .locked()
            .channel
            .as_ref()
            .is_some_and(Channel::is_open)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.table.locked().pending.len()
    }

    /// Send a request and wait for its reply.
    ///
    /// `build` receives the assigned request id and returns the message
    /// to put on the wire. With `timeout` set, an unanswered request is
    /// removed and fails with [`PeerError::Timeout`].
    pub async fn send<F>(&self, build: F, timeout: Option<Duration>) -> Result<Reply, PeerError>
    where
        F: FnOnce(u32) -> Result<Message, PeerError>,
    {
        let (rid, rx) = {
            let mut table = self.inner.table.locked();
            let channel = table.channel.clone().ok_or(PeerError::NotConnected)?;
            let rid = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let message = build(rid)?;

            let (tx, rx) = oneshot::channel();
            table.pending.insert(rid, tx);
            if let Err(e) = channel.send(message) {
                table.pending.remove(&rid);
                return Err(e);
            }
            (rid, rx)
        };
        trace!(rid, "request sent");

        // Dropping the caller's future must not leak the table entry.
        let _guard = PendingGuard {
            inner: &self.inner,
            rid,
        };

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(rid, "request timed out after {limit:?}");
                    return Err(PeerError::Timeout(limit));
                }
            },
            None => rx.await,
        };
        outcome.map_err(|_| PeerError::Reset)?
    }

    /// Complete request `rid`. Returns `false` for unknown ids (late or
    /// duplicate replies), which are dropped.
    pub fn resolve(&self, rid: u32, outcome: Result<Reply, ErrorCode>) -> bool {
        let Some(tx) = self.inner.table.locked().pending.remove(&rid) else {
            debug!(rid, "dropping reply for unknown request");
            return false;
        };
        let _ = tx.send(outcome.map_err(PeerError::from));
        true
    }

    /// Complete a request from a binary reply frame.
    pub fn resolve_binary(&self, frame: &Bytes) -> bool {
        match decode_binary_reply(frame) {
            Some((rid, payload)) => self.resolve(rid, Ok(Reply::Binary(payload))),
            None => {
                debug!(len = frame.len(), "binary reply shorter than its header");
                false
            }
        }
    }

    /// Fail every pending request with `Reset`.
    pub fn reset(&self) {
        let drained: Vec<Completion> = {
            let mut table = self.inner.table.locked();
            table.pending.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "resetting pending requests");
        }
        for tx in drained {
            let _ = tx.send(Err(PeerError::Reset));
        }
    }
}

struct PendingGuard<'a> {
    inner: &'a RouterInner,
    rid: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.table.locked().pending.remove(&self.rid);
    }
}

// ── Tests ────────────────────────────────────────────────────────
