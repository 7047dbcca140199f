//! The transport seam.
//!
//! Session setup (signalling, NAT traversal, media negotiation) lives
//! behind [`Transport`]. Whatever implements it turns a room id plus a
//! signalling key into a [`TransportLink`] and reports progress through
//! [`TransportEvent`]s. Two implementations ship with the crate:
//!
//! - [`memory`]: in-process rendezvous hub for tests and demos.
//! - [`tcp`]: one TCP socket multiplexing named sub-channels.

pub mod memory;
pub mod tcp;

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::channel::{Channel, Message};
use crate::error::PeerError;

pub use memory::{MemoryHub, MemoryTransport};
pub use tcp::{TcpMode, TcpTransport};

/// Link protocol version announced by transports that handshake.
pub const LINK_VERSION: u32 = 1;

// ── TransportEvent ───────────────────────────────────────────────

/// Progress notifications from a transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Signalling finished; sub-channels may now be opened.
    Open,
    /// The media/data path is fully up.
    Connect,
    /// The session is gone.
    Disconnect(String),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

// ── Media ────────────────────────────────────────────────────────

/// Media direction requested for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaDirection {
    /// No media, data channels only.
    #[default]
    None,
    /// One-way: this side publishes its media source.
    Publish,
    /// One-way: this side only receives.
    Receive,
}

/// A captured stream handed to the transport (screen, camera, audio).
///
/// Capture itself is external; the session only needs to be able to
/// release what it exclusively owns.
pub trait MediaSource: Send + Sync {
    /// Human readable description for logs.
    fn label(&self) -> &str;

    /// Stop capture and free the underlying resources.
    fn release(&self);
}

// ── SessionParams ────────────────────────────────────────────────

/// Everything a transport needs to set up one peer session.
#[derive(Clone, Default)]
pub struct SessionParams {
    pub room_id: String,
    pub signaling_key: Option<String>,
    pub direction: MediaDirection,
    pub media: Option<Arc<dyn MediaSource>>,
}

impl SessionParams {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            ..Default::default()
        }
    }

    pub fn with_signaling_key(mut self, key: impl Into<String>) -> Self {
        self.signaling_key = Some(key.into());
        self
    }

    pub fn with_media(mut self, direction: MediaDirection, media: Option<Arc<dyn MediaSource>>) -> Self {
        self.direction = direction;
        self.media = media;
        self
    }
}

impl fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field("room_id", &self.room_id)
            .field("signaling_key", &self.signaling_key.as_ref().map(|_| "<redacted>"))
            .field("direction", &self.direction)
            .field("media", &self.media.as_ref().map(|m| m.label().to_string()))
            .finish()
    }
}

// ── Traits ───────────────────────────────────────────────────────

/// Factory for transport sessions.
pub trait Transport: Send + Sync {
    /// Begin session setup. Returns immediately; progress arrives on
    /// `events`. The link is unusable until [`TransportEvent::Open`].
    fn start(
        &self,
        params: SessionParams,
        events: TransportEventSender,
    ) -> Result<Box<dyn TransportLink>, PeerError>;
}

/// A live (or pending) transport session.
pub trait TransportLink: Send + Sync {
    /// Open the named sub-channel. Incoming messages for it arrive on the
    /// returned receiver, in order.
    fn open_channel(
        &self,
        name: &str,
    ) -> Result<(Channel, mpsc::UnboundedReceiver<Message>), PeerError>;

    /// Tear the session down. Must not emit further events.
    fn close(&self);
}
