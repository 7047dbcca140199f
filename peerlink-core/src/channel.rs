//! Sub-channel handles and the observer interface consumers implement.
//!
//! A [`Channel`] is the sending half of one named, ordered sub-channel
//! multiplexed over a transport link. Incoming traffic is delivered to a
//! [`ChannelObserver`] by the owning state machine.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::PeerError;

// ── Message ──────────────────────────────────────────────────────

/// One message on a sub-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text, used for JSON control traffic.
    Text(String),
    /// Opaque binary payload.
    Binary(Bytes),
}

impl Message {
    pub fn len(&self) -> usize {
        match self {
            Message::Text(s) => s.len(),
            Message::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(s)
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Binary(b)
    }
}

// ── ChannelSink ──────────────────────────────────────────────────

/// Transport-specific writer behind a [`Channel`].
pub trait ChannelSink: Send + Sync {
    /// Queue a message for delivery. Messages on one sink are delivered
    /// in send order.
    fn send(&self, message: Message) -> Result<(), PeerError>;

    /// Whether the underlying link still accepts messages.
    fn is_open(&self) -> bool;
}

// ── Channel ──────────────────────────────────────────────────────

/// Cloneable sending handle for a named sub-channel.
#[derive(Clone)]
pub struct Channel {
    name: Arc<str>,
    sink: Arc<dyn ChannelSink>,
}

impl Channel {
    pub fn new(name: impl Into<Arc<str>>, sink: Arc<dyn ChannelSink>) -> Self {
        Self {
            name: name.into(),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_open()
    }

    /// Send a message; fails with [`PeerError::NotConnected`] once the
    /// link is gone.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), PeerError> {
        if !self.sink.is_open() {
            return Err(PeerError::NotConnected);
        }
        self.sink.send(message.into())
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), PeerError> {
        self.send(Message::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), PeerError> {
        self.send(Message::Binary(data.into()))
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

// ── ChannelObserver ──────────────────────────────────────────────

/// Consumer of one named sub-channel.
///
/// The state machine calls `on_open` once the sub-channel is bound,
/// `on_message` for every incoming message in order, and `on_close`
/// exactly once when the binding is torn down.
#[async_trait]
pub trait ChannelObserver: Send + Sync {
    async fn on_open(&self, channel: Channel);

    async fn on_message(&self, message: Message);

    async fn on_close(&self);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        open: AtomicBool,
        sent: Mutex<Vec<Message>>,
    }

    impl ChannelSink for RecordingSink {
        fn send(&self, message: Message) -> Result<(), PeerError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn send_goes_through_open_sink() {
        let sink = Arc::new(RecordingSink::default());
        sink.open.store(true, Ordering::SeqCst);
        let channel = Channel::new("files", sink.clone());

        channel.send_text("hello").unwrap();
        channel.send_binary(vec![1u8, 2, 3]).unwrap();

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], Message::Text("hello".into()));
        assert_eq!(sent[1].len(), 3);
    }

    #[test]
    fn closed_sink_reports_not_connected() {
        let sink = Arc::new(RecordingSink::default());
        let channel = Channel::new("files", sink);
        assert!(matches!(
            channel.send_text("x"),
            Err(PeerError::NotConnected)
        ));
    }
}
