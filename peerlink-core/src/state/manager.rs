//! Named stream sessions for one paired device.
//!
//! Each stream gets the lowest free positive id and its own room,
//! `<base>.<id>`, so streams of one device never share a transport
//! session.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::ChannelObserver;
use crate::config::ManagerConfig;
use crate::state::connection::ConnectionState;
use crate::state::machine::ConnectionStateMachine;
use crate::sync::MutexExt;
use crate::transport::{MediaDirection, MediaSource, SessionParams, Transport};

/// Sub-channel the per-stream message handler is bound to.
pub const CONTROL_CHANNEL: &str = "control";

/// One entry of a [`ConnectionManager`].
#[derive(Debug)]
pub struct StreamSession {
    pub id: u32,
    pub name: String,
    pub permanent: bool,
    pub machine: ConnectionStateMachine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    Added { id: u32, name: String },
    Removed { id: u32 },
}

/// Everything `add_stream_with` needs.
pub struct StreamOptions {
    pub name: String,
    pub media: Option<Arc<dyn MediaSource>>,
    pub auto_connect: bool,
    pub permanent: bool,
    /// Sub-channels in registration order.
    pub channels: Vec<(String, Arc<dyn ChannelObserver>)>,
}

impl StreamOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            media: None,
            auto_connect: true,
            permanent: false,
            channels: Vec::new(),
        }
    }

    pub fn media(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn permanent(mut self, permanent: bool) -> Self {
        self.permanent = permanent;
        self
    }

    pub fn channel(mut self, name: impl Into<String>, observer: Arc<dyn ChannelObserver>) -> Self {
        self.channels.push((name.into(), observer));
        self
    }
}

// ── ConnectionManager ────────────────────────────────────────────

struct ManagerInner {
    transport: Arc<dyn Transport>,
    base_room: String,
    signaling_key: Option<String>,
    config: ManagerConfig,
    sessions: Mutex<BTreeMap<u32, Arc<StreamSession>>>,
    events: broadcast::Sender<ManagerEvent>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_room: impl Into<String>,
        signaling_key: Option<String>,
        config: ManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                base_room: base_room.into(),
                signaling_key,
                config,
                sessions: Mutex::new(BTreeMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    pub fn base_room(&self) -> &str {
        &self.inner.base_room
    }

    /// Add a publishing stream whose control channel feeds `handler`.
    pub fn add_stream(
        &self,
        media: Option<Arc<dyn MediaSource>>,
        handler: Arc<dyn ChannelObserver>,
        name: impl Into<String>,
        auto_connect: bool,
        permanent: bool,
    ) -> Arc<StreamSession> {
        let mut options = StreamOptions::new(name)
            .auto_connect(auto_connect)
            .permanent(permanent)
            .channel(CONTROL_CHANNEL, handler);
        options.media = media;
        self.add_stream_with(options)
    }

    pub fn add_stream_with(&self, options: StreamOptions) -> Arc<StreamSession> {
        let StreamOptions {
            name,
            media,
            auto_connect,
            permanent,
            channels,
        } = options;

        // Allocation and registration happen under one lock.
        let session = {
            let mut sessions = self.inner.sessions.locked();
            let id = lowest_free_id(&sessions);

            let mut params = SessionParams::new(format!("{}.{id}", self.inner.base_room))
                .with_media(MediaDirection::Publish, media);
            params.signaling_key = self.inner.signaling_key.clone();

            let machine = ConnectionStateMachine::new(
                Arc::clone(&self.inner.transport),
                params,
                self.inner.config.machine(permanent),
            );
            for (channel, observer) in channels {
                machine.register(channel, observer);
            }

            let session = Arc::new(StreamSession {
                id,
                name,
                permanent,
                machine,
            });
            sessions.insert(id, Arc::clone(&session));
            session
        };

        info!(id = session.id, name = %session.name, permanent, "stream added");
        let _ = self.inner.events.send(ManagerEvent::Added {
            id: session.id,
            name: session.name.clone(),
        });

        if !permanent {
            self.watch_transient(&session);
        }
        if auto_connect {
            if let Err(e) = session.machine.connect() {
                warn!(id = session.id, "initial connect failed: {e}");
            }
        }
        session
    }

    /// Dispose and forget stream `id`. Unknown ids are ignored.
    pub fn remove_stream(&self, id: u32) -> Option<Arc<StreamSession>> {
        let removed = self.inner.sessions.locked().remove(&id)?;
        removed.machine.dispose();
        info!(id, "stream removed");
        let _ = self.inner.events.send(ManagerEvent::Removed { id });
        Some(removed)
    }

    pub fn get(&self, id: u32) -> Option<Arc<StreamSession>> {
        self.inner.sessions.locked().get(&id).cloned()
    }

    /// Sessions ordered by id.
    pub fn sessions(&self) -> Vec<Arc<StreamSession>> {
        self.inner.sessions.locked().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispose(&self) {
        let drained = std::mem::take(&mut *self.inner.sessions.locked());
        for (id, session) in drained {
            session.machine.dispose();
            let _ = self.inner.events.send(ManagerEvent::Removed { id });
        }
    }

    /// Transient sessions remove themselves on their first disconnect.
    fn watch_transient(&self, session: &Arc<StreamSession>) {
        let mut rx = session.machine.subscribe();
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let session = Arc::downgrade(session);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                if !matches!(state, ConnectionState::Disconnected | ConnectionState::Disposed) {
                    continue;
                }
                let (Some(inner), Some(session)) = (weak.upgrade(), session.upgrade()) else {
                    return;
                };
                let manager = ConnectionManager { inner };
                let current = manager.get(session.id);
                if current.is_some_and(|c| Arc::ptr_eq(&c, &session)) {
                    debug!(id = session.id, "transient stream ended");
                    manager.remove_stream(session.id);
                }
                return;
            }
        });
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let sessions = self.sessions.get_mut().unwrap_or_else(PoisonError::into_inner);
        for session in sessions.values() {
            session.machine.dispose();
        }
    }
}

fn lowest_free_id(sessions: &BTreeMap<u32, Arc<StreamSession>>) -> u32 {
    let mut candidate = 1;
    for &id in sessions.keys() {
        if id != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::channel::{Channel, Message};
    use crate::transport::MemoryHub;

    struct Silent;

    #[async_trait]
    impl ChannelObserver for Silent {
        async fn on_open(&self, _channel: Channel) {}
        async fn on_message(&self, _message: Message) {}
        async fn on_close(&self) {}
    }

    fn manager(hub: &Arc<MemoryHub>) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(hub.transport()),
            "room:base",
            Some("key".into()),
            ManagerConfig::default(),
        )
    }

    #[tokio::test]
    async fn ids_are_lowest_free() {
        let hub = MemoryHub::new();
        let mgr = manager(&hub);
        let mut events = mgr.subscribe();

        let first = mgr.add_stream(None, Arc::new(Silent), "cam", true, false);
        let second = mgr.add_stream(None, Arc::new(Silent), "cam", true, false);
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.machine.room_id(), "room:base.1");

        mgr.remove_stream(1);
        let third = mgr.add_stream(None, Arc::new(Silent), "cam", true, false);
        assert_eq!(third.id, 1);

        assert_eq!(
            events.recv().await.unwrap(),
            ManagerEvent::Added { id: 1, name: "cam".into() }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ManagerEvent::Added { id: 2, name: "cam".into() }
        );
        assert_eq!(events.recv().await.unwrap(), ManagerEvent::Removed { id: 1 });
    }

    #[tokio::test]
    async fn remove_unknown_is_noop() {
        let hub = MemoryHub::new();
        let mgr = manager(&hub);
        assert!(mgr.remove_stream(7).is_none());
    }

    #[tokio::test]
    async fn removal_disposes_machine() {
        let hub = MemoryHub::new();
        let mgr = manager(&hub);
        let s = mgr.add_stream(None, Arc::new(Silent), "screen", false, true);
        assert_eq!(s.machine.state(), ConnectionState::Disconnected);
        mgr.remove_stream(s.id);
        assert_eq!(s.machine.state(), ConnectionState::Disposed);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_stream_removes_itself_on_timeout() {
        let hub = MemoryHub::new();
        let mgr = manager(&hub);
        let s = mgr.add_stream(None, Arc::new(Silent), "cam", true, false);
        assert_eq!(mgr.len(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(mgr.is_empty());
        assert_eq!(s.machine.state(), ConnectionState::Disposed);
    }

    #[tokio::test]
    async fn dispose_clears_all() {
        let hub = MemoryHub::new();
        let mgr = manager(&hub);
        let a = mgr.add_stream(None, Arc::new(Silent), "a", true, true);
        let b = mgr.add_stream(None, Arc::new(Silent), "b", true, true);
        mgr.dispose();
        assert!(mgr.is_empty());
        assert!(a.machine.state().is_disposed());
        assert!(b.machine.state().is_disposed());
    }
}
