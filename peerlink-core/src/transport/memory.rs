//! In-process transport.
//!
//! Every [`MemoryTransport`] created from the same [`MemoryHub`] meets
//! its peer by room id and signalling key. Two joiners with matching
//! credentials are paired immediately and both receive `Open` followed
//! by `Connect`. Closing one side delivers `Disconnect` to the other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{Channel, ChannelSink, Message};
use crate::error::PeerError;
use crate::sync::MutexExt;
use crate::transport::{SessionParams, Transport, TransportEvent, TransportEventSender, TransportLink};

// ── MemoryHub ────────────────────────────────────────────────────

/// Rendezvous point shared by in-process peers.
#[derive(Default)]
pub struct MemoryHub {
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    waiting: HashMap<String, Vec<Arc<Endpoint>>>,
    paired: HashMap<String, Vec<Weak<Endpoint>>>,
    joins: HashMap<String, usize>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport bound to this hub.
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            hub: Arc::clone(self),
        }
    }

    /// How many sessions have been started for `room_id` so far.
    pub fn joins(&self, room_id: &str) -> usize {
        self.state.locked().joins.get(room_id).copied().unwrap_or(0)
    }

    /// Number of peers currently waiting for a partner in `room_id`.
    pub fn waiting(&self, room_id: &str) -> usize {
        self.state
            .locked()
            .waiting
            .get(room_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Kill every paired session in `room_id`, as if the network dropped.
    pub fn sever(&self, room_id: &str) {
        let endpoints: Vec<Arc<Endpoint>> = {
            let mut state = self.state.locked();
            state
                .paired
                .remove(room_id)
                .unwrap_or_default()
                .iter()
                .filter_map(Weak::upgrade)
                .collect()
        };
        for endpoint in endpoints {
            endpoint.drop_link("link severed");
        }
    }

    fn join(&self, params: &SessionParams, events: TransportEventSender) -> Arc<Endpoint> {
        let endpoint = Arc::new(Endpoint {
            room_id: params.room_id.clone(),
            key: params.signaling_key.clone(),
            events,
            state: Mutex::new(EndpointState::default()),
        });

        let mut state = self.state.locked();
        *state.joins.entry(params.room_id.clone()).or_default() += 1;

        let waiting = state.waiting.entry(params.room_id.clone()).or_default();
        let partner = waiting
            .iter()
            .position(|w| w.key == endpoint.key)
            .map(|idx| waiting.remove(idx));

        match partner {
            Some(partner) => {
                Endpoint::pair(&partner, &endpoint);
                state
                    .paired
                    .entry(params.room_id.clone())
                    .or_default()
                    .extend([Arc::downgrade(&partner), Arc::downgrade(&endpoint)]);
                debug!(room = %params.room_id, "memory transport paired");
                partner.announce();
                endpoint.announce();
            }
            None => waiting.push(Arc::clone(&endpoint)),
        }
        endpoint
    }

    fn leave(&self, endpoint: &Arc<Endpoint>) {
        let mut state = self.state.locked();
        if let Some(waiting) = state.waiting.get_mut(&endpoint.room_id) {
            waiting.retain(|w| !Arc::ptr_eq(w, endpoint));
        }
        if let Some(paired) = state.paired.get_mut(&endpoint.room_id) {
            paired.retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), Arc::as_ptr(endpoint)));
        }
    }
}

// ── MemoryTransport ──────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
}

impl MemoryTransport {
    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

impl Transport for MemoryTransport {
    fn start(
        &self,
        params: SessionParams,
        events: TransportEventSender,
    ) -> Result<Box<dyn TransportLink>, PeerError> {
        let endpoint = self.hub.join(&params, events);
        Ok(Box::new(MemoryLink {
            hub: Arc::downgrade(&self.hub),
            endpoint,
        }))
    }
}

// ── Endpoint ─────────────────────────────────────────────────────

struct Endpoint {
    room_id: String,
    key: Option<String>,
    events: TransportEventSender,
    state: Mutex<EndpointState>,
}

#[derive(Default)]
struct EndpointState {
    peer: Option<Weak<Endpoint>>,
    closed: bool,
    inbox: HashMap<String, mpsc::UnboundedSender<Message>>,
    backlog: HashMap<String, Vec<Message>>,
}

impl Endpoint {
    fn pair(a: &Arc<Endpoint>, b: &Arc<Endpoint>) {
        a.state.locked().peer = Some(Arc::downgrade(b));
        b.state.locked().peer = Some(Arc::downgrade(a));
    }

    fn announce(&self) {
        let _ = self.events.send(TransportEvent::Open);
        let _ = self.events.send(TransportEvent::Connect);
    }

    fn peer(&self) -> Option<Arc<Endpoint>> {
        let state = self.state.locked();
        if state.closed {
            return None;
        }
        state.peer.as_ref().and_then(Weak::upgrade)
    }

    fn is_linked(&self) -> bool {
        self.peer().is_some()
    }

    /// Deliver a message sent by the peer on `name`.
    fn deliver(&self, name: &str, message: Message) -> Result<(), PeerError> {
        let mut state = self.state.locked();
        if state.closed {
            return Err(PeerError::NotConnected);
        }
        match state.inbox.get(name) {
            Some(tx) => tx.send(message).map_err(|_| PeerError::ChannelClosed),
            None => {
                state.backlog.entry(name.to_string()).or_default().push(message);
                Ok(())
            }
        }
    }

    fn open_channel(&self, name: &str) -> Result<mpsc::UnboundedReceiver<Message>, PeerError> {
        let mut state = self.state.locked();
        if state.closed || state.peer.is_none() {
            return Err(PeerError::NotConnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for message in state.backlog.remove(name).unwrap_or_default() {
            let _ = tx.send(message);
        }
        state.inbox.insert(name.to_string(), tx);
        Ok(rx)
    }

    /// Local teardown; no event for this side.
    fn close(&self) -> Option<Arc<Endpoint>> {
        let mut state = self.state.locked();
        if state.closed {
            return None;
        }
        state.closed = true;
        state.inbox.clear();
        state.backlog.clear();
        state.peer.take().and_then(|p| p.upgrade())
    }

    /// The link died underneath this endpoint.
    fn drop_link(&self, reason: &str) {
        let was_open = {
            let mut state = self.state.locked();
            if state.closed {
                false
            } else {
                state.closed = true;
                state.inbox.clear();
                state.backlog.clear();
                state.peer = None;
                true
            }
        };
        if was_open {
            let _ = self.events.send(TransportEvent::Disconnect(reason.to_string()));
        }
    }
}

// ── MemoryLink ───────────────────────────────────────────────────

struct MemoryLink {
    hub: Weak<MemoryHub>,
    endpoint: Arc<Endpoint>,
}

impl TransportLink for MemoryLink {
    fn open_channel(
        &self,
        name: &str,
    ) -> Result<(Channel, mpsc::UnboundedReceiver<Message>), PeerError> {
        let rx = self.endpoint.open_channel(name)?;
        let sink = MemorySink {
            name: name.to_string(),
            endpoint: Arc::clone(&self.endpoint),
        };
        Ok((Channel::new(name, Arc::new(sink)), rx))
    }

    fn close(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.leave(&self.endpoint);
        }
        if let Some(peer) = self.endpoint.close() {
            peer.drop_link("peer closed");
        }
    }
}

struct MemorySink {
    name: String,
    endpoint: Arc<Endpoint>,
}

impl ChannelSink for MemorySink {
    fn send(&self, message: Message) -> Result<(), PeerError> {
        let peer = self.endpoint.peer().ok_or(PeerError::NotConnected)?;
        peer.deliver(&self.name, message)
    }

    fn is_open(&self) -> bool {
        self.endpoint.is_linked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        rx.recv().await.expect("event stream ended")
    }

    #[tokio::test]
    async fn peers_in_same_room_pair() {
        let hub = MemoryHub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let a = hub.transport().start(SessionParams::new("room:1"), tx_a).unwrap();
        assert_eq!(hub.waiting("room:1"), 1);
        let b = hub.transport().start(SessionParams::new("room:1"), tx_b).unwrap();
        assert_eq!(hub.waiting("room:1"), 0);

        assert_eq!(next_event(&mut rx_a).await, TransportEvent::Open);
        assert_eq!(next_event(&mut rx_a).await, TransportEvent::Connect);
        assert_eq!(next_event(&mut rx_b).await, TransportEvent::Open);

        let (chan_a, _rx) = a.open_channel("files").unwrap();
        chan_a.send_text("early").unwrap();

        // b opens after a already sent: message was buffered.
        let (_chan_b, mut inbox_b) = b.open_channel("files").unwrap();
        assert_eq!(inbox_b.recv().await.unwrap(), Message::Text("early".into()));
    }

    #[tokio::test]
    async fn key_mismatch_does_not_pair() {
        let hub = MemoryHub::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let _a = hub
            .transport()
            .start(SessionParams::new("room:1").with_signaling_key("one"), tx_a)
            .unwrap();
        let _b = hub
            .transport()
            .start(SessionParams::new("room:1").with_signaling_key("two"), tx_b)
            .unwrap();
        assert_eq!(hub.waiting("room:1"), 2);
    }

    #[tokio::test]
    async fn closing_one_side_disconnects_the_other() {
        let hub = MemoryHub::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = hub.transport().start(SessionParams::new("r"), tx_a).unwrap();
        let _b = hub.transport().start(SessionParams::new("r"), tx_b).unwrap();

        assert_eq!(next_event(&mut rx_b).await, TransportEvent::Open);
        assert_eq!(next_event(&mut rx_b).await, TransportEvent::Connect);

        a.close();
        assert!(matches!(
            next_event(&mut rx_b).await,
            TransportEvent::Disconnect(_)
        ));
        assert_eq!(hub.joins("r"), 2);
    }

    #[tokio::test]
    async fn sever_drops_both_sides() {
        let hub = MemoryHub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = hub.transport().start(SessionParams::new("r"), tx_a).unwrap();
        let _b = hub.transport().start(SessionParams::new("r"), tx_b).unwrap();
        let (chan, _inbox) = a.open_channel("control").unwrap();

        hub.sever("r");
        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(next_event(rx).await, TransportEvent::Open);
            assert_eq!(next_event(rx).await, TransportEvent::Connect);
            assert!(matches!(next_event(rx).await, TransportEvent::Disconnect(_)));
        }
        assert!(!chan.is_open());
    }
}
