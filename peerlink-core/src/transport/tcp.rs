//! TCP transport: one socket, many named sub-channels.
//!
//! ```text
//! dialer                                   listener
//!   ──[Hello{room, key digest}]──────────────►
//!   ◄──────────────[Hello{room, key digest}]──   (mismatch ⇒ Goodbye)
//!   ──[ChannelOpen{id, "control"}]───────────►
//!   ──[Data{id}]─────────────────────────────►
//!   ◄───────────────────────────[Heartbeat]──   every 5 s
//! ```
//!
//! Each side numbers its own sub-channels; a `ChannelOpen` frame tells
//! the receiver which name a sender-local id refers to. Data for a name
//! the receiver has not opened yet is held until it does.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelSink, Message};
use crate::codec::FrameCodec;
use crate::error::PeerError;
use crate::message::FrameKind;
use crate::packet::{LinkHello, Packet};
use crate::sync::MutexExt;
use crate::transport::{
    LINK_VERSION, SessionParams, Transport, TransportEvent, TransportEventSender, TransportLink,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(20);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_RETRY: Duration = Duration::from_secs(1);

type FramedStream = Framed<TcpStream, FrameCodec>;

/// Which end of the socket this side plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpMode {
    /// Bind and accept the first peer whose hello matches.
    Listen(SocketAddr),
    /// Connect, retrying until the link is closed.
    Dial(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct TcpTransport {
    mode: TcpMode,
    heartbeat: Duration,
    idle_timeout: Duration,
}

impl TcpTransport {
    pub fn new(mode: TcpMode) -> Self {
        Self {
            mode,
            heartbeat: HEARTBEAT_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    pub fn listen(addr: SocketAddr) -> Self {
        Self::new(TcpMode::Listen(addr))
    }

    pub fn dial(addr: SocketAddr) -> Self {
        Self::new(TcpMode::Dial(addr))
    }

    /// Override heartbeat cadence and idle timeout.
    pub fn with_liveness(mut self, heartbeat: Duration, idle_timeout: Duration) -> Self {
        self.heartbeat = heartbeat;
        self.idle_timeout = idle_timeout.max(heartbeat * 2);
        self
    }

    pub fn mode(&self) -> TcpMode {
        self.mode
    }
}

impl Transport for TcpTransport {
    fn start(
        &self,
        params: SessionParams,
        events: TransportEventSender,
    ) -> Result<Box<dyn TransportLink>, PeerError> {
        let shared = Arc::new(LinkShared::default());
        let hello = LinkHello::new(&params.room_id, params.signaling_key.as_deref(), LINK_VERSION);
        let driver = LinkDriver {
            transport: self.clone(),
            hello,
            shared: Arc::clone(&shared),
            events,
        };
        tokio::spawn(driver.run());
        Ok(Box::new(TcpLink { shared }))
    }
}

// ── Shared link state ────────────────────────────────────────────

#[derive(Default)]
struct LinkShared {
    writer: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    routes: Mutex<Routes>,
    next_channel: AtomicU32,
    closed: CancellationToken,
}

#[derive(Default)]
struct Routes {
    remote_names: HashMap<u32, String>,
    inbox: HashMap<String, mpsc::UnboundedSender<Message>>,
    backlog: HashMap<String, Vec<Message>>,
}

impl LinkShared {
    fn send(&self, packet: Packet) -> Result<(), PeerError> {
        match self.writer.locked().as_ref() {
            Some(tx) => tx.send(packet).map_err(|_| PeerError::NotConnected),
            None => Err(PeerError::NotConnected),
        }
    }

    fn is_up(&self) -> bool {
        !self.closed.is_cancelled() && self.writer.locked().is_some()
    }

    fn route(&self, packet: Packet) -> Result<(), PeerError> {
        match packet.kind() {
            FrameKind::ChannelOpen => {
                let name = packet.to_channel_name()?;
                debug!(channel = %name, id = packet.channel(), "peer opened sub-channel");
                self.routes.locked().remote_names.insert(packet.channel(), name);
            }
            FrameKind::Data => {
                let id = packet.channel();
                let message = packet.into_message()?;
                let mut routes = self.routes.locked();
                let Some(name) = routes.remote_names.get(&id).cloned() else {
                    warn!(id, "data for unannounced sub-channel dropped");
                    return Ok(());
                };
                match routes.inbox.get(&name) {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => routes.backlog.entry(name).or_default().push(message),
                }
            }
            FrameKind::Heartbeat | FrameKind::Hello | FrameKind::Goodbye => {}
        }
        Ok(())
    }
}

// ── Driver ───────────────────────────────────────────────────────

struct LinkDriver {
    transport: TcpTransport,
    hello: LinkHello,
    shared: Arc<LinkShared>,
    events: TransportEventSender,
}

impl LinkDriver {
    async fn run(self) {
        let closed = self.shared.closed.clone();
        let framed = tokio::select! {
            _ = closed.cancelled() => return,
            result = self.establish() => result,
        };

        let framed = match framed {
            Ok(framed) => framed,
            Err(e) => {
                warn!("tcp transport setup failed: {e}");
                let _ = self.events.send(TransportEvent::Disconnect(e.to_string()));
                return;
            }
        };

        let (mut net_writer, mut net_reader) = framed.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
        *self.shared.writer.locked() = Some(tx);

        let _ = self.events.send(TransportEvent::Open);
        let _ = self.events.send(TransportEvent::Connect);

        // Writer task: link -> network, with heartbeats.
        let heartbeat = self.transport.heartbeat;
        let writer = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat);
            interval.tick().await;
            loop {
                let packet = tokio::select! {
                    packet = rx.recv() => match packet {
                        Some(packet) => packet,
                        None => break,
                    },
                    _ = interval.tick() => Packet::heartbeat(),
                };
                if let Err(e) = net_writer.send(packet).await {
                    debug!("network write error: {e}");
                    break;
                }
            }
            let _ = net_writer.close().await;
        });

        // Reader loop: network -> sub-channels.
        let idle = self.transport.idle_timeout;
        let reason = loop {
            let next = tokio::select! {
                _ = closed.cancelled() => break None,
                next = tokio::time::timeout(idle, net_reader.next()) => next,
            };
            match next {
                Err(_) => break Some("peer idle timeout".to_string()),
                Ok(None) => break Some("connection closed".to_string()),
                Ok(Some(Err(e))) => break Some(format!("read error: {e}")),
                Ok(Some(Ok(packet))) => {
                    if packet.kind() == FrameKind::Goodbye {
                        break Some("peer closed".to_string());
                    }
                    if let Err(e) = self.shared.route(packet) {
                        warn!("dropping malformed frame: {e}");
                    }
                }
            }
        };

        self.shared.writer.locked().take();
        self.shared.routes.locked().inbox.clear();
        if reason.is_none() {
            // Local close: let the writer flush the goodbye.
            let _ = writer.await;
        } else {
            writer.abort();
        }
        if let Some(reason) = reason {
            if !closed.is_cancelled() {
                info!(room = %self.hello.room_id, "tcp link lost: {reason}");
                let _ = self.events.send(TransportEvent::Disconnect(reason));
            }
        }
    }

    async fn establish(&self) -> Result<FramedStream, PeerError> {
        match self.transport.mode {
            TcpMode::Dial(addr) => loop {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        return self.handshake(stream).await;
                    }
                    Err(e) => {
                        debug!("dial {addr} failed: {e}; retrying");
                        tokio::time::sleep(DIAL_RETRY).await;
                    }
                }
            },
            TcpMode::Listen(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!(room = %self.hello.room_id, "waiting for peer on {}", listener.local_addr()?);
                loop {
                    let (stream, peer) = listener.accept().await?;
                    stream.set_nodelay(true)?;
                    match self.handshake(stream).await {
                        Ok(framed) => {
                            info!("peer {peer} joined");
                            return Ok(framed);
                        }
                        Err(e) => warn!("rejected {peer}: {e}"),
                    }
                }
            }
        }
    }

    async fn handshake(&self, stream: TcpStream) -> Result<FramedStream, PeerError> {
        let mut framed = Framed::new(stream, FrameCodec);
        framed.send(Packet::hello(&self.hello)?).await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| PeerError::Timeout(HANDSHAKE_TIMEOUT))?
            .ok_or(PeerError::ChannelClosed)??;

        let theirs = reply.to_hello()?;
        if theirs.version != self.hello.version {
            let _ = framed.send(Packet::goodbye()).await;
            return Err(PeerError::UnsupportedVersion(theirs.version));
        }
        if !theirs.matches(&self.hello) {
            let _ = framed.send(Packet::goodbye()).await;
            return Err(PeerError::InvalidFrame("room or key mismatch"));
        }
        Ok(framed)
    }
}

// ── TcpLink ──────────────────────────────────────────────────────

struct TcpLink {
    shared: Arc<LinkShared>,
}

impl TransportLink for TcpLink {
    fn open_channel(
        &self,
        name: &str,
    ) -> Result<(Channel, mpsc::UnboundedReceiver<Message>), PeerError> {
        let id = self.shared.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.send(Packet::channel_open(id, name)?)?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.shared.routes.locked();
            for message in routes.backlog.remove(name).unwrap_or_default() {
                let _ = tx.send(message);
            }
            routes.inbox.insert(name.to_string(), tx);
        }

        let sink = TcpSink {
            id,
            shared: Arc::clone(&self.shared),
        };
        Ok((Channel::new(name, Arc::new(sink)), rx))
    }

    fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        let _ = self.shared.send(Packet::goodbye());
        self.shared.writer.locked().take();
        self.shared.closed.cancel();
    }
}

struct TcpSink {
    id: u32,
    shared: Arc<LinkShared>,
}

impl ChannelSink for TcpSink {
    fn send(&self, message: Message) -> Result<(), PeerError> {
        self.shared.send(Packet::data(self.id, message)?)
    }

    fn is_open(&self) -> bool {
        self.shared.is_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_addr() -> SocketAddr {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout")
            .expect("event stream ended")
    }

    fn params(key: &str) -> SessionParams {
        SessionParams::new("room:tcp").with_signaling_key(key)
    }

    #[tokio::test]
    async fn dial_and_listen_exchange_messages() {
        let addr = free_addr();
        let (tx_l, mut rx_l) = mpsc::unbounded_channel();
        let (tx_d, mut rx_d) = mpsc::unbounded_channel();
        let listener = TcpTransport::listen(addr).start(params("k"), tx_l).unwrap();
        let dialer = TcpTransport::dial(addr).start(params("k"), tx_d).unwrap();

        for rx in [&mut rx_l, &mut rx_d] {
            assert_eq!(next_event(rx).await, TransportEvent::Open);
            assert_eq!(next_event(rx).await, TransportEvent::Connect);
        }

        let (to_listener, _) = dialer.open_channel("files").unwrap();
        to_listener.send_text("before open").unwrap();
        to_listener
            .send(Message::Binary(bytes::Bytes::from_static(b"\x00\x01")))
            .unwrap();

        // Held until the listener opens the same name.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (back, mut inbox) = listener.open_channel("files").unwrap();
        assert_eq!(inbox.recv().await.unwrap(), Message::Text("before open".into()));
        assert_eq!(
            inbox.recv().await.unwrap(),
            Message::Binary(bytes::Bytes::from_static(b"\x00\x01"))
        );
        assert!(back.is_open());

        dialer.close();
        assert!(matches!(next_event(&mut rx_l).await, TransportEvent::Disconnect(_)));
        assert!(!back.is_open());
    }

    #[tokio::test]
    async fn key_mismatch_is_refused() {
        let addr = free_addr();
        let (tx_l, _rx_l) = mpsc::unbounded_channel();
        let (tx_d, mut rx_d) = mpsc::unbounded_channel();
        let listener = TcpTransport::listen(addr).start(params("one"), tx_l).unwrap();
        let _dialer = TcpTransport::dial(addr).start(params("two"), tx_d).unwrap();

        assert!(matches!(next_event(&mut rx_d).await, TransportEvent::Disconnect(_)));
        listener.close();
    }
}
