//! Control channel endpoints.
//!
//! The host side ([`ControlServer`]) refuses everything until the viewer
//! authenticates with a token from the device registry, then forwards
//! input to an [`InputSink`] and answers `rpc` calls from named
//! [`RpcHandler`]s. The viewer side ([`ControlClient`]) authenticates on
//! open and turns `rpc` into awaitable calls through a [`RequestRouter`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelObserver, Message};
use crate::config::RpcConfig;
use crate::error::{ErrorCode, PeerError};
use crate::pairing::DeviceRegistry;
use crate::protocol::control::{ControlMessage, KeyEvent, MouseEvent};
use crate::router::{Reply, RequestRouter};
use crate::sync::MutexExt;

// ── Seams ────────────────────────────────────────────────────────

/// Where authenticated input events go. Native injection lives outside
/// this crate.
pub trait InputSink: Send + Sync {
    fn mouse(&self, event: &MouseEvent);
    fn key(&self, event: &KeyEvent);
}

/// Input sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInputSink;

impl InputSink for LoggingInputSink {
    fn mouse(&self, event: &MouseEvent) {
        debug!(action = ?event.action, x = event.x, y = event.y, button = event.button, "mouse");
    }

    fn key(&self, event: &KeyEvent) {
        debug!(action = ?event.action, key = %event.key, modifiers = ?event.modifiers, "key");
    }
}

#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn call(&self, params: Value) -> Result<Value, PeerError>;
}

#[async_trait]
impl<F> RpcHandler for F
where
    F: Fn(Value) -> Result<Value, PeerError> + Send + Sync,
{
    async fn call(&self, params: Value) -> Result<Value, PeerError> {
        self(params)
    }
}

// ── ControlServer ────────────────────────────────────────────────

#[derive(Default)]
struct ServerSession {
    channel: Option<Channel>,
    /// Room id of the authenticated device.
    device: Option<String>,
}

pub struct ControlServer {
    registry: DeviceRegistry,
    input: Arc<dyn InputSink>,
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
    session: Mutex<ServerSession>,
}

impl ControlServer {
    pub fn new(registry: DeviceRegistry, input: Arc<dyn InputSink>) -> Self {
        Self {
            registry,
            input,
            handlers: HashMap::new(),
            session: Mutex::new(ServerSession::default()),
        }
    }

    pub fn with_rpc(mut self, name: impl Into<String>, handler: Arc<dyn RpcHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn authenticated_device(&self) -> Option<String> {
        self.session.locked().device.clone()
    }

    /// Ask the connected viewer to move to another room.
    pub fn redirect(&self, room_id: impl Into<String>) -> Result<(), PeerError> {
        let channel = self.session.locked().channel.clone().ok_or(PeerError::NotConnected)?;
        let message = ControlMessage::Redirect {
            room_id: room_id.into(),
        };
        channel.send_text(message.to_json()?)
    }

    fn reply(&self, message: &ControlMessage) {
        let channel = self.session.locked().channel.clone();
        let sent = match channel {
            Some(channel) => message.to_json().and_then(|raw| channel.send_text(raw)),
            None => Err(PeerError::NotConnected),
        };
        if let Err(e) = sent {
            debug!("control reply dropped: {e}");
        }
    }

    async fn dispatch_rpc(&self, name: String, req_id: u32, params: Value) {
        let outcome = match self.handlers.get(&name) {
            Some(handler) => handler.call(params).await,
            None => Err(PeerError::UnknownOperation),
        };
        let reply = match outcome {
            Ok(value) => ControlMessage::RpcResult {
                name,
                req_id,
                value,
                error: None,
            },
            Err(e) => {
                let code = e.code();
                if code == ErrorCode::InternalError {
                    warn!(rpc = %name, "rpc handler failed: {e}");
                }
                ControlMessage::RpcResult {
                    name,
                    req_id,
                    value: Value::Null,
                    error: Some(code.as_str().to_string()),
                }
            }
        };
        self.reply(&reply);
    }
}

#[async_trait]
impl ChannelObserver for ControlServer {
    async fn on_open(&self, channel: Channel) {
        let mut session = self.session.locked();
        session.channel = Some(channel);
        session.device = None;
    }

    async fn on_message(&self, message: Message) {
        let Message::Text(raw) = message else {
            debug!("ignoring binary control message");
            return;
        };
        let message = match ControlMessage::from_json(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("malformed control message: {e}");
                return;
            }
        };

        if let ControlMessage::Auth { token } = &message {
            let device = self.registry.find_by_token(token).map(|d| d.room_id);
            match &device {
                Some(room) => info!(room = %room, "control channel authenticated"),
                None => warn!("control auth with unknown token"),
            }
            self.session.locked().device = device;
            return;
        }
        if self.session.locked().device.is_none() {
            debug!("dropping control message before auth");
            return;
        }

        match message {
            ControlMessage::Mouse(event) => self.input.mouse(&event),
            ControlMessage::Key(event) => self.input.key(&event),
            ControlMessage::Rpc {
                name,
                req_id,
                params,
            } => self.dispatch_rpc(name, req_id, params).await,
            ControlMessage::Auth { .. }
            | ControlMessage::Redirect { .. }
            | ControlMessage::RpcResult { .. } => {
                debug!("ignoring viewer-bound control message");
            }
        }
    }

    async fn on_close(&self) {
        let mut session = self.session.locked();
        session.channel = None;
        session.device = None;
    }
}

// ── ControlClient ────────────────────────────────────────────────

pub struct ControlClient {
    token: String,
    router: RequestRouter,
    rpc_timeout: Duration,
    channel: Mutex<Option<Channel>>,
    redirect_tx: watch::Sender<Option<String>>,
}

impl ControlClient {
    pub fn new(token: impl Into<String>, config: RpcConfig) -> Self {
        let (redirect_tx, _) = watch::channel(None);
        Self {
            token: token.into(),
            router: RequestRouter::new(),
            rpc_timeout: config.timeout,
            channel: Mutex::new(None),
            redirect_tx,
        }
    }

    /// Latest room the host redirected us to.
    pub fn redirects(&self) -> watch::Receiver<Option<String>> {
        self.redirect_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.router.is_bound()
    }

    pub fn send_mouse(&self, event: MouseEvent) -> Result<(), PeerError> {
        self.send(&ControlMessage::Mouse(event))
    }

    pub fn send_key(&self, event: KeyEvent) -> Result<(), PeerError> {
        self.send(&ControlMessage::Key(event))
    }

    /// Remote procedure call with the configured timeout.
    pub async fn call(&self, name: &str, params: Value) -> Result<Value, PeerError> {
        let reply = self
            .router
            .send(
                |req_id| {
                    let rpc = ControlMessage::Rpc {
                        name: name.to_string(),
                        req_id,
                        params,
                    };
                    Ok(Message::Text(rpc.to_json()?))
                },
                Some(self.rpc_timeout),
            )
            .await?;
        match reply {
            Reply::Value(value) => Ok(value),
            Reply::Binary(_) => Err(PeerError::Encoding("binary rpc result".into())),
        }
    }

    fn send(&self, message: &ControlMessage) -> Result<(), PeerError> {
        let channel = self.channel.locked().clone().ok_or(PeerError::NotConnected)?;
        channel.send_text(message.to_json()?)
    }
}

#[async_trait]
impl ChannelObserver for ControlClient {
    async fn on_open(&self, channel: Channel) {
        *self.channel.locked() = Some(channel.clone());
        self.router.bind(channel);
        let auth = ControlMessage::Auth {
            token: self.token.clone(),
        };
        if let Err(e) = self.send(&auth) {
            warn!("failed to authenticate control channel: {e}");
        }
    }

    async fn on_message(&self, message: Message) {
        let Message::Text(raw) = message else {
            return;
        };
        match ControlMessage::from_json(&raw) {
            Ok(ControlMessage::RpcResult {
                req_id,
                value,
                error,
                ..
            }) => {
                let outcome = match error {
                    Some(code) => Err(ErrorCode::from_wire(&code)),
                    None => Ok(Reply::Value(value)),
                };
                self.router.resolve(req_id, outcome);
            }
            Ok(ControlMessage::Redirect { room_id }) => {
                info!(room = %room_id, "host requested redirect");
                self.redirect_tx.send_replace(Some(room_id));
            }
            Ok(other) => debug!("ignoring host-bound control message {other:?}"),
            Err(e) => warn!("malformed control message: {e}"),
        }
    }

    async fn on_close(&self) {
        self.channel.locked().take();
        self.router.unbind();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::channel::ChannelSink;
    use crate::pairing::DeviceRecord;
    use crate::protocol::control::MouseAction;

    struct QueueSink(mpsc::UnboundedSender<Message>);

    impl ChannelSink for QueueSink {
        fn send(&self, message: Message) -> Result<(), PeerError> {
            self.0.send(message).map_err(|_| PeerError::NotConnected)
        }

        fn is_open(&self) -> bool {
            !self.0.is_closed()
        }
    }

    #[derive(Default)]
    struct CountingSink {
        mice: AtomicUsize,
    }

    impl InputSink for CountingSink {
        fn mouse(&self, _event: &MouseEvent) {
            self.mice.fetch_add(1, Ordering::SeqCst);
        }

        fn key(&self, _event: &KeyEvent) {}
    }

    fn text(message: &ControlMessage) -> Message {
        Message::Text(message.to_json().unwrap())
    }

    fn parse(message: Message) -> ControlMessage {
        let Message::Text(raw) = message else {
            panic!("expected text");
        };
        ControlMessage::from_json(&raw).unwrap()
    }

    fn registry() -> DeviceRegistry {
        let registry = DeviceRegistry::in_memory();
        registry
            .upsert(DeviceRecord {
                name: None,
                room_id: "room:v".into(),
                publish_room_id: None,
                signaling_key: "k".into(),
                user_agent: "viewer".into(),
                token: "good".into(),
            })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn server_requires_auth() {
        let input = Arc::new(CountingSink::default());
        let server = ControlServer::new(registry(), input.clone()).with_rpc(
            "echo",
            Arc::new(|params: Value| -> Result<Value, PeerError> { Ok(params) }) as Arc<dyn RpcHandler>,
        );
        let (tx, mut wire) = mpsc::unbounded_channel();
        server.on_open(Channel::new("control", Arc::new(QueueSink(tx)))).await;

        let click = ControlMessage::Mouse(MouseEvent::press(1.0, 2.0, 0));
        server.on_message(text(&click)).await;
        assert_eq!(input.mice.load(Ordering::SeqCst), 0);

        server
            .on_message(text(&ControlMessage::Auth { token: "bad".into() }))
            .await;
        server.on_message(text(&click)).await;
        assert_eq!(input.mice.load(Ordering::SeqCst), 0);

        server
            .on_message(text(&ControlMessage::Auth { token: "good".into() }))
            .await;
        assert_eq!(server.authenticated_device().as_deref(), Some("room:v"));
        server.on_message(text(&click)).await;
        assert_eq!(input.mice.load(Ordering::SeqCst), 1);

        let rpc = ControlMessage::Rpc {
            name: "echo".into(),
            req_id: 7,
            params: json!({"a": 1}),
        };
        server.on_message(text(&rpc)).await;
        assert_eq!(
            parse(wire.recv().await.unwrap()),
            ControlMessage::RpcResult {
                name: "echo".into(),
                req_id: 7,
                value: json!({"a": 1}),
                error: None
            }
        );

        let missing = ControlMessage::Rpc {
            name: "reboot".into(),
            req_id: 8,
            params: Value::Null,
        };
        server.on_message(text(&missing)).await;
        let ControlMessage::RpcResult { error, .. } = parse(wire.recv().await.unwrap()) else {
            panic!("expected rpcResult");
        };
        assert_eq!(error.as_deref(), Some("unknown_operation"));
    }

    #[tokio::test]
    async fn client_authenticates_and_resolves_calls() {
        let client = Arc::new(ControlClient::new("good", RpcConfig::default()));
        let (tx, mut wire) = mpsc::unbounded_channel();
        client.on_open(Channel::new("control", Arc::new(QueueSink(tx)))).await;
        assert_eq!(
            parse(wire.recv().await.unwrap()),
            ControlMessage::Auth { token: "good".into() }
        );

        client.send_mouse(MouseEvent::move_to(3.0, 4.0)).unwrap();
        let ControlMessage::Mouse(event) = parse(wire.recv().await.unwrap()) else {
            panic!("expected mouse");
        };
        assert_eq!(event.action, MouseAction::Move);

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("ping", Value::Null).await }
        });
        let ControlMessage::Rpc { req_id, .. } = parse(wire.recv().await.unwrap()) else {
            panic!("expected rpc");
        };
        let result = ControlMessage::RpcResult {
            name: "ping".into(),
            req_id,
            value: json!("pong"),
            error: None,
        };
        client.on_message(text(&result)).await;
        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));

        let mut redirects = client.redirects();
        client
            .on_message(text(&ControlMessage::Redirect {
                room_id: "room:next".into(),
            }))
            .await;
        assert_eq!(redirects.borrow_and_update().as_deref(), Some("room:next"));
    }

    #[tokio::test(start_paused = true)]
    async fn client_call_times_out() {
        let client = ControlClient::new("good", RpcConfig::default());
        let (tx, _wire) = mpsc::unbounded_channel();
        client.on_open(Channel::new("control", Arc::new(QueueSink(tx)))).await;
        assert!(matches!(
            client.call("slow", Value::Null).await,
            Err(PeerError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn client_close_resets_calls() {
        let client = Arc::new(ControlClient::new("good", RpcConfig::default()));
        let (tx, mut wire) = mpsc::unbounded_channel();
        client.on_open(Channel::new("control", Arc::new(QueueSink(tx)))).await;
        wire.recv().await.unwrap();

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("slow", Value::Null).await }
        });
        wire.recv().await.unwrap();
        client.on_close().await;
        assert!(matches!(call.await.unwrap(), Err(PeerError::Reset)));
        assert!(matches!(client.send_key(KeyEvent::press("a", vec![])), Err(PeerError::NotConnected)));
    }
}
