//! Async driver for one peer session.
//!
//! A [`ConnectionStateMachine`] owns at most one transport link, binds
//! every registered sub-channel to its observer once the link opens, and
//! applies the reconnect / connect-timeout policy from [`MachineConfig`].
//!
//! ```text
//! connect() ──► Transport::start ──► Open ──► bind channels ──► Waiting
//!                                   Connect ───────────────────► Connected
//!                                   Disconnect ──► unbind ──► Disconnected
//!                                                   └─► reconnect after delay
//! ```
//!
//! Every `connect()` starts a new epoch. Events and timers tagged with an
//! older epoch are ignored, so a late `Disconnect` from a replaced link
//! cannot tear down its successor.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelObserver, Message};
use crate::config::MachineConfig;
use crate::error::PeerError;
use crate::state::connection::ConnectionState;
use crate::sync::MutexExt;
use crate::transport::{SessionParams, Transport, TransportEvent, TransportLink};

/// Reason passed by [`ConnectionStateMachine::dispose`].
pub const DISPOSE_REASON: &str = "dispose";

// ── Internal state ───────────────────────────────────────────────

struct Binding {
    name: String,
    observer: Arc<dyn ChannelObserver>,
    bound: Option<Channel>,
}

struct Core {
    state: ConnectionState,
    epoch: u64,
    link: Option<Arc<dyn TransportLink>>,
    bindings: Vec<Binding>,
    /// Cancels the event loop, pumps and connect timer of the current epoch.
    session: CancellationToken,
    reconnect: Option<CancellationToken>,
    disposed: bool,
}

impl Core {
    /// Unbind all sub-channels and detach the link.
    fn teardown(&mut self) -> Option<Arc<dyn TransportLink>> {
        self.session.cancel();
        for binding in &mut self.bindings {
            binding.bound = None;
        }
        self.link.take()
    }

    fn cancel_reconnect(&mut self) {
        if let Some(token) = self.reconnect.take() {
            token.cancel();
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    params: SessionParams,
    config: MachineConfig,
    core: Mutex<Core>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Inner {
    /// Publish the state computed under the lock if it actually changed.
    /// Nothing is published after `Disposed`.
    fn publish(&self, core: &Core) {
        let next = core.state;
        self.state_tx.send_if_modified(|current| {
            if *current == next || current.is_disposed() {
                false
            } else {
                debug!(room = %self.params.room_id, "{current} -> {next}");
                *current = next;
                true
            }
        });
    }
}

// ── ConnectionStateMachine ───────────────────────────────────────

/// Cloneable handle to one peer session.
#[derive(Clone)]
pub struct ConnectionStateMachine {
    inner: Arc<Inner>,
}

impl ConnectionStateMachine {
    pub fn new(transport: Arc<dyn Transport>, params: SessionParams, config: MachineConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                params,
                config,
                core: Mutex::new(Core {
                    state: ConnectionState::Disconnected,
                    epoch: 0,
                    link: None,
                    bindings: Vec::new(),
                    session: CancellationToken::new(),
                    reconnect: None,
                    disposed: false,
                }),
                state_tx,
            }),
        }
    }

    /// Register a named sub-channel. Channels are opened in registration
    /// order on the next transport open.
    pub fn register(&self, name: impl Into<String>, observer: Arc<dyn ChannelObserver>) -> &Self {
        let name = name.into();
        let mut core = self.inner.core.locked();
        match core.bindings.iter_mut().find(|b| b.name == name) {
            Some(binding) => binding.observer = observer,
            None => core.bindings.push(Binding {
                name,
                observer,
                bound: None,
            }),
        }
        self
    }

    pub fn with_channel(self, name: impl Into<String>, observer: Arc<dyn ChannelObserver>) -> Self {
        self.register(name, observer);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.locked().state
    }

    /// Receiver notified on every real transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn room_id(&self) -> &str {
        &self.inner.params.room_id
    }

    pub fn config(&self) -> &MachineConfig {
        &self.inner.config
    }

    /// The bound channel for `name`, if the session is open.
    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.inner
            .core
            .locked()
            .bindings
            .iter()
            .find(|b| b.name == name)
            .and_then(|b| b.bound.clone())
    }

    /// Wait until the session reaches `target`. Fails once the session
    /// is disposed without getting there.
    pub async fn wait_for(&self, target: ConnectionState) -> Result<(), PeerError> {
        let mut rx = self.subscribe();
        let reached = *rx
            .wait_for(|s| *s == target || s.is_disposed())
            .await
            .map_err(|_| PeerError::ChannelClosed)?;
        if reached == target {
            Ok(())
        } else {
            Err(PeerError::InvalidState("session disposed"))
        }
    }

    // ── Operations ───────────────────────────────────────────────

    /// Begin a transport session.
    pub fn connect(&self) -> Result<(), PeerError> {
        let (epoch, session) = {
            let mut core = self.inner.core.locked();
            core.state.begin_connect()?;
            core.cancel_reconnect();
            core.epoch += 1;
            core.session = CancellationToken::new();
            self.inner.publish(&core);
            (core.epoch, core.session.clone())
        };

        info!(room = %self.inner.params.room_id, epoch, "connecting");
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link: Arc<dyn TransportLink> =
            match self.inner.transport.start(self.inner.params.clone(), events_tx) {
                Ok(link) => Arc::from(link),
                Err(e) => {
                    warn!(room = %self.inner.params.room_id, "transport start failed: {e}");
                    Self::lost(&self.inner, epoch, "transport start failed");
                    return Err(e);
                }
            };

        {
            let mut core = self.inner.core.locked();
            if core.epoch != epoch || !core.state.is_active() {
                drop(core);
                link.close();
                return Ok(());
            }
            core.link = Some(Arc::clone(&link));
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(run_events(weak.clone(), epoch, events_rx, session.clone()));

        if let Some(timeout) = self.inner.config.connect_timeout {
            let timer = session.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        if let Some(inner) = weak.upgrade() {
                            let reached = inner.core.locked().state.is_connected();
                            if !reached {
                                info!(room = %inner.params.room_id, "connect timed out after {timeout:?}");
                                Self::shutdown(&inner, Some(epoch), "connect timeout");
                            }
                        }
                    }
                }
            });
        }
        Ok(())
    }

    /// Detach from the transport without scheduling a reconnect.
    /// Safe to call in any state, any number of times.
    pub fn disconnect(&self, reason: &str) {
        Self::shutdown(&self.inner, None, reason);
    }

    /// Disconnect for good and release exclusively owned media.
    pub fn dispose(&self) {
        Self::shutdown(&self.inner, None, DISPOSE_REASON);
        let newly_disposed = {
            let mut core = self.inner.core.locked();
            let changed = core.state.dispose();
            if changed {
                self.inner.publish(&core);
            }
            changed
        };
        if newly_disposed {
            if let Some(media) = &self.inner.params.media {
                media.release();
            }
            info!(room = %self.inner.params.room_id, "disposed");
        }
    }

    // ── Event handling ───────────────────────────────────────────

    fn shutdown(inner: &Arc<Inner>, epoch: Option<u64>, reason: &str) {
        let link = {
            let mut core = inner.core.locked();
            if epoch.is_some_and(|e| e != core.epoch) {
                return;
            }
            core.cancel_reconnect();
            if reason == DISPOSE_REASON {
                core.disposed = true;
            }
            // Invalidate in-flight events of the current link.
            core.epoch += 1;
            let link = core.teardown();
            if core.state.finish_disconnect() {
                info!(room = %inner.params.room_id, "disconnected: {reason}");
                inner.publish(&core);
            }
            link
        };
        if let Some(link) = link {
            link.close();
        }
    }

    /// The transport went away underneath us.
    fn lost(inner: &Arc<Inner>, epoch: u64, reason: &str) {
        let link = {
            let mut core = inner.core.locked();
            if core.epoch != epoch || !core.state.is_active() {
                return;
            }
            let link = core.teardown();
            core.state.finish_disconnect();
            info!(room = %inner.params.room_id, "link lost: {reason}");
            inner.publish(&core);

            if let (false, Some(delay)) = (core.disposed, inner.config.reconnect_delay) {
                let token = CancellationToken::new();
                core.reconnect = Some(token.clone());
                debug!(room = %inner.params.room_id, "reconnecting in {delay:?}");
                let weak = Arc::downgrade(inner);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            if let Some(inner) = weak.upgrade() {
                                let machine = ConnectionStateMachine { inner };
                                if let Err(e) = machine.connect() {
                                    debug!("reconnect skipped: {e}");
                                }
                            }
                        }
                    }
                });
            }
            link
        };
        if let Some(link) = link {
            link.close();
        }
    }

    fn opened(inner: &Arc<Inner>, epoch: u64) {
        let mut pumps = Vec::new();
        {
            let mut core = inner.core.locked();
            if core.epoch != epoch || core.state != ConnectionState::Connecting {
                return;
            }
            let Some(link) = core.link.clone() else {
                return;
            };
            let session = core.session.clone();
            for binding in &mut core.bindings {
                match link.open_channel(&binding.name) {
                    Ok((channel, rx)) => {
                        binding.bound = Some(channel.clone());
                        let token = session.child_token();
                        pumps.push((channel, rx, Arc::clone(&binding.observer), token));
                    }
                    Err(e) => warn!(channel = %binding.name, "failed to open sub-channel: {e}"),
                }
            }
            if core.state.open().is_ok() {
                inner.publish(&core);
            }
        }
        for (channel, rx, observer, token) in pumps {
            tokio::spawn(pump(channel, rx, observer, token));
        }
    }

    fn established(inner: &Arc<Inner>, epoch: u64) {
        let mut core = inner.core.locked();
        if core.epoch != epoch {
            return;
        }
        if core.state.establish().is_ok() {
            info!(room = %inner.params.room_id, "connected");
            inner.publish(&core);
        }
    }
}

impl std::fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("room_id", &self.inner.params.room_id)
            .field("state", &self.state())
            .finish()
    }
}

// ── Tasks ────────────────────────────────────────────────────────

async fn run_events(
    weak: Weak<Inner>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    session: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = session.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            Some(TransportEvent::Open) => ConnectionStateMachine::opened(&inner, epoch),
            Some(TransportEvent::Connect) => ConnectionStateMachine::established(&inner, epoch),
            Some(TransportEvent::Disconnect(reason)) => {
                ConnectionStateMachine::lost(&inner, epoch, &reason);
                return;
            }
            None => {
                ConnectionStateMachine::lost(&inner, epoch, "transport dropped");
                return;
            }
        }
    }
}

/// Feed one sub-channel into its observer until the binding goes away.
async fn pump(
    channel: Channel,
    mut rx: mpsc::UnboundedReceiver<Message>,
    observer: Arc<dyn ChannelObserver>,
    token: CancellationToken,
) {
    observer.on_open(channel).await;
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            message = rx.recv() => message,
        };
        match message {
            Some(message) => observer.on_message(message).await,
            None => break,
        }
    }
    observer.on_close().await;
}

// ── Tests ────────────────────────────────────────────────────────
