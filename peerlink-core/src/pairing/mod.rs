//! PIN-gated credential exchange.
//!
//! ```text
//! Offering (shows PIN)                       Accepting (types PIN)
//!   join "pin:482913"                          validate length, join "pin:482913"
//!   ──{"type":"hello",...}──────────────────►  check version
//!                                              mint room, key, token; persist
//!   ◄──────────────{"type":"credential",...}─
//!   persist, disconnect                        disconnect
//! ```
//!
//! Each side runs a throwaway [`ConnectionStateMachine`] with a single
//! `secret` sub-channel. A driver task owns it and disposes it once the
//! exchange finishes, fails, times out, or is cancelled.

pub mod registry;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelObserver, Message};
use crate::config::{MachineConfig, PairingConfig};
use crate::error::PeerError;
use crate::protocol::pairing::{PAIRING_VERSION, PairingMessage, SECRET_CHANNEL};
use crate::state::machine::ConnectionStateMachine;
use crate::sync::MutexExt;
use crate::transport::{SessionParams, Transport};

pub use registry::{DeviceRecord, DeviceRegistry};

/// Prefix of short-lived pairing rooms.
pub const PIN_ROOM_PREFIX: &str = "pin:";
/// Prefix of long-lived device rooms.
pub const ROOM_PREFIX: &str = "room:";
/// Length of generated secrets and tokens.
pub const SECRET_LENGTH: usize = 16;

// ── Randomness ───────────────────────────────────────────────────

/// A fixed-length numeric PIN from the OS RNG.
pub fn generate_pin(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// A secret over `[A-Za-z0-9]` from the OS RNG.
pub fn generate_secret(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn pin_room(pin: &str) -> String {
    format!("{PIN_ROOM_PREFIX}{pin}")
}

/// A fresh long-lived room id.
pub fn generate_room() -> String {
    format!("{ROOM_PREFIX}{}", generate_secret(SECRET_LENGTH))
}

pub fn validate_pin(pin: &str, expected: usize) -> Result<(), PeerError> {
    if pin.len() == expected && pin.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(PeerError::InvalidPin { expected })
    }
}

// ── Pairing ──────────────────────────────────────────────────────

/// Starts pairing exchanges over a transport.
#[derive(Clone)]
pub struct Pairing {
    transport: Arc<dyn Transport>,
    registry: DeviceRegistry,
    config: PairingConfig,
}

impl Pairing {
    pub fn new(transport: Arc<dyn Transport>, registry: DeviceRegistry, config: PairingConfig) -> Self {
        Self {
            transport,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Offer pairing under a freshly generated PIN.
    pub fn offer(&self) -> Result<PairingSession, PeerError> {
        self.offer_with_pin(generate_pin(self.config.pin_length))
    }

    /// Offer pairing under a caller-chosen PIN.
    pub fn offer_with_pin(&self, pin: String) -> Result<PairingSession, PeerError> {
        validate_pin(&pin, self.config.pin_length)?;
        let (room_id, signaling_key) = if self.config.isolated_room {
            (Some(generate_room()), Some(generate_secret(SECRET_LENGTH)))
        } else {
            (None, None)
        };
        let hello = PairingMessage::Hello {
            room_id: room_id.clone(),
            signaling_key,
            user_agent: self.config.user_agent.clone(),
            version: PAIRING_VERSION,
        };
        let role = Role::Offer {
            hello,
            publish_room: room_id,
        };
        let observer = Arc::new(PairingObserver::new(
            role,
            self.registry.clone(),
            self.config.user_agent.clone(),
        ));
        info!("pairing offered, pin room {}", pin_room(&pin));
        self.start(pin, observer, self.config.offer_timeout)
    }

    /// Accept an offer. The PIN is validated before any connection.
    pub fn accept(&self, pin: &str) -> Result<PairingSession, PeerError> {
        validate_pin(pin, self.config.pin_length)?;
        let observer = Arc::new(PairingObserver::new(
            Role::Accept,
            self.registry.clone(),
            self.config.user_agent.clone(),
        ));
        self.start(pin.to_string(), observer, self.config.accept_timeout)
    }

    fn start(
        &self,
        pin: String,
        observer: Arc<PairingObserver>,
        timeout: Duration,
    ) -> Result<PairingSession, PeerError> {
        let (done_tx, done_rx) = oneshot::channel();
        *observer.done.locked() = Some(done_tx);

        let machine = ConnectionStateMachine::new(
            Arc::clone(&self.transport),
            SessionParams::new(pin_room(&pin)),
            MachineConfig::default(),
        )
        .with_channel(SECRET_CHANNEL, observer);
        machine.connect()?;

        let cancel = CancellationToken::new();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn({
            let machine = machine.clone();
            let cancel = cancel.clone();
            async move {
                let result = tokio::select! {
                    result = done_rx => result.unwrap_or(Err(PeerError::Cancelled)),
                    _ = cancel.cancelled() => Err(PeerError::Cancelled),
                    _ = tokio::time::sleep(timeout) => Err(PeerError::Timeout(timeout)),
                };
                match &result {
                    Ok(record) => info!(room = %record.room_id, "pairing complete"),
                    Err(e) => warn!("pairing ended: {e}"),
                }
                machine.dispose();
                let _ = outcome_tx.send(result);
            }
        });

        Ok(PairingSession {
            pin,
            machine,
            cancel,
            outcome: outcome_rx,
        })
    }
}

/// One running exchange.
pub struct PairingSession {
    pin: String,
    machine: ConnectionStateMachine,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<Result<DeviceRecord, PeerError>>,
}

impl PairingSession {
    pub fn pin(&self) -> &str {
        &self.pin
    }

    pub fn machine(&self) -> &ConnectionStateMachine {
        &self.machine
    }

    /// Abort the exchange; `wait` then returns `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The persisted record once the exchange completes.
    pub async fn wait(self) -> Result<DeviceRecord, PeerError> {
        self.outcome.await.map_err(|_| PeerError::Cancelled)?
    }
}

// ── Observer ─────────────────────────────────────────────────────

enum Role {
    Offer {
        hello: PairingMessage,
        publish_room: Option<String>,
    },
    Accept,
}

struct PairingObserver {
    role: Role,
    registry: DeviceRegistry,
    user_agent: String,
    channel: Mutex<Option<Channel>>,
    done: Mutex<Option<oneshot::Sender<Result<DeviceRecord, PeerError>>>>,
}

impl PairingObserver {
    fn new(role: Role, registry: DeviceRegistry, user_agent: String) -> Self {
        Self {
            role,
            registry,
            user_agent,
            channel: Mutex::new(None),
            done: Mutex::new(None),
        }
    }

    fn finish(&self, result: Result<DeviceRecord, PeerError>) {
        if let Some(done) = self.done.locked().take() {
            let _ = done.send(result);
        }
    }

    fn handle(&self, message: PairingMessage) -> Result<Option<DeviceRecord>, PeerError> {
        match (&self.role, message) {
            (
                Role::Offer { publish_room, .. },
                PairingMessage::Credential {
                    room_id,
                    signaling_key,
                    token,
                    user_agent,
                },
            ) => {
                let record = DeviceRecord {
                    name: None,
                    room_id,
                    publish_room_id: publish_room.clone(),
                    signaling_key,
                    user_agent,
                    token,
                };
                self.registry.upsert(record.clone())?;
                Ok(Some(record))
            }
            (
                Role::Accept,
                PairingMessage::Hello {
                    room_id,
                    signaling_key,
                    user_agent,
                    version,
                },
            ) => {
                if version != PAIRING_VERSION {
                    return Err(PeerError::UnsupportedVersion(version));
                }
                let (room_id, signaling_key) = match (room_id, signaling_key) {
                    (Some(room), Some(key)) => (room, key),
                    (Some(room), None) => (room, generate_secret(SECRET_LENGTH)),
                    _ => (generate_room(), generate_secret(SECRET_LENGTH)),
                };
                let token = generate_secret(SECRET_LENGTH);
                let credential = PairingMessage::Credential {
                    room_id: room_id.clone(),
                    signaling_key: signaling_key.clone(),
                    token: token.clone(),
                    user_agent: self.user_agent.clone(),
                };
                let channel = self.channel.locked().clone().ok_or(PeerError::NotConnected)?;
                channel.send_text(credential.to_json()?)?;

                let record = DeviceRecord {
                    name: None,
                    room_id,
                    publish_room_id: None,
                    signaling_key,
                    user_agent,
                    token,
                };
                self.registry.upsert(record.clone())?;
                Ok(Some(record))
            }
            (_, other) => {
                debug!("ignoring unexpected pairing message {other:?}");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ChannelObserver for PairingObserver {
    async fn on_open(&self, channel: Channel) {
        *self.channel.locked() = Some(channel.clone());
        if let Role::Offer { hello, .. } = &self.role {
            if let Err(e) = hello.to_json().and_then(|raw| channel.send_text(raw)) {
                self.finish(Err(e));
            }
        }
    }

    async fn on_message(&self, message: Message) {
        let Message::Text(raw) = message else {
            debug!("ignoring binary message on pairing channel");
            return;
        };
        let outcome = PairingMessage::from_json(&raw).and_then(|m| self.handle(m));
        match outcome {
            Ok(Some(record)) => self.finish(Ok(record)),
            Ok(None) => {}
            Err(e) => self.finish(Err(e)),
        }
    }

    async fn on_close(&self) {
        self.channel.locked().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryHub;

    #[test]
    fn pins_are_fixed_length_digits() {
        for len in [4, 6, 8] {
            let pin = generate_pin(len);
            assert_eq!(pin.len(), len);
            assert!(pin.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn secrets_use_alphanumeric_alphabet() {
        let secret = generate_secret(SECRET_LENGTH);
        assert_eq!(secret.len(), 16);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, generate_secret(SECRET_LENGTH));
    }

    #[test]
    fn room_namespaces_are_disjoint() {
        assert!(pin_room("123456").starts_with(PIN_ROOM_PREFIX));
        assert!(generate_room().starts_with(ROOM_PREFIX));
        assert!(!PIN_ROOM_PREFIX.starts_with(ROOM_PREFIX));
    }

    #[tokio::test]
    async fn accept_rejects_bad_pin_before_connecting() {
        let hub = MemoryHub::new();
        let pairing = Pairing::new(
            Arc::new(hub.transport()),
            DeviceRegistry::in_memory(),
            PairingConfig::default(),
        );
        for pin in ["12345", "1234567", "12a456"] {
            assert!(matches!(
                pairing.accept(pin),
                Err(PeerError::InvalidPin { expected: 6 })
            ));
        }
        assert_eq!(hub.joins(&pin_room("12345")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_times_out_without_offer() {
        let hub = MemoryHub::new();
        let pairing = Pairing::new(
            Arc::new(hub.transport()),
            DeviceRegistry::in_memory(),
            PairingConfig::default(),
        );
        let session = pairing.accept("000111").unwrap();
        let machine = session.machine().clone();
        assert!(matches!(session.wait().await, Err(PeerError::Timeout(_))));
        assert!(machine.state().is_disposed());
    }

    #[tokio::test]
    async fn cancel_ends_the_exchange() {
        let hub = MemoryHub::new();
        let pairing = Pairing::new(
            Arc::new(hub.transport()),
            DeviceRegistry::in_memory(),
            PairingConfig::default(),
        );
        let session = pairing.offer().unwrap();
        session.cancel();
        assert!(matches!(session.wait().await, Err(PeerError::Cancelled)));
    }

    #[tokio::test]
    async fn version_mismatch_aborts() {
        let hub = MemoryHub::new();
        let registry = DeviceRegistry::in_memory();
        let pairing = Pairing::new(Arc::new(hub.transport()), registry.clone(), PairingConfig::default());
        let acceptor = pairing.accept("424242").unwrap();

        // A fake offering peer speaking a future version.
        let (tx, _events) = tokio::sync::mpsc::unbounded_channel();
        let link = hub.transport().start(SessionParams::new(pin_room("424242")), tx).unwrap();
        let machine = acceptor.machine().clone();
        machine.wait_for(crate::state::ConnectionState::Connected).await.unwrap();
        let (channel, _inbox) = link.open_channel(SECRET_CHANNEL).unwrap();
        let hello = PairingMessage::Hello {
            room_id: None,
            signaling_key: None,
            user_agent: "future".into(),
            version: PAIRING_VERSION + 1,
        };
        channel.send_text(hello.to_json().unwrap()).unwrap();

        assert!(matches!(
            acceptor.wait().await,
            Err(PeerError::UnsupportedVersion(v)) if v == PAIRING_VERSION + 1
        ));
        assert!(registry.is_empty());
    }
}
