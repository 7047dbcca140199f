//! A header plus payload, the unit the TCP codec reads and writes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::channel::Message;
use crate::error::PeerError;
use crate::flags::FrameFlags;
use crate::header::{self, FrameHeader, HEADER_SIZE};
use crate::message::FrameKind;

/// Maximum payload size for a single frame (4 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Maximum encoded frame size.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Link handshake payload exchanged in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHello {
    /// Room both peers must agree on.
    pub room_id: String,
    /// blake3 digest of the signalling key (the key never crosses the wire).
    pub key_digest: [u8; 32],
    /// Link protocol version.
    pub version: u32,
}

impl LinkHello {
    pub fn new(room_id: &str, signaling_key: Option<&str>, version: u32) -> Self {
        let key = signaling_key.unwrap_or_default();
        Self {
            room_id: room_id.to_string(),
            key_digest: *blake3::hash(key.as_bytes()).as_bytes(),
            version,
        }
    }

    /// Two hellos describe the same session.
    pub fn matches(&self, other: &Self) -> bool {
        self.room_id == other.room_id && self.key_digest == other.key_digest
    }
}

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: FrameHeader,
    payload: Bytes,
}

impl Packet {
    fn build(
        kind: FrameKind,
        flags: FrameFlags,
        channel: u32,
        payload: Bytes,
    ) -> Result<Self, PeerError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PeerError::FrameTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            header: FrameHeader::new(kind, flags, channel, &payload),
            payload,
        })
    }

    pub fn hello(hello: &LinkHello) -> Result<Self, PeerError> {
        let payload = bincode::serialize(hello)?;
        Self::build(FrameKind::Hello, FrameFlags::empty(), 0, payload.into())
    }

    pub fn goodbye() -> Self {
        Self {
            header: FrameHeader::new(FrameKind::Goodbye, FrameFlags::FINAL, 0, &[]),
            payload: Bytes::new(),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            header: FrameHeader::new(FrameKind::Heartbeat, FrameFlags::empty(), 0, &[]),
            payload: Bytes::new(),
        }
    }

    /// Announce that data frames tagged `channel` belong to `name`.
    pub fn channel_open(channel: u32, name: &str) -> Result<Self, PeerError> {
        Self::build(
            FrameKind::ChannelOpen,
            FrameFlags::empty(),
            channel,
            Bytes::copy_from_slice(name.as_bytes()),
        )
    }

    pub fn data(channel: u32, message: Message) -> Result<Self, PeerError> {
        match message {
            Message::Text(text) => {
                Self::build(FrameKind::Data, FrameFlags::empty(), channel, text.into())
            }
            Message::Binary(bytes) => {
                Self::build(FrameKind::Data, FrameFlags::BINARY, channel, bytes)
            }
        }
    }

    /// Reassemble from a header and its payload, verifying the checksum.
    pub fn from_parts(header: FrameHeader, payload: Bytes) -> Result<Self, PeerError> {
        if header.payload_length != payload.len() as u64 {
            return Err(PeerError::InvalidFrame("payload length mismatch"));
        }
        if header.checksum != header::checksum(&payload) {
            return Err(PeerError::InvalidFrame("checksum mismatch"));
        }
        Ok(Self { header, payload })
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    pub fn channel(&self) -> u32 {
        self.header.channel
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode a `Hello` payload.
    pub fn to_hello(&self) -> Result<LinkHello, PeerError> {
        if self.kind() != FrameKind::Hello {
            return Err(PeerError::InvalidFrame("expected Hello"));
        }
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Decode a `ChannelOpen` payload into the announced name.
    pub fn to_channel_name(&self) -> Result<String, PeerError> {
        String::from_utf8(self.payload.to_vec())
            .map_err(|_| PeerError::InvalidFrame("channel name is not utf-8"))
    }

    /// Convert a `Data` frame into the message it carries.
    pub fn into_message(self) -> Result<Message, PeerError> {
        if self.header.flags.contains(FrameFlags::BINARY) {
            Ok(Message::Binary(self.payload))
        } else {
            String::from_utf8(self.payload.to_vec())
                .map(Message::Text)
                .map_err(|_| PeerError::InvalidFrame("text payload is not utf-8"))
        }
    }

    /// Header followed by payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }
}
