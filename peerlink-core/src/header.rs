//! Fixed-size header preceding every transport frame.
//!
//! ```text
//! magic:          [u8; 4]  "PLK0"
//! checksum:       u32      first 4 bytes of blake3(payload), 0 if empty
//! kind:           u32      FrameKind
//! flags:          u32      FrameFlags
//! channel:        u32      sender-local sub-channel id (0 for link frames)
//! payload_length: u64
//! ```
//!
//! All integers are little-endian.

use crate::error::PeerError;
use crate::flags::FrameFlags;
use crate::message::FrameKind;

/// Magic bytes identifying a peerlink frame.
pub const MAGIC: [u8; 4] = *b"PLK0";

/// Encoded header size on the wire.
pub const HEADER_SIZE: usize = 28;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub checksum: u32,
    pub kind: FrameKind,
    pub flags: FrameFlags,
    pub channel: u32,
    pub payload_length: u64,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, flags: FrameFlags, channel: u32, payload: &[u8]) -> Self {
        Self {
            checksum: checksum(payload),
            kind,
            flags,
            channel,
            payload_length: payload.len() as u64,
        }
    }

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[16..20].copy_from_slice(&self.channel.to_le_bytes());
        buf[20..28].copy_from_slice(&self.payload_length.to_le_bytes());
        buf
    }

    /// Deserialize from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HEADER_SIZE {
            return Err(PeerError::InvalidFrame("header too short"));
        }
        if data[0..4] != MAGIC {
            return Err(PeerError::InvalidFrame("bad magic"));
        }
        Ok(Self {
            checksum: read_u32(&data[4..8]),
            kind: FrameKind::try_from(read_u32(&data[8..12]))?,
            flags: FrameFlags::from_bits_truncate(read_u32(&data[12..16])),
            channel: read_u32(&data[16..20]),
            payload_length: u64::from_le_bytes([
                data[20], data[21], data[22], data[23], data[24], data[25], data[26], data[27],
            ]),
        })
    }
}

/// Truncated blake3 digest used as the payload checksum.
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let digest = blake3::hash(payload);
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = FrameHeader::new(FrameKind::Data, FrameFlags::BINARY, 7, b"abc");
        let decoded = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.payload_length, 3);
        assert_ne!(decoded.checksum, 0);
    }

    #[test]
    fn empty_payload_has_zero_checksum() {
        let header = FrameHeader::new(FrameKind::Heartbeat, FrameFlags::empty(), 0, &[]);
        assert_eq!(header.checksum, 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = FrameHeader::new(FrameKind::Goodbye, FrameFlags::empty(), 0, &[]).encode();
        bytes[0] = b'X';
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(PeerError::InvalidFrame("bad magic"))
        ));
    }

    #[test]
    fn rejects_short_input() {
        assert!(FrameHeader::decode(&[0u8; 10]).is_err());
    }
}
