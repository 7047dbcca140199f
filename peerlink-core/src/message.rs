//! Transport frame kinds.
//!
//! Uses a proper enum with `TryFrom`, so unknown values never panic on unknown values.

use std::fmt;

use crate::error::PeerError;

/// What a transport frame carries.
///
/// - `0x01..0x0F`: link management (handshake, liveness, shutdown)
/// - `0x10..0x1F`: sub-channel traffic
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Link handshake: room id, key digest, protocol version.
    Hello = 0x01,
    /// Graceful shutdown of the whole link.
    Goodbye = 0x02,
    /// Keep-alive; carries no payload.
    Heartbeat = 0x03,

    /// Announces a named sub-channel and the id its data frames use.
    ChannelOpen = 0x10,
    /// One message on a sub-channel.
    Data = 0x11,
}

impl TryFrom<u32> for FrameKind {
    type Error = PeerError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Hello),
            0x02 => Ok(FrameKind::Goodbye),
            0x03 => Ok(FrameKind::Heartbeat),
            0x10 => Ok(FrameKind::ChannelOpen),
            0x11 => Ok(FrameKind::Data),
            _ => Err(PeerError::InvalidFrame("unknown frame kind")),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Hello => "Hello",
            FrameKind::Goodbye => "Goodbye",
            FrameKind::Heartbeat => "Heartbeat",
            FrameKind::ChannelOpen => "ChannelOpen",
            FrameKind::Data => "Data",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kinds_parse() {
        for kind in [
            FrameKind::Hello,
            FrameKind::Goodbye,
            FrameKind::Heartbeat,
            FrameKind::ChannelOpen,
            FrameKind::Data,
        ] {
            assert_eq!(FrameKind::try_from(kind as u32).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_an_error() {
        assert!(FrameKind::try_from(0xFF).is_err());
    }

    #[test]
    fn display() {
        assert_eq!(FrameKind::ChannelOpen.to_string(), "ChannelOpen");
    }
}
