//! Per-frame flags carried in the transport header.

use bitflags::bitflags;

bitflags! {
    /// Bit set stored in [`FrameHeader::flags`](crate::header::FrameHeader).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u32 {
        /// The data payload is an opaque binary message, not UTF-8 text.
        const BINARY = 0x0000_0001;
        /// Set on the last frame a peer sends before closing the socket.
        const FINAL = 0x0000_0002;
    }
}
