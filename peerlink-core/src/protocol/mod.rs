//! JSON message definitions for each sub-channel.
//!
//! Each sub-module is a closed tagged union for one channel. Parsing is
//! exhaustive; anything else is rejected at the boundary.

pub mod control;
pub mod file;
pub mod pairing;

pub use control::{ControlMessage, KeyAction, KeyEvent, Modifier, MouseAction, MouseEvent};
pub use file::{
    EntryKind, FILES_CHANNEL, FileCommand, FileOp, FileReply, ParsedCommand, StatMetadata,
    StatRecord,
};
pub use pairing::{PAIRING_VERSION, PairingMessage, SECRET_CHANNEL};
