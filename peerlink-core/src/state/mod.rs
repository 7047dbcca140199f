//! Session lifecycle: the phase enum, its async driver, and the
//! per-device stream manager.

pub mod connection;
pub mod machine;
pub mod manager;

pub use connection::ConnectionState;
pub use machine::{ConnectionStateMachine, DISPOSE_REASON};
pub use manager::{CONTROL_CHANNEL, ConnectionManager, ManagerEvent, StreamOptions, StreamSession};
