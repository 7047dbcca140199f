//! # peerlink-core
//!
//! Core library for peerlink: paired peer sessions that carry named
//! sub-channels, and a remote file system protocol on top of them.
//!
//! This crate contains:
//! - **Transport**: `Transport`/`TransportLink` seams plus in-memory and TCP links
//! - **Wire**: `FrameHeader`, `Packet`, `FrameKind`, `FrameFlags`, `FrameCodec`
//! - **State**: `ConnectionStateMachine` and the per-device `ConnectionManager`
//! - **Pairing**: PIN-gated credential exchange and the `DeviceRegistry`
//! - **Router**: `RequestRouter` for request/response correlation
//! - **Control**: authenticated input forwarding and RPC
//! - **VFS**: `VfsServer`, `VfsClient`, page-cached `RemoteDirectory`, `FileReader`
//! - **Task**: `TaskPool` for per-request tasks with cancellation
//! - **Error**: `PeerError` and the wire `ErrorCode`

pub mod channel;
pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod flags;
pub mod header;
pub mod message;
pub mod packet;
pub mod pairing;
pub mod protocol;
pub mod router;
pub mod state;
pub(crate) mod sync;
pub mod task;
pub mod transport;
pub mod vfs;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use channel::{Channel, ChannelObserver, ChannelSink, Message};
pub use codec::FrameCodec;
pub use config::{
    DirectoryConfig, MachineConfig, ManagerConfig, PairingConfig, ReadAheadConfig, RpcConfig,
};
pub use control::{ControlClient, ControlServer, InputSink, LoggingInputSink, RpcHandler};
pub use error::{ErrorCode, PeerError};
pub use flags::FrameFlags;
pub use header::{HEADER_SIZE, FrameHeader};
pub use message::FrameKind;
pub use packet::{MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, Packet};
pub use pairing::{DeviceRecord, DeviceRegistry, Pairing, PairingSession};
pub use router::{Reply, RequestRouter};
pub use state::{
    ConnectionManager, ConnectionState, ConnectionStateMachine, ManagerEvent, StreamOptions,
    StreamSession,
};
pub use task::TaskPool;
pub use transport::{
    MediaDirection, MediaSource, MemoryHub, SessionParams, TcpMode, TcpTransport, Transport,
    TransportEvent, TransportLink,
};
pub use vfs::{
    FileEntry, FileReader, LocalBackend, MemoryBackend, Mount, RemoteDirectory, SizeHint,
    VfsClient, VfsServer,
};
