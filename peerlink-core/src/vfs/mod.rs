//! Remote file system over the `files` sub-channel.
//!
//! - [`VfsServer`] answers requests from a storage [`backend`].
//! - [`VfsClient`] issues them and hands out page-cached
//!   [`RemoteDirectory`] views and read-ahead [`FileReader`]s.

pub mod backend;
pub mod client;
pub mod directory;
pub mod reader;
pub mod server;
pub mod thumbnail;

pub use backend::{
    DirectoryHandle, EntryMeta, FileHandle, Handle, LocalBackend, MemoryBackend, Mount,
    StorageError,
};
pub use client::VfsClient;
pub use directory::{FileEntry, Page, RemoteDirectory, SizeHint};
pub use reader::{Blocks, FileReader};
pub use server::{Outcome, VfsServer};
pub use thumbnail::{THUMBNAIL_SIZE, ThumbnailCache};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use super::VfsClient;
    use crate::channel::ChannelObserver;
    use crate::config::MachineConfig;
    use crate::protocol::file::FILES_CHANNEL;
    use crate::state::{ConnectionState, ConnectionStateMachine};
    use crate::transport::{MemoryHub, SessionParams};

    /// Both ends of a wired file channel. Dropping it disposes them.
    pub(crate) struct Wired {
        pub(crate) hub: Arc<MemoryHub>,
        pub(crate) client: ConnectionStateMachine,
        pub(crate) server: ConnectionStateMachine,
    }

    impl Drop for Wired {
        fn drop(&mut self) {
            self.client.dispose();
            self.server.dispose();
        }
    }

    /// Connect a fresh [`VfsClient`] to `server` over an in-memory link
    /// and wait until requests can flow.
    pub(crate) async fn wire(server: Arc<dyn ChannelObserver>) -> (VfsClient, Wired) {
        let hub = MemoryHub::new();
        let client = VfsClient::new();
        let machine = |observer: Arc<dyn ChannelObserver>| {
            ConnectionStateMachine::new(
                Arc::new(hub.transport()),
                SessionParams::new("room:vfs"),
                MachineConfig::default(),
            )
            .with_channel(FILES_CHANNEL, observer)
        };
        let server = machine(server);
        let client_machine = machine(Arc::new(client.clone()));
        server.connect().unwrap();
        client_machine.connect().unwrap();
        client_machine
            .wait_for(ConnectionState::Connected)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !client.is_connected() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        (
            client,
            Wired {
                hub,
                client: client_machine,
                server,
            },
        )
    }
}
