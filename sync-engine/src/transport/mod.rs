//! Connection abstraction for syncmesh.
//!
//! Connection management, encryption and discovery live outside the
//! engine. The engine only needs to talk to an already-authenticated peer:
//! - `request()` fetches a byte range of a file
//! - `index()` / `index_update()` announce local records
//!
//! Inbound messages are handed to [`crate::Model::on_message`] by whoever
//! owns the connection.

mod mock;

pub use mock::MockConnection;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sync_types::{DeviceId, ErrorCode, FileInfo, Request, SyncError};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Request timed out.
    #[error("request timeout")]
    Timeout,

    /// The peer answered with an error code.
    #[error("remote error: {0:?}")]
    Remote(ErrorCode),

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Message encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] SyncError),
}

/// An authenticated connection to one peer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The peer's device ID.
    fn device_id(&self) -> DeviceId;

    /// Ask the peer for a byte range of a file.
    ///
    /// Bounded by the transport's own request timeout.
    async fn request(&self, request: Request) -> Result<Vec<u8>, TransportError>;

    /// Send the complete list of local records for a folder.
    async fn index(&self, folder: &str, files: Vec<FileInfo>) -> Result<(), TransportError>;

    /// Send changed local records for a folder.
    async fn index_update(&self, folder: &str, files: Vec<FileInfo>)
        -> Result<(), TransportError>;
}

/// Live connections by device.
#[derive(Clone, Default)]
pub struct Peers {
    connections: Arc<DashMap<DeviceId, Arc<dyn Connection>>>,
}

impl Peers {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the one it replaces.
    pub fn add(&self, connection: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        self.connections.insert(connection.device_id(), connection)
    }

    /// Forget the connection to `device`.
    pub fn remove(&self, device: &DeviceId) -> Option<Arc<dyn Connection>> {
        self.connections.remove(device).map(|(_, c)| c)
    }

    /// Connection to `device`, if any.
    pub fn get(&self, device: &DeviceId) -> Option<Arc<dyn Connection>> {
        self.connections.get(device).map(|c| Arc::clone(c.value()))
    }

    /// True if `device` is connected.
    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.connections.contains_key(device)
    }

    /// Connections to those of `members` that are connected.
    pub fn connected(&self, members: &[DeviceId]) -> Vec<Arc<dyn Connection>> {
        members.iter().filter_map(|d| self.get(d)).collect()
    }

    /// Send `files` as an index update to every connected member.
    ///
    /// Failures are logged; the peer catches up from the full index on
    /// reconnect.
    pub async fn announce(&self, folder: &str, members: &[DeviceId], files: &[FileInfo]) {
        if files.is_empty() {
            return;
        }
        for connection in self.connected(members) {
            if let Err(e) = connection.index_update(folder, files.to_vec()).await {
                tracing::warn!(
                    %folder,
                    device = %connection.device_id(),
                    error = %e,
                    "index update failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for Peers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peers")
            .field("connected", &self.connections.len())
            .finish()
    }
}
