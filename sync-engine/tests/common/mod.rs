//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use sync_core::{block_size, hash_blocks};
use sync_types::{
    DeviceId, ErrorCode, FileInfo, Index, IndexUpdate, Message, Request, ShortId, VersionVector,
};
use syncmesh_engine::{Connection, FolderConfig, MemoryIndex, Model, TransportError};
use tempfile::TempDir;

pub const FOLDER: &str = "default";

/// Install a subscriber once so `RUST_LOG=debug` shows engine logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One engine with a single folder rooted in a fresh temp directory.
///
/// The folder root is a subdirectory of the temp directory so tests can
/// check that nothing is written next to it.
pub struct Device {
    pub tmp: TempDir,
    pub model: Arc<Model>,
}

impl Device {
    pub fn new(shared_with: &[DeviceId]) -> Self {
        Self::with_id(DeviceId::random(), shared_with)
    }

    pub fn with_id(id: DeviceId, shared_with: &[DeviceId]) -> Self {
        init_tracing();
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("folder");
        std::fs::create_dir(&root).unwrap();

        let model = Model::new(id, Arc::new(MemoryIndex::new()));
        let mut config = FolderConfig::new(FOLDER, &root);
        for device in shared_with {
            config = config.with_device(*device);
        }
        model.new_folder(config).unwrap();

        Self {
            tmp,
            model: Arc::new(model),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.model.device_id()
    }

    pub fn root(&self) -> PathBuf {
        self.tmp.path().join("folder")
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }

    pub fn write(&self, name: &str, data: &[u8]) {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }

    pub fn read(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.path(name)).unwrap()
    }

    /// Names directly under the folder root, sorted, engine dirs excluded.
    pub fn listing(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with(".syncmesh"))
            .collect();
        names.sort();
        names
    }

    /// Deliver an index update for the folder as if `from` had sent it.
    pub async fn receive(&self, from: &DeviceId, files: Vec<FileInfo>) {
        let message = Message::IndexUpdate(IndexUpdate {
            folder: FOLDER.to_string(),
            files,
        });
        self.model.on_message(from, message).await.unwrap();
    }
}

/// Record of `data` under `name` edited once by `by`.
pub fn file_record(name: &str, data: &[u8], by: ShortId) -> FileInfo {
    let size = block_size(data.len() as i64);
    let mut file = FileInfo::file(name, size, hash_blocks(data, size).unwrap());
    file.version = VersionVector::new().update(by);
    file.modified_by = by;
    file.modified_s = 1_700_000_000;
    file
}

pub fn request(name: &str, offset: i64, size: i32) -> Request {
    Request {
        id: 7,
        folder: FOLDER.to_string(),
        name: name.to_string(),
        offset,
        size,
        hash: Vec::new(),
        weak_hash: 0,
        from_temporary: false,
    }
}

/// In-process connection delivering straight into another engine.
pub struct Loopback {
    local: DeviceId,
    remote_id: DeviceId,
    remote: Weak<Model>,
}

impl Loopback {
    fn remote(&self) -> Result<Arc<Model>, TransportError> {
        self.remote.upgrade().ok_or(TransportError::ConnectionClosed)
    }

    async fn deliver(&self, message: Message) -> Result<(), TransportError> {
        self.remote()?
            .on_message(&self.local, message)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl Connection for Loopback {
    fn device_id(&self) -> DeviceId {
        self.remote_id
    }

    async fn request(&self, request: Request) -> Result<Vec<u8>, TransportError> {
        let response = self.remote()?.request(&self.local, &request).await;
        match response.code {
            ErrorCode::NoError => Ok(response.data),
            code => Err(TransportError::Remote(code)),
        }
    }

    async fn index(&self, folder: &str, files: Vec<FileInfo>) -> Result<(), TransportError> {
        self.deliver(Message::Index(Index {
            folder: folder.to_string(),
            files,
        }))
        .await
    }

    async fn index_update(&self, folder: &str, files: Vec<FileInfo>) -> Result<(), TransportError> {
        self.deliver(Message::IndexUpdate(IndexUpdate {
            folder: folder.to_string(),
            files,
        }))
        .await
    }
}

/// Connect two engines in both directions, exchanging full indexes.
pub async fn connect(a: &Device, b: &Device) {
    a.model
        .add_connection(Arc::new(Loopback {
            local: a.id(),
            remote_id: b.id(),
            remote: Arc::downgrade(&b.model),
        }))
        .await
        .unwrap();
    b.model
        .add_connection(Arc::new(Loopback {
            local: b.id(),
            remote_id: a.id(),
            remote: Arc::downgrade(&a.model),
        }))
        .await
        .unwrap();
}

/// Two devices sharing the folder with each other.
pub fn pair() -> (Device, Device) {
    let a_id = DeviceId::random();
    let b_id = DeviceId::random();
    (Device::with_id(a_id, &[b_id]), Device::with_id(b_id, &[a_id]))
}

/// Set the modification time of `path` relative to now.
pub fn touch(path: &Path, offset_secs: i64) {
    let now = filetime::FileTime::now();
    let when = filetime::FileTime::from_unix_time(now.unix_seconds() + offset_secs, 0);
    filetime::set_file_mtime(path, when).unwrap();
}
