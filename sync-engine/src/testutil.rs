//! Shared fixtures for unit tests.

use std::path::Path;
use std::sync::Arc;

use sync_core::{block_size, hash_blocks};
use sync_types::{DeviceId, FileInfo, ShortId, VersionVector};
use tempfile::TempDir;

use crate::config::FolderConfig;
use crate::events::EventSink;
use crate::folder::Folder;
use crate::index::MemoryIndex;
use crate::transport::{MockConnection, Peers};

pub(crate) const FOLDER: &str = "default";

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub folder: Arc<Folder>,
    pub store: MemoryIndex,
    pub events: EventSink,
    pub peer: MockConnection,
    pub remote: DeviceId,
}

impl Fixture {
    pub fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, data: &[u8]) {
        write(self.dir.path(), name, data);
    }

    pub fn read(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.path(name)).unwrap()
    }

    /// Announce `files` from the remote peer.
    pub async fn announce(&self, files: Vec<FileInfo>) {
        self.folder
            .on_remote_index(&self.remote, files, false)
            .await
            .unwrap();
    }
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(|config| config, |folder| folder)
}

pub(crate) fn fixture_with(
    tune: impl FnOnce(FolderConfig) -> FolderConfig,
    build: impl FnOnce(Folder) -> Folder,
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let local = DeviceId::random();
    let remote = DeviceId::random();
    let store = MemoryIndex::new();
    let events = EventSink::new();
    let peers = Peers::new();
    let peer = MockConnection::new(remote);
    peers.add(Arc::new(peer.clone()));

    let config = tune(FolderConfig::new(FOLDER, dir.path()).with_device(remote));
    let folder = Folder::new(config, local, Arc::new(store.clone()), peers, events.clone()).unwrap();
    let folder = build(folder);

    Fixture {
        dir,
        folder: Arc::new(folder),
        store,
        events,
        peer,
        remote,
    }
}

pub(crate) fn write(root: &Path, name: &str, data: &[u8]) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, data).unwrap();
}

/// Record of `data` under `name` edited once by `by`.
pub(crate) fn file_record(name: &str, data: &[u8], by: ShortId) -> FileInfo {
    let size = block_size(data.len() as i64);
    let mut file = FileInfo::file(name, size, hash_blocks(data, size).unwrap());
    file.version = VersionVector::new().update(by);
    file.modified_by = by;
    file.modified_s = 1_700_000_000;
    file
}
