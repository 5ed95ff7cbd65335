//! Index store and per-folder index views.
//!
//! The store keeps one [`FileInfo`] per (folder, device, name). Records for
//! remote devices are stored verbatim as announced; records for the local
//! device go through [`FolderIndex::commit_local`], the single serializing
//! update path of a folder, which assigns local sequence numbers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sync_core::wins_conflict;
use sync_types::{DeviceId, FileInfo, VectorOrdering};
use tokio::sync::{Mutex, RwLock};

use crate::error::IndexError;
use crate::ignore::IgnoreMatcher;

/// Key-value store of file records.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Record of `name` announced by `device`.
    async fn get(
        &self,
        folder: &str,
        device: &DeviceId,
        name: &str,
    ) -> Result<Option<FileInfo>, IndexError>;

    /// Insert or replace records, keyed by name.
    async fn put(
        &self,
        folder: &str,
        device: &DeviceId,
        files: Vec<FileInfo>,
    ) -> Result<(), IndexError>;

    /// Drop every record of `device` in `folder`.
    async fn clear(&self, folder: &str, device: &DeviceId) -> Result<(), IndexError>;

    /// All records of `device` in `folder`, by name.
    async fn scan(&self, folder: &str, device: &DeviceId) -> Result<Vec<FileInfo>, IndexError>;

    /// Devices with at least one record in `folder`.
    async fn devices(&self, folder: &str) -> Result<Vec<DeviceId>, IndexError>;

    /// Counter bumped by every mutation of `folder`.
    async fn change_counter(&self, folder: &str) -> Result<u64, IndexError>;
}

#[derive(Debug, Default)]
struct FolderRecords {
    devices: HashMap<DeviceId, BTreeMap<String, FileInfo>>,
    changes: u64,
}

/// In-memory index store.
///
/// Not persistent - all records are lost when the store is dropped.
#[derive(Debug, Default, Clone)]
pub struct MemoryIndex {
    folders: Arc<RwLock<HashMap<String, FolderRecords>>>,
    fail_next_put: Arc<AtomicBool>,
}

impl MemoryIndex {
    /// Create a new empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cause the next `put()` to fail.
    pub fn fail_next_put(&self) {
        self.fail_next_put.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexStore for MemoryIndex {
    async fn get(
        &self,
        folder: &str,
        device: &DeviceId,
        name: &str,
    ) -> Result<Option<FileInfo>, IndexError> {
        let folders = self.folders.read().await;
        Ok(folders
            .get(folder)
            .and_then(|f| f.devices.get(device))
            .and_then(|files| files.get(name))
            .cloned())
    }

    async fn put(
        &self,
        folder: &str,
        device: &DeviceId,
        files: Vec<FileInfo>,
    ) -> Result<(), IndexError> {
        if self.fail_next_put.swap(false, Ordering::SeqCst) {
            return Err(IndexError::Backend("injected put failure".into()));
        }
        let mut folders = self.folders.write().await;
        let records = folders.entry(folder.to_string()).or_default();
        let stored = records.devices.entry(*device).or_default();
        for file in files {
            stored.insert(file.name.clone(), file);
        }
        records.changes += 1;
        Ok(())
    }

    async fn clear(&self, folder: &str, device: &DeviceId) -> Result<(), IndexError> {
        let mut folders = self.folders.write().await;
        let records = folders.entry(folder.to_string()).or_default();
        records.devices.remove(device);
        records.changes += 1;
        Ok(())
    }

    async fn scan(&self, folder: &str, device: &DeviceId) -> Result<Vec<FileInfo>, IndexError> {
        let folders = self.folders.read().await;
        Ok(folders
            .get(folder)
            .and_then(|f| f.devices.get(device))
            .map(|files| files.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn devices(&self, folder: &str) -> Result<Vec<DeviceId>, IndexError> {
        let folders = self.folders.read().await;
        let mut devices: Vec<DeviceId> = folders
            .get(folder)
            .map(|f| f.devices.keys().copied().collect())
            .unwrap_or_default();
        devices.sort();
        Ok(devices)
    }

    async fn change_counter(&self, folder: &str) -> Result<u64, IndexError> {
        let folders = self.folders.read().await;
        Ok(folders.get(folder).map_or(0, |f| f.changes))
    }
}

/// A file the local device should bring up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeededFile {
    /// Best globally known record.
    pub global: FileInfo,
    /// Current local record, if any.
    pub local: Option<FileInfo>,
    /// Remote devices announcing exactly the global version.
    pub availability: Vec<DeviceId>,
}

/// Index of one folder as seen by the local device.
pub struct FolderIndex {
    folder: String,
    local: DeviceId,
    store: Arc<dyn IndexStore>,
    update: Mutex<()>,
}

impl FolderIndex {
    /// View of `folder` in `store` for `local`.
    pub fn new(folder: impl Into<String>, local: DeviceId, store: Arc<dyn IndexStore>) -> Self {
        Self {
            folder: folder.into(),
            local,
            store,
            update: Mutex::new(()),
        }
    }

    /// Local device ID.
    pub fn local_device(&self) -> DeviceId {
        self.local
    }

    /// Local record of `name`.
    pub async fn local(&self, name: &str) -> Result<Option<FileInfo>, IndexError> {
        self.store.get(&self.folder, &self.local, name).await
    }

    /// All local records.
    pub async fn local_files(&self) -> Result<Vec<FileInfo>, IndexError> {
        self.store.scan(&self.folder, &self.local).await
    }

    /// Store local records, assigning each the next local sequence number.
    ///
    /// Returns the records as stored.
    pub async fn commit_local(&self, files: Vec<FileInfo>) -> Result<Vec<FileInfo>, IndexError> {
        if files.is_empty() {
            return Ok(files);
        }
        let _guard = self.update.lock().await;
        let mut sequence = self
            .local_files()
            .await?
            .iter()
            .map(|f| f.sequence)
            .max()
            .unwrap_or(0);
        let files: Vec<FileInfo> = files
            .into_iter()
            .map(|mut f| {
                sequence += 1;
                f.sequence = sequence;
                f
            })
            .collect();
        self.store
            .put(&self.folder, &self.local, files.clone())
            .await?;
        Ok(files)
    }

    /// Store records announced by `device`. A full index replaces
    /// everything previously known from that device.
    pub async fn update_remote(
        &self,
        device: &DeviceId,
        files: Vec<FileInfo>,
        full: bool,
    ) -> Result<(), IndexError> {
        let _guard = self.update.lock().await;
        if full {
            self.store.clear(&self.folder, device).await?;
        }
        self.store.put(&self.folder, device, files).await
    }

    /// Counter bumped by every change to the folder.
    pub async fn change_counter(&self) -> Result<u64, IndexError> {
        self.store.change_counter(&self.folder).await
    }

    async fn all_records(&self) -> Result<Vec<(DeviceId, Vec<FileInfo>)>, IndexError> {
        let mut all = Vec::new();
        for device in self.store.devices(&self.folder).await? {
            all.push((device, self.store.scan(&self.folder, &device).await?));
        }
        Ok(all)
    }

    /// Best known record of every name plus the remote devices holding it.
    ///
    /// Invalid records never become global.
    pub async fn global(&self) -> Result<BTreeMap<String, (FileInfo, Vec<DeviceId>)>, IndexError> {
        let all = self.all_records().await?;
        let mut best: BTreeMap<String, FileInfo> = BTreeMap::new();
        for (_, files) in &all {
            for file in files.iter().filter(|f| !f.is_invalid()) {
                match best.get(&file.name) {
                    Some(current) if !beats(file, current) => {}
                    _ => {
                        best.insert(file.name.clone(), file.clone());
                    }
                }
            }
        }

        let remotes: Vec<(DeviceId, HashMap<&str, &FileInfo>)> = all
            .iter()
            .filter(|(device, _)| *device != self.local)
            .map(|(device, files)| {
                (*device, files.iter().map(|f| (f.name.as_str(), f)).collect())
            })
            .collect();

        let mut global = BTreeMap::new();
        for (name, file) in best {
            let holders = remotes
                .iter()
                .filter(|(_, files)| {
                    files
                        .get(name.as_str())
                        .is_some_and(|f| !f.is_invalid() && f.version == file.version)
                })
                .map(|(device, _)| *device)
                .collect();
            global.insert(name, (file, holders));
        }
        Ok(global)
    }

    /// Up to `limit` names whose global record differs from the local one,
    /// in name order. Locally ignored names are never needed.
    pub async fn need(
        &self,
        limit: usize,
        ignores: &dyn IgnoreMatcher,
    ) -> Result<Vec<NeededFile>, IndexError> {
        let local: HashMap<String, FileInfo> = self
            .local_files()
            .await?
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();

        let mut needed = Vec::new();
        for (name, (global, availability)) in self.global().await? {
            if needed.len() >= limit {
                break;
            }
            if ignores.is_ignored(&name) {
                continue;
            }
            let local = local.get(&name).cloned();
            let wanted = match &local {
                None => !global.is_deleted(),
                Some(l) if l.is_ignored() => false,
                Some(l) => l.version != global.version,
            };
            if wanted {
                needed.push(NeededFile {
                    global,
                    local,
                    availability,
                });
            }
        }
        Ok(needed)
    }

    /// Names any device has a record for.
    pub async fn names(&self) -> Result<BTreeSet<String>, IndexError> {
        Ok(self
            .all_records()
            .await?
            .into_iter()
            .flat_map(|(_, files)| files.into_iter().map(|f| f.name))
            .collect())
    }
}

/// True if `candidate` should replace `current` as the global record.
fn beats(candidate: &FileInfo, current: &FileInfo) -> bool {
    match candidate.version.compare(&current.version) {
        VectorOrdering::Newer => true,
        VectorOrdering::Older | VectorOrdering::Equal => false,
        VectorOrdering::Concurrent => wins_conflict(candidate, current),
    }
}
