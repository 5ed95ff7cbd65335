//! Local change detection.
//!
//! Walks the folder, compares what is on disk with the local index and
//! commits a new record for every entry whose content, type or permissions
//! changed. Entries that vanished become tombstones. Only real edits bump
//! the local counter; an mtime-only change keeps the version.

use std::collections::{HashMap, HashSet};

use sync_core::{block_size, validate_name};
use sync_types::{FileInfo, FileType, VersionVector};

use crate::error::EngineError;
use crate::events::FolderState;
use crate::folder::Folder;
use crate::fs::{FileMeta, WalkEntry};

/// Scan `subdirs` (everything when empty) and commit the changes.
pub(crate) async fn scan(folder: &Folder, subdirs: &[String]) -> Result<Vec<FileInfo>, EngineError> {
    let _disk = folder.disk_lock.lock().await;
    folder.set_state(FolderState::Scanning);
    let result = scan_locked(folder, subdirs).await;
    match &result {
        Ok(changed) => {
            tracing::debug!(folder = %folder.id(), changed = changed.len(), "scan complete");
            folder.set_state(FolderState::Idle);
        }
        Err(_) => folder.set_state(FolderState::Error),
    }
    result
}

/// Rescan individual names without touching the folder state.
pub(crate) async fn rescan(folder: &Folder, names: &[String]) -> Result<Vec<FileInfo>, EngineError> {
    let _disk = folder.disk_lock.lock().await;
    scan_locked(folder, names).await
}

async fn scan_locked(folder: &Folder, subdirs: &[String]) -> Result<Vec<FileInfo>, EngineError> {
    let local: HashMap<String, FileInfo> = folder
        .index
        .local_files()
        .await?
        .into_iter()
        .map(|f| (f.name.clone(), f))
        .collect();

    let mut prefixes: Vec<Option<&str>> = Vec::new();
    if subdirs.is_empty() {
        prefixes.push(None);
    }
    for sub in subdirs {
        if let Err(e) = validate_name(sub) {
            tracing::warn!(folder = %folder.id(), error = %e, "not scanning invalid path");
            continue;
        }
        if let Some(link) = folder.fs.symlink_in_path(sub, false).await? {
            tracing::warn!(folder = %folder.id(), name = %sub, %link, "not scanning below symlink");
            continue;
        }
        prefixes.push(Some(sub.as_str()));
    }

    let mut seen = HashSet::new();
    let mut changed = Vec::new();
    for prefix in &prefixes {
        for entry in folder.fs.walk(*prefix).await? {
            if validate_name(&entry.name).is_err() {
                continue;
            }
            seen.insert(entry.name.clone());
            let existing = local.get(&entry.name);
            match record_for(folder, &entry, existing).await {
                Ok(Some(file)) => changed.push(file),
                Ok(None) => {}
                Err(e) => {
                    // The entry may have vanished mid-scan; the next scan settles it.
                    tracing::debug!(folder = %folder.id(), name = %entry.name, error = %e, "skipping entry");
                }
            }
        }
    }

    for (name, old) in &local {
        if old.is_deleted() || seen.contains(name) || !in_scope(name, &prefixes) {
            continue;
        }
        if folder.fs.lstat(name).await?.is_some() {
            continue;
        }
        changed.push(tombstone(folder, old));
    }

    changed.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(folder.commit_local(changed).await?)
}

fn in_scope(name: &str, prefixes: &[Option<&str>]) -> bool {
    prefixes.iter().any(|prefix| match prefix {
        None => true,
        Some(p) => name == *p || name.strip_prefix(p).is_some_and(|rest| rest.starts_with('/')),
    })
}

async fn record_for(
    folder: &Folder,
    entry: &WalkEntry,
    existing: Option<&FileInfo>,
) -> std::io::Result<Option<FileInfo>> {
    let short = folder.short_id();
    let live = existing.filter(|f| !f.is_deleted());

    if folder.ignores.is_ignored(&entry.name) {
        if live.is_some_and(FileInfo::is_ignored) {
            return Ok(None);
        }
        let mut file = bare_record(&entry.name, &entry.meta, String::new());
        file.flags.ignored = true;
        file.version = bumped(existing, short);
        file.modified_by = short;
        return Ok(Some(file));
    }

    let live = live.filter(|f| !f.is_invalid());
    if live.is_some_and(|old| unchanged(old, &entry.meta)) {
        return Ok(None);
    }

    let mut file = match entry.meta.file_type {
        FileType::File => {
            let size = block_size(entry.meta.size);
            let blocks = folder.fs.hash_file(&entry.name, size).await?;
            let mut file = FileInfo::file(&entry.name, size, blocks);
            apply_meta(&mut file, &entry.meta);
            file
        }
        FileType::Directory => bare_record(&entry.name, &entry.meta, String::new()),
        FileType::Symlink => {
            let target = folder.fs.read_link(&entry.name).await?;
            bare_record(&entry.name, &entry.meta, target)
        }
    };

    if let Some(old) = live {
        if old.same_content(&file) && same_permissions(old.permissions, file.permissions) {
            if old.modified_s == file.modified_s && old.modified_ns == file.modified_ns {
                return Ok(None);
            }
            if file.is_directory() {
                return Ok(None);
            }
            file.version = old.version.clone();
            file.modified_by = old.modified_by;
            return Ok(Some(file));
        }
    }

    file.version = bumped(existing, short);
    file.modified_by = short;
    Ok(Some(file))
}

fn bare_record(name: &str, meta: &FileMeta, target: String) -> FileInfo {
    let mut file = match meta.file_type {
        FileType::Symlink => FileInfo::symlink(name, target),
        FileType::Directory => FileInfo::directory(name),
        FileType::File => FileInfo::file(name, 0, Vec::new()),
    };
    apply_meta(&mut file, meta);
    file
}

fn apply_meta(file: &mut FileInfo, meta: &FileMeta) {
    file.permissions = meta.permissions;
    file.modified_s = meta.modified_s;
    file.modified_ns = meta.modified_ns;
}

fn bumped(existing: Option<&FileInfo>, short: sync_types::ShortId) -> VersionVector {
    existing
        .map(|f| f.version.clone())
        .unwrap_or_default()
        .update(short)
}

/// Permission bits only count where the platform has them.
fn same_permissions(a: u32, b: u32) -> bool {
    !cfg!(unix) || (a & 0o777) == (b & 0o777)
}

fn unchanged(old: &FileInfo, meta: &FileMeta) -> bool {
    if old.file_type != meta.file_type || !same_permissions(old.permissions, meta.permissions) {
        return false;
    }
    match meta.file_type {
        FileType::File => {
            old.size == meta.size
                && old.modified_s == meta.modified_s
                && old.modified_ns == meta.modified_ns
        }
        FileType::Directory => true,
        FileType::Symlink => false,
    }
}

fn tombstone(folder: &Folder, old: &FileInfo) -> FileInfo {
    let short = folder.short_id();
    let now = chrono::Utc::now();
    let mut gone = old.clone();
    gone.flags.deleted = true;
    gone.blocks.clear();
    gone.size = 0;
    gone.version = old.version.update(short);
    gone.modified_by = short;
    gone.modified_s = now.timestamp();
    gone.modified_ns = now.timestamp_subsec_nanos() as i32;
    gone
}
