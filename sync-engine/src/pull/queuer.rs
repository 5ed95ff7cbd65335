//! Queuer: turns the folder's need list into work.
//!
//! Directories and symlinks are applied inline, parents first. Files go
//! through the copier/puller/finisher pipeline in random order so no
//! single large file holds up the rest of the batch. Deletions run last,
//! deepest first, once every file that might copy from a deleted name has
//! finished.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use sync_core::names::{depth, parent};
use sync_core::{detect_renames, diff_blocks, is_temporary, temp_name, BlockIndex};
use sync_types::{FileInfo, FileType};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{copier, finisher, puller, Completion, PullJob, PullSummary};
use crate::error::{EngineError, PullError};
use crate::events::{self, Event, FolderState, ItemAction};
use crate::folder::Folder;
use crate::fs::FileMeta;
use crate::index::NeededFile;
use crate::scanner;
use crate::temp::{InFlightJob, TempFile};

/// Run one pull cycle over up to `pull_batch_size` needed names.
pub(crate) async fn run_cycle(folder: &Arc<Folder>) -> Result<PullSummary, EngineError> {
    let needed = folder
        .index
        .need(folder.config().pull_batch_size, folder.ignores.as_ref())
        .await?;
    if needed.is_empty() {
        return Ok(PullSummary::default());
    }

    tracing::debug!(folder = %folder.id(), needed = needed.len(), "starting pull cycle");
    folder.set_state(FolderState::Syncing);
    let summary = pull_needed(folder, needed).await;
    folder.set_state(FolderState::Idle);
    summary
}

#[derive(Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    rescan: Vec<String>,
}

impl Tally {
    fn record(&mut self, folder: &Folder, name: &str, action: ItemAction, result: Result<(), PullError>) {
        let error = match result {
            Ok(()) => {
                self.succeeded += 1;
                None
            }
            Err(e) => {
                self.failed += 1;
                if matches!(e, PullError::ModifiedLocally) {
                    self.rescan.push(name.to_string());
                }
                folder.report(Some(name), &e);
                Some(e.to_string())
            }
        };
        folder.events.emit(Event::ItemFinished(events::ItemFinished {
            folder: folder.id().to_string(),
            name: name.to_string(),
            action,
            error,
        }));
    }
}

fn started(folder: &Folder, name: &str, action: ItemAction) {
    folder.events.emit(Event::ItemStarted(events::ItemStarted {
        folder: folder.id().to_string(),
        name: name.to_string(),
        action,
    }));
}

async fn pull_needed(
    folder: &Arc<Folder>,
    needed: Vec<NeededFile>,
) -> Result<PullSummary, EngineError> {
    let total = needed.len();
    let mut dirs = Vec::new();
    let mut links = Vec::new();
    let mut files = Vec::new();
    let mut deletions = Vec::new();
    for need in needed {
        if need.global.is_deleted() {
            deletions.push(need);
        } else {
            match need.global.file_type {
                FileType::Directory => dirs.push(need),
                FileType::Symlink => links.push(need),
                FileType::File => files.push(need),
            }
        }
    }

    let mut tally = Tally::default();

    dirs.sort_by(|a, b| a.global.name.cmp(&b.global.name));
    for need in &dirs {
        started(folder, &need.global.name, ItemAction::Update);
        let result = apply_directory(folder, need).await;
        tally.record(folder, &need.global.name, ItemAction::Update, result);
    }

    links.sort_by(|a, b| a.global.name.cmp(&b.global.name));
    for need in &links {
        started(folder, &need.global.name, ItemAction::Update);
        let result = apply_symlink(folder, need).await;
        tally.record(folder, &need.global.name, ItemAction::Update, result);
    }

    let gone: Vec<FileInfo> = deletions
        .iter()
        .filter_map(|n| n.local.clone())
        .filter(is_live)
        .collect();
    let created: Vec<FileInfo> = files.iter().map(|n| n.global.clone()).collect();
    let renames: HashMap<String, String> = detect_renames(&gone, &created)
        .into_iter()
        .map(|r| (r.to, r.from))
        .collect();

    files.shuffle(&mut rand::thread_rng());
    pull_files(folder, files, renames, &mut tally).await?;

    deletions.sort_by(|a, b| {
        depth(&b.global.name)
            .cmp(&depth(&a.global.name))
            .then_with(|| a.global.name.cmp(&b.global.name))
    });
    for need in &deletions {
        started(folder, &need.global.name, ItemAction::Delete);
        let result = apply_deletion(folder, need).await;
        tally.record(folder, &need.global.name, ItemAction::Delete, result);
    }

    if !tally.rescan.is_empty() {
        tally.rescan.sort();
        tally.rescan.dedup();
        scanner::rescan(folder, &tally.rescan).await?;
    }

    Ok(PullSummary {
        needed: total,
        succeeded: tally.succeeded,
        failed: tally.failed,
    })
}

/// Run the copier/puller/finisher pipeline over `files`.
async fn pull_files(
    folder: &Arc<Folder>,
    files: Vec<NeededFile>,
    renames: HashMap<String, String>,
    tally: &mut Tally,
) -> Result<(), EngineError> {
    if files.is_empty() {
        return Ok(());
    }

    let config = folder.config();
    let local_files = folder.index.local_files().await?;
    let index = Arc::new(BlockIndex::from_files(&local_files));
    let requests = Arc::new(Semaphore::new(config.pullers));

    let (copy_tx, copy_rx) = mpsc::channel::<Arc<PullJob>>(config.copiers);
    let (pull_tx, pull_rx) = mpsc::channel::<Arc<PullJob>>(config.pullers);
    // Every job reports at most three times, so sends never wait.
    let (done_tx, done_rx) = mpsc::channel::<Completion>(3 * files.len() + 1);

    let finisher = tokio::spawn(finisher::run(Arc::clone(folder), done_rx));
    let copy_rx = Arc::new(Mutex::new(copy_rx));
    let copiers: Vec<_> = (0..config.copiers)
        .map(|_| {
            tokio::spawn(copier::run(
                Arc::clone(folder),
                Arc::clone(&copy_rx),
                done_tx.clone(),
                Arc::clone(&requests),
            ))
        })
        .collect();
    let puller = tokio::spawn(puller::run(
        Arc::clone(folder),
        pull_rx,
        done_tx.clone(),
        Arc::clone(&requests),
        config.pullers,
    ));

    for need in files {
        let name = need.global.name.clone();
        let rename_from = renames.get(&name).cloned();
        match prepare(folder, need, rename_from, &index).await {
            Ok(Prepared::Metadata) => {
                tally.record(folder, &name, ItemAction::Metadata, Ok(()));
            }
            Ok(Prepared::Job(job)) => {
                let job = Arc::new(job);
                let queued = done_tx.send(Completion::Started(Arc::clone(&job))).await.is_ok()
                    && copy_tx.send(Arc::clone(&job)).await.is_ok()
                    && pull_tx.send(job).await.is_ok();
                if !queued {
                    tracing::error!(folder = %folder.id(), %name, "pull pipeline stopped early");
                    break;
                }
            }
            Err(e) => tally.record(folder, &name, ItemAction::Update, Err(e)),
        }
    }

    drop(copy_tx);
    drop(pull_tx);
    drop(done_tx);
    for copier in copiers {
        if let Err(e) = copier.await {
            tracing::error!(folder = %folder.id(), error = %e, "copier task failed");
        }
    }
    if let Err(e) = puller.await {
        tracing::error!(folder = %folder.id(), error = %e, "puller task failed");
    }
    match finisher.await {
        Ok(outcome) => {
            tally.succeeded += outcome.succeeded;
            tally.failed += outcome.failed;
            tally.rescan.extend(outcome.rescan);
        }
        Err(e) => tracing::error!(folder = %folder.id(), error = %e, "finisher task failed"),
    }
    Ok(())
}

enum Prepared {
    /// Content was already right; only metadata changed.
    Metadata,
    Job(PullJob),
}

/// Work out which blocks the job needs and open its temp file.
async fn prepare(
    folder: &Folder,
    need: NeededFile,
    rename_from: Option<String>,
    index: &Arc<BlockIndex>,
) -> Result<Prepared, PullError> {
    let NeededFile {
        global: target,
        local,
        availability,
    } = need;
    let name = target.name.as_str();
    guard_ancestors(folder, name).await?;

    let usable = local
        .as_ref()
        .filter(|l| is_live(l) && l.is_file());
    if usable.is_some_and(|l| l.same_content(&target)) {
        started(folder, name, ItemAction::Metadata);
        apply_metadata(folder, local.as_ref(), &target).await?;
        return Ok(Prepared::Metadata);
    }

    if let Some(dir) = parent(name) {
        folder.fs.create_dir_all(dir).await?;
    }
    let temp = TempFile::open(Arc::clone(&folder.fs), temp_name(&target), target.size).await?;

    let have = usable.map_or(&[][..], |l| l.blocks.as_slice());
    let diff = diff_blocks(have, &target.blocks);
    let (mut copy, mut pull) = (diff.copy, diff.pull);
    if rename_from.is_some() {
        copy.append(&mut pull);
    } else {
        let (local_blocks, remote): (Vec<_>, Vec<_>) =
            pull.into_iter().partition(|b| index.contains(b));
        copy.extend(local_blocks);
        pull = remote;
    }

    // Blocks an earlier attempt already wrote stay where they are.
    let mut missing_copy = Vec::with_capacity(copy.len());
    for block in copy {
        if !temp.has_block(&block).await {
            missing_copy.push(block);
        }
    }
    let mut missing_pull = Vec::with_capacity(pull.len());
    for block in pull {
        if !temp.has_block(&block).await {
            missing_pull.push(block);
        }
    }

    tracing::debug!(
        folder = %folder.id(),
        %name,
        copy = missing_copy.len(),
        pull = missing_pull.len(),
        rename_from = rename_from.as_deref().unwrap_or(""),
        "job queued"
    );

    let token = CancellationToken::new();
    folder.inflight.register(
        name,
        InFlightJob {
            version: target.version.clone(),
            temp: temp.name().to_string(),
            token: token.clone(),
        },
    );

    Ok(Prepared::Job(PullJob {
        local,
        temp,
        copy: missing_copy,
        pull: missing_pull,
        rename_from,
        availability,
        token,
        index: Arc::clone(index),
        target,
    }))
}

/// Adopt `target` for a file whose content already matches.
async fn apply_metadata(
    folder: &Folder,
    local: Option<&FileInfo>,
    target: &FileInfo,
) -> Result<(), PullError> {
    let name = target.name.as_str();
    let _disk = folder.disk_lock.lock().await;
    let meta = folder.fs.lstat(name).await?;
    check_unmodified(local, meta.as_ref())?;
    if cfg!(unix) {
        folder.fs.set_permissions(name, target.permissions).await?;
    }
    folder
        .fs
        .set_mtime(name, target.modified_s, target.modified_ns)
        .await?;
    folder.commit_pulled(target.clone()).await?;
    Ok(())
}

async fn apply_directory(folder: &Folder, need: &NeededFile) -> Result<(), PullError> {
    let name = need.global.name.as_str();
    guard_ancestors(folder, name).await?;
    let _disk = folder.disk_lock.lock().await;
    match folder.fs.lstat(name).await? {
        Some(meta) if meta.file_type == FileType::Directory => {}
        Some(meta) => {
            check_unmodified(need.local.as_ref(), Some(&meta))?;
            folder.versioner.archive(folder.fs.as_ref(), name).await?;
            remove_entry(folder, name).await?;
            folder.fs.create_dir_all(name).await?;
        }
        None => folder.fs.create_dir_all(name).await?,
    }
    if cfg!(unix) {
        folder
            .fs
            .set_permissions(name, need.global.permissions)
            .await?;
    }
    folder.commit_pulled(need.global.clone()).await?;
    Ok(())
}

async fn apply_symlink(folder: &Folder, need: &NeededFile) -> Result<(), PullError> {
    let name = need.global.name.as_str();
    guard_ancestors(folder, name).await?;

    if !cfg!(unix) {
        // Recorded invalid so it stops being needed and never becomes global.
        let mut file = need.global.clone();
        file.flags.invalid = true;
        folder.commit_local(vec![file]).await?;
        tracing::debug!(folder = %folder.id(), %name, "symlink recorded as invalid");
        return Ok(());
    }

    let target = need.global.symlink_target.as_str();
    let _disk = folder.disk_lock.lock().await;
    let meta = folder.fs.lstat(name).await?;
    let in_place = match &meta {
        Some(m) if m.file_type == FileType::Symlink => {
            folder.fs.read_link(name).await.ok().as_deref() == Some(target)
        }
        _ => false,
    };
    if !in_place {
        if let Some(meta) = &meta {
            check_unmodified(need.local.as_ref(), Some(meta))?;
            folder.versioner.archive(folder.fs.as_ref(), name).await?;
            remove_entry(folder, name).await?;
        }
        folder.fs.create_symlink(target, name).await?;
    }
    folder.commit_pulled(need.global.clone()).await?;
    Ok(())
}

async fn apply_deletion(folder: &Folder, need: &NeededFile) -> Result<(), PullError> {
    let name = need.global.name.as_str();
    guard_ancestors(folder, name).await?;
    let _disk = folder.disk_lock.lock().await;

    if let Some(meta) = folder.fs.lstat(name).await? {
        check_unmodified(need.local.as_ref(), Some(&meta))?;
        if meta.file_type == FileType::Directory {
            remove_temp_files(folder, name).await?;
            if folder.fs.walk(Some(name)).await?.len() > 1 {
                return Err(PullError::DirectoryNotEmpty);
            }
        } else {
            folder.versioner.archive(folder.fs.as_ref(), name).await?;
        }
        remove_entry(folder, name).await?;
    }

    folder.commit_pulled(need.global.clone()).await?;
    Ok(())
}

/// Leftover temp files directly inside `dir` would keep it from being
/// removed.
async fn remove_temp_files(folder: &Folder, dir: &str) -> Result<(), PullError> {
    for entry in folder.fs.walk(Some(dir)).await? {
        if parent(&entry.name) == Some(dir) && is_temporary(&entry.name) {
            remove_entry(folder, &entry.name).await?;
        }
    }
    Ok(())
}

async fn remove_entry(folder: &Folder, name: &str) -> Result<(), PullError> {
    match folder.fs.remove(name).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Refuse to touch anything below a symlink.
pub(super) async fn guard_ancestors(folder: &Folder, name: &str) -> Result<(), PullError> {
    match folder.fs.symlink_in_path(name, false).await? {
        Some(link) => {
            tracing::warn!(folder = %folder.id(), %name, %link, "refusing to write below symlink");
            Err(PullError::SymlinkAncestor(link))
        }
        None => Ok(()),
    }
}

/// True for a record describing something that should exist on disk.
pub(super) fn is_live(file: &FileInfo) -> bool {
    !file.is_deleted() && !file.is_invalid()
}

/// Fail unless the disk still holds what `local` describes.
pub(super) fn check_unmodified(
    local: Option<&FileInfo>,
    disk: Option<&FileMeta>,
) -> Result<(), PullError> {
    let local = local.filter(|f| !f.is_deleted());
    let unmodified = match (local, disk) {
        (None, None) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some(local), Some(meta)) => {
            local.file_type == meta.file_type
                && (!local.is_file()
                    || (local.size == meta.size
                        && local.modified_s == meta.modified_s
                        && local.modified_ns == meta.modified_ns))
        }
    };
    if unmodified {
        Ok(())
    } else {
        Err(PullError::ModifiedLocally)
    }
}
