//! Copier: fills blocks from bytes already on the local disk.

use std::sync::Arc;

use sync_core::verify_block;
use sync_types::BlockInfo;
use tokio::sync::{mpsc, Mutex, Semaphore};

use super::{puller, Completion, PullJob};
use crate::error::PullError;
use crate::folder::Folder;

/// Worker loop; several workers share one queue.
pub(super) async fn run(
    folder: Arc<Folder>,
    jobs: Arc<Mutex<mpsc::Receiver<Arc<PullJob>>>>,
    done: mpsc::Sender<Completion>,
    requests: Arc<Semaphore>,
) {
    loop {
        let next = jobs.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };
        let result = copy_job(&folder, &job, &requests).await;
        if let Err(e) = &result {
            tracing::debug!(folder = %folder.id(), name = %job.name(), error = %e, "copy side failed");
        }
        let completion = Completion::Copied {
            name: job.name().to_string(),
            result,
        };
        if done.send(completion).await.is_err() {
            break;
        }
    }
}

/// Fill every copy block of `job`, falling back to the network for blocks
/// whose local source turned out to be gone or changed.
pub(super) async fn copy_job(
    folder: &Folder,
    job: &PullJob,
    requests: &Semaphore,
) -> Result<(), PullError> {
    for block in &job.copy {
        if job.token.is_cancelled() {
            return Err(PullError::Cancelled);
        }
        if copy_block(folder, job, block).await? {
            continue;
        }
        tracing::debug!(
            folder = %folder.id(),
            name = %job.name(),
            offset = block.offset,
            "no local source for block, fetching"
        );
        puller::fetch_block(folder, job, block, requests).await?;
    }
    Ok(())
}

/// Candidate places on disk for `block`, best first.
fn sources(job: &PullJob, block: &BlockInfo) -> Vec<(String, i64)> {
    let mut found: Vec<(String, i64)> = Vec::new();
    if let Some(from) = &job.rename_from {
        found.push((from.clone(), block.offset));
    }
    found.push((job.name().to_string(), block.offset));
    for location in job.index.candidates(block) {
        found.push((location.name.clone(), location.offset));
    }
    let mut seen = std::collections::HashSet::new();
    found.retain(|source| seen.insert(source.clone()));
    found
}

/// Copy `block` from the first local source whose bytes verify.
///
/// Returns false when no source had the content.
async fn copy_block(folder: &Folder, job: &PullJob, block: &BlockInfo) -> Result<bool, PullError> {
    let Ok(size) = usize::try_from(block.size) else {
        return Ok(false);
    };
    for (name, offset) in sources(job, block) {
        if job.token.is_cancelled() {
            return Err(PullError::Cancelled);
        }
        if !matches!(folder.fs.symlink_in_path(&name, true).await, Ok(None)) {
            continue;
        }
        let Ok(data) = folder.fs.read_at(&name, offset, size).await else {
            continue;
        };
        if !verify_block(block, &data) {
            continue;
        }
        if job.token.is_cancelled() {
            return Err(PullError::Cancelled);
        }
        job.temp.write_block(block, &data).await?;
        return Ok(true);
    }
    Ok(false)
}
