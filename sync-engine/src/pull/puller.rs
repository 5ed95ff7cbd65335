//! Puller: fetches blocks from peers.

use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use sync_core::verify_block;
use sync_types::{BlockInfo, Request};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use super::{Completion, PullJob};
use crate::error::PullError;
use crate::folder::Folder;

/// Dispatcher: runs up to `width` jobs at a time. Requests across all jobs
/// share the `requests` permits.
pub(super) async fn run(
    folder: Arc<Folder>,
    mut jobs: mpsc::Receiver<Arc<PullJob>>,
    done: mpsc::Sender<Completion>,
    requests: Arc<Semaphore>,
    width: usize,
) {
    let mut running = JoinSet::new();
    while let Some(job) = jobs.recv().await {
        while running.len() >= width {
            if let Some(Err(e)) = running.join_next().await {
                tracing::error!(folder = %folder.id(), error = %e, "pull task failed");
            }
        }
        let folder = Arc::clone(&folder);
        let done = done.clone();
        let requests = Arc::clone(&requests);
        running.spawn(async move {
            let result = pull_job(&folder, &job, &requests).await;
            if let Err(e) = &result {
                tracing::debug!(folder = %folder.id(), name = %job.name(), error = %e, "pull side failed");
            }
            let completion = Completion::Pulled {
                name: job.name().to_string(),
                result,
            };
            if done.send(completion).await.is_err() {
                tracing::debug!(folder = %folder.id(), name = %job.name(), "finisher gone, dropping pull result");
            }
        });
    }
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            tracing::error!(folder = %folder.id(), error = %e, "pull task failed");
        }
    }
}

/// Fetch every pull block of `job`, several requests in flight at once.
///
/// The first block that cannot be fetched fails the job; requests still
/// in flight are dropped.
pub(super) async fn pull_job(
    folder: &Folder,
    job: &PullJob,
    requests: &Semaphore,
) -> Result<(), PullError> {
    let mut pending: FuturesUnordered<_> = job
        .pull
        .iter()
        .map(|block| fetch_block(folder, job, block, requests))
        .collect();
    while let Some(result) = pending.next().await {
        result?;
    }
    Ok(())
}

/// Request `block` from each device that has it until one answers with
/// bytes that verify, and write them into the temp file.
pub(super) async fn fetch_block(
    folder: &Folder,
    job: &PullJob,
    block: &BlockInfo,
    requests: &Semaphore,
) -> Result<(), PullError> {
    let _permit = tokio::select! {
        biased;
        _ = job.token.cancelled() => return Err(PullError::Cancelled),
        permit = requests.acquire() => permit.map_err(|_| PullError::Cancelled)?,
    };

    for device in &job.availability {
        let Some(connection) = folder.peers.get(device) else {
            continue;
        };
        let request = Request {
            id: folder.next_request_id(),
            folder: folder.id().to_string(),
            name: job.name().to_string(),
            offset: block.offset,
            size: block.size,
            hash: block.hash.clone(),
            weak_hash: block.weak_hash,
            from_temporary: false,
        };
        let response = tokio::select! {
            biased;
            _ = job.token.cancelled() => return Err(PullError::Cancelled),
            response = connection.request(request) => response,
        };
        match response {
            Ok(data) if verify_block(block, &data) => {
                if job.token.is_cancelled() {
                    return Err(PullError::Cancelled);
                }
                job.temp.write_block(block, &data).await?;
                return Ok(());
            }
            Ok(_) => {
                tracing::warn!(
                    folder = %folder.id(),
                    name = %job.name(),
                    %device,
                    offset = block.offset,
                    "block failed verification, trying next device"
                );
            }
            Err(e) => {
                tracing::debug!(
                    folder = %folder.id(),
                    name = %job.name(),
                    %device,
                    offset = block.offset,
                    error = %e,
                    "block request failed"
                );
            }
        }
    }

    Err(PullError::NoSource {
        offset: block.offset,
    })
}
