//! Finisher: commits completed jobs.
//!
//! Feeds the copier's and puller's reports into each job's [`JobState`]
//! and carries out the actions it returns. Commits are serialized with
//! scans through the folder's disk lock, so a scan never sees a replaced
//! file before its record is indexed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use sync_core::{conflict_name, JobAction, JobEvent, JobState};
use sync_types::FileType;
use tokio::sync::mpsc;

use super::queuer::{check_unmodified, guard_ancestors, is_live};
use super::{Completion, PullJob};
use crate::error::PullError;
use crate::events::{self, Event, ItemAction};
use crate::folder::Folder;

/// Tally of one cycle's finished jobs.
#[derive(Debug, Default)]
pub(super) struct Outcome {
    pub succeeded: usize,
    pub failed: usize,
    /// Names to rescan once the cycle ends.
    pub rescan: Vec<String>,
}

struct Entry {
    state: JobState,
    job: Arc<PullJob>,
}

/// Consume completions until every sender is gone.
pub(super) async fn run(folder: Arc<Folder>, mut done: mpsc::Receiver<Completion>) -> Outcome {
    let mut jobs: HashMap<String, Entry> = HashMap::new();
    let mut outcome = Outcome::default();

    while let Some(completion) = done.recv().await {
        let (name, event) = match completion {
            Completion::Started(job) => {
                let name = job.name().to_string();
                jobs.insert(
                    name.clone(),
                    Entry {
                        state: JobState::new(),
                        job,
                    },
                );
                (name, JobEvent::Started)
            }
            Completion::Copied { name, result } => {
                let event = match result {
                    Ok(()) => JobEvent::CopyDone,
                    Err(e) => JobEvent::CopyFailed {
                        error: e.to_string(),
                    },
                };
                (name, event)
            }
            Completion::Pulled { name, result } => {
                let event = match result {
                    Ok(()) => JobEvent::PullDone,
                    Err(e) => JobEvent::PullFailed {
                        error: e.to_string(),
                    },
                };
                (name, event)
            }
        };
        drive(&folder, &mut jobs, &name, event, &mut outcome).await;
    }

    // A worker died without reporting; the file stays needed.
    for (name, entry) in jobs.drain() {
        tracing::error!(folder = %folder.id(), %name, state = ?entry.state, "job never completed");
        entry.job.token.cancel();
        folder.inflight.finish(&name, entry.job.temp.name());
        outcome.failed += 1;
    }
    outcome
}

async fn drive(
    folder: &Folder,
    jobs: &mut HashMap<String, Entry>,
    name: &str,
    event: JobEvent,
    outcome: &mut Outcome,
) {
    let mut queue = VecDeque::from([event]);
    while let Some(event) = queue.pop_front() {
        let Some(entry) = jobs.get_mut(name) else {
            return;
        };
        let (state, actions) = std::mem::take(&mut entry.state).on_event(event);
        entry.state = state.clone();
        let job = Arc::clone(&entry.job);

        for action in actions {
            match action {
                JobAction::EmitStarted => {
                    folder.events.emit(Event::ItemStarted(events::ItemStarted {
                        folder: folder.id().to_string(),
                        name: name.to_string(),
                        action: ItemAction::Update,
                    }));
                }
                JobAction::Abort => job.token.cancel(),
                JobAction::Commit => match commit(folder, &job).await {
                    Ok(conflict) => {
                        outcome.rescan.extend(conflict);
                        queue.push_back(JobEvent::Committed);
                    }
                    Err(e) => {
                        if matches!(e, PullError::ModifiedLocally) {
                            outcome.rescan.push(name.to_string());
                        }
                        queue.push_back(JobEvent::CommitFailed {
                            error: e.to_string(),
                            keep_temp: e.keeps_temp(),
                        });
                    }
                },
                JobAction::Discard { error } => {
                    if let Err(e) = job.temp.remove().await {
                        tracing::warn!(folder = %folder.id(), temp = %job.temp.name(), error = %e, "removing temp file");
                    }
                    folder.report(Some(name), &error);
                }
                JobAction::Report { error } => folder.report(Some(name), &error),
                JobAction::Finished => {
                    folder.inflight.finish(name, job.temp.name());
                    let error = match &state {
                        JobState::Failed { error } => Some(error.clone()),
                        _ => None,
                    };
                    if error.is_some() {
                        outcome.failed += 1;
                    } else {
                        outcome.succeeded += 1;
                    }
                    folder.events.emit(Event::ItemFinished(events::ItemFinished {
                        folder: folder.id().to_string(),
                        name: name.to_string(),
                        action: ItemAction::Update,
                        error,
                    }));
                }
            }
        }

        if state.is_terminal() {
            jobs.remove(name);
            return;
        }
    }
}

/// Verify the temp file and move it into place.
///
/// Returns the name of the conflict copy made of the local content, if
/// any.
async fn commit(folder: &Folder, job: &PullJob) -> Result<Option<String>, PullError> {
    let name = job.name();
    let fs = &folder.fs;
    guard_ancestors(folder, name).await?;
    job.temp
        .verify(&job.target.blocks)
        .await
        .map_err(|offset| PullError::VerifyFailed { offset })?;

    let _disk = folder.disk_lock.lock().await;

    let current = folder.index.local(name).await?;
    let expected = job.local.as_ref().map(|f| &f.version);
    if current.as_ref().map(|f| &f.version) != expected {
        return Err(PullError::ModifiedLocally);
    }
    let on_disk = fs.lstat(name).await?;
    check_unmodified(job.local.as_ref(), on_disk.as_ref())?;

    let mut conflict = None;
    if let (Some(local), Some(meta)) = (job.local.as_ref().filter(|f| is_live(f)), &on_disk) {
        if meta.file_type == FileType::Directory {
            if fs.walk(Some(name)).await?.len() > 1 {
                return Err(PullError::DirectoryNotEmpty);
            }
            fs.remove(name).await?;
        } else if local.version.concurrent(&job.target.version) && !local.same_content(&job.target)
        {
            let copy = conflict_name(name, chrono::Local::now().naive_local(), local.modified_by);
            fs.rename(name, &copy).await?;
            tracing::info!(folder = %folder.id(), %name, conflict = %copy, "concurrent edit preserved as conflict copy");
            conflict = Some(copy);
        } else {
            folder.versioner.archive(fs.as_ref(), name).await?;
        }
    }

    fs.sync(job.temp.name()).await?;
    fs.rename(job.temp.name(), name).await?;
    if cfg!(unix) {
        fs.set_permissions(name, job.target.permissions).await?;
    }
    fs.set_mtime(name, job.target.modified_s, job.target.modified_ns)
        .await?;

    folder.commit_pulled(job.target.clone()).await?;
    tracing::debug!(folder = %folder.id(), %name, "file committed");
    Ok(conflict)
}
