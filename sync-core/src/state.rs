//! Pull job state machine.
//!
//! Pure, side-effect-free lifecycle of one file's pull job. The finisher in
//! `sync-engine` feeds in completion reports from the copier and puller and
//! executes the actions that come back. The copy and pull sides may report
//! in either order; the job is only committed once both have reported and
//! neither failed.

/// Per-file pull job state - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Scheduled, no worker has touched the temp file yet.
    Queued,
    /// Copier and puller are filling the temp file.
    Transferring {
        /// Copy side has reported.
        copy_done: bool,
        /// Pull side has reported.
        pull_done: bool,
        /// First failure reported by either side.
        failure: Option<String>,
    },
    /// Both sides done; the temp file is being verified and moved into place.
    Verifying,
    /// The target file matches the announced version and is indexed.
    Finalized,
    /// The job gave up; the file is still needed.
    Failed {
        /// Cause of the failure.
        error: String,
    },
}

impl JobState {
    /// Create a new job in the Queued state.
    pub fn new() -> Self {
        Self::Queued
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (the finisher)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: JobEvent) -> (Self, Vec<JobAction>) {
        match (self, event) {
            // From Queued
            (Self::Queued, JobEvent::Started) => (
                Self::Transferring {
                    copy_done: false,
                    pull_done: false,
                    failure: None,
                },
                vec![JobAction::EmitStarted],
            ),

            // From Transferring
            (
                Self::Transferring {
                    pull_done, failure, ..
                },
                JobEvent::CopyDone,
            ) => Self::side_reported(true, pull_done, failure, None),
            (
                Self::Transferring {
                    copy_done, failure, ..
                },
                JobEvent::PullDone,
            ) => Self::side_reported(copy_done, true, failure, None),
            (
                Self::Transferring {
                    pull_done, failure, ..
                },
                JobEvent::CopyFailed { error },
            ) => Self::side_reported(true, pull_done, failure, Some(error)),
            (
                Self::Transferring {
                    copy_done, failure, ..
                },
                JobEvent::PullFailed { error },
            ) => Self::side_reported(copy_done, true, failure, Some(error)),

            // From Verifying
            (Self::Verifying, JobEvent::Committed) => {
                (Self::Finalized, vec![JobAction::Finished])
            }
            (Self::Verifying, JobEvent::CommitFailed { error, keep_temp }) => {
                let release = if keep_temp {
                    JobAction::Report {
                        error: error.clone(),
                    }
                } else {
                    JobAction::Discard {
                        error: error.clone(),
                    }
                };
                (Self::Failed { error }, vec![release, JobAction::Finished])
            }

            // Failed is not sticky
            (Self::Failed { .. }, JobEvent::Requeued) => (Self::Queued, vec![]),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    fn side_reported(
        copy_done: bool,
        pull_done: bool,
        failure: Option<String>,
        new_error: Option<String>,
    ) -> (Self, Vec<JobAction>) {
        let mut actions = Vec::new();
        let failure = match (failure, new_error) {
            (Some(first), _) => Some(first),
            (None, Some(error)) => {
                // First failure stops the other side.
                actions.push(JobAction::Abort);
                Some(error)
            }
            (None, None) => None,
        };

        if !(copy_done && pull_done) {
            return (
                Self::Transferring {
                    copy_done,
                    pull_done,
                    failure,
                },
                actions,
            );
        }

        match failure {
            Some(error) => {
                actions.push(JobAction::Discard {
                    error: error.clone(),
                });
                actions.push(JobAction::Finished);
                (Self::Failed { error }, actions)
            }
            None => {
                actions.push(JobAction::Commit);
                (Self::Verifying, actions)
            }
        }
    }

    /// True once the job can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed { .. })
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events that can occur in a pull job's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Workers were handed the job.
    Started,
    /// Every copy segment was written and verified.
    CopyDone,
    /// Every pull segment was written and verified.
    PullDone,
    /// The copy side gave up.
    CopyFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The pull side gave up.
    PullFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The file was verified, renamed into place and indexed.
    Committed,
    /// Verification or finalization failed.
    CommitFailed {
        /// Error message describing the failure.
        error: String,
        /// The temp file must be kept (it may already be the target).
        keep_temp: bool,
    },
    /// The next scheduler cycle still needs the file.
    Requeued,
}

/// Actions to be executed by the finisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    /// Emit an item-started event.
    EmitStarted,
    /// Cancel the job's token so the other side stops writing.
    Abort,
    /// Verify the temp file and move it into place.
    Commit,
    /// Remove the temp file and raise a folder error.
    Discard {
        /// Cause to report.
        error: String,
    },
    /// Raise a folder error, leaving the temp file where it is.
    Report {
        /// Cause to report.
        error: String,
    },
    /// Emit an item-finished event and forget the job.
    Finished,
}
