//! One shared folder and its background loop.
//!
//! A [`Folder`] owns the collaborators of one folder (filesystem, ignore
//! predicate, versioner, index view) and exposes the operations the model
//! dispatches to: scan, pull cycle, remote index handling and request
//! serving.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use sync_core::{check_layout, validate_name, ChangeTracker, NameError};
use sync_types::{DeviceId, FileFlags, FileInfo, Request, ShortId};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, FolderConfig};
use crate::error::{EngineError, IndexError, RequestError};
use crate::events::{self, Event, EventSink, FolderState};
use crate::fs::{BasicFilesystem, Filesystem};
use crate::ignore::{IgnoreMatcher, NoIgnores};
use crate::index::{FolderIndex, IndexStore};
use crate::pull::{self, PullSummary};
use crate::request;
use crate::scanner;
use crate::temp::InFlight;
use crate::transport::Peers;
use crate::versioner::{versioner_for, Versioner};

/// A folder shared with a set of devices.
pub struct Folder {
    config: FolderConfig,
    members: Vec<DeviceId>,
    short: ShortId,
    pub(crate) fs: Arc<dyn Filesystem>,
    pub(crate) ignores: Arc<dyn IgnoreMatcher>,
    pub(crate) versioner: Arc<dyn Versioner>,
    pub(crate) index: FolderIndex,
    pub(crate) inflight: InFlight,
    pub(crate) events: EventSink,
    pub(crate) peers: Peers,
    /// Serializes scans with pull commits so neither works from a stale
    /// view of the other's disk changes.
    pub(crate) disk_lock: Mutex<()>,
    next_request: AtomicU32,
    state: StdMutex<FolderState>,
}

impl Folder {
    /// Folder backed by the local disk at `config.path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn new(
        config: FolderConfig,
        local: DeviceId,
        store: Arc<dyn IndexStore>,
        peers: Peers,
        events: EventSink,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let members = config.device_ids()?;
        Ok(Self {
            members,
            short: local.short(),
            fs: Arc::new(BasicFilesystem::new(&config.path)),
            ignores: Arc::new(NoIgnores),
            versioner: Arc::from(versioner_for(config.versioning)),
            index: FolderIndex::new(config.id.clone(), local, store),
            inflight: InFlight::new(),
            events,
            peers,
            disk_lock: Mutex::new(()),
            next_request: AtomicU32::new(1),
            state: StdMutex::new(FolderState::Idle),
            config,
        })
    }

    /// Replace the filesystem backend.
    pub fn with_filesystem(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Replace the ignore predicate.
    pub fn with_ignores(mut self, ignores: Arc<dyn IgnoreMatcher>) -> Self {
        self.ignores = ignores;
        self
    }

    /// Replace the versioning backend.
    pub fn with_versioner(mut self, versioner: Arc<dyn Versioner>) -> Self {
        self.versioner = versioner;
        self
    }

    /// Folder ID.
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Folder configuration.
    pub fn config(&self) -> &FolderConfig {
        &self.config
    }

    /// Devices the folder is shared with.
    pub fn members(&self) -> &[DeviceId] {
        &self.members
    }

    /// True if the folder is shared with `device`.
    pub fn is_member(&self, device: &DeviceId) -> bool {
        self.members.contains(device)
    }

    /// Short ID of the local device, the counter bumped by local edits.
    pub fn short_id(&self) -> ShortId {
        self.short
    }

    /// Index view of this folder.
    pub fn index(&self) -> &FolderIndex {
        &self.index
    }

    /// Current activity state.
    pub fn state(&self) -> FolderState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, to: FolderState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            tracing::debug!(folder = %self.id(), ?from, ?to, "folder state changed");
            self.events.emit(Event::StateChanged(events::StateChanged {
                folder: self.id().to_string(),
                from,
                to,
            }));
        }
    }

    pub(crate) fn next_request_id(&self) -> u32 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// Log and publish a failure.
    pub(crate) fn report(&self, name: Option<&str>, error: &dyn fmt::Display) {
        tracing::warn!(folder = %self.id(), name = name.unwrap_or(""), error = %error, "folder error");
        self.events.emit(Event::FolderError(events::FolderError {
            folder: self.id().to_string(),
            name: name.map(str::to_string),
            error: error.to_string(),
        }));
    }

    /// Walk the folder (or only `subdirs`) and record local changes.
    ///
    /// Returns the records that changed.
    pub async fn scan(&self, subdirs: &[String]) -> Result<Vec<FileInfo>, EngineError> {
        scanner::scan(self, subdirs).await
    }

    /// Run one pull cycle.
    pub async fn pull(self: &Arc<Self>) -> Result<PullSummary, EngineError> {
        pull::run_cycle(self).await
    }

    /// Answer a peer's block request.
    pub async fn serve(&self, device: &DeviceId, request: &Request) -> Result<Vec<u8>, RequestError> {
        request::serve(self, device, request).await
    }

    /// Store records announced by `device`.
    ///
    /// Names that fail validation are dropped; temp file names and files
    /// whose blocks do not tile their size are kept but marked invalid so
    /// they are never pulled. A newer version of a name with an in-flight
    /// job cancels that job.
    pub async fn on_remote_index(
        &self,
        device: &DeviceId,
        files: Vec<FileInfo>,
        full: bool,
    ) -> Result<(), EngineError> {
        if !self.is_member(device) {
            return Err(EngineError::NotShared {
                folder: self.id().to_string(),
                device: *device,
            });
        }

        let mut accepted = Vec::with_capacity(files.len());
        for mut file in files {
            match validate_name(&file.name) {
                Ok(()) => {}
                Err(NameError::Temporary(_)) => file.flags.invalid = true,
                Err(e) => {
                    tracing::warn!(folder = %self.id(), %device, error = %e, "dropping invalid name");
                    continue;
                }
            }
            if file.is_file() && !file.is_deleted() {
                if let Err(e) = check_layout(file.size, &file.blocks) {
                    tracing::warn!(folder = %self.id(), %device, name = %file.name, error = %e, "inconsistent block list");
                    file.flags.invalid = true;
                }
            }
            if !file.is_invalid() && self.inflight.supersede(&file.name, &file.version) {
                tracing::debug!(folder = %self.id(), name = %file.name, "in-flight pull superseded");
            }
            accepted.push(file);
        }

        let items = accepted.len();
        self.index.update_remote(device, accepted, full).await?;
        tracing::debug!(folder = %self.id(), %device, items, full, "remote index updated");
        self.events.emit(Event::RemoteIndexUpdated(events::RemoteIndexUpdated {
            folder: self.id().to_string(),
            device: *device,
            items,
        }));
        Ok(())
    }

    /// Commit local records, announce them and publish the change.
    pub(crate) async fn commit_local(&self, files: Vec<FileInfo>) -> Result<Vec<FileInfo>, IndexError> {
        if files.is_empty() {
            return Ok(files);
        }
        let committed = self.index.commit_local(files).await?;
        self.peers
            .announce(self.id(), &self.members, &committed)
            .await;
        self.events.emit(Event::LocalIndexUpdated(events::LocalIndexUpdated {
            folder: self.id().to_string(),
            names: committed.iter().map(|f| f.name.clone()).collect(),
        }));
        Ok(committed)
    }

    /// Adopt a pulled record as the local one, verbatim apart from local flags.
    pub(crate) async fn commit_pulled(&self, mut file: FileInfo) -> Result<FileInfo, IndexError> {
        file.flags = FileFlags {
            deleted: file.flags.deleted,
            ..FileFlags::default()
        };
        let mut committed = self.commit_local(vec![file]).await?;
        committed
            .pop()
            .ok_or_else(|| IndexError::Backend("commit returned no record".into()))
    }

    /// Run the pull and scan loops until `cancel` fires.
    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                folder = %self.id(),
                pull_interval_ms = self.config.pull_interval_ms,
                "folder started"
            );

            if let Err(e) = self.scan(&[]).await {
                self.report(None, &e);
                self.set_state(FolderState::Error);
            }

            let mut tracker = ChangeTracker::new();
            let mut pull_timer = interval(self.config.pull_interval());
            pull_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let scan_every = self.config.scan_interval();
            let mut scan_timer = interval(scan_every.unwrap_or(Duration::from_secs(3600)));
            scan_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            scan_timer.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = pull_timer.tick() => self.pull_if_changed(&mut tracker).await,
                    _ = scan_timer.tick(), if scan_every.is_some() => {
                        if let Err(e) = self.scan(&[]).await {
                            self.report(None, &e);
                        }
                    }
                }
            }

            self.inflight.cancel_all();
            tracing::info!(folder = %self.id(), "folder stopped");
        })
    }

    async fn pull_if_changed(self: &Arc<Self>, tracker: &mut ChangeTracker) {
        let counter = match self.index.change_counter().await {
            Ok(counter) => counter,
            Err(e) => {
                self.report(None, &e);
                return;
            }
        };
        if !tracker.changed(counter) {
            tracing::trace!(folder = %self.id(), "no index changes, skipping pull");
            return;
        }

        match self.pull().await {
            Ok(summary) if summary.failed > 0 => {
                tracing::info!(folder = %self.id(), failed = summary.failed, "pull cycle left work undone");
                tracker.reset();
            }
            Ok(summary) => {
                if summary.needed > 0 {
                    tracing::info!(folder = %self.id(), pulled = summary.succeeded, "pull cycle complete");
                }
            }
            Err(e) => {
                self.report(None, &e);
                self.set_state(FolderState::Error);
                tracker.reset();
            }
        }
    }
}

impl fmt::Debug for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Folder")
            .field("id", &self.config.id)
            .field("path", &self.config.path)
            .field("members", &self.members.len())
            .finish()
    }
}
