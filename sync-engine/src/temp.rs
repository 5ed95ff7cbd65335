//! Temp files of in-progress pulls.
//!
//! A [`TempFile`] is shared by exactly the copier and puller working on one
//! job; each writes only its own blocks. [`InFlight`] tracks which names
//! currently have a job, so the request handler can serve from a temp file
//! and a newer announcement can cancel a stale job.

use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use sync_core::verify_block;
use sync_types::{BlockInfo, VectorOrdering, VersionVector};
use tokio_util::sync::CancellationToken;

use crate::fs::Filesystem;

/// Hidden sibling file a job assembles content in.
#[derive(Clone)]
pub struct TempFile {
    fs: Arc<dyn Filesystem>,
    name: String,
}

impl TempFile {
    /// Open (or reuse) the temp file `name` and size it to `size` bytes.
    pub async fn open(fs: Arc<dyn Filesystem>, name: String, size: i64) -> io::Result<Self> {
        fs.create_file(&name, size).await?;
        Ok(Self { fs, name })
    }

    /// Name relative to the folder root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write the content of `block`.
    pub async fn write_block(&self, block: &BlockInfo, data: &[u8]) -> io::Result<()> {
        self.fs.write_at(&self.name, block.offset, data).await
    }

    /// Read `size` bytes at `offset`.
    pub async fn read_at(&self, offset: i64, size: usize) -> io::Result<Vec<u8>> {
        self.fs.read_at(&self.name, offset, size).await
    }

    /// True if the temp file already holds the verified content of `block`.
    ///
    /// Lets a pull resume from a temp file an earlier attempt left behind.
    pub async fn has_block(&self, block: &BlockInfo) -> bool {
        let Ok(size) = usize::try_from(block.size) else {
            return false;
        };
        match self.read_at(block.offset, size).await {
            Ok(data) => verify_block(block, &data),
            Err(_) => false,
        }
    }

    /// Check every block; returns the offset of the first bad one.
    pub async fn verify(&self, blocks: &[BlockInfo]) -> Result<(), i64> {
        for block in blocks {
            if !self.has_block(block).await {
                return Err(block.offset);
            }
        }
        Ok(())
    }

    /// Delete the temp file. A missing file is not an error.
    pub async fn remove(&self) -> io::Result<()> {
        match self.fs.remove(&self.name).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for TempFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempFile").field("name", &self.name).finish()
    }
}

/// A job currently pulling a name.
#[derive(Debug, Clone)]
pub struct InFlightJob {
    /// Version being pulled.
    pub version: VersionVector,
    /// Temp file name.
    pub temp: String,
    /// Job cancellation.
    pub token: CancellationToken,
}

/// Registry of in-flight jobs by target name.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    jobs: Arc<DashMap<String, InFlightJob>>,
}

impl InFlight {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `name` is being pulled.
    pub fn register(&self, name: &str, job: InFlightJob) {
        self.jobs.insert(name.to_string(), job);
    }

    /// Forget the job for `name` if it still pulls into `temp`.
    pub fn finish(&self, name: &str, temp: &str) {
        self.jobs.remove_if(name, |_, job| job.temp == temp);
    }

    /// Job for `name`, if any.
    pub fn get(&self, name: &str) -> Option<InFlightJob> {
        self.jobs.get(name).map(|job| job.value().clone())
    }

    /// Cancel the job for `name` if `version` supersedes what it pulls.
    ///
    /// Returns true if a job was cancelled.
    pub fn supersede(&self, name: &str, version: &VersionVector) -> bool {
        let Some(job) = self.get(name) else {
            return false;
        };
        if version.compare(&job.version) != VectorOrdering::Newer {
            return false;
        }
        job.token.cancel();
        true
    }

    /// Cancel every job.
    pub fn cancel_all(&self) {
        for job in self.jobs.iter() {
            job.token.cancel();
        }
    }

    /// Number of in-flight jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// True if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
