//! Pull pipeline.
//!
//! One cycle per folder tick:
//!
//! ```text
//! queuer ──copy jobs──► copier (N=copiers) ──┐
//!    │                                        ├──► finisher
//!    └────pull jobs──► puller (N=pullers) ───┘
//! ```
//!
//! Both job queues are bounded, so a slow copier or puller stalls the
//! queuer rather than letting work pile up. The copy and pull side of a
//! job share its temp file and its cancellation token and write disjoint
//! blocks; the finisher commits once both sides have reported.

mod copier;
mod finisher;
mod puller;
mod queuer;

use std::sync::Arc;

use sync_core::BlockIndex;
use sync_types::{BlockInfo, DeviceId, FileInfo};
use tokio_util::sync::CancellationToken;

use crate::error::PullError;
use crate::temp::TempFile;

pub(crate) use queuer::run_cycle;

/// Outcome counts of one pull cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    /// Names the index said were needed.
    pub needed: usize,
    /// Names brought up to date.
    pub succeeded: usize,
    /// Names that are still needed.
    pub failed: usize,
}

/// One file's transfer, shared by its copy and pull side.
#[derive(Debug)]
pub(crate) struct PullJob {
    /// Record being pulled.
    pub target: FileInfo,
    /// Local record the job started from.
    pub local: Option<FileInfo>,
    pub temp: TempFile,
    /// Blocks to fill from local files.
    pub copy: Vec<BlockInfo>,
    /// Blocks to request from peers.
    pub pull: Vec<BlockInfo>,
    /// Old name of a detected rename; its bytes are tried first.
    pub rename_from: Option<String>,
    /// Devices announcing exactly the target version.
    pub availability: Vec<DeviceId>,
    pub token: CancellationToken,
    pub index: Arc<BlockIndex>,
}

impl PullJob {
    pub fn name(&self) -> &str {
        &self.target.name
    }
}

/// Reports flowing into the finisher.
#[derive(Debug)]
pub(crate) enum Completion {
    Started(Arc<PullJob>),
    Copied {
        name: String,
        result: Result<(), PullError>,
    },
    Pulled {
        name: String,
        result: Result<(), PullError>,
    },
}
