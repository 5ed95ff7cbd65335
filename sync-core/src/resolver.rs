//! Version resolution, conflict naming and rename detection.
//!
//! Every rule here is deterministic and symmetric: two replicas looking at
//! the same pair of records reach the same decision without talking to
//! each other.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use chrono::NaiveDateTime;
use sync_types::{FileInfo, ShortId, VectorOrdering};

use crate::names::{base_name, parent};

const CONFLICT_MARKER: &str = ".sync-conflict-";

/// Which replica a decision refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// This device's record.
    Local,
    /// The announcing peer's record.
    Remote,
}

/// Outcome of comparing the local and a remote record of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Same version on both sides.
    InSync,
    /// The local version dominates; nothing to pull.
    KeepLocal,
    /// The remote version dominates; pull it.
    TakeRemote,
    /// Concurrent edits with identical content; adopt `winner`'s record,
    /// no conflict copy.
    Merge {
        /// Record that becomes canonical.
        winner: Side,
    },
    /// Concurrent edits with different content; `winner` replaces the file
    /// and the loser is preserved as a conflict copy.
    Conflict {
        /// Record whose content ends up under the original name.
        winner: Side,
    },
}

/// Decide what to do about `remote` given the local record of the same name.
pub fn resolve(local: &FileInfo, remote: &FileInfo) -> Resolution {
    match local.version.compare(&remote.version) {
        VectorOrdering::Equal => Resolution::InSync,
        VectorOrdering::Newer => Resolution::KeepLocal,
        VectorOrdering::Older => Resolution::TakeRemote,
        VectorOrdering::Concurrent => {
            let winner = if wins_conflict(local, remote) {
                Side::Local
            } else {
                Side::Remote
            };
            if local.same_content(remote) {
                Resolution::Merge { winner }
            } else {
                Resolution::Conflict { winner }
            }
        }
    }
}

/// True if `a` beats the concurrent record `b`.
///
/// In order: a valid record beats an invalid one, a live record beats a
/// tombstone, the newer modification time wins, then the larger
/// `modified_by`, then the larger counter total, then the lexicographically
/// larger counter list. Concurrent vectors always differ, so exactly one of
/// `wins_conflict(a, b)` and `wins_conflict(b, a)` holds for them.
pub fn wins_conflict(a: &FileInfo, b: &FileInfo) -> bool {
    order(a, b) == Ordering::Greater
}

fn order(a: &FileInfo, b: &FileInfo) -> Ordering {
    (!a.is_invalid())
        .cmp(&!b.is_invalid())
        .then((!a.is_deleted()).cmp(&!b.is_deleted()))
        .then(a.mod_time_nanos().cmp(&b.mod_time_nanos()))
        .then(a.modified_by.cmp(&b.modified_by))
        .then(a.version.total().cmp(&b.version.total()))
        .then_with(|| counter_list(a).cmp(&counter_list(b)))
}

fn counter_list(file: &FileInfo) -> Vec<(ShortId, u64)> {
    file.version
        .counters()
        .iter()
        .map(|c| (c.id, c.value))
        .collect()
}

/// Name of the conflict copy of `name` made at `when` because of `by`.
///
/// `dir/report.txt` becomes
/// `dir/report.sync-conflict-20240102-030405-ABCDEF1.txt`.
pub fn conflict_name(name: &str, when: NaiveDateTime, by: ShortId) -> String {
    let base = base_name(name);
    let (stem, ext) = match base.rfind('.') {
        Some(idx) if idx > 0 => base.split_at(idx),
        _ => (base, ""),
    };
    let renamed = format!(
        "{stem}{CONFLICT_MARKER}{}-{by}{ext}",
        when.format("%Y%m%d-%H%M%S")
    );
    match parent(name) {
        Some(dir) => format!("{dir}/{renamed}"),
        None => renamed,
    }
}

/// True if `name` looks like a conflict copy.
pub fn is_conflict_name(name: &str) -> bool {
    base_name(name).contains(CONFLICT_MARKER)
}

/// A new name whose content already exists locally under an old name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    /// Name being deleted; its bytes are still on disk.
    pub from: String,
    /// Name being created with identical content.
    pub to: String,
}

/// Pair deletions with creations of identical content.
///
/// `deleted` holds the local records of names about to be removed, `created`
/// the records about to be pulled. Only non-empty regular files take part.
/// Each deleted name is used at most once; pairing is by name order so every
/// replica picks the same pairs.
pub fn detect_renames(deleted: &[FileInfo], created: &[FileInfo]) -> Vec<Rename> {
    let mut sources: Vec<&FileInfo> = deleted.iter().filter(|f| renameable(f)).collect();
    sources.sort_by(|a, b| a.name.cmp(&b.name));

    let mut by_content: HashMap<Vec<&[u8]>, VecDeque<&str>> = HashMap::new();
    for file in sources {
        by_content
            .entry(file.block_hashes())
            .or_default()
            .push_back(&file.name);
    }

    let mut targets: Vec<&FileInfo> = created.iter().filter(|f| renameable(f)).collect();
    targets.sort_by(|a, b| a.name.cmp(&b.name));

    let mut renames = Vec::new();
    for file in targets {
        if let Some(from) = by_content
            .get_mut(&file.block_hashes())
            .and_then(VecDeque::pop_front)
        {
            renames.push(Rename {
                from: from.to_string(),
                to: file.name.clone(),
            });
        }
    }
    renames
}

fn renameable(file: &FileInfo) -> bool {
    file.is_file() && !file.blocks.is_empty()
}
