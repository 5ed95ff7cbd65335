//! # sync-core
//!
//! Pure logic for syncmesh (no I/O, instant tests).
//!
//! This crate implements the algorithms of the synchronization engine
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects:
//! - [`blocks`]: chunking, weak/strong block hashes, positional block diff
//! - [`block_index`]: weak-hash index for locating local copies of blocks
//! - [`resolver`]: version comparison, conflict policy, rename detection
//! - [`names`] and [`tempname`]: path validation and temp file naming
//! - [`state`]: per-file pull job state machine
//! - [`tracker`]: folder change short-circuit
//!
//! The actual I/O (disk, network) is performed by `sync-engine`, which
//! interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block_index;
pub mod blocks;
pub mod names;
pub mod resolver;
pub mod state;
pub mod tempname;
pub mod tracker;

pub use block_index::{BlockIndex, BlockLocation};
pub use blocks::{
    block_size, check_layout, diff_blocks, hash_block, hash_blocks, strong_hash, verify_block,
    weak_hash, BlockDiff, LayoutError, Segment, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
pub use names::{validate_name, NameError, INTERNAL_DIR};
pub use resolver::{
    conflict_name, detect_renames, is_conflict_name, resolve, wins_conflict, Rename, Resolution,
    Side,
};
pub use state::{JobAction, JobEvent, JobState};
pub use tempname::{is_temporary, temp_name, temp_name_for, TEMP_PREFIX};
pub use tracker::ChangeTracker;
