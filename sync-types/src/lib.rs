//! # sync-types
//!
//! Wire format and data model types for the syncmesh replication protocol.
//!
//! This crate provides the foundational types used across all syncmesh crates:
//! - [`DeviceId`], [`ShortId`] - Device identity
//! - [`VersionVector`] - Per-device counters ordering replica versions
//! - [`FileInfo`], [`BlockInfo`] - Replica state of one file
//! - [`Message`] - Protocol messages (Index, IndexUpdate, Request, Response)
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod file_info;
mod ids;
mod messages;
mod vector;

pub use error::SyncError;
pub use file_info::{BlockInfo, FileFlags, FileInfo, FileType};
pub use ids::{DeviceId, ShortId};
pub use messages::{ErrorCode, Index, IndexUpdate, Message, Request, Response};
pub use vector::{Counter, VectorOrdering, VersionVector};
