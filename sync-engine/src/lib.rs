//! # sync-engine
//!
//! Synchronization engine for syncmesh.
//!
//! Turns "a remote device announced a new file version" into "the local
//! file on disk matches it", and answers peers' requests for file content.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────── Model ─────────────┐
//!  Connection ─┤ Index / IndexUpdate / Request  │
//!              └──────┬──────────────┬──────────┘
//!                     │              │
//!                 Folder          request handler
//!          ┌──────────┼──────────┐
//!       scanner    queuer    (index, fs, versioner)
//!                     │
//!           copier ∥ puller ──► finisher
//! ```
//!
//! The pure decisions (block diff, version resolution, job state) live in
//! `sync-core`; this crate performs the I/O they call for. Every external
//! collaborator sits behind a trait so tests can swap it out:
//! - [`Filesystem`] with [`BasicFilesystem`]
//! - [`IndexStore`] with [`MemoryIndex`]
//! - [`Connection`] with [`MockConnection`]
//! - [`IgnoreMatcher`] and [`Versioner`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod folder;
pub mod fs;
pub mod ignore;
pub mod index;
pub mod model;
pub mod pull;
pub mod request;
pub mod scanner;
pub mod temp;
pub mod transport;
pub mod versioner;

#[cfg(test)]
mod testutil;

pub use config::{ConfigError, DeviceConfig, EngineConfig, FolderConfig, VersioningKind};
pub use error::{EngineError, IndexError, PullError, RequestError};
pub use events::{Event, EventSink, FolderState, Subscription};
pub use folder::Folder;
pub use fs::{BasicFilesystem, FileMeta, Filesystem};
pub use ignore::{IgnoreMatcher, NoIgnores};
pub use index::{FolderIndex, IndexStore, MemoryIndex, NeededFile};
pub use model::Model;
pub use pull::PullSummary;
pub use transport::{Connection, MockConnection, Peers, TransportError};
pub use versioner::{NoVersioning, TrashCan, Versioner};
