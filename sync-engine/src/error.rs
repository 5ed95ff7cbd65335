//! Error types for sync-engine.

use std::io;

use sync_core::NameError;
use sync_types::{DeviceId, ErrorCode};
use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Index store error.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Serving a request failed.
    #[error("request error: {0}")]
    Request(#[from] RequestError),

    /// A pull job failed.
    #[error("pull error: {0}")]
    Pull(#[from] PullError),

    /// Connection error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No folder with this ID is configured.
    #[error("unknown folder: {0}")]
    UnknownFolder(String),

    /// The device is not a member of the folder.
    #[error("folder {folder} is not shared with {device}")]
    NotShared {
        /// Folder ID.
        folder: String,
        /// Offending device.
        device: DeviceId,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures of the serving side, one per protocol outcome.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Unspecified failure.
    #[error("{0}")]
    Generic(String),

    /// The file does not exist here.
    #[error("no such file: {0}")]
    NoSuchFile(String),

    /// The file exists but is ignored, invalid or not a valid name.
    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// The path crosses a symlink.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The bytes on disk no longer match the requested block.
    #[error("hash mismatch: {name} at offset {offset}")]
    HashMismatch {
        /// File name.
        name: String,
        /// Requested offset.
        offset: i64,
    },

    /// I/O error while reading.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RequestError {
    /// Protocol error code sent back to the requester.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoSuchFile(_) => ErrorCode::NoSuchFile,
            Self::InvalidFile(_) | Self::PermissionDenied(_) => ErrorCode::InvalidFile,
            Self::Generic(_) | Self::HashMismatch { .. } | Self::Io(_) => ErrorCode::Generic,
        }
    }
}

/// Reasons a single file's pull job fails.
///
/// None of these stop the folder; the file stays needed and is retried on
/// the next cycle.
#[derive(Debug, Error)]
pub enum PullError {
    /// The job's token was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// No local copy or connected device produced a verified block.
    #[error("no source for block at offset {offset}")]
    NoSource {
        /// Block offset.
        offset: i64,
    },

    /// The finished temp file does not match the announced blocks.
    #[error("temp file failed verification at offset {offset}")]
    VerifyFailed {
        /// First bad block.
        offset: i64,
    },

    /// A parent directory of the target is a symlink.
    #[error("path crosses symlink {0}")]
    SymlinkAncestor(String),

    /// The file on disk changed since it was last scanned.
    #[error("file modified locally")]
    ModifiedLocally,

    /// Directory still has entries we do not know about.
    #[error("directory not empty")]
    DirectoryNotEmpty,

    /// The platform cannot represent this entry.
    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),

    /// The name failed validation.
    #[error("invalid name: {0}")]
    Name(#[from] NameError),

    /// Writing the local index failed.
    #[error("index write failed: {0}")]
    Index(#[from] IndexError),

    /// Disk I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PullError {
    /// True if the temp file must survive this failure.
    ///
    /// An index failure happens after the temp file has been moved into
    /// place, so there is nothing left to remove.
    pub fn keeps_temp(&self) -> bool {
        matches!(self, Self::Index(_))
    }
}

/// Index store errors.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The backend rejected the operation.
    #[error("index backend: {0}")]
    Backend(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_errors_map_to_protocol_codes() {
        assert_eq!(RequestError::NoSuchFile("a".into()).code(), ErrorCode::NoSuchFile);
        assert_eq!(RequestError::InvalidFile("a".into()).code(), ErrorCode::InvalidFile);
        assert_eq!(
            RequestError::PermissionDenied("a".into()).code(),
            ErrorCode::InvalidFile
        );
        assert_eq!(
            RequestError::HashMismatch {
                name: "a".into(),
                offset: 0
            }
            .code(),
            ErrorCode::Generic
        );
    }

    #[test]
    fn only_index_failures_keep_temp() {
        assert!(PullError::Index(IndexError::Backend("x".into())).keeps_temp());
        assert!(!PullError::Cancelled.keeps_temp());
        assert!(!PullError::VerifyFailed { offset: 0 }.keeps_temp());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineError>();
    }
}
