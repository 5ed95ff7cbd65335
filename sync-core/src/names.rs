//! File name validation and path helpers.
//!
//! Names are slash-separated paths relative to a folder root. Anything a
//! peer sends is validated here before it reaches the filesystem layer.

use thiserror::Error;

use crate::tempname::is_temporary;

/// Directory inside each folder reserved for engine state (trash, etc).
pub const INTERNAL_DIR: &str = ".syncmesh";

/// Reasons a file name is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    /// The name is empty.
    #[error("empty name")]
    Empty,

    /// The name is absolute.
    #[error("absolute path: {0}")]
    Absolute(String),

    /// The name contains `..`, `.` or an empty component.
    #[error("non-canonical path component in {0}")]
    BadComponent(String),

    /// The name contains a NUL or backslash.
    #[error("invalid character in {0}")]
    BadCharacter(String),

    /// The name refers to an engine temp file.
    #[error("temporary file name: {0}")]
    Temporary(String),

    /// The name lies inside the engine's internal directory.
    #[error("internal path: {0}")]
    Internal(String),
}

/// Check that `name` is a canonical relative path we are willing to touch.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.starts_with('/') || has_drive_prefix(name) {
        return Err(NameError::Absolute(name.to_string()));
    }
    if name.contains('\0') || name.contains('\\') {
        return Err(NameError::BadCharacter(name.to_string()));
    }
    if name
        .split('/')
        .any(|c| c.is_empty() || c == "." || c == "..")
    {
        return Err(NameError::BadComponent(name.to_string()));
    }
    if name == INTERNAL_DIR || name.starts_with(&format!("{INTERNAL_DIR}/")) {
        return Err(NameError::Internal(name.to_string()));
    }
    if is_temporary(name) {
        return Err(NameError::Temporary(name.to_string()));
    }
    Ok(())
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Every proper ancestor of `name`, shallowest first.
///
/// `"a/b/c"` yields `"a"` then `"a/b"`.
pub fn ancestors(name: &str) -> impl Iterator<Item = &str> {
    name.match_indices('/').map(move |(idx, _)| &name[..idx])
}

/// Parent directory of `name`, if any.
pub fn parent(name: &str) -> Option<&str> {
    name.rfind('/').map(|idx| &name[..idx])
}

/// Final component of `name`.
pub fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Number of components in `name`.
pub fn depth(name: &str) -> usize {
    name.split('/').count()
}
