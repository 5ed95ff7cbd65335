//! Versioning backends.
//!
//! The finisher calls [`Versioner::archive`] before it overwrites or
//! deletes a file, giving the backend a chance to move the old content
//! somewhere safe. After `archive` returns the caller proceeds as if the
//! file may or may not still be there.

use std::io;

use async_trait::async_trait;
use sync_core::names::parent;
use sync_core::INTERNAL_DIR;

use crate::config::VersioningKind;
use crate::fs::Filesystem;

/// Preserves old file content before a destructive change.
#[async_trait]
pub trait Versioner: Send + Sync {
    /// Archive the current content of `name`.
    async fn archive(&self, fs: &dyn Filesystem, name: &str) -> io::Result<()>;
}

/// Keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVersioning;

#[async_trait]
impl Versioner for NoVersioning {
    async fn archive(&self, _fs: &dyn Filesystem, _name: &str) -> io::Result<()> {
        Ok(())
    }
}

/// Moves old content into `.syncmesh/trash/<name>`, replacing any earlier
/// trashed copy of the same name.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrashCan;

impl TrashCan {
    /// Where `name` is kept once trashed.
    pub fn trash_name(name: &str) -> String {
        format!("{INTERNAL_DIR}/trash/{name}")
    }
}

#[async_trait]
impl Versioner for TrashCan {
    async fn archive(&self, fs: &dyn Filesystem, name: &str) -> io::Result<()> {
        match fs.lstat(name).await? {
            Some(meta) if meta.file_type != sync_types::FileType::Directory => {}
            _ => return Ok(()),
        }
        let target = Self::trash_name(name);
        if let Some(dir) = parent(&target) {
            fs.create_dir_all(dir).await?;
        }
        fs.rename(name, &target).await?;
        tracing::debug!(%name, trash = %target, "archived to trash can");
        Ok(())
    }
}

/// Backend for a configured [`VersioningKind`].
pub fn versioner_for(kind: VersioningKind) -> Box<dyn Versioner> {
    match kind {
        VersioningKind::None => Box::new(NoVersioning),
        VersioningKind::Trashcan => Box::new(TrashCan),
    }
}
