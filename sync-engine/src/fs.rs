//! Filesystem capability.
//!
//! All disk access of the engine goes through [`Filesystem`], rooted at the
//! folder path. Names are slash-separated and relative to the root;
//! platform quirks (separators, Unicode normalisation form) are handled
//! inside the backend and never branched on in the sync logic.
//!
//! # Conformance
//!
//! - Names passed in have been validated (`sync_core::validate_name`).
//! - `lstat` never follows a final symlink.
//! - `walk` never follows symlinks and reports names in the wire form.
//! - `rename` replaces an existing target file.

use std::borrow::Cow;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use sync_core::names::ancestors;
use sync_types::{BlockInfo, FileType};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use unicode_normalization::UnicodeNormalization;

/// Metadata of one entry, as seen without following symlinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Entry kind.
    pub file_type: FileType,
    /// Size in bytes (zero for directories and symlinks).
    pub size: i64,
    /// Permission bits.
    pub permissions: u32,
    /// Modification time, seconds since the epoch.
    pub modified_s: i64,
    /// Sub-second part of the modification time.
    pub modified_ns: i32,
}

/// One entry found by [`Filesystem::walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Name relative to the folder root.
    pub name: String,
    /// Entry metadata.
    pub meta: FileMeta,
}

/// Disk access rooted at one folder.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Metadata of `name`, `None` if nothing exists there.
    async fn lstat(&self, name: &str) -> io::Result<Option<FileMeta>>;

    /// Read exactly `size` bytes at `offset`.
    ///
    /// Fails with `UnexpectedEof` if the file is shorter.
    async fn read_at(&self, name: &str, offset: i64, size: usize) -> io::Result<Vec<u8>>;

    /// Write `data` at `offset`, creating the file if needed.
    async fn write_at(&self, name: &str, offset: i64, data: &[u8]) -> io::Result<()>;

    /// Create `name` if missing and set its length to `size`.
    async fn create_file(&self, name: &str, size: i64) -> io::Result<()>;

    /// Flush file content to stable storage.
    async fn sync(&self, name: &str) -> io::Result<()>;

    /// Move `from` to `to`, replacing a file at `to`.
    async fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    /// Remove a file, symlink or empty directory.
    async fn remove(&self, name: &str) -> io::Result<()>;

    /// Create a directory and any missing parents.
    async fn create_dir_all(&self, name: &str) -> io::Result<()>;

    /// Create a symlink at `name` pointing at `target`.
    async fn create_symlink(&self, target: &str, name: &str) -> io::Result<()>;

    /// Target of the symlink at `name`.
    async fn read_link(&self, name: &str) -> io::Result<String>;

    /// Set the modification time.
    async fn set_mtime(&self, name: &str, seconds: i64, nanos: i32) -> io::Result<()>;

    /// Set permission bits.
    async fn set_permissions(&self, name: &str, mode: u32) -> io::Result<()>;

    /// Every entry below `prefix` (or the whole root), symlinks not followed.
    async fn walk(&self, prefix: Option<&str>) -> io::Result<Vec<WalkEntry>>;

    /// Block list of the file at `name`.
    async fn hash_file(&self, name: &str, block_size: i32) -> io::Result<Vec<BlockInfo>>;

    /// First symlink on the way to `name`, checking each ancestor from the
    /// root down and `name` itself when `include_self` is set.
    async fn symlink_in_path(&self, name: &str, include_self: bool) -> io::Result<Option<String>> {
        let last = include_self.then_some(name);
        for prefix in ancestors(name).chain(last) {
            match self.lstat(prefix).await? {
                Some(meta) if meta.file_type == FileType::Symlink => {
                    return Ok(Some(prefix.to_string()));
                }
                Some(_) => {}
                // Nothing below a missing component can exist.
                None => return Ok(None),
            }
        }
        Ok(None)
    }
}

/// Name as stored on this platform's disk (NFD on macOS).
pub fn native_name(name: &str) -> Cow<'_, str> {
    normalize(name, cfg!(target_os = "macos"), true)
}

/// Name as sent on the wire (NFC on macOS).
pub fn wire_name(name: &str) -> Cow<'_, str> {
    normalize(name, cfg!(target_os = "macos"), false)
}

fn normalize(name: &str, enabled: bool, decompose: bool) -> Cow<'_, str> {
    if !enabled || name.is_ascii() {
        return Cow::Borrowed(name);
    }
    if decompose {
        Cow::Owned(name.nfd().collect())
    } else {
        Cow::Owned(name.nfc().collect())
    }
}

/// [`Filesystem`] backed by the local disk.
#[derive(Debug, Clone)]
pub struct BasicFilesystem {
    root: PathBuf,
}

impl BasicFilesystem {
    /// Filesystem rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        let mut path = self.root.clone();
        for component in native_name(name).split('/') {
            path.push(component);
        }
        path
    }
}

fn meta_from(metadata: &std::fs::Metadata) -> FileMeta {
    let file_type = if metadata.file_type().is_symlink() {
        FileType::Symlink
    } else if metadata.is_dir() {
        FileType::Directory
    } else {
        FileType::File
    };
    let (modified_s, modified_ns) = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| (d.as_secs() as i64, d.subsec_nanos() as i32))
        .unwrap_or((0, 0));
    FileMeta {
        file_type,
        size: if file_type == FileType::File {
            metadata.len() as i64
        } else {
            0
        },
        permissions: permission_bits(metadata, file_type),
        modified_s,
        modified_ns,
    }
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata, _file_type: FileType) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &std::fs::Metadata, file_type: FileType) -> u32 {
    match (file_type, metadata.permissions().readonly()) {
        (FileType::Directory, _) => 0o755,
        (_, true) => 0o444,
        (_, false) => 0o644,
    }
}

fn offset_of(offset: i64) -> io::Result<u64> {
    u64::try_from(offset).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "negative offset"))
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

#[async_trait]
impl Filesystem for BasicFilesystem {
    async fn lstat(&self, name: &str) -> io::Result<Option<FileMeta>> {
        match tokio::fs::symlink_metadata(self.path(name)).await {
            Ok(metadata) => Ok(Some(meta_from(&metadata))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn read_at(&self, name: &str, offset: i64, size: usize) -> io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(self.path(name)).await?;
        file.seek(SeekFrom::Start(offset_of(offset)?)).await?;
        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn write_at(&self, name: &str, offset: i64, data: &[u8]) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path(name))
            .await?;
        file.seek(SeekFrom::Start(offset_of(offset)?)).await?;
        file.write_all(data).await?;
        file.flush().await
    }

    async fn create_file(&self, name: &str, size: i64) -> io::Result<()> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path(name))
            .await?;
        file.set_len(offset_of(size)?).await
    }

    async fn sync(&self, name: &str) -> io::Result<()> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.path(name))
            .await?;
        file.sync_all().await
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        tokio::fs::rename(self.path(from), self.path(to)).await
    }

    async fn remove(&self, name: &str) -> io::Result<()> {
        let path = self.path(name);
        let metadata = tokio::fs::symlink_metadata(&path).await?;
        if metadata.is_dir() {
            tokio::fs::remove_dir(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        }
    }

    async fn create_dir_all(&self, name: &str) -> io::Result<()> {
        tokio::fs::create_dir_all(self.path(name)).await
    }

    #[cfg(unix)]
    async fn create_symlink(&self, target: &str, name: &str) -> io::Result<()> {
        tokio::fs::symlink(target, self.path(name)).await
    }

    #[cfg(not(unix))]
    async fn create_symlink(&self, _target: &str, _name: &str) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlinks are not supported on this platform",
        ))
    }

    async fn read_link(&self, name: &str) -> io::Result<String> {
        let target = tokio::fs::read_link(self.path(name)).await?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn set_mtime(&self, name: &str, seconds: i64, nanos: i32) -> io::Result<()> {
        let path = self.path(name);
        let mtime = filetime::FileTime::from_unix_time(seconds, nanos.max(0) as u32);
        blocking(move || filetime::set_symlink_file_times(&path, mtime, mtime)).await
    }

    #[cfg(unix)]
    async fn set_permissions(&self, name: &str, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(mode & 0o777);
        tokio::fs::set_permissions(self.path(name), permissions).await
    }

    #[cfg(not(unix))]
    async fn set_permissions(&self, _name: &str, _mode: u32) -> io::Result<()> {
        Ok(())
    }

    async fn walk(&self, prefix: Option<&str>) -> io::Result<Vec<WalkEntry>> {
        let root = self.root.clone();
        let start = match prefix {
            Some(prefix) => self.path(prefix),
            None => root.clone(),
        };
        let whole_root = prefix.is_none();
        blocking(move || {
            if let Err(e) = std::fs::symlink_metadata(&start) {
                // A missing root must not look like an empty folder.
                return if whole_root { Err(e) } else { Ok(Vec::new()) };
            }
            let mut entries = Vec::new();
            let walker = walkdir::WalkDir::new(&start)
                .follow_links(false)
                .follow_root_links(false)
                .sort_by_file_name();
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let components: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                if components.is_empty() {
                    continue;
                }
                let metadata = match entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping entry without metadata");
                        continue;
                    }
                };
                let name = components.join("/");
                entries.push(WalkEntry {
                    name: wire_name(&name).into_owned(),
                    meta: meta_from(&metadata),
                });
            }
            Ok(entries)
        })
        .await
    }

    async fn hash_file(&self, name: &str, block_size: i32) -> io::Result<Vec<BlockInfo>> {
        let path = self.path(name);
        blocking(move || {
            let file = std::fs::File::open(path)?;
            sync_core::hash_blocks(io::BufReader::new(file), block_size)
        })
        .await
    }
}
