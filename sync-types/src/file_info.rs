//! Replica state of a single file.

use serde::{Deserialize, Serialize};

use crate::{ShortId, VersionVector};

/// Kind of filesystem entry a [`FileInfo`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file with block content.
    File,
    /// Directory.
    Directory,
    /// Symbolic link; the target lives in [`FileInfo::symlink_target`].
    Symlink,
}

/// One content-addressed block of a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Byte offset of the block within the file.
    pub offset: i64,
    /// Block length in bytes.
    pub size: i32,
    /// SHA-256 of the block content.
    pub hash: Vec<u8>,
    /// Adler-32 of the block content.
    pub weak_hash: u32,
}

impl BlockInfo {
    /// Offset one past the last byte of the block.
    pub fn end(&self) -> i64 {
        self.offset + i64::from(self.size)
    }
}

/// Local and protocol flags of a [`FileInfo`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileFlags {
    /// The file was removed; the record is a tombstone.
    pub deleted: bool,
    /// The announcing device has no valid content for this file.
    pub invalid: bool,
    /// The file matches a local ignore pattern.
    pub ignored: bool,
}

/// Replica state of one file, directory or symlink in a folder.
///
/// A new edit produces a new `FileInfo` with a dominating version; records
/// are never modified in place once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Slash-separated path relative to the folder root.
    pub name: String,
    /// Entry kind.
    pub file_type: FileType,
    /// Total content size in bytes (zero for directories and symlinks).
    pub size: i64,
    /// Unix permission bits.
    pub permissions: u32,
    /// Modification time, seconds since the Unix epoch.
    pub modified_s: i64,
    /// Sub-second part of the modification time.
    pub modified_ns: i32,
    /// Device that made the edit producing this version.
    pub modified_by: ShortId,
    /// Version vector of this record.
    pub version: VersionVector,
    /// Position in the announcing device's change stream.
    pub sequence: i64,
    /// Block size used to chunk the content.
    pub block_size: i32,
    /// Content blocks in ascending offset order.
    pub blocks: Vec<BlockInfo>,
    /// Link target for symlinks, empty otherwise.
    pub symlink_target: String,
    /// Deleted / invalid / ignored flags.
    pub flags: FileFlags,
}

impl FileInfo {
    /// Create a record for a regular file with the given content blocks.
    pub fn file(name: impl Into<String>, block_size: i32, blocks: Vec<BlockInfo>) -> Self {
        let size = blocks.iter().map(|b| i64::from(b.size)).sum();
        Self {
            name: name.into(),
            file_type: FileType::File,
            size,
            permissions: 0o644,
            modified_s: 0,
            modified_ns: 0,
            modified_by: ShortId::default(),
            version: VersionVector::new(),
            sequence: 0,
            block_size,
            blocks,
            symlink_target: String::new(),
            flags: FileFlags::default(),
        }
    }

    /// Create a record for a directory.
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            file_type: FileType::Directory,
            permissions: 0o755,
            ..Self::file(name, 0, Vec::new())
        }
    }

    /// Create a record for a symlink pointing at `target`.
    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            file_type: FileType::Symlink,
            permissions: 0o777,
            symlink_target: target.into(),
            ..Self::file(name, 0, Vec::new())
        }
    }

    /// True for tombstones.
    pub fn is_deleted(&self) -> bool {
        self.flags.deleted
    }

    /// True if the record carries no usable content (invalid or ignored).
    pub fn is_invalid(&self) -> bool {
        self.flags.invalid || self.flags.ignored
    }

    /// True if the file matched a local ignore pattern.
    pub fn is_ignored(&self) -> bool {
        self.flags.ignored
    }

    /// True for regular files.
    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    /// True for directories.
    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// True for symlinks.
    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    /// Modification time as nanoseconds since the epoch, for ordering.
    pub fn mod_time_nanos(&self) -> i128 {
        i128::from(self.modified_s) * 1_000_000_000 + i128::from(self.modified_ns)
    }

    /// True if both records hold the same content, ignoring name and version.
    ///
    /// Content equality is block-hash sequence equality for files and target
    /// equality for symlinks.
    pub fn same_content(&self, other: &Self) -> bool {
        if self.file_type != other.file_type || self.is_deleted() != other.is_deleted() {
            return false;
        }
        match self.file_type {
            FileType::File => {
                self.size == other.size
                    && self.blocks.len() == other.blocks.len()
                    && self
                        .blocks
                        .iter()
                        .zip(&other.blocks)
                        .all(|(a, b)| a.hash == b.hash)
            }
            FileType::Symlink => self.symlink_target == other.symlink_target,
            FileType::Directory => true,
        }
    }

    /// Hashes of all blocks, in order.
    pub fn block_hashes(&self) -> Vec<&[u8]> {
        self.blocks.iter().map(|b| b.hash.as_slice()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(offset: i64, size: i32, fill: u8) -> BlockInfo {
        BlockInfo {
            offset,
            size,
            hash: vec![fill; 32],
            weak_hash: u32::from(fill),
        }
    }

    #[test]
    fn file_size_is_sum_of_blocks() {
        let f = FileInfo::file("a", 4, vec![block(0, 4, 1), block(4, 2, 2)]);
        assert_eq!(f.size, 6);
        assert_eq!(f.blocks[1].end(), 6);
    }

    #[test]
    fn same_content_ignores_name_and_version() {
        let a = FileInfo::file("a", 4, vec![block(0, 4, 1)]);
        let mut b = FileInfo::file("b", 4, vec![block(0, 4, 1)]);
        b.version = b.version.update(ShortId::new(9));
        assert!(a.same_content(&b));
    }

    #[test]
    fn different_blocks_are_different_content() {
        let a = FileInfo::file("a", 4, vec![block(0, 4, 1)]);
        let b = FileInfo::file("a", 4, vec![block(0, 4, 2)]);
        assert!(!a.same_content(&b));
    }

    #[test]
    fn tombstone_differs_from_live_file() {
        let a = FileInfo::file("a", 4, vec![]);
        let mut b = a.clone();
        b.flags.deleted = true;
        assert!(!a.same_content(&b));
    }

    #[test]
    fn symlinks_compare_targets() {
        assert!(FileInfo::symlink("l", "..").same_content(&FileInfo::symlink("m", "..")));
        assert!(!FileInfo::symlink("l", "..").same_content(&FileInfo::symlink("l", "/tmp")));
    }

    #[test]
    fn ignored_counts_as_invalid() {
        let mut f = FileInfo::directory("d");
        f.flags.ignored = true;
        assert!(f.is_invalid());
        assert!(f.is_ignored());
    }
}
