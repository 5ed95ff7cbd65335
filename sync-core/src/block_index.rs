//! Weak-hash index over locally available blocks.
//!
//! Maps Adler-32 values to the places in local files where a block with
//! that weak hash was last seen. A lookup only yields candidates: the
//! caller must read the bytes and re-verify the strong hash before using
//! them, since files may have changed since they were indexed and weak
//! hashes collide.

use std::collections::{HashMap, HashSet};

use sync_types::{BlockInfo, FileInfo};

/// A place on disk where a block's content was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocation {
    /// File holding the block.
    pub name: String,
    /// Offset of the block within that file.
    pub offset: i64,
    /// Block length.
    pub size: i32,
    /// Strong hash recorded when the file was indexed.
    pub hash: Vec<u8>,
}

/// Index of local blocks by weak hash.
#[derive(Debug, Clone, Default)]
pub struct BlockIndex {
    by_weak: HashMap<u32, Vec<BlockLocation>>,
    strong: HashSet<Vec<u8>>,
}

impl BlockIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index over every live, valid regular file in `files`.
    pub fn from_files<'a, I>(files: I) -> Self
    where
        I: IntoIterator<Item = &'a FileInfo>,
    {
        let mut index = Self::new();
        for file in files {
            index.insert_file(file);
        }
        index
    }

    /// Add all blocks of `file`. Tombstones, invalid records and
    /// non-files are skipped.
    pub fn insert_file(&mut self, file: &FileInfo) {
        if !file.is_file() || file.is_deleted() || file.is_invalid() {
            return;
        }
        for block in &file.blocks {
            self.strong.insert(block.hash.clone());
            self.by_weak
                .entry(block.weak_hash)
                .or_default()
                .push(BlockLocation {
                    name: file.name.clone(),
                    offset: block.offset,
                    size: block.size,
                    hash: block.hash.clone(),
                });
        }
    }

    /// True if some local file was indexed with this exact block content.
    pub fn contains(&self, block: &BlockInfo) -> bool {
        self.strong.contains(&block.hash)
    }

    /// Candidate locations for `block`, best first.
    ///
    /// Only locations with the same weak hash and size are returned; those
    /// whose recorded strong hash also matches come first.
    pub fn candidates(&self, block: &BlockInfo) -> Vec<&BlockLocation> {
        let Some(locations) = self.by_weak.get(&block.weak_hash) else {
            return Vec::new();
        };
        let mut found: Vec<&BlockLocation> = locations
            .iter()
            .filter(|loc| loc.size == block.size)
            .collect();
        found.sort_by_key(|loc| loc.hash != block.hash);
        found
    }

    /// Number of indexed block locations.
    pub fn len(&self) -> usize {
        self.by_weak.values().map(Vec::len).sum()
    }

    /// True if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.by_weak.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{hash_block, hash_blocks};

    fn file(name: &str, data: &[u8]) -> FileInfo {
        FileInfo::file(name, 4, hash_blocks(data, 4).unwrap())
    }

    #[test]
    fn finds_block_in_other_file() {
        let index = BlockIndex::from_files(&[file("a", b"abcdefgh")]);
        let wanted = hash_block(0, b"efgh");

        assert!(index.contains(&wanted));
        let found = index.candidates(&wanted);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "a");
        assert_eq!(found[0].offset, 4);
    }

    #[test]
    fn unknown_block_has_no_candidates() {
        let index = BlockIndex::from_files(&[file("a", b"abcd")]);
        let wanted = hash_block(0, b"zzzz");
        assert!(!index.contains(&wanted));
        assert!(index.candidates(&wanted).is_empty());
    }

    #[test]
    fn weak_collision_sorts_after_exact_match() {
        let mut index = BlockIndex::new();
        let wanted = hash_block(0, b"abcd");
        let mut collision = file("collide", b"abcd");
        collision.blocks[0].hash = vec![0; 32];
        index.insert_file(&collision);
        index.insert_file(&file("exact", b"abcd"));

        let found = index.candidates(&wanted);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "exact");
        assert_eq!(found[1].name, "collide");
    }

    #[test]
    fn skips_deleted_and_invalid_files() {
        let mut deleted = file("gone", b"abcd");
        deleted.flags.deleted = true;
        let mut ignored = file("ign", b"efgh");
        ignored.flags.ignored = true;

        let index = BlockIndex::from_files(&[deleted, ignored]);
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
    }
}
