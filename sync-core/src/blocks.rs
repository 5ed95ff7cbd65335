//! Block model: chunking, hashing and positional diff.
//!
//! Files are split into fixed-size blocks (the last one may be short). Each
//! block carries a SHA-256 strong hash and an Adler-32 weak hash. The weak
//! hash is only ever used to find candidates cheaply; content is accepted
//! once the strong hash matches.

use std::io::{self, Read};

use sha2::{Digest, Sha256};
use sync_types::BlockInfo;
use thiserror::Error;

/// Smallest block size (128 KiB).
pub const MIN_BLOCK_SIZE: i32 = 128 << 10;

/// Largest block size (16 MiB).
pub const MAX_BLOCK_SIZE: i32 = 16 << 20;

/// Target upper bound on blocks per file when choosing a block size.
const DESIRED_BLOCKS: i64 = 2000;

const ADLER_MOD: u32 = 65521;

/// Largest run of bytes that can be summed before the Adler accumulators
/// must be reduced to stay within `u32`.
const ADLER_NMAX: usize = 5552;

/// Pick the block size for a file of `file_size` bytes.
///
/// The smallest power of two in `[MIN_BLOCK_SIZE, MAX_BLOCK_SIZE]` that
/// keeps the block count at or below 2000.
pub fn block_size(file_size: i64) -> i32 {
    let mut size = MIN_BLOCK_SIZE;
    while size < MAX_BLOCK_SIZE && file_size > i64::from(size) * DESIRED_BLOCKS {
        size *= 2;
    }
    size
}

/// Adler-32 checksum of `data`.
pub fn weak_hash(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(ADLER_NMAX) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= ADLER_MOD;
        b %= ADLER_MOD;
    }
    (b << 16) | a
}

/// SHA-256 of `data`.
pub fn strong_hash(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Describe `data` as the block starting at `offset`.
pub fn hash_block(offset: i64, data: &[u8]) -> BlockInfo {
    BlockInfo {
        offset,
        size: data.len() as i32,
        hash: strong_hash(data),
        weak_hash: weak_hash(data),
    }
}

/// True if `data` is exactly the content of `block`.
///
/// The weak hash is checked first when present (non-zero).
pub fn verify_block(block: &BlockInfo, data: &[u8]) -> bool {
    if data.len() != block.size as usize {
        return false;
    }
    if block.weak_hash != 0 && weak_hash(data) != block.weak_hash {
        return false;
    }
    strong_hash(data) == block.hash
}

/// Chunk everything `reader` yields into blocks of `block_size` bytes.
///
/// An empty input produces no blocks.
pub fn hash_blocks<R: Read>(mut reader: R, block_size: i32) -> io::Result<Vec<BlockInfo>> {
    if block_size <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "block size must be positive",
        ));
    }

    let mut blocks = Vec::new();
    let mut buf = vec![0u8; block_size as usize];
    let mut offset = 0i64;
    loop {
        let filled = fill(&mut reader, &mut buf)?;
        if filled == 0 {
            break;
        }
        blocks.push(hash_block(offset, &buf[..filled]));
        offset += filled as i64;
        if filled < buf.len() {
            break;
        }
    }
    Ok(blocks)
}

fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Ways an announced block list can disagree with its file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    /// The file size is negative.
    #[error("negative file size {0}")]
    NegativeSize(i64),

    /// A block is empty, negative or larger than [`MAX_BLOCK_SIZE`].
    #[error("bad block size {size} at offset {offset}")]
    BadBlockSize {
        /// Offset of the offending block.
        offset: i64,
        /// Its announced size.
        size: i32,
    },

    /// A block does not start where the previous one ended.
    #[error("block at offset {found}, expected {expected}")]
    Gap {
        /// End of the previous block.
        expected: i64,
        /// Offset actually announced.
        found: i64,
    },

    /// The blocks cover a different number of bytes than the file holds.
    #[error("blocks cover {covered} bytes of a {size} byte file")]
    SizeMismatch {
        /// Bytes covered by the blocks.
        covered: i64,
        /// Announced file size.
        size: i64,
    },
}

/// Check that `blocks` tile a file of `size` bytes.
///
/// Blocks must start at zero, follow each other without gaps or overlap,
/// each hold between 1 and [`MAX_BLOCK_SIZE`] bytes and end exactly at `size`.
pub fn check_layout(size: i64, blocks: &[BlockInfo]) -> Result<(), LayoutError> {
    if size < 0 {
        return Err(LayoutError::NegativeSize(size));
    }
    let mut covered = 0i64;
    for block in blocks {
        if block.size <= 0 || block.size > MAX_BLOCK_SIZE {
            return Err(LayoutError::BadBlockSize {
                offset: block.offset,
                size: block.size,
            });
        }
        if block.offset != covered {
            return Err(LayoutError::Gap {
                expected: covered,
                found: block.offset,
            });
        }
        covered += i64::from(block.size);
    }
    if covered != size {
        return Err(LayoutError::SizeMismatch { covered, size });
    }
    Ok(())
}

/// A byte range of a file: `[offset, offset + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Segment {
    /// Start of the range.
    pub offset: i64,
    /// Length of the range.
    pub size: i32,
}

impl From<&BlockInfo> for Segment {
    fn from(block: &BlockInfo) -> Self {
        Self {
            offset: block.offset,
            size: block.size,
        }
    }
}

/// Wanted blocks split by where their content comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDiff {
    /// Blocks already present at the same offset in the local copy.
    pub copy: Vec<BlockInfo>,
    /// Blocks that differ locally and must be obtained elsewhere.
    pub pull: Vec<BlockInfo>,
}

impl BlockDiff {
    /// Byte ranges of the copy side.
    pub fn copy_segments(&self) -> Vec<Segment> {
        self.copy.iter().map(Segment::from).collect()
    }

    /// Byte ranges of the pull side.
    pub fn pull_segments(&self) -> Vec<Segment> {
        self.pull.iter().map(Segment::from).collect()
    }
}

/// Compare `have` and `want` block by block.
///
/// A wanted block lands on the copy side when the local block at the same
/// position has the same offset, size and strong hash; otherwise it lands on
/// the pull side. Together the two sides cover every wanted block exactly once.
pub fn diff_blocks(have: &[BlockInfo], want: &[BlockInfo]) -> BlockDiff {
    let mut diff = BlockDiff::default();
    for (i, block) in want.iter().enumerate() {
        let matches = have.get(i).is_some_and(|h| {
            h.offset == block.offset && h.size == block.size && h.hash == block.hash
        });
        if matches {
            diff.copy.push(block.clone());
        } else {
            diff.pull.push(block.clone());
        }
    }
    diff
}
