//! Version vectors.
//!
//! A [`VersionVector`] maps short device IDs to monotonically increasing
//! counters. Vectors form a partial order: `a <= b` iff every counter in `a`
//! is at most the corresponding counter in `b` (missing entries count as
//! zero). Two vectors where neither dominates are concurrent.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

use crate::ShortId;

/// One device's counter inside a [`VersionVector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Counter {
    /// Device that owns this counter.
    pub id: ShortId,
    /// Number of edits made by that device (as seen by this replica).
    pub value: u64,
}

/// Result of comparing two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrdering {
    /// Both vectors hold identical counters.
    Equal,
    /// The left-hand vector dominates the right-hand one.
    Newer,
    /// The right-hand vector dominates the left-hand one.
    Older,
    /// Neither vector dominates.
    Concurrent,
}

/// Per-device counter map, kept sorted by device with no zero entries.
///
/// Decoding normalizes whatever a peer sent, so equality and hashing only
/// ever see the canonical form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawVector")]
pub struct VersionVector {
    counters: Vec<Counter>,
}

/// Wire shape of a [`VersionVector`] before normalization.
#[derive(Deserialize)]
struct RawVector {
    counters: Vec<Counter>,
}

impl From<RawVector> for VersionVector {
    fn from(raw: RawVector) -> Self {
        Self::from_counters(raw.counters)
    }
}

impl VersionVector {
    /// Create an empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a vector from arbitrary counters.
    ///
    /// Duplicate device entries keep their highest value; zero counters are dropped.
    pub fn from_counters<I: IntoIterator<Item = Counter>>(counters: I) -> Self {
        let mut counters: Vec<Counter> = counters.into_iter().filter(|c| c.value > 0).collect();
        counters.sort_by(|a, b| a.id.cmp(&b.id).then(b.value.cmp(&a.value)));
        counters.dedup_by_key(|c| c.id);
        Self { counters }
    }

    /// The counters, sorted by device.
    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    /// True if no device has made an edit.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Counter for one device (zero when absent).
    pub fn counter(&self, id: ShortId) -> u64 {
        match self.counters.binary_search_by(|c| c.id.cmp(&id)) {
            Ok(idx) => self.counters[idx].value,
            Err(_) => 0,
        }
    }

    /// Return a copy with the counter for `id` incremented by one.
    ///
    /// Every local edit goes through this, so the result strictly dominates `self`.
    pub fn update(&self, id: ShortId) -> Self {
        let mut counters = self.counters.clone();
        match counters.binary_search_by(|c| c.id.cmp(&id)) {
            Ok(idx) => counters[idx].value = counters[idx].value.saturating_add(1),
            Err(idx) => counters.insert(idx, Counter { id, value: 1 }),
        }
        Self { counters }
    }

    /// Element-wise maximum of both vectors.
    pub fn merge(&self, other: &Self) -> Self {
        Self::from_counters(self.counters.iter().chain(other.counters.iter()).copied())
    }

    /// Compare two vectors under the partial order.
    pub fn compare(&self, other: &Self) -> VectorOrdering {
        let mut ours_ahead = false;
        let mut theirs_ahead = false;

        let mut a = self.counters.iter().peekable();
        let mut b = other.counters.iter().peekable();
        loop {
            match (a.peek(), b.peek()) {
                (None, None) => break,
                (Some(_), None) => {
                    ours_ahead = true;
                    break;
                }
                (None, Some(_)) => {
                    theirs_ahead = true;
                    break;
                }
                (Some(x), Some(y)) => match x.id.cmp(&y.id) {
                    Ordering::Less => {
                        ours_ahead = true;
                        a.next();
                    }
                    Ordering::Greater => {
                        theirs_ahead = true;
                        b.next();
                    }
                    Ordering::Equal => {
                        match x.value.cmp(&y.value) {
                            Ordering::Greater => ours_ahead = true,
                            Ordering::Less => theirs_ahead = true,
                            Ordering::Equal => {}
                        }
                        a.next();
                        b.next();
                    }
                },
            }
        }

        match (ours_ahead, theirs_ahead) {
            (false, false) => VectorOrdering::Equal,
            (true, false) => VectorOrdering::Newer,
            (false, true) => VectorOrdering::Older,
            (true, true) => VectorOrdering::Concurrent,
        }
    }

    /// True if `self` and `other` are concurrent.
    pub fn concurrent(&self, other: &Self) -> bool {
        self.compare(other) == VectorOrdering::Concurrent
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        self.counters
            .iter()
            .fold(0u64, |acc, c| acc.saturating_add(c.value))
    }

    /// Short stable string identifying this exact vector.
    ///
    /// Hex of the first eight bytes of a SHA-256 over the sorted counters.
    /// Safe for use inside file names on every platform.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for c in &self.counters {
            hasher.update(c.id.value().to_be_bytes());
            hasher.update(c.value.to_be_bytes());
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}

impl PartialOrd for VersionVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare(other) {
            VectorOrdering::Equal => Some(Ordering::Equal),
            VectorOrdering::Newer => Some(Ordering::Greater),
            VectorOrdering::Older => Some(Ordering::Less),
            VectorOrdering::Concurrent => None,
        }
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, c) in self.counters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", c.id, c.value)?;
        }
        write!(f, "}}")
    }
}
