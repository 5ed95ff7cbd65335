//! Identity types for syncmesh devices.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SyncError;

/// A unique identifier for a device in the sync network.
///
/// 32 bytes, displayed as URL-safe base64.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId([u8; 32]);

impl DeviceId {
    /// Create a new random DeviceId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Create a DeviceId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 32 {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(bytes);
            Some(Self(arr))
        } else {
            None
        }
    }

    /// Get the raw bytes of this DeviceId.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The 64-bit short form used as the key in version vectors.
    pub fn short(&self) -> ShortId {
        let mut first = [0u8; 8];
        first.copy_from_slice(&self.0[..8]);
        ShortId(u64::from_be_bytes(first))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", &self.to_string()[..8])
    }
}

impl FromStr for DeviceId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s.trim())
            .map_err(|e| SyncError::InvalidDeviceId(e.to_string()))?;
        Self::from_bytes(&bytes)
            .ok_or_else(|| SyncError::InvalidDeviceId(format!("expected 32 bytes, got {}", bytes.len())))
    }
}

/// Short device identifier: the first eight bytes of a [`DeviceId`].
///
/// Version vectors and `modified_by` fields carry short IDs to keep
/// index records small.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ShortId(u64);

impl ShortId {
    /// Create a ShortId from its numeric value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this ShortId.
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = format!("{:016X}", self.0);
        write!(f, "{}", &hex[..7])
    }
}

impl fmt::Debug for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortId({})", self)
    }
}
