//! Error types for syncmesh wire types.

use thiserror::Error;

/// Errors that can occur while encoding, decoding or validating wire types.
#[derive(Debug, Error)]
pub enum SyncError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Device ID string could not be parsed
    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::InvalidDeviceId("short".into());
        assert_eq!(err.to_string(), "invalid device id: short");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}
