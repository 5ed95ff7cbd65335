//! Protocol messages for syncmesh.
//!
//! Payload shapes only; framing and transport encryption belong to the
//! connection layer.

use serde::{Deserialize, Serialize};

use crate::{FileInfo, SyncError};

/// All possible protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Full replica state announcement
    Index(Index),
    /// Incremental replica state announcement
    IndexUpdate(IndexUpdate),
    /// Request a byte range of a file
    Request(Request),
    /// Response to a request
    Response(Response),
}

impl Message {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

/// Complete list of files a device holds for a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Folder ID
    pub folder: String,
    /// Every file record the sender has for the folder
    pub files: Vec<FileInfo>,
}

/// Files that changed since the sender's previous announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexUpdate {
    /// Folder ID
    pub folder: String,
    /// Changed file records
    pub files: Vec<FileInfo>,
}

/// Request for `size` bytes at `offset` of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Correlates the response
    pub id: u32,
    /// Folder ID
    pub folder: String,
    /// File name relative to the folder root
    pub name: String,
    /// Byte offset
    pub offset: i64,
    /// Number of bytes
    pub size: i32,
    /// Expected SHA-256 of the range (empty to skip verification)
    pub hash: Vec<u8>,
    /// Expected Adler-32 of the range (zero to skip)
    pub weak_hash: u32,
    /// Serve from an in-progress temporary file if one exists
    pub from_temporary: bool,
}

/// Outcome code of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Data follows
    NoError,
    /// Unspecified failure
    Generic,
    /// The file does not exist at the responder
    NoSuchFile,
    /// The file exists but cannot be served (ignored, invalid, unsafe path)
    InvalidFile,
}

/// Response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// ID of the request being answered
    pub id: u32,
    /// Requested bytes (empty on error)
    pub data: Vec<u8>,
    /// Outcome
    pub code: ErrorCode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockInfo, ShortId};

    #[test]
    fn index_update_survives_messagepack() {
        let mut file = FileInfo::file(
            "dir/testfile",
            128 * 1024,
            vec![BlockInfo {
                offset: 0,
                size: 19,
                hash: vec![7; 32],
                weak_hash: 1234,
            }],
        );
        file.version = file.version.update(ShortId::new(5));

        let msg = Message::IndexUpdate(IndexUpdate {
            folder: "default".into(),
            files: vec![file],
        });
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn request_carries_temporary_flag() {
        let msg = Message::Request(Request {
            id: 3,
            folder: "default".into(),
            name: "foo".into(),
            offset: 0,
            size: 5,
            hash: vec![],
            weak_hash: 0,
            from_temporary: true,
        });
        match Message::from_bytes(&msg.to_bytes().unwrap()).unwrap() {
            Message::Request(r) => assert!(r.from_temporary),
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            Message::from_bytes(&[0xc1, 0x00]),
            Err(SyncError::Deserialization(_))
        ));
    }
}
