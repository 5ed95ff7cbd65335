//! Mock connection for testing.
//!
//! Plays a remote peer: serves file content for requests, records every
//! request and captures announced indexes for verification. Announcements
//! pass through the MessagePack codec like they would on the wire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sync_types::{DeviceId, ErrorCode, FileInfo, Index, IndexUpdate, Message, Request};

use super::{Connection, TransportError};

/// Mock connection for testing.
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another.
#[derive(Debug, Clone)]
pub struct MockConnection {
    device: DeviceId,
    inner: Arc<Mutex<MockConnectionInner>>,
}

#[derive(Debug, Default)]
struct MockConnectionInner {
    content: HashMap<(String, String), Vec<u8>>,
    sent_messages: Vec<Vec<u8>>,
    requests: Vec<Request>,
    fail_next_request: Option<ErrorCode>,
    corrupt_responses: bool,
    closed: bool,
}

impl MockConnection {
    /// Create a mock peer with the given device ID.
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            inner: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `data` available as the content of `name` in `folder`.
    pub fn serve(&self, folder: &str, name: &str, data: &[u8]) {
        self.lock()
            .content
            .insert((folder.to_string(), name.to_string()), data.to_vec());
    }

    /// Stop serving `name`.
    pub fn forget(&self, folder: &str, name: &str) {
        self.lock()
            .content
            .remove(&(folder.to_string(), name.to_string()));
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.lock().requests.clone()
    }

    /// Requests received for `name`.
    pub fn requests_for(&self, name: &str) -> Vec<Request> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect()
    }

    /// Every message sent to this peer, decoded.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.lock()
            .sent_messages
            .iter()
            .filter_map(|bytes| Message::from_bytes(bytes).ok())
            .collect()
    }

    /// Full indexes received for `folder`.
    pub fn indexes(&self, folder: &str) -> Vec<Vec<FileInfo>> {
        self.sent_messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::Index(i) if i.folder == folder => Some(i.files),
                _ => None,
            })
            .collect()
    }

    /// Index updates received for `folder`.
    pub fn index_updates(&self, folder: &str) -> Vec<Vec<FileInfo>> {
        self.sent_messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::IndexUpdate(u) if u.folder == folder => Some(u.files),
                _ => None,
            })
            .collect()
    }

    /// Cause the next request to fail with `code`.
    pub fn fail_next_request(&self, code: ErrorCode) {
        self.lock().fail_next_request = Some(code);
    }

    /// Flip a byte in every response from now on.
    pub fn corrupt_responses(&self, corrupt: bool) {
        self.lock().corrupt_responses = corrupt;
    }

    /// Make every further call fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    fn record(&self, message: Message) -> Result<(), TransportError> {
        let bytes = message.to_bytes()?;
        let mut inner = self.lock();
        if inner.closed {
            return Err(TransportError::ConnectionClosed);
        }
        inner.sent_messages.push(bytes);
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    async fn request(&self, request: Request) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.lock();
        inner.requests.push(request.clone());

        if inner.closed {
            return Err(TransportError::ConnectionClosed);
        }

        // Check for forced failure
        if let Some(code) = inner.fail_next_request.take() {
            return Err(TransportError::Remote(code));
        }

        let content = inner
            .content
            .get(&(request.folder.clone(), request.name.clone()))
            .ok_or(TransportError::Remote(ErrorCode::NoSuchFile))?;
        let start = usize::try_from(request.offset)
            .map_err(|_| TransportError::Remote(ErrorCode::Generic))?;
        let end = start + usize::try_from(request.size).unwrap_or(0);
        let mut data = content
            .get(start..end)
            .ok_or(TransportError::Remote(ErrorCode::Generic))?
            .to_vec();

        if inner.corrupt_responses {
            if let Some(first) = data.first_mut() {
                *first ^= 0xff;
            }
        }
        Ok(data)
    }

    async fn index(&self, folder: &str, files: Vec<FileInfo>) -> Result<(), TransportError> {
        self.record(Message::Index(Index {
            folder: folder.to_string(),
            files,
        }))
    }

    async fn index_update(
        &self,
        folder: &str,
        files: Vec<FileInfo>,
    ) -> Result<(), TransportError> {
        self.record(Message::IndexUpdate(IndexUpdate {
            folder: folder.to_string(),
            files,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, offset: i64, size: i32) -> Request {
        Request {
            id: 1,
            folder: "default".into(),
            name: name.into(),
            offset,
            size,
            hash: Vec::new(),
            weak_hash: 0,
            from_temporary: false,
        }
    }

    // ===========================================
    // MockConnection Basic Tests
    // ===========================================

    #[tokio::test]
    async fn serves_requested_range() {
        let peer = MockConnection::new(DeviceId::random());
        peer.serve("default", "f", b"0123456789");

        let data = peer.request(request("f", 2, 3)).await.unwrap();
        assert_eq!(data, b"234");
        assert_eq!(peer.requests_for("f").len(), 1);
    }

    #[tokio::test]
    async fn captures_announcements() {
        let peer = MockConnection::new(DeviceId::random());
        peer.index("default", vec![FileInfo::directory("a")])
            .await
            .unwrap();
        peer.index_update("default", vec![FileInfo::directory("b")])
            .await
            .unwrap();
        peer.index_update("other", vec![FileInfo::directory("c")])
            .await
            .unwrap();

        assert_eq!(peer.indexes("default")[0][0].name, "a");
        assert_eq!(peer.index_updates("default").len(), 1);
        assert_eq!(peer.sent_messages().len(), 3);
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn unknown_file_is_no_such_file() {
        let peer = MockConnection::new(DeviceId::random());
        let result = peer.request(request("missing", 0, 1)).await;
        assert!(matches!(
            result,
            Err(TransportError::Remote(ErrorCode::NoSuchFile))
        ));
    }

    #[tokio::test]
    async fn out_of_range_is_generic() {
        let peer = MockConnection::new(DeviceId::random());
        peer.serve("default", "f", b"abc");
        let result = peer.request(request("f", 2, 5)).await;
        assert!(matches!(result, Err(TransportError::Remote(ErrorCode::Generic))));
    }

    #[tokio::test]
    async fn forced_failure_is_one_shot() {
        let peer = MockConnection::new(DeviceId::random());
        peer.serve("default", "f", b"abc");
        peer.fail_next_request(ErrorCode::InvalidFile);

        assert!(peer.request(request("f", 0, 3)).await.is_err());
        assert!(peer.request(request("f", 0, 3)).await.is_ok());
    }

    #[tokio::test]
    async fn corrupt_responses_flip_data() {
        let peer = MockConnection::new(DeviceId::random());
        peer.serve("default", "f", b"abc");
        peer.corrupt_responses(true);
        assert_ne!(peer.request(request("f", 0, 3)).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn closed_connection_fails() {
        let peer = MockConnection::new(DeviceId::random());
        peer.close();
        assert!(matches!(
            peer.index("default", vec![]).await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(matches!(
            peer.request(request("f", 0, 1)).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
