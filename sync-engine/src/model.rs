//! Engine entry point.
//!
//! The [`Model`] owns every folder, dispatches inbound protocol messages
//! to them and starts their background loops. Whoever owns the actual
//! connections hands them to [`Model::add_connection`] and feeds received
//! messages into [`Model::on_message`].

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use sync_types::{DeviceId, ErrorCode, FileInfo, Message, Request, Response};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, FolderConfig};
use crate::error::{EngineError, RequestError, Result};
use crate::events::{EventSink, Subscription};
use crate::folder::Folder;
use crate::index::IndexStore;
use crate::pull::PullSummary;
use crate::transport::{Connection, Peers};

/// The synchronization engine of one device.
pub struct Model {
    device: DeviceId,
    store: Arc<dyn IndexStore>,
    events: EventSink,
    peers: Peers,
    folders: DashMap<String, Arc<Folder>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Model {
    /// Engine for `device` with no folders.
    pub fn new(device: DeviceId, store: Arc<dyn IndexStore>) -> Self {
        Self {
            device,
            store,
            events: EventSink::new(),
            peers: Peers::new(),
            folders: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Engine with every folder from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn from_config(
        config: &EngineConfig,
        device: DeviceId,
        store: Arc<dyn IndexStore>,
    ) -> Result<Self> {
        config.validate()?;
        let model = Self::new(device, store);
        for folder in &config.folders {
            model.new_folder(folder.clone())?;
        }
        tracing::info!(
            device = %device,
            name = %config.device.name,
            folders = config.folders.len(),
            "engine configured"
        );
        Ok(model)
    }

    /// This device.
    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    /// Event sink shared by every folder.
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Live connections.
    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    /// Create and register a folder backed by the local disk.
    pub fn new_folder(&self, config: FolderConfig) -> Result<Arc<Folder>> {
        let folder = Folder::new(
            config,
            self.device,
            Arc::clone(&self.store),
            self.peers.clone(),
            self.events.clone(),
        )?;
        Ok(self.add_folder(folder))
    }

    /// Register a folder built by the caller, replacing one with the same ID.
    pub fn add_folder(&self, folder: Folder) -> Arc<Folder> {
        let folder = Arc::new(folder);
        self.folders
            .insert(folder.id().to_string(), Arc::clone(&folder));
        folder
    }

    /// Folder by ID.
    pub fn folder(&self, id: &str) -> Result<Arc<Folder>> {
        self.folders
            .get(id)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| EngineError::UnknownFolder(id.to_string()))
    }

    /// IDs of all folders, sorted.
    pub fn folder_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.folders.iter().map(|f| f.key().clone()).collect();
        ids.sort();
        ids
    }

    fn shared_with(&self, device: &DeviceId) -> Vec<Arc<Folder>> {
        self.folders
            .iter()
            .filter(|f| f.value().is_member(device))
            .map(|f| Arc::clone(f.value()))
            .collect()
    }

    /// Register a connected peer and send it the full index of every
    /// folder it shares.
    pub async fn add_connection(&self, connection: Arc<dyn Connection>) -> Result<()> {
        let device = connection.device_id();
        if self.peers.add(Arc::clone(&connection)).is_some() {
            tracing::debug!(%device, "replaced existing connection");
        }
        for folder in self.shared_with(&device) {
            let files = folder.index().local_files().await?;
            tracing::debug!(%device, folder = %folder.id(), files = files.len(), "sending index");
            connection.index(folder.id(), files).await?;
        }
        tracing::info!(%device, "peer connected");
        Ok(())
    }

    /// Forget a disconnected peer.
    pub fn remove_connection(&self, device: &DeviceId) {
        if self.peers.remove(device).is_some() {
            tracing::info!(%device, "peer disconnected");
        }
    }

    /// Handle one message from `from`, returning the reply to send, if any.
    pub async fn on_message(&self, from: &DeviceId, message: Message) -> Result<Option<Message>> {
        match message {
            Message::Index(index) => {
                self.folder(&index.folder)?
                    .on_remote_index(from, index.files, true)
                    .await?;
                Ok(None)
            }
            Message::IndexUpdate(update) => {
                self.folder(&update.folder)?
                    .on_remote_index(from, update.files, false)
                    .await?;
                Ok(None)
            }
            Message::Request(request) => Ok(Some(Message::Response(
                self.request(from, &request).await,
            ))),
            Message::Response(response) => {
                tracing::debug!(%from, id = response.id, "ignoring unsolicited response");
                Ok(None)
            }
        }
    }

    /// Answer a block request.
    pub async fn request(&self, from: &DeviceId, request: &Request) -> Response {
        let result = match self.folder(&request.folder) {
            Ok(folder) => folder.serve(from, request).await,
            Err(e) => Err(RequestError::Generic(e.to_string())),
        };
        match result {
            Ok(data) => Response {
                id: request.id,
                data,
                code: ErrorCode::NoError,
            },
            Err(e) => Response {
                id: request.id,
                data: Vec::new(),
                code: e.code(),
            },
        }
    }

    /// Scan a folder now.
    pub async fn scan(&self, folder: &str, subdirs: &[String]) -> Result<Vec<FileInfo>> {
        self.folder(folder)?.scan(subdirs).await
    }

    /// Run one pull cycle of a folder now.
    pub async fn pull(&self, folder: &str) -> Result<PullSummary> {
        self.folder(folder)?.pull().await
    }

    /// Start the background loop of every registered folder.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for folder in self.folders.iter() {
            let folder = Arc::clone(folder.value());
            tasks.push(folder.run(self.shutdown.child_token()));
        }
        tracing::info!(folders = tasks.len(), "engine started");
    }

    /// Stop every folder loop, cancelling in-flight pulls, and wait for
    /// them to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "folder task failed");
            }
        }
        tracing::info!("engine stopped");
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("device", &self.device)
            .field("folders", &self.folder_ids())
            .field("peers", &self.peers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::testutil::{file_record, write};
    use crate::transport::MockConnection;
    use std::time::Duration;
    use sync_types::{Index, IndexUpdate};

    struct Setup {
        dir: tempfile::TempDir,
        model: Model,
        peer: MockConnection,
        remote: DeviceId,
    }

    async fn setup(tune: impl FnOnce(FolderConfig) -> FolderConfig) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let remote = DeviceId::random();
        let model = Model::new(DeviceId::random(), Arc::new(MemoryIndex::new()));
        model
            .new_folder(tune(FolderConfig::new("default", dir.path()).with_device(remote)))
            .unwrap();
        let peer = MockConnection::new(remote);
        model.add_connection(Arc::new(peer.clone())).await.unwrap();
        Setup {
            dir,
            model,
            peer,
            remote,
        }
    }

    fn request(name: &str, size: i32) -> Request {
        Request {
            id: 7,
            folder: "default".to_string(),
            name: name.to_string(),
            offset: 0,
            size,
            hash: Vec::new(),
            weak_hash: 0,
            from_temporary: false,
        }
    }

    #[tokio::test]
    async fn connecting_sends_full_index() {
        let s = setup(|c| c).await;
        write(s.dir.path(), "foo", b"hello");
        s.model.scan("default", &[]).await.unwrap();

        let peer = MockConnection::new(s.remote);
        s.model.add_connection(Arc::new(peer.clone())).await.unwrap();

        let indexes = peer.indexes("default");
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].len(), 1);
        assert_eq!(indexes[0][0].name, "foo");
    }

    #[tokio::test]
    async fn request_message_gets_response() {
        let s = setup(|c| c).await;
        write(s.dir.path(), "foo", b"hello");

        let reply = s
            .model
            .on_message(&s.remote, Message::Request(request("foo", 5)))
            .await
            .unwrap();

        match reply {
            Some(Message::Response(r)) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.code, ErrorCode::NoError);
                assert_eq!(r.data, b"hello");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_errors_become_codes() {
        let s = setup(|c| c).await;

        let missing = s.model.request(&s.remote, &request("nope", 1)).await;
        assert_eq!(missing.code, ErrorCode::NoSuchFile);
        assert!(missing.data.is_empty());

        let mut unknown = request("foo", 1);
        unknown.folder = "elsewhere".to_string();
        assert_eq!(s.model.request(&s.remote, &unknown).await.code, ErrorCode::Generic);
    }

    #[tokio::test]
    async fn index_from_stranger_is_rejected() {
        let s = setup(|c| c).await;
        let stranger = DeviceId::random();
        let message = Message::IndexUpdate(IndexUpdate {
            folder: "default".to_string(),
            files: vec![file_record("x", b"x", stranger.short())],
        });

        let err = s.model.on_message(&stranger, message).await.unwrap_err();
        assert!(matches!(err, EngineError::NotShared { .. }));
    }

    #[tokio::test]
    async fn full_index_replaces_previous_records() {
        let s = setup(|c| c).await;
        let by = s.remote.short();
        let update = Message::IndexUpdate(IndexUpdate {
            folder: "default".to_string(),
            files: vec![file_record("old", b"1", by)],
        });
        s.model.on_message(&s.remote, update).await.unwrap();
        let index = Message::Index(Index {
            folder: "default".to_string(),
            files: vec![file_record("new", b"2", by)],
        });
        s.model.on_message(&s.remote, index).await.unwrap();

        let folder = s.model.folder("default").unwrap();
        let names = folder.index().names().await.unwrap();
        assert!(names.contains("new"));
        assert!(!names.contains("old"));
    }

    #[tokio::test]
    async fn temp_names_are_recorded_invalid() {
        let s = setup(|c| c).await;
        let by = s.remote.short();
        let temp = sync_core::temp_name_for("x", &sync_types::VersionVector::new());
        let update = Message::IndexUpdate(IndexUpdate {
            folder: "default".to_string(),
            files: vec![file_record(&temp, b"1", by), file_record("../escape", b"2", by)],
        });
        s.model.on_message(&s.remote, update).await.unwrap();

        let folder = s.model.folder("default").unwrap();
        assert!(folder.index().global().await.unwrap().is_empty());
        let names = folder.index().names().await.unwrap();
        assert!(names.contains(&temp));
        assert!(!names.contains("../escape"));
    }

    #[tokio::test]
    async fn unknown_folder_is_an_error() {
        let s = setup(|c| c).await;
        assert!(matches!(
            s.model.pull("missing").await,
            Err(EngineError::UnknownFolder(_))
        ));
    }

    #[tokio::test]
    async fn from_config_registers_folders() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            device: crate::config::DeviceConfig::default(),
            folders: vec![
                FolderConfig::new("one", dir.path().join("one")),
                FolderConfig::new("two", dir.path().join("two")),
            ],
        };
        let model = Model::from_config(&config, DeviceId::random(), Arc::new(MemoryIndex::new()))
            .unwrap();
        assert_eq!(model.folder_ids(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn background_loop_pulls_announced_files() {
        let s = setup(|mut c| {
            c.pull_interval_ms = 10;
            c.scan_interval_secs = 0;
            c
        })
        .await;
        s.model.start();

        s.peer.serve("default", "testfile", b"test file contents\n");
        let update = Message::IndexUpdate(IndexUpdate {
            folder: "default".to_string(),
            files: vec![file_record("testfile", b"test file contents\n", s.remote.short())],
        });
        s.model.on_message(&s.remote, update).await.unwrap();

        let path = s.dir.path().join("testfile");
        let pulled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if std::fs::read(&path).ok().as_deref() == Some(&b"test file contents\n"[..]) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        s.model.stop().await;
        assert!(pulled.is_ok());
    }
}
