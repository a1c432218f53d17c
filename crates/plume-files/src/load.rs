use crate::ids::QueryId;
use crate::location::{
    FileEncryptionKey, FileType, FullLocalFileLocation, FullRemoteFileLocation, LocalFileLocation,
    RemoteFileLocation,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct DownloadParts {
    pub query_id: QueryId,
    pub local: LocalFileLocation,
    pub remote: FullRemoteFileLocation,
    pub size: i64,
    pub name: String,
    pub encryption_key: FileEncryptionKey,
    pub priority: i8,
}

#[derive(Clone, Debug)]
pub struct UploadParts {
    pub query_id: QueryId,
    pub local: FullLocalFileLocation,
    pub remote: RemoteFileLocation,
    pub size: i64,
    pub expected_size: i64,
    pub encryption_key: FileEncryptionKey,
    pub priority: i8,
    pub upload_order: u64,
    pub bad_parts: Vec<i32>,
    pub by_hash: bool,
}

#[derive(Clone, Debug)]
pub struct SetContentParts {
    pub query_id: QueryId,
    pub file_type: FileType,
    pub bytes: Vec<u8>,
    pub priority: i8,
}

/// The byte-level transfer engine. Query ids are minted by the file manager;
/// completion and failure flow back through the manager's `on_*` callbacks.
#[async_trait]
pub trait LoadEngine: Send + Sync {
    async fn start_download(&self, parts: DownloadParts);
    async fn start_upload(&self, parts: UploadParts);
    async fn set_content(&self, parts: SetContentParts);
    async fn cancel(&self, query_id: QueryId);
}

#[derive(Default)]
pub struct LoadJournal {
    pub downloads: Vec<DownloadParts>,
    pub uploads: Vec<UploadParts>,
    pub set_contents: Vec<SetContentParts>,
    pub cancelled: Vec<QueryId>,
}

#[derive(Clone, Default)]
pub struct MockLoadEngine {
    inner: Arc<Mutex<LoadJournal>>,
}

impl MockLoadEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn downloads(&self) -> Vec<DownloadParts> {
        self.inner.lock().await.downloads.clone()
    }

    pub async fn uploads(&self) -> Vec<UploadParts> {
        self.inner.lock().await.uploads.clone()
    }

    pub async fn set_contents(&self) -> Vec<SetContentParts> {
        self.inner.lock().await.set_contents.clone()
    }

    pub async fn cancelled(&self) -> Vec<QueryId> {
        self.inner.lock().await.cancelled.clone()
    }

    pub async fn last_download_query(&self) -> Option<QueryId> {
        self.inner.lock().await.downloads.last().map(|p| p.query_id)
    }

    pub async fn last_upload_query(&self) -> Option<QueryId> {
        self.inner.lock().await.uploads.last().map(|p| p.query_id)
    }

    pub async fn last_set_content_query(&self) -> Option<QueryId> {
        self.inner
            .lock()
            .await
            .set_contents
            .last()
            .map(|p| p.query_id)
    }
}

#[async_trait]
impl LoadEngine for MockLoadEngine {
    async fn start_download(&self, parts: DownloadParts) {
        self.inner.lock().await.downloads.push(parts);
    }

    async fn start_upload(&self, parts: UploadParts) {
        self.inner.lock().await.uploads.push(parts);
    }

    async fn set_content(&self, parts: SetContentParts) {
        self.inner.lock().await.set_contents.push(parts);
    }

    async fn cancel(&self, query_id: QueryId) {
        self.inner.lock().await.cancelled.push(query_id);
    }
}
