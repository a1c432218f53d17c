use crate::ids::QueryId;
use crate::location::{FullGenerateFileLocation, LocalFileLocation};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct GenerateParts {
    pub query_id: QueryId,
    pub generate: FullGenerateFileLocation,
    pub local: LocalFileLocation,
    pub size: i64,
    pub expected_size: i64,
    pub name: String,
    /// Pressure the generation inherits from the handles waiting on it, split
    /// by what they are waiting for.
    pub download_priority: i8,
    pub upload_priority: i8,
}

/// The content-generation worker; produces local bytes from a generate
/// location. Progress mirrors the download side of the load engine.
#[async_trait]
pub trait GenerateEngine: Send + Sync {
    async fn start_generate(&self, parts: GenerateParts);
    async fn cancel(&self, query_id: QueryId);
}

#[derive(Default)]
pub struct GenerateJournal {
    pub generates: Vec<GenerateParts>,
    pub cancelled: Vec<QueryId>,
}

#[derive(Clone, Default)]
pub struct MockGenerateEngine {
    inner: Arc<Mutex<GenerateJournal>>,
}

impl MockGenerateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn generates(&self) -> Vec<GenerateParts> {
        self.inner.lock().await.generates.clone()
    }

    pub async fn cancelled(&self) -> Vec<QueryId> {
        self.inner.lock().await.cancelled.clone()
    }

    pub async fn last_generate_query(&self) -> Option<QueryId> {
        self.inner.lock().await.generates.last().map(|p| p.query_id)
    }
}

#[async_trait]
impl GenerateEngine for MockGenerateEngine {
    async fn start_generate(&self, parts: GenerateParts) {
        self.inner.lock().await.generates.push(parts);
    }

    async fn cancel(&self, query_id: QueryId) {
        self.inner.lock().await.cancelled.push(query_id);
    }
}
