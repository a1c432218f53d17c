use crate::error::FileError;
use crate::ids::{DialogId, MetaId};
use crate::location::{
    FileEncryptionKey, FileLocationSource, FullGenerateFileLocation, FullLocalFileLocation,
    FullRemoteFileLocation, GenerateFileLocation, LocalFileLocation, RemoteFileLocation,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// The persisted record of a node: everything needed to rebuild it after a
/// restart.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    pub local: LocalFileLocation,
    pub remote: RemoteFileLocation,
    pub generate: GenerateFileLocation,
    pub size: i64,
    pub expected_size: i64,
    pub name: String,
    pub url: String,
    pub owner_dialog_id: DialogId,
    pub encryption_key: FileEncryptionKey,
    pub remote_source: FileLocationSource,
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, id: MetaId) -> Result<Option<FileData>, FileError>;
    async fn get_by_local(
        &self,
        location: &FullLocalFileLocation,
    ) -> Result<Option<(MetaId, FileData)>, FileError>;
    async fn get_by_remote(
        &self,
        location: &FullRemoteFileLocation,
    ) -> Result<Option<(MetaId, FileData)>, FileError>;
    async fn get_by_generate(
        &self,
        location: &FullGenerateFileLocation,
    ) -> Result<Option<(MetaId, FileData)>, FileError>;
    async fn put(&self, id: MetaId, data: &FileData) -> Result<(), FileError>;
    async fn erase(&self, id: MetaId) -> Result<(), FileError>;
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<u64, Vec<u8>>,
    by_location: HashMap<String, u64>,
    puts: u64,
    erases: u64,
}

/// JSON-bytes store with location secondary indexes; the stand-in used by
/// tests and lightweight embedders.
#[derive(Default)]
pub struct InMemoryMetaStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_count(&self) -> u64 {
        self.inner.lock().await.puts
    }

    pub async fn erase_count(&self) -> u64 {
        self.inner.lock().await.erases
    }

    /// Plant raw bytes under a record, bypassing the codec. Lets tests model
    /// a corrupt row.
    pub async fn put_raw(&self, id: MetaId, bytes: Vec<u8>, location_key: Option<String>) {
        let mut inner = self.inner.lock().await;
        inner.records.insert(id.0, bytes);
        if let Some(key) = location_key {
            inner.by_location.insert(key, id.0);
        }
    }

    pub fn local_key(location: &FullLocalFileLocation) -> String {
        format!("local:{:?}:{}", location.file_type, location.path)
    }

    pub fn remote_key(location: &FullRemoteFileLocation) -> String {
        format!("remote:{}:{}", location.dc_id, location.id)
    }

    pub fn generate_key(location: &FullGenerateFileLocation) -> String {
        format!(
            "generate:{}:{}",
            location.original_path, location.conversion
        )
    }

    fn decode(bytes: &[u8]) -> Result<FileData, FileError> {
        serde_json::from_slice(bytes).map_err(|err| FileError::Io(err.to_string()))
    }

    fn location_keys(data: &FileData) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(local) = data.local.full() {
            keys.push(Self::local_key(local));
        }
        if let Some(remote) = data.remote.full() {
            keys.push(Self::remote_key(remote));
        }
        if let Some(generate) = data.generate.full() {
            keys.push(Self::generate_key(generate));
        }
        keys
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<(MetaId, FileData)>, FileError> {
        let inner = self.inner.lock().await;
        let Some(&id) = inner.by_location.get(key) else {
            return Ok(None);
        };
        let Some(bytes) = inner.records.get(&id) else {
            return Ok(None);
        };
        Ok(Some((MetaId(id), Self::decode(bytes)?)))
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn get(&self, id: MetaId) -> Result<Option<FileData>, FileError> {
        let inner = self.inner.lock().await;
        match inner.records.get(&id.0) {
            Some(bytes) => Ok(Some(Self::decode(bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_by_local(
        &self,
        location: &FullLocalFileLocation,
    ) -> Result<Option<(MetaId, FileData)>, FileError> {
        self.get_by_key(&Self::local_key(location)).await
    }

    async fn get_by_remote(
        &self,
        location: &FullRemoteFileLocation,
    ) -> Result<Option<(MetaId, FileData)>, FileError> {
        self.get_by_key(&Self::remote_key(location)).await
    }

    async fn get_by_generate(
        &self,
        location: &FullGenerateFileLocation,
    ) -> Result<Option<(MetaId, FileData)>, FileError> {
        self.get_by_key(&Self::generate_key(location)).await
    }

    async fn put(&self, id: MetaId, data: &FileData) -> Result<(), FileError> {
        let bytes = serde_json::to_vec(data).map_err(|err| FileError::Io(err.to_string()))?;
        let mut inner = self.inner.lock().await;
        // drop index entries the previous version of this row held
        let old_keys = inner
            .records
            .get(&id.0)
            .and_then(|old| Self::decode(old).ok())
            .map(|old| Self::location_keys(&old))
            .unwrap_or_default();
        for key in old_keys {
            if inner.by_location.get(&key) == Some(&id.0) {
                inner.by_location.remove(&key);
            }
        }
        inner.records.insert(id.0, bytes);
        for key in Self::location_keys(data) {
            inner.by_location.insert(key, id.0);
        }
        inner.puts += 1;
        Ok(())
    }

    async fn erase(&self, id: MetaId) -> Result<(), FileError> {
        let mut inner = self.inner.lock().await;
        if let Some(bytes) = inner.records.remove(&id.0) {
            if let Ok(data) = Self::decode(&bytes) {
                for key in Self::location_keys(&data) {
                    if inner.by_location.get(&key) == Some(&id.0) {
                        inner.by_location.remove(&key);
                    }
                }
            }
            inner.erases += 1;
        }
        Ok(())
    }
}
