use crate::callback::{DownloadCallback, UploadCallback};
use crate::error::FileError;
use crate::generate::MockGenerateEngine;
use crate::ids::{DialogId, FileId};
use crate::load::MockLoadEngine;
use crate::location::{
    FileType, FullLocalFileLocation, FullRemoteFileLocation, InputFileToken,
    PartialLocalFileLocation, PartialRemoteFileLocation,
};
use crate::policy::FilePolicy;
use crate::store::InMemoryMetaStore;
use crate::FileManager;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub(crate) struct Harness {
    pub manager: FileManager,
    pub load: MockLoadEngine,
    pub generate: MockGenerateEngine,
    pub store: Arc<InMemoryMetaStore>,
}

pub(crate) fn harness() -> Harness {
    harness_with_store(Arc::new(InMemoryMetaStore::new()))
}

pub(crate) fn harness_with_store(store: Arc<InMemoryMetaStore>) -> Harness {
    let load = MockLoadEngine::new();
    let generate = MockGenerateEngine::new();
    let manager = FileManager::new(
        FilePolicy::default(),
        Arc::new(load.clone()),
        Arc::new(generate.clone()),
        Some(store.clone()),
    );
    Harness {
        manager,
        load,
        generate,
        store,
    }
}

pub(crate) fn owner() -> DialogId {
    DialogId(77)
}

pub(crate) fn remote(id: i64) -> FullRemoteFileLocation {
    FullRemoteFileLocation {
        file_type: FileType::Document,
        dc_id: 2,
        id,
        access_hash: id.wrapping_mul(31) + 5,
    }
}

pub(crate) fn secret_remote(id: i64) -> FullRemoteFileLocation {
    FullRemoteFileLocation {
        file_type: FileType::Secret,
        ..remote(id)
    }
}

pub(crate) fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> FullLocalFileLocation {
    write_file_typed(dir, name, bytes, FileType::Document)
}

pub(crate) fn write_file_typed(
    dir: &Path,
    name: &str,
    bytes: &[u8],
    file_type: FileType,
) -> FullLocalFileLocation {
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("write test file");
    FullLocalFileLocation {
        file_type,
        path: path.to_string_lossy().into_owned(),
        mtime_nsec: 0,
    }
}

pub(crate) fn partial_local(path: &str, ready_part_count: i32) -> PartialLocalFileLocation {
    PartialLocalFileLocation {
        file_type: FileType::Document,
        path: path.to_string(),
        part_size: 1024,
        ready_part_count,
        iv: Vec::new(),
    }
}

pub(crate) fn partial_remote(id: i64, ready_part_count: i32) -> PartialRemoteFileLocation {
    PartialRemoteFileLocation {
        id,
        part_count: 8,
        part_size: 1024,
        ready_part_count,
        is_big: false,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CallbackEvent {
    Progress(FileId),
    DownloadOk(FileId),
    DownloadError(FileId, FileError),
    UploadOk(FileId, InputFileToken),
    UploadEncryptedOk(FileId, InputFileToken),
    UploadError(FileId, FileError),
}

/// Records every per-handle callback in arrival order; implements both
/// callback capabilities so one instance can watch a whole transfer.
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<CallbackEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: CallbackEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl DownloadCallback for Recorder {
    fn on_progress(&self, file_id: FileId) {
        self.push(CallbackEvent::Progress(file_id));
    }

    fn on_download_ok(&self, file_id: FileId) {
        self.push(CallbackEvent::DownloadOk(file_id));
    }

    fn on_download_error(&self, file_id: FileId, error: FileError) {
        self.push(CallbackEvent::DownloadError(file_id, error));
    }
}

impl UploadCallback for Recorder {
    fn on_progress(&self, file_id: FileId) {
        self.push(CallbackEvent::Progress(file_id));
    }

    fn on_upload_ok(&self, file_id: FileId, token: InputFileToken) {
        self.push(CallbackEvent::UploadOk(file_id, token));
    }

    fn on_upload_encrypted_ok(&self, file_id: FileId, token: InputFileToken) {
        self.push(CallbackEvent::UploadEncryptedOk(file_id, token));
    }

    fn on_upload_error(&self, file_id: FileId, error: FileError) {
        self.push(CallbackEvent::UploadError(file_id, error));
    }
}
