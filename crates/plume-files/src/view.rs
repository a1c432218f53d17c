use crate::ids::{DialogId, FileId};
use crate::location::{
    FileEncryptionKey, FileType, FullGenerateFileLocation, FullLocalFileLocation,
    FullRemoteFileLocation,
};
use crate::node::FileNode;

/// Read-only snapshot of a node. Every accessor derives from node state;
/// nothing here mutates.
#[derive(Clone, Copy)]
pub struct FileView<'a> {
    node: &'a FileNode,
}

impl<'a> FileView<'a> {
    pub(crate) fn new(node: &'a FileNode) -> Self {
        Self { node }
    }

    pub fn file_id(&self) -> FileId {
        self.node.main_file_id
    }

    pub fn has_local_location(&self) -> bool {
        self.node.local.is_full()
    }

    pub fn local_location(&self) -> Option<&'a FullLocalFileLocation> {
        self.node.local.full()
    }

    pub fn has_remote_location(&self) -> bool {
        self.node.remote.is_full()
    }

    pub fn remote_location(&self) -> Option<&'a FullRemoteFileLocation> {
        self.node.remote.full()
    }

    pub fn remote_source(&self) -> crate::location::FileLocationSource {
        self.node.remote_source
    }

    pub fn has_generate_location(&self) -> bool {
        self.node.generate.is_full()
    }

    pub fn generate_location(&self) -> Option<&'a FullGenerateFileLocation> {
        self.node.generate.full()
    }

    pub fn has_url(&self) -> bool {
        !self.node.url.is_empty()
    }

    pub fn url(&self) -> &'a str {
        &self.node.url
    }

    pub fn name(&self) -> &'a str {
        &self.node.name
    }

    pub fn owner_dialog_id(&self) -> DialogId {
        self.node.owner_dialog_id
    }

    pub fn get_by_hash(&self) -> bool {
        self.node.get_by_hash
    }

    pub fn size(&self) -> i64 {
        self.node.size
    }

    pub fn expected_size(&self) -> i64 {
        self.node.expected_size
    }

    pub fn is_downloading(&self) -> bool {
        self.node.download_query.is_some()
    }

    pub fn is_uploading(&self) -> bool {
        self.node.upload_query.is_some()
    }

    pub fn is_generating(&self) -> bool {
        self.node.generate_query.is_some()
    }

    pub fn local_size(&self) -> i64 {
        if self.node.local.is_full() {
            self.node.size
        } else {
            self.node.local_ready_size
        }
    }

    pub fn local_total_size(&self) -> i64 {
        if self.node.size > 0 {
            self.node.size
        } else {
            self.node.expected_size
        }
    }

    pub fn remote_size(&self) -> i64 {
        if self.node.remote.is_full() {
            self.node.size
        } else {
            self.node.remote_ready_size
        }
    }

    pub fn path(&self) -> Option<&'a str> {
        self.node.local.full().map(|full| full.path.as_str())
    }

    pub fn can_download_from_server(&self) -> bool {
        self.node.remote.is_full()
    }

    pub fn can_generate(&self) -> bool {
        self.node.generate.is_full()
    }

    pub fn can_delete(&self) -> bool {
        self.node.local.is_full() || self.node.local.is_partial()
    }

    pub fn get_type(&self) -> FileType {
        self.node.file_type()
    }

    pub fn is_encrypted(&self) -> bool {
        self.get_type().is_secret()
    }

    pub fn encryption_key(&self) -> &'a FileEncryptionKey {
        &self.node.encryption_key
    }
}
