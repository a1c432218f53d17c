use crate::ids::{DialogId, FileId, MetaId, QueryId};
use crate::location::{
    FileEncryptionKey, FileLocationSource, FileType, GenerateFileLocation, LocalFileLocation,
    RemoteFileLocation,
};
use crate::store::FileData;

/// Canonical state of one underlying file. Mutations go through the setters,
/// which record whether the change is user-observable (`info_changed`) and
/// whether it diverges from the last persisted record (`pmc_changed`).
#[derive(Clone, Debug)]
pub struct FileNode {
    pub(crate) local: LocalFileLocation,
    pub(crate) remote: RemoteFileLocation,
    pub(crate) generate: GenerateFileLocation,
    pub(crate) size: i64,
    pub(crate) expected_size: i64,
    pub(crate) local_ready_size: i64,
    pub(crate) remote_ready_size: i64,
    pub(crate) name: String,
    pub(crate) url: String,
    pub(crate) owner_dialog_id: DialogId,
    pub(crate) encryption_key: FileEncryptionKey,
    pub(crate) remote_source: FileLocationSource,
    pub(crate) empty_file_type: FileType,

    pub(crate) meta_id: Option<MetaId>,
    pub(crate) file_ids: Vec<FileId>,
    pub(crate) main_file_id: FileId,
    pub(crate) main_file_id_priority: i8,

    pub(crate) download_priority: i8,
    pub(crate) upload_priority: i8,
    pub(crate) generate_priority: i8,
    pub(crate) generate_download_priority: i8,
    pub(crate) generate_upload_priority: i8,

    pub(crate) upload_pause: Option<FileId>,
    pub(crate) download_query: Option<QueryId>,
    pub(crate) upload_query: Option<QueryId>,
    pub(crate) generate_query: Option<QueryId>,

    pub(crate) get_by_hash: bool,
    pub(crate) is_download_started: bool,
    pub(crate) generate_was_update: bool,
    pub(crate) need_load_from_pmc: bool,

    pub(crate) pmc_changed: bool,
    pub(crate) info_changed: bool,
}

impl FileNode {
    pub(crate) fn from_data(
        data: FileData,
        main_file_id: FileId,
        main_file_id_priority: i8,
    ) -> Self {
        let size = data.size.max(0);
        Self {
            local: data.local,
            remote: data.remote,
            generate: data.generate,
            size,
            expected_size: data.expected_size.max(size),
            local_ready_size: 0,
            remote_ready_size: 0,
            name: data.name,
            url: data.url,
            owner_dialog_id: data.owner_dialog_id,
            encryption_key: data.encryption_key,
            remote_source: data.remote_source,
            empty_file_type: FileType::Temp,
            meta_id: None,
            file_ids: Vec::new(),
            main_file_id,
            main_file_id_priority,
            download_priority: 0,
            upload_priority: 0,
            generate_priority: 0,
            generate_download_priority: 0,
            generate_upload_priority: 0,
            upload_pause: None,
            download_query: None,
            upload_query: None,
            generate_query: None,
            get_by_hash: false,
            is_download_started: false,
            generate_was_update: false,
            need_load_from_pmc: false,
            pmc_changed: false,
            info_changed: false,
        }
    }

    pub(crate) fn to_data(&self) -> FileData {
        FileData {
            local: self.local.clone(),
            remote: self.remote.clone(),
            generate: self.generate.clone(),
            size: self.size,
            expected_size: self.expected_size,
            name: self.name.clone(),
            url: self.url.clone(),
            owner_dialog_id: self.owner_dialog_id,
            encryption_key: self.encryption_key.clone(),
            remote_source: self.remote_source,
        }
    }

    /// Effective type: local wins, then remote, then generate, then the type
    /// declared at empty registration. A node carrying an encryption key
    /// always reports the secret variant.
    pub(crate) fn file_type(&self) -> FileType {
        let file_type = self
            .local
            .file_type()
            .or_else(|| self.remote.file_type())
            .or_else(|| self.generate.file_type())
            .unwrap_or(self.empty_file_type);
        if self.encryption_key.is_empty() {
            file_type
        } else {
            file_type.to_secret()
        }
    }

    pub(crate) fn set_local_location(&mut self, local: LocalFileLocation, ready_size: i64) {
        if self.local_ready_size != ready_size {
            self.local_ready_size = ready_size;
            self.on_info_changed();
        }
        if self.local != local {
            self.local = local;
            self.on_changed();
        }
    }

    pub(crate) fn set_remote_location(
        &mut self,
        remote: RemoteFileLocation,
        source: FileLocationSource,
        ready_size: i64,
    ) {
        if self.remote_ready_size != ready_size {
            self.remote_ready_size = ready_size;
            self.on_info_changed();
        }
        if self.remote != remote || self.remote_source != source {
            self.remote = remote;
            self.remote_source = source;
            self.on_changed();
        }
    }

    pub(crate) fn set_generate_location(&mut self, generate: GenerateFileLocation) {
        if self.generate != generate {
            self.generate = generate;
            self.on_changed();
        }
    }

    pub(crate) fn set_size(&mut self, size: i64) {
        if self.size != size {
            self.size = size;
            if self.expected_size < size {
                self.expected_size = size;
            }
            self.on_changed();
        }
    }

    pub(crate) fn set_expected_size(&mut self, expected_size: i64) {
        let expected_size = expected_size.max(self.size);
        if self.expected_size != expected_size {
            self.expected_size = expected_size;
            self.on_changed();
        }
    }

    pub(crate) fn set_name(&mut self, name: String) {
        if self.name != name {
            self.name = name;
            self.on_changed();
        }
    }

    pub(crate) fn set_url(&mut self, url: String) {
        if self.url != url {
            self.url = url;
            self.on_changed();
        }
    }

    pub(crate) fn set_owner_dialog_id(&mut self, owner_dialog_id: DialogId) {
        if self.owner_dialog_id != owner_dialog_id {
            self.owner_dialog_id = owner_dialog_id;
            self.on_pmc_changed();
        }
    }

    pub(crate) fn set_encryption_key(&mut self, key: FileEncryptionKey) {
        if self.encryption_key != key {
            self.encryption_key = key;
            self.on_changed();
        }
    }

    pub(crate) fn set_download_priority(&mut self, priority: i8) {
        if self.download_priority != priority {
            self.download_priority = priority;
            self.on_info_changed();
        }
    }

    pub(crate) fn set_upload_priority(&mut self, priority: i8) {
        if self.upload_priority != priority {
            self.upload_priority = priority;
            self.on_info_changed();
        }
    }

    pub(crate) fn set_generate_priority(&mut self, download: i8, upload: i8) {
        if self.generate_download_priority != download || self.generate_upload_priority != upload {
            self.generate_download_priority = download;
            self.generate_upload_priority = upload;
            self.generate_priority = download.max(upload);
            self.on_info_changed();
        }
    }

    pub(crate) fn on_changed(&mut self) {
        self.on_pmc_changed();
        self.on_info_changed();
    }

    pub(crate) fn on_pmc_changed(&mut self) {
        self.pmc_changed = true;
    }

    pub(crate) fn on_info_changed(&mut self) {
        self.info_changed = true;
    }

    pub(crate) fn need_pmc_flush(&self) -> bool {
        self.pmc_changed
    }

    pub(crate) fn need_info_flush(&self) -> bool {
        self.info_changed
    }

    pub(crate) fn on_pmc_flushed(&mut self) {
        self.pmc_changed = false;
    }

    pub(crate) fn on_info_flushed(&mut self) {
        self.info_changed = false;
    }

    /// Anything worth a row in the metadata store?
    pub(crate) fn has_persistable_state(&self) -> bool {
        self.local.is_full() || self.remote.is_full() || self.generate.is_full()
            || !self.url.is_empty()
    }
}
