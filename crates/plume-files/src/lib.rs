pub mod callback;
pub mod error;
pub mod event;
pub mod generate;
pub mod ids;
pub mod load;
pub mod location;
pub mod node;
pub mod persistent_id;
pub mod policy;
pub mod store;
pub mod view;

#[cfg(test)]
mod tests;

use crate::callback::{DownloadCallback, UploadCallback};
use crate::error::FileError;
use crate::event::{FileEvent, FileEventBus, FileEventReceiver};
use crate::generate::{GenerateEngine, GenerateParts};
use crate::ids::{DialogId, FileId, FileNodeId, MetaId, QueryId};
use crate::load::{DownloadParts, LoadEngine, SetContentParts, UploadParts};
use crate::location::{
    FileEncryptionKey, FileLocationSource, FileType, FullGenerateFileLocation,
    FullLocalFileLocation, FullRemoteFileLocation, GenerateFileLocation, InputFileToken,
    LocalFileLocation, PartialLocalFileLocation, PartialRemoteFileLocation, RemoteFileLocation,
};
use crate::node::FileNode;
use crate::policy::FilePolicy;
use crate::store::{FileData, MetaStore};
use crate::view::FileView;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueryKind {
    Download,
    Upload,
    UploadByHash,
    SetContent,
    Generate,
}

#[derive(Clone, Copy, Debug)]
struct Query {
    file_id: FileId,
    kind: QueryKind,
}

#[derive(Default)]
struct FileIdInfo {
    node_id: FileNodeId,
    send_updates: bool,
    pinned: bool,
    download_priority: i8,
    upload_priority: i8,
    upload_order: u64,
    download_callback: Option<Arc<dyn DownloadCallback>>,
    upload_callback: Option<Arc<dyn UploadCallback>>,
}

fn local_rank(location: &LocalFileLocation) -> u8 {
    match location {
        LocalFileLocation::Empty => 0,
        LocalFileLocation::Partial(_) => 1,
        LocalFileLocation::Full(_) => 2,
    }
}

fn remote_rank(location: &RemoteFileLocation) -> u8 {
    match location {
        RemoteFileLocation::Empty => 0,
        RemoteFileLocation::Partial(_) => 1,
        RemoteFileLocation::Full(_) => 2,
    }
}

/// The file manager: every notion of a file (local blob, remote object,
/// generatable content) becomes one node reachable through any number of
/// handles, and per-node state machines drive the load and generate engines.
///
/// All mutation happens through `&mut self`; embedders that share the manager
/// across tasks put it behind a single `tokio::sync::Mutex`, which keeps
/// engine callbacks serialized against caller operations.
pub struct FileManager {
    policy: FilePolicy,
    load_engine: Arc<dyn LoadEngine>,
    generate_engine: Arc<dyn GenerateEngine>,
    store: Option<Arc<dyn MetaStore>>,
    events: FileEventBus,

    file_id_infos: Vec<FileIdInfo>,
    empty_file_ids: Vec<FileId>,
    file_nodes: Vec<Option<FileNode>>,

    local_index: HashMap<FullLocalFileLocation, FileId>,
    remote_index: HashMap<FullRemoteFileLocation, FileId>,
    generate_index: HashMap<FullGenerateFileLocation, FileId>,
    meta_index: HashMap<MetaId, FileNodeId>,

    queries: HashMap<QueryId, Query>,
    next_query_id: u64,
    next_meta_id: u64,

    bad_paths: HashSet<String>,
    dirty_nodes: Vec<FileNodeId>,
}

impl FileManager {
    pub fn new(
        policy: FilePolicy,
        load_engine: Arc<dyn LoadEngine>,
        generate_engine: Arc<dyn GenerateEngine>,
        store: Option<Arc<dyn MetaStore>>,
    ) -> Self {
        let events = FileEventBus::new(policy.event_capacity);
        Self {
            policy,
            load_engine,
            generate_engine,
            store,
            events,
            file_id_infos: Vec::new(),
            empty_file_ids: Vec::new(),
            file_nodes: Vec::new(),
            local_index: HashMap::new(),
            remote_index: HashMap::new(),
            generate_index: HashMap::new(),
            meta_index: HashMap::new(),
            queries: HashMap::new(),
            next_query_id: 1,
            next_meta_id: 1,
            bad_paths: HashSet::new(),
            dirty_nodes: Vec::new(),
        }
    }

    /// Seed the record-id counter above the store's high-water mark after a
    /// restart, so fresh rows never collide with surviving ones.
    pub fn with_meta_id_seed(mut self, seed: u64) -> Self {
        self.next_meta_id = seed.max(1);
        self
    }

    pub fn subscribe(&self) -> FileEventReceiver {
        self.events.subscribe()
    }

    // ---- registration ----

    pub async fn register_empty(&mut self, file_type: FileType) -> FileId {
        let file_id = self.add_node(FileData::default(), 0, true);
        let node_id = self.file_id_infos[file_id.0 as usize].node_id;
        self.node_mut(node_id).empty_file_type = file_type;
        self.flush_dirty().await;
        file_id
    }

    pub async fn register_local(
        &mut self,
        location: FullLocalFileLocation,
        owner_dialog_id: DialogId,
        size: i64,
        get_by_hash: bool,
        force: bool,
    ) -> Result<FileId, FileError> {
        let mut location = location;
        let mut size = size;
        self.check_local_location_impl(&mut location, &mut size, force)?;
        let data = FileData {
            local: LocalFileLocation::Full(location),
            size,
            expected_size: size,
            owner_dialog_id,
            ..FileData::default()
        };
        let file_id = self
            .do_register(data, FileLocationSource::None, force, None, true)
            .await?;
        {
            let node_id = self.node_id(file_id)?;
            let node = self.node_mut(node_id);
            node.get_by_hash = node.get_by_hash || get_by_hash;
        }
        if !force {
            // a forced registration declares a fresh file; old records for
            // this path must not fold it back onto their node
            self.maybe_schedule_rehydration(file_id, true).await;
        }
        let node_id = self.node_id(file_id)?;
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
        Ok(file_id)
    }

    pub async fn register_remote(
        &mut self,
        location: FullRemoteFileLocation,
        source: FileLocationSource,
        owner_dialog_id: DialogId,
        size: i64,
        expected_size: i64,
        name: String,
    ) -> Result<FileId, FileError> {
        let mut name = name;
        if name.len() > self.policy.max_name_length {
            let mut cut = self.policy.max_name_length;
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name.truncate(cut);
        }
        let data = FileData {
            remote: RemoteFileLocation::Full(location),
            size,
            expected_size,
            name,
            owner_dialog_id,
            remote_source: source,
            ..FileData::default()
        };
        let file_id = self.do_register(data, source, false, None, true).await?;
        self.maybe_schedule_rehydration(file_id, false).await;
        let node_id = self.node_id(file_id)?;
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
        Ok(file_id)
    }

    pub async fn register_generate(
        &mut self,
        file_type: FileType,
        original_path: String,
        conversion: String,
        owner_dialog_id: DialogId,
        expected_size: i64,
    ) -> Result<FileId, FileError> {
        if conversion.is_empty() {
            return Err(FileError::WrongLocalLocation("empty conversion".to_string()));
        }
        let data = FileData {
            generate: GenerateFileLocation::Full(FullGenerateFileLocation {
                file_type,
                original_path,
                conversion,
                mtime_nsec: 0,
            }),
            expected_size,
            owner_dialog_id,
            ..FileData::default()
        };
        let file_id = self
            .do_register(data, FileLocationSource::None, false, None, true)
            .await?;
        self.maybe_schedule_rehydration(file_id, true).await;
        let node_id = self.node_id(file_id)?;
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
        Ok(file_id)
    }

    /// Rehydrate a persisted record; conflicts with realized nodes resolve by
    /// merging.
    pub async fn register_file(
        &mut self,
        data: FileData,
        source: FileLocationSource,
        force: bool,
    ) -> Result<FileId, FileError> {
        let file_id = self.do_register(data, source, force, None, true).await?;
        let node_id = self.node_id(file_id)?;
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
        Ok(file_id)
    }

    async fn do_register(
        &mut self,
        data: FileData,
        source: FileLocationSource,
        force: bool,
        known_meta: Option<MetaId>,
        pinned: bool,
    ) -> Result<FileId, FileError> {
        let no_sync = matches!(source, FileLocationSource::FromDb);
        let file_id = self.add_node(data, 0, pinned);
        if let Some(meta_id) = known_meta {
            let node_id = self.file_id_infos[file_id.0 as usize].node_id;
            self.node_mut(node_id).meta_id = Some(meta_id);
            self.meta_index.insert(meta_id, node_id);
        }
        let (local, remote, generate) = {
            let node_id = self.file_id_infos[file_id.0 as usize].node_id;
            let node = self.node_ref(node_id);
            (
                node.local.full().cloned(),
                node.remote.full().cloned(),
                node.generate.full().cloned(),
            )
        };
        if let Some(local) = local {
            if let Err(err) = self.bind_local(file_id, local, force, no_sync).await {
                self.forget_failed_registration(file_id).await;
                return Err(err);
            }
        }
        if let Some(remote) = remote {
            if let Err(err) = self.bind_remote(file_id, remote, no_sync).await {
                self.forget_failed_registration(file_id).await;
                return Err(err);
            }
        }
        if let Some(generate) = generate {
            if let Err(err) = self.bind_generate(file_id, generate, no_sync).await {
                self.forget_failed_registration(file_id).await;
                return Err(err);
            }
        }
        Ok(file_id)
    }

    async fn bind_local(
        &mut self,
        file_id: FileId,
        location: FullLocalFileLocation,
        force: bool,
        no_sync: bool,
    ) -> Result<(), FileError> {
        if let Some(other) = self.local_index.get(&location).copied() {
            if self.node_id(other).ok() != self.node_id(file_id).ok() {
                if force {
                    let other_node_id = self.node_id(other)?;
                    warn!(%file_id, other = %other, "forced registration takes over local location");
                    self.node_mut(other_node_id)
                        .set_local_location(LocalFileLocation::Empty, 0);
                    self.cancel_upload(other_node_id).await;
                    self.reevaluate(other_node_id).await;
                } else {
                    self.merge_impl(file_id, other, no_sync).await?;
                }
            }
        }
        let node_id = self.node_id(file_id)?;
        let main = self.node_ref(node_id).main_file_id;
        self.local_index.insert(location, main);
        Ok(())
    }

    async fn bind_remote(
        &mut self,
        file_id: FileId,
        location: FullRemoteFileLocation,
        no_sync: bool,
    ) -> Result<(), FileError> {
        if let Some(other) = self.remote_index.get(&location).copied() {
            if self.node_id(other).ok() != self.node_id(file_id).ok() {
                self.merge_impl(file_id, other, no_sync).await?;
            }
        }
        let node_id = self.node_id(file_id)?;
        let main = self.node_ref(node_id).main_file_id;
        self.remote_index.insert(location, main);
        Ok(())
    }

    async fn bind_generate(
        &mut self,
        file_id: FileId,
        location: FullGenerateFileLocation,
        no_sync: bool,
    ) -> Result<(), FileError> {
        if let Some(other) = self.generate_index.get(&location).copied() {
            if self.node_id(other).ok() != self.node_id(file_id).ok() {
                self.merge_impl(file_id, other, no_sync).await?;
            }
        }
        let node_id = self.node_id(file_id)?;
        let main = self.node_ref(node_id).main_file_id;
        self.generate_index.insert(location, main);
        Ok(())
    }

    async fn forget_failed_registration(&mut self, file_id: FileId) {
        let Ok(node_id) = self.node_id(file_id) else {
            return;
        };
        if self.node_ref(node_id).file_ids.len() == 1 {
            self.remove_node(node_id).await;
        }
    }

    // ---- merging ----

    pub async fn merge(
        &mut self,
        x_file_id: FileId,
        y_file_id: FileId,
        no_sync: bool,
    ) -> Result<FileId, FileError> {
        let result = self.merge_impl(x_file_id, y_file_id, no_sync).await;
        if let Ok(file_id) = result {
            if let Ok(node_id) = self.node_id(file_id) {
                self.reevaluate(node_id).await;
            }
        }
        self.flush_dirty().await;
        result
    }

    async fn merge_impl(
        &mut self,
        x_file_id: FileId,
        y_file_id: FileId,
        no_sync: bool,
    ) -> Result<FileId, FileError> {
        let x_node_id = self.node_id(x_file_id)?;
        let y_node_id = self.node_id(y_file_id)?;
        if x_node_id == y_node_id {
            return Ok(self.node_ref(x_node_id).main_file_id);
        }

        let (survivor_id, victim_id) = {
            let x = self.node_ref(x_node_id);
            let y = self.node_ref(y_node_id);
            if x.main_file_id_priority > y.main_file_id_priority
                || (x.main_file_id_priority == y.main_file_id_priority
                    && x.main_file_id.0 <= y.main_file_id.0)
            {
                (x_node_id, y_node_id)
            } else {
                (y_node_id, x_node_id)
            }
        };

        {
            let survivor = self.node_ref(survivor_id);
            let victim = self.node_ref(victim_id);
            let conflict = matches!(
                (survivor.local.full(), victim.local.full()),
                (Some(a), Some(b)) if a != b
            ) || matches!(
                (survivor.remote.full(), victim.remote.full()),
                (Some(a), Some(b)) if a != b
            ) || matches!(
                (survivor.generate.full(), victim.generate.full()),
                (Some(a), Some(b)) if a != b
            );
            if conflict && !no_sync {
                return Err(FileError::CantShareOwnership);
            }
        }

        let mut victim = self.file_nodes[victim_id].take().expect("live file node");
        debug!(
            survivor = %self.node_ref(survivor_id).main_file_id,
            victim = %victim.main_file_id,
            "merging file nodes"
        );

        // locations the victim loses in a conflict disappear entirely
        let survivor_local = self.node_ref(survivor_id).local.full().cloned();
        let survivor_remote = self.node_ref(survivor_id).remote.full().cloned();
        let survivor_generate = self.node_ref(survivor_id).generate.full().cloned();
        if let (Some(kept), Some(lost)) = (&survivor_local, victim.local.full()) {
            if kept != lost {
                self.local_index.remove(lost);
            }
        }
        if let (Some(kept), Some(lost)) = (&survivor_remote, victim.remote.full()) {
            if kept != lost {
                self.remote_index.remove(lost);
            }
        }
        if let (Some(kept), Some(lost)) = (&survivor_generate, victim.generate.full()) {
            if kept != lost {
                self.generate_index.remove(lost);
            }
        }

        let mut load_cancels: Vec<QueryId> = Vec::new();
        let mut generate_cancels: Vec<QueryId> = Vec::new();
        for query_id in [victim.download_query.take(), victim.upload_query.take()]
            .into_iter()
            .flatten()
        {
            self.queries.remove(&query_id);
            load_cancels.push(query_id);
        }
        if let Some(query_id) = victim.generate_query.take() {
            self.queries.remove(&query_id);
            generate_cancels.push(query_id);
        }

        let mut erase_meta: Option<MetaId> = None;
        {
            let survivor = self.file_nodes[survivor_id]
                .as_mut()
                .expect("live file node");
            if local_rank(&victim.local) > local_rank(&survivor.local) {
                let ready = victim.local_ready_size;
                survivor.set_local_location(victim.local.clone(), ready);
            }
            if remote_rank(&victim.remote) > remote_rank(&survivor.remote) {
                let ready = victim.remote_ready_size;
                survivor.set_remote_location(victim.remote.clone(), victim.remote_source, ready);
            }
            if victim.generate.is_full() && !survivor.generate.is_full() {
                survivor.set_generate_location(victim.generate.clone());
            }
            if victim.size > survivor.size {
                survivor.set_size(victim.size);
            }
            survivor.set_expected_size(survivor.expected_size.max(victim.expected_size));
            if survivor.name.is_empty() && !victim.name.is_empty() {
                survivor.set_name(victim.name.clone());
            }
            if survivor.url.is_empty() && !victim.url.is_empty() {
                survivor.set_url(victim.url.clone());
            }
            if !survivor.owner_dialog_id.is_known() && victim.owner_dialog_id.is_known() {
                survivor.set_owner_dialog_id(victim.owner_dialog_id);
            }
            if survivor.encryption_key.is_empty() && !victim.encryption_key.is_empty() {
                survivor.set_encryption_key(victim.encryption_key.clone());
            }
            survivor.get_by_hash = survivor.get_by_hash || victim.get_by_hash;
            survivor.upload_pause = None;
            match (survivor.meta_id, victim.meta_id) {
                (Some(_), Some(victim_meta)) => erase_meta = Some(victim_meta),
                (None, Some(victim_meta)) => survivor.meta_id = Some(victim_meta),
                _ => {}
            }
            survivor.need_load_from_pmc = (survivor.need_load_from_pmc
                || victim.need_load_from_pmc)
                && survivor.meta_id.is_none();
            survivor.on_changed();
        }

        {
            let survivor = self.file_nodes[survivor_id]
                .as_mut()
                .expect("live file node");
            for file_id in victim.file_ids.drain(..) {
                self.file_id_infos[file_id.0 as usize].node_id = survivor_id;
                survivor.file_ids.push(file_id);
            }
        }

        let (main, final_local, final_remote, final_generate, final_meta) = {
            let survivor = self.node_ref(survivor_id);
            (
                survivor.main_file_id,
                survivor.local.full().cloned(),
                survivor.remote.full().cloned(),
                survivor.generate.full().cloned(),
                survivor.meta_id,
            )
        };
        if let Some(local) = final_local {
            self.local_index.insert(local, main);
        }
        if let Some(remote) = final_remote {
            self.remote_index.insert(remote, main);
        }
        if let Some(generate) = final_generate {
            self.generate_index.insert(generate, main);
        }
        if let Some(meta_id) = final_meta {
            self.meta_index.insert(meta_id, survivor_id);
        }

        self.recalc_node_priorities(survivor_id);
        self.schedule_flush(survivor_id);

        for query_id in load_cancels {
            let engine = self.load_engine.clone();
            engine.cancel(query_id).await;
        }
        for query_id in generate_cancels {
            let engine = self.generate_engine.clone();
            engine.cancel(query_id).await;
        }
        if let Some(meta_id) = erase_meta {
            self.meta_index.remove(&meta_id);
            if let Some(store) = self.store.clone() {
                if let Err(err) = store.erase(meta_id).await {
                    warn!(%meta_id, error = %err, "failed to erase merged record");
                }
            }
        }
        Ok(main)
    }

    // ---- state engine ----

    fn recalc_node_priorities(&mut self, node_id: FileNodeId) {
        let (download, upload) = {
            let node = self.node_ref(node_id);
            let mut download = 0i8;
            let mut upload = 0i8;
            for &file_id in &node.file_ids {
                let info = &self.file_id_infos[file_id.0 as usize];
                download = download.max(info.download_priority);
                upload = upload.max(info.upload_priority);
            }
            (download, upload)
        };
        let node = self.node_mut(node_id);
        node.set_download_priority(download);
        node.set_upload_priority(upload);
        node.set_generate_priority(download, upload);
    }

    async fn reevaluate(&mut self, node_id: FileNodeId) {
        self.recalc_node_priorities(node_id);
        let (
            download_priority,
            upload_priority,
            generate_priority,
            local_full,
            remote_full,
            generate_full,
            encryption_ok,
            upload_paused,
            download_active,
            upload_active,
            generate_active,
            set_content_active,
        ) = {
            let node = self.node_ref(node_id);
            let set_content_active = node.download_query.map_or(false, |query_id| {
                matches!(
                    self.queries.get(&query_id),
                    Some(Query {
                        kind: QueryKind::SetContent,
                        ..
                    })
                )
            });
            (
                node.download_priority,
                node.upload_priority,
                node.generate_priority,
                node.local.is_full(),
                node.remote.is_full(),
                node.generate.is_full(),
                !node.file_type().is_secret() || !node.encryption_key.is_empty(),
                node.upload_pause.is_some(),
                node.download_query.is_some(),
                node.upload_query.is_some(),
                node.generate_query.is_some(),
                set_content_active,
            )
        };

        let download_desired =
            download_priority > 0 && remote_full && !local_full && encryption_ok;
        let generate_desired = generate_priority > 0 && generate_full && !local_full;
        let (want_download, want_generate) = match (download_desired, generate_desired) {
            (true, true) => {
                if generate_priority >= download_priority {
                    (false, true)
                } else {
                    (true, false)
                }
            }
            both => both,
        };
        let want_upload = upload_priority > 0 && local_full && !remote_full && !upload_paused;

        if !want_download && download_active && !set_content_active {
            self.cancel_download(node_id).await;
        }
        // an upload awaiting server confirmation stays parked, never cancelled
        if !want_upload && upload_active && !upload_paused {
            self.cancel_upload(node_id).await;
        }
        if !want_generate && generate_active {
            self.cancel_generate(node_id).await;
        }

        if want_download && self.node_ref(node_id).download_query.is_none() {
            self.run_download(node_id).await;
        }
        if want_upload && self.node_ref(node_id).upload_query.is_none() {
            self.run_upload(node_id, Vec::new()).await;
        }
        if want_generate && self.node_ref(node_id).generate_query.is_none() {
            self.run_generate(node_id).await;
        }
        self.schedule_flush(node_id);
    }

    async fn run_download(&mut self, node_id: FileNodeId) {
        let query_id = self.next_query();
        let parts = {
            let node = self.node_mut(node_id);
            let Some(remote) = node.remote.full().cloned() else {
                return;
            };
            node.download_query = Some(query_id);
            node.is_download_started = false;
            DownloadParts {
                query_id,
                local: node.local.clone(),
                remote,
                size: node.size,
                name: node.name.clone(),
                encryption_key: node.encryption_key.clone(),
                priority: node.download_priority,
            }
        };
        let main = self.node_ref(node_id).main_file_id;
        self.queries.insert(
            query_id,
            Query {
                file_id: main,
                kind: QueryKind::Download,
            },
        );
        debug!(%query_id, file_id = %main, "starting download");
        let engine = self.load_engine.clone();
        engine.start_download(parts).await;
    }

    async fn run_upload(&mut self, node_id: FileNodeId, bad_parts: Vec<i32>) {
        let upload_handle = self.pick_upload_handle(node_id);
        let upload_order = self.file_id_infos[upload_handle.0 as usize].upload_order;
        let query_id = self.next_query();
        let (parts, kind) = {
            let node = self.node_mut(node_id);
            let Some(local) = node.local.full().cloned() else {
                return;
            };
            node.upload_query = Some(query_id);
            let by_hash = node.get_by_hash && node.encryption_key.is_empty();
            (
                UploadParts {
                    query_id,
                    local,
                    remote: node.remote.clone(),
                    size: node.size,
                    expected_size: node.expected_size,
                    encryption_key: node.encryption_key.clone(),
                    priority: node.upload_priority,
                    upload_order,
                    bad_parts,
                    by_hash,
                },
                if by_hash {
                    QueryKind::UploadByHash
                } else {
                    QueryKind::Upload
                },
            )
        };
        self.queries.insert(
            query_id,
            Query {
                file_id: upload_handle,
                kind,
            },
        );
        debug!(%query_id, file_id = %upload_handle, "starting upload");
        let engine = self.load_engine.clone();
        engine.start_upload(parts).await;
    }

    async fn run_generate(&mut self, node_id: FileNodeId) {
        let query_id = self.next_query();
        let parts = {
            let node = self.node_mut(node_id);
            let Some(generate) = node.generate.full().cloned() else {
                return;
            };
            node.generate_query = Some(query_id);
            node.generate_was_update = false;
            GenerateParts {
                query_id,
                generate,
                local: node.local.clone(),
                size: node.size,
                expected_size: node.expected_size,
                name: node.name.clone(),
                download_priority: node.generate_download_priority,
                upload_priority: node.generate_upload_priority,
            }
        };
        let main = self.node_ref(node_id).main_file_id;
        self.queries.insert(
            query_id,
            Query {
                file_id: main,
                kind: QueryKind::Generate,
            },
        );
        debug!(%query_id, file_id = %main, "starting generation");
        let engine = self.generate_engine.clone();
        engine.start_generate(parts).await;
    }

    fn pick_upload_handle(&self, node_id: FileNodeId) -> FileId {
        let node = self.node_ref(node_id);
        let mut best = node.main_file_id;
        let mut best_priority = 0i8;
        let mut best_order = u64::MAX;
        for &file_id in &node.file_ids {
            let info = &self.file_id_infos[file_id.0 as usize];
            if info.upload_priority == 0 {
                continue;
            }
            if info.upload_priority > best_priority
                || (info.upload_priority == best_priority && info.upload_order < best_order)
            {
                best = file_id;
                best_priority = info.upload_priority;
                best_order = info.upload_order;
            }
        }
        best
    }

    async fn cancel_download(&mut self, node_id: FileNodeId) {
        let Some(query_id) = self.node_mut(node_id).download_query.take() else {
            return;
        };
        self.queries.remove(&query_id);
        {
            let node = self.node_mut(node_id);
            node.is_download_started = false;
            node.local_ready_size = 0;
            node.on_info_changed();
        }
        debug!(%query_id, "cancelling download");
        let engine = self.load_engine.clone();
        engine.cancel(query_id).await;
        self.schedule_flush(node_id);
    }

    async fn cancel_upload(&mut self, node_id: FileNodeId) {
        let Some(query_id) = self.node_mut(node_id).upload_query.take() else {
            return;
        };
        self.queries.remove(&query_id);
        {
            let node = self.node_mut(node_id);
            node.remote_ready_size = 0;
            node.on_info_changed();
        }
        debug!(%query_id, "cancelling upload");
        let engine = self.load_engine.clone();
        engine.cancel(query_id).await;
        self.schedule_flush(node_id);
    }

    async fn cancel_generate(&mut self, node_id: FileNodeId) {
        let Some(query_id) = self.node_mut(node_id).generate_query.take() else {
            return;
        };
        self.queries.remove(&query_id);
        {
            let node = self.node_mut(node_id);
            if node.generate_was_update && node.local.is_partial() {
                // the partial file belongs to the cancelled generator
                node.set_local_location(LocalFileLocation::Empty, 0);
            } else {
                node.local_ready_size = 0;
                node.on_info_changed();
            }
            node.generate_was_update = false;
        }
        debug!(%query_id, "cancelling generation");
        let engine = self.generate_engine.clone();
        engine.cancel(query_id).await;
        self.schedule_flush(node_id);
    }

    // ---- control API ----

    pub async fn download(
        &mut self,
        file_id: FileId,
        callback: Option<Arc<dyn DownloadCallback>>,
        new_priority: i8,
    ) -> Result<(), FileError> {
        let node_id = self.node_id(file_id)?;
        {
            let info = &mut self.file_id_infos[file_id.0 as usize];
            info.download_priority = new_priority.max(0);
            if callback.is_some() {
                info.pinned = true;
            }
            info.download_callback = callback;
        }
        if self.node_ref(node_id).need_load_from_pmc {
            self.load_from_store(file_id).await;
        }
        let node_id = self.node_id(file_id)?;
        if new_priority > 0 && self.node_ref(node_id).local.is_full() {
            // bytes already here
            self.finish_download_handles(node_id);
            self.recalc_node_priorities(node_id);
            self.schedule_flush(node_id);
            self.flush_dirty().await;
            return Ok(());
        }
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
        Ok(())
    }

    pub async fn upload(
        &mut self,
        file_id: FileId,
        callback: Option<Arc<dyn UploadCallback>>,
        new_priority: i8,
        upload_order: u64,
    ) -> Result<(), FileError> {
        let node_id = self.node_id(file_id)?;
        {
            let info = &mut self.file_id_infos[file_id.0 as usize];
            info.upload_priority = new_priority.max(0);
            info.upload_order = upload_order;
            if callback.is_some() {
                info.pinned = true;
            }
            info.upload_callback = callback;
        }
        let already_remote = self.node_ref(node_id).remote.full().cloned();
        if let (Some(remote), true) = (already_remote, new_priority > 0) {
            let (name, encrypted, key_fingerprint) = {
                let node = self.node_ref(node_id);
                (
                    node.name.clone(),
                    node.file_type().is_secret(),
                    node.encryption_key.fingerprint(),
                )
            };
            if let Some(cb) = self.file_id_infos[file_id.0 as usize].upload_callback.take() {
                if encrypted {
                    let token = InputFileToken::Encrypted {
                        id: remote.id,
                        part_count: 0,
                        key_fingerprint,
                    };
                    cb.on_upload_encrypted_ok(file_id, token);
                } else {
                    let token = InputFileToken::Plain {
                        id: remote.id,
                        part_count: 0,
                        name,
                    };
                    cb.on_upload_ok(file_id, token);
                }
            }
            self.flush_dirty().await;
            return Ok(());
        }
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
        Ok(())
    }

    /// Explicit resumption: lifts the post-`on_upload_ok` pause and restarts
    /// the transfer, re-sending the parts the server reported bad.
    pub async fn resume_upload(
        &mut self,
        file_id: FileId,
        bad_parts: Vec<i32>,
        callback: Option<Arc<dyn UploadCallback>>,
        new_priority: i8,
        upload_order: u64,
    ) -> Result<(), FileError> {
        let node_id = self.node_id(file_id)?;
        {
            let info = &mut self.file_id_infos[file_id.0 as usize];
            info.upload_priority = new_priority.max(0);
            info.upload_order = upload_order;
            if let Some(cb) = callback {
                info.pinned = true;
                info.upload_callback = Some(cb);
            }
        }
        self.node_mut(node_id).upload_pause = None;
        if self.node_ref(node_id).upload_query.is_some() {
            self.cancel_upload(node_id).await;
        }
        self.recalc_node_priorities(node_id);
        let wants_upload = {
            let node = self.node_ref(node_id);
            node.upload_priority > 0 && node.local.is_full() && !node.remote.is_full()
        };
        if wants_upload {
            self.run_upload(node_id, bad_parts).await;
        }
        self.schedule_flush(node_id);
        self.flush_dirty().await;
        Ok(())
    }

    pub async fn delete_partial_remote_location(
        &mut self,
        file_id: FileId,
    ) -> Result<(), FileError> {
        let node_id = self.node_id(file_id)?;
        {
            let node = self.node_mut(node_id);
            node.upload_pause = None;
            if node.remote.is_partial() {
                node.set_remote_location(RemoteFileLocation::Empty, FileLocationSource::None, 0);
            }
        }
        if self.node_ref(node_id).upload_query.is_some() {
            self.cancel_upload(node_id).await;
        }
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
        Ok(())
    }

    pub async fn delete_file(&mut self, file_id: FileId) -> Result<(), FileError> {
        let node_id = self.node_id(file_id)?;
        let path = {
            let node = self.node_ref(node_id);
            match &node.local {
                LocalFileLocation::Full(full) => Some(full.path.clone()),
                LocalFileLocation::Partial(partial) => Some(partial.path.clone()),
                LocalFileLocation::Empty => None,
            }
        };
        debug!(%file_id, "deleting file");
        self.remove_node(node_id).await;
        if let Some(path) = path {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path, error = %err, "failed to remove local file");
            }
        }
        self.flush_dirty().await;
        Ok(())
    }

    pub async fn set_encryption_key(
        &mut self,
        file_id: FileId,
        key: FileEncryptionKey,
    ) -> Result<(), FileError> {
        let node_id = self.node_id(file_id)?;
        if !self.node_ref(node_id).file_type().is_secret() {
            return Err(FileError::WrongFileType);
        }
        self.node_mut(node_id).set_encryption_key(key);
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
        Ok(())
    }

    /// Write the given bytes as this file's content. Runs as a load-engine
    /// query at an implicit high priority; completion arrives through the
    /// ordinary download-ok route and produces a fresh full local location.
    pub async fn set_content(&mut self, file_id: FileId, bytes: Vec<u8>) -> Result<(), FileError> {
        let node_id = self.node_id(file_id)?;
        let priority = self.policy.from_bytes_priority;
        {
            let info = &mut self.file_id_infos[file_id.0 as usize];
            info.download_priority = priority;
            info.pinned = true;
        }
        let stale_user_remote = {
            let node = self.node_ref(node_id);
            if node.remote.is_full() && node.remote_source == FileLocationSource::FromUser {
                node.remote.full().cloned()
            } else {
                None
            }
        };
        if let Some(remote) = stale_user_remote {
            // user-supplied coordinates described the old bytes
            self.remote_index.remove(&remote);
            self.node_mut(node_id).set_remote_location(
                RemoteFileLocation::Empty,
                FileLocationSource::None,
                0,
            );
        }
        if self.node_ref(node_id).download_query.is_some() {
            self.cancel_download(node_id).await;
        }
        if self.node_ref(node_id).upload_query.is_some() {
            self.cancel_upload(node_id).await;
        }
        let file_type = self.node_ref(node_id).file_type();
        let query_id = self.next_query();
        self.node_mut(node_id).download_query = Some(query_id);
        self.queries.insert(
            query_id,
            Query {
                file_id,
                kind: QueryKind::SetContent,
            },
        );
        self.recalc_node_priorities(node_id);
        debug!(%query_id, %file_id, "writing supplied content");
        let engine = self.load_engine.clone();
        engine
            .set_content(SetContentParts {
                query_id,
                file_type,
                bytes,
                priority,
            })
            .await;
        self.schedule_flush(node_id);
        self.flush_dirty().await;
        Ok(())
    }

    pub async fn get_content(&mut self, file_id: FileId) -> Result<Vec<u8>, FileError> {
        let node_id = self.node_id(file_id)?;
        let full = self.node_ref(node_id).local.full().cloned();
        let Some(full) = full else {
            return Err(FileError::FileNotFound(self.node_ref(node_id).name.clone()));
        };
        Ok(tokio::fs::read(&full.path).await?)
    }

    /// External notice that a local file disappeared from disk.
    pub async fn on_file_unlink(&mut self, location: &FullLocalFileLocation) {
        let Some(&file_id) = self.local_index.get(location) else {
            return;
        };
        let Ok(node_id) = self.node_id(file_id) else {
            return;
        };
        self.local_index.remove(location);
        self.bad_paths.remove(&location.path);
        self.node_mut(node_id)
            .set_local_location(LocalFileLocation::Empty, 0);
        if self.node_ref(node_id).upload_query.is_some() {
            self.cancel_upload(node_id).await;
        }
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
    }

    pub fn dup_file_id(&mut self, file_id: FileId) -> Result<FileId, FileError> {
        let node_id = self.node_id(file_id)?;
        let new_id = self.next_file_id();
        {
            let info = &mut self.file_id_infos[new_id.0 as usize];
            info.node_id = node_id;
            info.send_updates = true;
            info.pinned = true;
        }
        self.node_mut(node_id).file_ids.push(new_id);
        Ok(new_id)
    }

    pub fn to_persistent_id(&self, file_id: FileId) -> Result<String, FileError> {
        let node_id = self.node_id(file_id)?;
        let Some(remote) = self.node_ref(node_id).remote.full() else {
            return Err(FileError::WrongRemoteLocation);
        };
        Ok(persistent_id::encode(remote))
    }

    pub async fn from_persistent_id(
        &mut self,
        text: &str,
        file_type: FileType,
    ) -> Result<FileId, FileError> {
        let location = persistent_id::decode(text)?;
        if file_type != FileType::Temp && file_type != location.file_type {
            return Err(FileError::WrongFileType);
        }
        self.register_remote(
            location,
            FileLocationSource::FromUser,
            DialogId::default(),
            0,
            0,
            String::new(),
        )
        .await
    }

    pub fn get_file_view(&self, file_id: FileId) -> Result<FileView<'_>, FileError> {
        let node_id = self.node_id(file_id)?;
        Ok(FileView::new(self.node_ref(node_id)))
    }

    /// Like `get_file_view`, but reads the metadata store first when the node
    /// still has an unrealized location.
    pub async fn get_sync_file_view(&mut self, file_id: FileId) -> Result<FileView<'_>, FileError> {
        let node_id = self.node_id(file_id)?;
        if self.node_ref(node_id).need_load_from_pmc {
            self.load_from_store(file_id).await;
            self.flush_dirty().await;
        }
        let node_id = self.node_id(file_id)?;
        Ok(FileView::new(self.node_ref(node_id)))
    }

    pub async fn external_generate_progress(
        &mut self,
        query_id: QueryId,
        expected_size: i64,
        local_prefix_size: i64,
    ) -> Result<(), FileError> {
        let Some(&Query { file_id, kind }) = self.queries.get(&query_id) else {
            return Err(FileError::Cancelled);
        };
        if kind != QueryKind::Generate {
            return Err(FileError::Cancelled);
        }
        let node_id = self.node_id(file_id)?;
        {
            let node = self.node_mut(node_id);
            if expected_size > 0 {
                node.set_expected_size(expected_size);
            }
            if local_prefix_size > node.local_ready_size {
                node.local_ready_size = local_prefix_size;
                node.on_info_changed();
            }
            node.generate_was_update = true;
        }
        self.fire_download_progress(node_id);
        self.schedule_flush(node_id);
        self.flush_dirty().await;
        Ok(())
    }

    pub async fn external_generate_finish(
        &mut self,
        query_id: QueryId,
        status: Result<FullLocalFileLocation, FileError>,
    ) -> Result<(), FileError> {
        match status {
            Ok(local) => self.on_generate_ok(query_id, local).await,
            Err(err) => self.on_error(query_id, err).await,
        }
        Ok(())
    }

    // ---- query router: load engine callbacks ----

    pub async fn on_start_download(&mut self, query_id: QueryId) {
        let Some(&Query { file_id, .. }) = self.queries.get(&query_id) else {
            return;
        };
        let Ok(node_id) = self.node_id(file_id) else {
            return;
        };
        if self.node_ref(node_id).download_query != Some(query_id) {
            return;
        }
        if self.node_ref(node_id).is_download_started {
            return;
        }
        {
            let node = self.node_mut(node_id);
            node.is_download_started = true;
            node.on_info_changed();
        }
        self.fire_download_progress(node_id);
        self.schedule_flush(node_id);
        self.flush_dirty().await;
    }

    pub async fn on_partial_download(
        &mut self,
        query_id: QueryId,
        partial_local: PartialLocalFileLocation,
        ready_size: i64,
    ) {
        let Some(&Query { file_id, .. }) = self.queries.get(&query_id) else {
            return;
        };
        let Ok(node_id) = self.node_id(file_id) else {
            return;
        };
        if self.node_ref(node_id).download_query != Some(query_id) {
            return;
        }
        {
            let node = self.node_mut(node_id);
            let ready = node.local_ready_size.max(ready_size);
            node.set_local_location(LocalFileLocation::Partial(partial_local), ready);
        }
        self.fire_download_progress(node_id);
        self.schedule_flush(node_id);
        self.flush_dirty().await;
    }

    pub async fn on_download_ok(
        &mut self,
        query_id: QueryId,
        local: FullLocalFileLocation,
        size: i64,
    ) {
        let Some(query) = self.take_query(query_id) else {
            return;
        };
        let Ok(node_id) = self.node_id(query.file_id) else {
            return;
        };
        debug!(file_id = %query.file_id, kind = ?query.kind, "download finished");
        {
            let node = self.node_mut(node_id);
            node.set_size(size);
            node.set_local_location(LocalFileLocation::Full(local.clone()), size);
            node.is_download_started = false;
        }
        if let Err(err) = self.bind_local(query.file_id, local, false, true).await {
            warn!(error = %err, "failed to index downloaded location");
        }
        let Ok(node_id) = self.node_id(query.file_id) else {
            return;
        };
        self.finish_download_handles(node_id);
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
    }

    pub async fn on_partial_upload(
        &mut self,
        query_id: QueryId,
        partial_remote: PartialRemoteFileLocation,
        ready_size: i64,
    ) {
        let Some(&Query { file_id, .. }) = self.queries.get(&query_id) else {
            return;
        };
        let Ok(node_id) = self.node_id(file_id) else {
            return;
        };
        if self.node_ref(node_id).upload_query != Some(query_id) {
            return;
        }
        {
            let node = self.node_mut(node_id);
            let ready = node.remote_ready_size.max(ready_size);
            let source = node.remote_source;
            node.set_remote_location(RemoteFileLocation::Partial(partial_remote), source, ready);
        }
        self.fire_upload_progress(node_id);
        self.schedule_flush(node_id);
        self.flush_dirty().await;
    }

    /// All parts are on the server; the caller gets a token to attach to a
    /// message, and further uploads pause until the server confirms the final
    /// identity (`on_upload_full_ok`). The query stays open meanwhile.
    pub async fn on_upload_ok(
        &mut self,
        query_id: QueryId,
        file_type: FileType,
        partial_remote: PartialRemoteFileLocation,
        size: i64,
    ) {
        let Some(&Query { file_id, .. }) = self.queries.get(&query_id) else {
            return;
        };
        let Ok(node_id) = self.node_id(file_id) else {
            return;
        };
        if self.node_ref(node_id).upload_query != Some(query_id) {
            return;
        }
        debug!(%file_id, "upload parts complete, awaiting confirmation");
        let encrypted = file_type.is_secret();
        let token = {
            let node = self.node_mut(node_id);
            if size > 0 {
                node.set_size(size);
            }
            let ready = node.remote_ready_size.max(partial_remote.ready_size());
            let source = node.remote_source;
            let token = if encrypted {
                InputFileToken::Encrypted {
                    id: partial_remote.id,
                    part_count: partial_remote.part_count,
                    key_fingerprint: node.encryption_key.fingerprint(),
                }
            } else {
                InputFileToken::Plain {
                    id: partial_remote.id,
                    part_count: partial_remote.part_count,
                    name: node.name.clone(),
                }
            };
            node.set_remote_location(RemoteFileLocation::Partial(partial_remote), source, ready);
            node.upload_pause = Some(file_id);
            node.on_changed();
            token
        };
        let cb = self.file_id_infos[file_id.0 as usize].upload_callback.clone();
        if let Some(cb) = cb {
            if encrypted {
                cb.on_upload_encrypted_ok(file_id, token);
            } else {
                cb.on_upload_ok(file_id, token);
            }
        }
        self.schedule_flush(node_id);
        self.flush_dirty().await;
    }

    pub async fn on_upload_full_ok(&mut self, query_id: QueryId, remote: FullRemoteFileLocation) {
        let Some(query) = self.take_query(query_id) else {
            return;
        };
        let Ok(node_id) = self.node_id(query.file_id) else {
            return;
        };
        debug!(file_id = %query.file_id, "upload confirmed by server");
        {
            let node = self.node_mut(node_id);
            let size = node.size;
            node.set_remote_location(
                RemoteFileLocation::Full(remote.clone()),
                FileLocationSource::FromServer,
                size,
            );
            node.upload_pause = None;
        }
        self.finish_upload_handles(node_id);
        if let Err(err) = self.bind_remote(query.file_id, remote, true).await {
            warn!(error = %err, "failed to index uploaded location");
        }
        let Ok(node_id) = self.node_id(query.file_id) else {
            return;
        };
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
    }

    // ---- query router: generate engine callbacks ----

    pub async fn on_partial_generate(
        &mut self,
        query_id: QueryId,
        partial_local: PartialLocalFileLocation,
        expected_size: i64,
    ) {
        let Some(&Query { file_id, .. }) = self.queries.get(&query_id) else {
            return;
        };
        let Ok(node_id) = self.node_id(file_id) else {
            return;
        };
        if self.node_ref(node_id).generate_query != Some(query_id) {
            return;
        }
        {
            let node = self.node_mut(node_id);
            let ready = node.local_ready_size.max(partial_local.ready_prefix_size());
            node.set_local_location(LocalFileLocation::Partial(partial_local), ready);
            if expected_size > 0 {
                node.set_expected_size(expected_size);
            }
            node.generate_was_update = true;
        }
        self.fire_download_progress(node_id);
        self.schedule_flush(node_id);
        self.flush_dirty().await;
    }

    pub async fn on_generate_ok(&mut self, query_id: QueryId, local: FullLocalFileLocation) {
        let Some(query) = self.take_query(query_id) else {
            return;
        };
        let Ok(node_id) = self.node_id(query.file_id) else {
            return;
        };
        let mut local = local;
        let mut size = 0i64;
        if let Err(err) = self.check_local_location_impl(&mut local, &mut size, true) {
            warn!(error = %err, "generated file failed validation");
            self.fail_download_handles(node_id, FileError::GenerationFailed(err.to_string()));
            self.reevaluate(node_id).await;
            self.flush_dirty().await;
            return;
        }
        debug!(file_id = %query.file_id, path = %local.path, "generation finished");
        {
            let node = self.node_mut(node_id);
            node.set_size(size);
            node.set_local_location(LocalFileLocation::Full(local.clone()), size);
            node.generate_was_update = false;
        }
        if let Err(err) = self.bind_local(query.file_id, local, false, true).await {
            warn!(error = %err, "failed to index generated location");
        }
        let Ok(node_id) = self.node_id(query.file_id) else {
            return;
        };
        self.finish_download_handles(node_id);
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
    }

    // ---- query router: errors ----

    pub async fn on_error(&mut self, query_id: QueryId, error: FileError) {
        let Some(query) = self.take_query(query_id) else {
            return;
        };
        let Ok(node_id) = self.node_id(query.file_id) else {
            return;
        };
        if error.is_retryable() && query.kind != QueryKind::SetContent {
            debug!(file_id = %query.file_id, error = %error, "transient failure, retrying");
            self.reevaluate(node_id).await;
            self.flush_dirty().await;
            return;
        }
        warn!(file_id = %query.file_id, kind = ?query.kind, error = %error, "query failed");
        match query.kind {
            QueryKind::Download | QueryKind::SetContent | QueryKind::Generate => {
                if query.kind == QueryKind::Download {
                    let node = self.node_mut(node_id);
                    node.local_ready_size = 0;
                    node.is_download_started = false;
                    node.on_info_changed();
                }
                self.fail_download_handles(node_id, error);
            }
            QueryKind::Upload | QueryKind::UploadByHash => {
                if error.is_local_trouble() {
                    self.drop_local_location(node_id);
                }
                {
                    let node = self.node_mut(node_id);
                    node.remote_ready_size = 0;
                    node.on_info_changed();
                }
                self.fail_upload_handles(node_id, error);
            }
        }
        self.reevaluate(node_id).await;
        self.flush_dirty().await;
    }

    // ---- handle bookkeeping ----

    fn finish_download_handles(&mut self, node_id: FileNodeId) {
        let handles = self.node_ref(node_id).file_ids.clone();
        let mut fired: Vec<(FileId, Arc<dyn DownloadCallback>)> = Vec::new();
        for file_id in handles {
            if let Some(cb) = self.file_id_infos[file_id.0 as usize].download_callback.take() {
                fired.push((file_id, cb));
            }
        }
        for (file_id, cb) in fired {
            cb.on_download_ok(file_id);
        }
    }

    fn fail_download_handles(&mut self, node_id: FileNodeId, error: FileError) {
        let handles = self.node_ref(node_id).file_ids.clone();
        let mut fired: Vec<(FileId, Arc<dyn DownloadCallback>)> = Vec::new();
        for file_id in handles {
            let info = &mut self.file_id_infos[file_id.0 as usize];
            info.download_priority = 0;
            if let Some(cb) = info.download_callback.take() {
                fired.push((file_id, cb));
            }
        }
        self.recalc_node_priorities(node_id);
        for (file_id, cb) in fired {
            cb.on_download_error(file_id, error.clone());
        }
    }

    fn finish_upload_handles(&mut self, node_id: FileNodeId) {
        let handles = self.node_ref(node_id).file_ids.clone();
        for file_id in handles {
            self.file_id_infos[file_id.0 as usize].upload_callback = None;
        }
    }

    fn fail_upload_handles(&mut self, node_id: FileNodeId, error: FileError) {
        let handles = self.node_ref(node_id).file_ids.clone();
        let mut fired: Vec<(FileId, Arc<dyn UploadCallback>)> = Vec::new();
        for file_id in handles {
            let info = &mut self.file_id_infos[file_id.0 as usize];
            info.upload_priority = 0;
            if let Some(cb) = info.upload_callback.take() {
                fired.push((file_id, cb));
            }
        }
        self.recalc_node_priorities(node_id);
        for (file_id, cb) in fired {
            cb.on_upload_error(file_id, error.clone());
        }
    }

    fn fire_download_progress(&self, node_id: FileNodeId) {
        let mut fired: Vec<(FileId, Arc<dyn DownloadCallback>)> = Vec::new();
        for &file_id in &self.node_ref(node_id).file_ids {
            if let Some(cb) = &self.file_id_infos[file_id.0 as usize].download_callback {
                fired.push((file_id, cb.clone()));
            }
        }
        for (file_id, cb) in fired {
            cb.on_progress(file_id);
        }
    }

    fn fire_upload_progress(&self, node_id: FileNodeId) {
        let mut fired: Vec<(FileId, Arc<dyn UploadCallback>)> = Vec::new();
        for &file_id in &self.node_ref(node_id).file_ids {
            if let Some(cb) = &self.file_id_infos[file_id.0 as usize].upload_callback {
                fired.push((file_id, cb.clone()));
            }
        }
        for (file_id, cb) in fired {
            cb.on_progress(file_id);
        }
    }

    fn drop_local_location(&mut self, node_id: FileNodeId) {
        let Some(local) = self.node_ref(node_id).local.full().cloned() else {
            return;
        };
        warn!(path = %local.path, "local file no longer usable");
        self.local_index.remove(&local);
        self.bad_paths.insert(local.path);
        self.node_mut(node_id)
            .set_local_location(LocalFileLocation::Empty, 0);
    }

    fn try_forget_file_id(&mut self, file_id: FileId) {
        let Ok(node_id) = self.node_id(file_id) else {
            return;
        };
        {
            let info = &self.file_id_infos[file_id.0 as usize];
            if info.pinned
                || info.download_callback.is_some()
                || info.upload_callback.is_some()
                || info.download_priority != 0
                || info.upload_priority != 0
            {
                return;
            }
        }
        if self.node_ref(node_id).main_file_id == file_id {
            return;
        }
        self.node_mut(node_id).file_ids.retain(|id| *id != file_id);
        self.file_id_infos[file_id.0 as usize] = FileIdInfo::default();
        self.empty_file_ids.push(file_id);
    }

    // ---- table plumbing ----

    fn next_file_id(&mut self) -> FileId {
        if let Some(file_id) = self.empty_file_ids.pop() {
            self.file_id_infos[file_id.0 as usize] = FileIdInfo::default();
            file_id
        } else {
            let file_id = FileId(self.file_id_infos.len() as i32);
            self.file_id_infos.push(FileIdInfo::default());
            file_id
        }
    }

    fn next_query(&mut self) -> QueryId {
        let query_id = QueryId(self.next_query_id);
        self.next_query_id += 1;
        query_id
    }

    fn add_node(&mut self, data: FileData, main_file_id_priority: i8, pinned: bool) -> FileId {
        let node_id = self.file_nodes.len();
        let file_id = self.next_file_id();
        {
            let info = &mut self.file_id_infos[file_id.0 as usize];
            info.node_id = node_id;
            info.send_updates = pinned;
            info.pinned = pinned;
        }
        let size_hint = if data.size > 0 {
            data.size
        } else {
            data.expected_size
        };
        let mut node = FileNode::from_data(data, file_id, main_file_id_priority);
        node.file_ids.push(file_id);
        node.on_changed();
        self.file_nodes.push(Some(node));
        self.events.publish(FileEvent::NewFile { size: size_hint });
        self.schedule_flush(node_id);
        debug!(%file_id, node_id, "registered file node");
        file_id
    }

    fn node_id(&self, file_id: FileId) -> Result<FileNodeId, FileError> {
        if !file_id.is_valid() {
            return Err(FileError::InvalidFileId);
        }
        let info = self
            .file_id_infos
            .get(file_id.0 as usize)
            .ok_or(FileError::InvalidFileId)?;
        let node = self
            .file_nodes
            .get(info.node_id)
            .and_then(|slot| slot.as_ref())
            .ok_or(FileError::InvalidFileId)?;
        if !node.file_ids.contains(&file_id) {
            return Err(FileError::InvalidFileId);
        }
        Ok(info.node_id)
    }

    fn node_ref(&self, node_id: FileNodeId) -> &FileNode {
        self.file_nodes[node_id].as_ref().expect("live file node")
    }

    fn node_mut(&mut self, node_id: FileNodeId) -> &mut FileNode {
        self.file_nodes[node_id].as_mut().expect("live file node")
    }

    fn take_query(&mut self, query_id: QueryId) -> Option<Query> {
        let query = self.queries.remove(&query_id)?;
        if let Ok(node_id) = self.node_id(query.file_id) {
            let node = self.node_mut(node_id);
            if node.download_query == Some(query_id) {
                node.download_query = None;
                node.is_download_started = false;
            }
            if node.upload_query == Some(query_id) {
                node.upload_query = None;
            }
            if node.generate_query == Some(query_id) {
                node.generate_query = None;
            }
        }
        Some(query)
    }

    fn remove_node_from_indexes(&mut self, node_id: FileNodeId) {
        let (local, remote, generate, meta) = {
            let node = self.node_ref(node_id);
            (
                node.local.full().cloned(),
                node.remote.full().cloned(),
                node.generate.full().cloned(),
                node.meta_id,
            )
        };
        if let Some(local) = local {
            self.local_index.remove(&local);
        }
        if let Some(remote) = remote {
            self.remote_index.remove(&remote);
        }
        if let Some(generate) = generate {
            self.generate_index.remove(&generate);
        }
        if let Some(meta_id) = meta {
            self.meta_index.remove(&meta_id);
        }
    }

    async fn remove_node(&mut self, node_id: FileNodeId) {
        self.remove_node_from_indexes(node_id);
        let Some(mut node) = self.file_nodes[node_id].take() else {
            return;
        };
        for query_id in [node.download_query.take(), node.upload_query.take()]
            .into_iter()
            .flatten()
        {
            self.queries.remove(&query_id);
            let engine = self.load_engine.clone();
            engine.cancel(query_id).await;
        }
        if let Some(query_id) = node.generate_query.take() {
            self.queries.remove(&query_id);
            let engine = self.generate_engine.clone();
            engine.cancel(query_id).await;
        }
        for file_id in node.file_ids.drain(..) {
            self.file_id_infos[file_id.0 as usize] = FileIdInfo::default();
            self.empty_file_ids.push(file_id);
        }
        if let Some(meta_id) = node.meta_id {
            if let Some(store) = self.store.clone() {
                if let Err(err) = store.erase(meta_id).await {
                    warn!(%meta_id, error = %err, "failed to erase deleted record");
                }
            }
        }
    }

    fn check_local_location_impl(
        &mut self,
        location: &mut FullLocalFileLocation,
        size: &mut i64,
        force: bool,
    ) -> Result<(), FileError> {
        if !force && self.bad_paths.contains(&location.path) {
            return Err(FileError::WrongLocalLocation(format!(
                "path {} previously failed validation",
                location.path
            )));
        }
        let metadata = match std::fs::metadata(&location.path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.bad_paths.insert(location.path.clone());
                return Err(FileError::FileNotFound(location.path.clone()));
            }
            Err(err) => {
                self.bad_paths.insert(location.path.clone());
                return Err(FileError::Io(err.to_string()));
            }
        };
        if !metadata.is_file() {
            self.bad_paths.insert(location.path.clone());
            return Err(FileError::WrongLocalLocation(format!(
                "{} is not a regular file",
                location.path
            )));
        }
        let real_size = metadata.len() as i64;
        if *size == 0 {
            *size = real_size;
        } else if *size != real_size {
            self.bad_paths.insert(location.path.clone());
            return Err(FileError::WrongLocalLocation(format!(
                "size of {} is {} instead of {}",
                location.path, real_size, *size
            )));
        }
        location.mtime_nsec = metadata
            .modified()
            .ok()
            .and_then(|mtime| mtime.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|duration| duration.as_nanos() as u64)
            .unwrap_or(0);
        self.bad_paths.remove(&location.path);
        Ok(())
    }

    // ---- store rehydration ----

    async fn maybe_schedule_rehydration(&mut self, file_id: FileId, eager: bool) {
        if self.store.is_none() {
            return;
        }
        let Ok(node_id) = self.node_id(file_id) else {
            return;
        };
        {
            let node = self.node_mut(node_id);
            if node.meta_id.is_some() {
                return;
            }
            node.need_load_from_pmc = true;
        }
        if eager {
            self.load_from_store(file_id).await;
        }
    }

    async fn load_from_store(&mut self, file_id: FileId) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Ok(node_id) = self.node_id(file_id) else {
            return;
        };
        let (local, remote, generate) = {
            let node = self.node_mut(node_id);
            node.need_load_from_pmc = false;
            (
                node.local.full().cloned(),
                node.remote.full().cloned(),
                node.generate.full().cloned(),
            )
        };
        let mut found: Option<(MetaId, FileData)> = None;
        if let Some(remote) = remote {
            found = match store.get_by_remote(&remote).await {
                Ok(hit) => hit,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable file record");
                    None
                }
            };
        }
        if found.is_none() {
            if let Some(local) = local {
                found = match store.get_by_local(&local).await {
                    Ok(hit) => hit,
                    Err(err) => {
                        warn!(error = %err, "skipping unreadable file record");
                        None
                    }
                };
            }
        }
        if found.is_none() {
            if let Some(generate) = generate {
                found = match store.get_by_generate(&generate).await {
                    Ok(hit) => hit,
                    Err(err) => {
                        warn!(error = %err, "skipping unreadable file record");
                        None
                    }
                };
            }
        }
        let Some((meta_id, data)) = found else {
            return;
        };
        if let Some(&other_node) = self.meta_index.get(&meta_id) {
            // already realized in memory
            let other_main = self.node_ref(other_node).main_file_id;
            if let Err(err) = self.merge_impl(file_id, other_main, true).await {
                warn!(error = %err, "failed to merge already-loaded record");
            }
            return;
        }
        debug!(%meta_id, %file_id, "rehydrating file record");
        match self
            .do_register(data, FileLocationSource::FromDb, false, Some(meta_id), false)
            .await
        {
            Ok(db_file_id) => {
                if let Err(err) = self.merge_impl(file_id, db_file_id, true).await {
                    warn!(error = %err, "failed to merge rehydrated record");
                }
                self.try_forget_file_id(db_file_id);
                if let Ok(node_id) = self.node_id(file_id) {
                    self.reevaluate(node_id).await;
                }
            }
            Err(err) => warn!(error = %err, "failed to register rehydrated record"),
        }
    }

    // ---- flush coordination ----

    fn schedule_flush(&mut self, node_id: FileNodeId) {
        if !self.dirty_nodes.contains(&node_id) {
            self.dirty_nodes.push(node_id);
        }
    }

    async fn flush_dirty(&mut self) {
        let pending = std::mem::take(&mut self.dirty_nodes);
        for node_id in pending {
            if self
                .file_nodes
                .get(node_id)
                .and_then(|slot| slot.as_ref())
                .is_none()
            {
                continue;
            }
            self.flush_node_info(node_id);
            self.flush_node_pmc(node_id).await;
        }
    }

    fn flush_node_info(&mut self, node_id: FileNodeId) {
        let (main, should_publish) = {
            let node = self.node_ref(node_id);
            if !node.need_info_flush() {
                return;
            }
            let send = node
                .file_ids
                .iter()
                .any(|file_id| self.file_id_infos[file_id.0 as usize].send_updates);
            (node.main_file_id, send)
        };
        if should_publish {
            self.events.publish(FileEvent::Updated(main));
        }
        self.node_mut(node_id).on_info_flushed();
    }

    async fn flush_node_pmc(&mut self, node_id: FileNodeId) {
        let data = {
            let node = self.node_ref(node_id);
            if !node.need_pmc_flush() {
                return;
            }
            if node.need_load_from_pmc {
                // a thin record written now would shadow the row we are about
                // to rehydrate; persist once the store read resolves
                return;
            }
            if node.has_persistable_state() {
                Some(node.to_data())
            } else {
                None
            }
        };
        let Some(data) = data else {
            // nothing worth a row; drop any stale one and wait for the next
            // full location to re-mark the node
            if let Some(meta_id) = self.node_ref(node_id).meta_id {
                if let Some(store) = self.store.clone() {
                    if let Err(err) = store.erase(meta_id).await {
                        warn!(%meta_id, error = %err, "failed to erase stale record");
                    }
                }
            }
            self.node_mut(node_id).on_pmc_flushed();
            return;
        };
        let Some(store) = self.store.clone() else {
            self.node_mut(node_id).on_pmc_flushed();
            return;
        };
        let meta_id = match self.node_ref(node_id).meta_id {
            Some(meta_id) => meta_id,
            None => {
                let meta_id = MetaId(self.next_meta_id);
                self.next_meta_id += 1;
                self.node_mut(node_id).meta_id = Some(meta_id);
                self.meta_index.insert(meta_id, node_id);
                meta_id
            }
        };
        if let Err(err) = store.put(meta_id, &data).await {
            // keep the dirty flag so a later flush retries
            warn!(%meta_id, error = %err, "failed to flush file record");
            return;
        }
        self.node_mut(node_id).on_pmc_flushed();
    }
}
