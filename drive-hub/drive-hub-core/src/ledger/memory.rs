//! In-process reference ledger.
//!
//! Authoritative state behind a `parking_lot` lock, permission decisions
//! delegated to the engine, events fanned out over a broadcast channel with
//! a monotonically assigned sequence number. Backs tests, benches and
//! single-node deployments; a remote backend implements the same trait over
//! its own transport.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::acl::{Acl, Grant};
use crate::error::{Error, Result};
use crate::ledger::{
    EntityId, EventKind, FileId, FileRecord, GroupId, GroupRecord, Ledger, LedgerEvent,
    PermissionBatch, SequenceNumber, Subject,
};
use crate::settings::Settings;

/// Internal record state; enumeration indexes are composed from the
/// permission engine on every query.
#[derive(Debug, Clone)]
struct FileMeta {
    id: FileId,
    is_folder: bool,
    parent_folder: FileId,
    storage_ref: String,
    file_size: u64,
    last_modification: DateTime<Utc>,
    name: String,
    labels: Vec<String>,
    owner: EntityId,
    is_public: bool,
    is_deleted: bool,
}

struct LedgerState {
    files: HashMap<FileId, FileMeta>,
    acl: Acl,
    settings: Settings,
    managers: HashSet<EntityId>,
    next_file_id: u64,
    sequence: SequenceNumber,
}

impl LedgerState {
    fn meta(&self, id: FileId) -> Result<&FileMeta> {
        self.files.get(&id).ok_or(Error::FileNotFound(id))
    }

    fn require_write(&self, id: FileId, caller: &str) -> Result<()> {
        let meta = self.meta(id)?;
        if self.acl.can_write(id, &meta.owner, caller) {
            Ok(())
        } else {
            Err(Error::AccessDenied(caller.to_string()))
        }
    }

    fn require_manager(&self, caller: &str) -> Result<()> {
        if self.managers.contains(caller) {
            Ok(())
        } else {
            Err(Error::AccessDenied(caller.to_string()))
        }
    }

    fn next_event(&mut self, kind: EventKind, subject: Option<Subject>) -> LedgerEvent {
        self.sequence += 1;
        LedgerEvent {
            sequence: self.sequence,
            kind,
            subject,
        }
    }

    fn compose(&self, meta: &FileMeta) -> FileRecord {
        FileRecord {
            id: meta.id,
            is_folder: meta.is_folder,
            parent_folder: meta.parent_folder,
            storage_ref: meta.storage_ref.clone(),
            file_size: meta.file_size,
            last_modification: meta.last_modification,
            name: meta.name.clone(),
            labels: meta.labels.clone(),
            owner: meta.owner.clone(),
            is_public: meta.is_public,
            is_deleted: meta.is_deleted,
            permission_addresses: self.acl.entities_with_grants(meta.id),
            permission_groups: self.acl.groups_with_grants(meta.id),
        }
    }
}

pub struct MemoryLedger {
    state: RwLock<LedgerState>,
    events: broadcast::Sender<LedgerEvent>,
}

impl MemoryLedger {
    /// A fresh ledger with `manager` holding the manager role and owning
    /// the root folder (id 0, public, self-parented).
    pub fn new(manager: impl Into<EntityId>) -> Self {
        Self::with_settings(manager, Settings::default())
    }

    pub fn with_settings(manager: impl Into<EntityId>, settings: Settings) -> Self {
        let manager = manager.into();
        let (events, _) = broadcast::channel(1024);
        let mut files = HashMap::new();
        files.insert(
            FileId::ROOT,
            FileMeta {
                id: FileId::ROOT,
                is_folder: true,
                parent_folder: FileId::ROOT,
                storage_ref: String::new(),
                file_size: 0,
                last_modification: Utc::now(),
                name: String::new(),
                labels: Vec::new(),
                owner: manager.clone(),
                is_public: true,
                is_deleted: false,
            },
        );
        Self {
            state: RwLock::new(LedgerState {
                files,
                acl: Acl::new(),
                settings,
                managers: HashSet::from([manager]),
                next_file_id: 1,
                sequence: 0,
            }),
            events,
        }
    }

    pub fn add_manager(&self, entity: impl Into<EntityId>) {
        self.state.write().managers.insert(entity.into());
    }

    pub fn is_manager(&self, entity: &str) -> bool {
        self.state.read().managers.contains(entity)
    }

    fn publish(&self, event: LedgerEvent) {
        debug!(sequence = event.sequence, kind = ?event.kind, "ledger event");
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn file(&self, id: FileId) -> Result<Option<FileRecord>> {
        let state = self.state.read();
        Ok(state.files.get(&id).map(|meta| state.compose(meta)))
    }

    async fn last_file_id(&self) -> Result<FileId> {
        Ok(FileId(self.state.read().next_file_id - 1))
    }

    async fn group(&self, id: GroupId) -> Result<Option<GroupRecord>> {
        let state = self.state.read();
        let Some(name) = state.acl.group_name(id) else {
            return Ok(None);
        };
        let members = state.acl.group_members(id).unwrap_or_default();
        Ok(Some(GroupRecord { id, name, members }))
    }

    async fn group_ids(&self) -> Result<Vec<GroupId>> {
        Ok(self.state.read().acl.group_ids())
    }

    async fn entity_grant(&self, file: FileId, entity: &str) -> Result<Grant> {
        Ok(self.state.read().acl.entity_grant(file, entity))
    }

    async fn group_grant(&self, file: FileId, group: GroupId) -> Result<Grant> {
        Ok(self.state.read().acl.group_grant(file, group))
    }

    async fn has_read_access(&self, file: FileId, entity: &str) -> Result<bool> {
        let state = self.state.read();
        Ok(match state.files.get(&file) {
            Some(meta) => state.acl.can_read(file, &meta.owner, meta.is_public, entity),
            None => false,
        })
    }

    async fn has_write_access(&self, file: FileId, entity: &str) -> Result<bool> {
        let state = self.state.read();
        Ok(match state.files.get(&file) {
            Some(meta) => state.acl.can_write(file, &meta.owner, entity),
            None => false,
        })
    }

    async fn settings(&self) -> Result<Settings> {
        Ok(self.state.read().settings.clone())
    }

    async fn current_sequence(&self) -> Result<SequenceNumber> {
        Ok(self.state.read().sequence)
    }

    async fn subscribe(&self, from: SequenceNumber) -> Result<BoxStream<'static, LedgerEvent>> {
        let rx = self.events.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |item| async move {
            match item {
                Ok(event) if event.sequence > from => Some(event),
                _ => None,
            }
        });
        Ok(Box::pin(stream))
    }

    async fn add_file(
        &self,
        caller: &str,
        parent: FileId,
        name: &str,
        storage_ref: &str,
        file_size: u64,
        is_public: bool,
    ) -> Result<FileId> {
        if caller.is_empty() {
            return Err(Error::Invalid("empty caller"));
        }
        if name.is_empty() {
            return Err(Error::Invalid("empty name"));
        }
        if storage_ref.is_empty() {
            return Err(Error::Invalid("empty storage ref"));
        }
        let (id, event) = {
            let mut state = self.state.write();
            let parent_is_folder = state.meta(parent)?.is_folder;
            if !parent_is_folder {
                return Err(Error::NotAFolder(parent));
            }
            let id = FileId(state.next_file_id);
            state.next_file_id += 1;
            state.files.insert(
                id,
                FileMeta {
                    id,
                    is_folder: false,
                    parent_folder: parent,
                    storage_ref: storage_ref.to_string(),
                    file_size,
                    last_modification: Utc::now(),
                    name: name.to_string(),
                    labels: Vec::new(),
                    owner: caller.to_string(),
                    is_public,
                    is_deleted: false,
                },
            );
            (
                id,
                state.next_event(EventKind::FileChange, Some(Subject::File(id))),
            )
        };
        self.publish(event);
        Ok(id)
    }

    async fn add_folder(&self, caller: &str, parent: FileId, name: &str) -> Result<FileId> {
        if caller.is_empty() {
            return Err(Error::Invalid("empty caller"));
        }
        if name.is_empty() {
            return Err(Error::Invalid("empty name"));
        }
        let (id, event) = {
            let mut state = self.state.write();
            let parent_is_folder = state.meta(parent)?.is_folder;
            if !parent_is_folder {
                return Err(Error::NotAFolder(parent));
            }
            let id = FileId(state.next_file_id);
            state.next_file_id += 1;
            state.files.insert(
                id,
                FileMeta {
                    id,
                    is_folder: true,
                    parent_folder: parent,
                    storage_ref: String::new(),
                    file_size: 0,
                    last_modification: Utc::now(),
                    name: name.to_string(),
                    labels: Vec::new(),
                    owner: caller.to_string(),
                    is_public: false,
                    is_deleted: false,
                },
            );
            (
                id,
                state.next_event(EventKind::FileChange, Some(Subject::File(id))),
            )
        };
        self.publish(event);
        Ok(id)
    }

    async fn set_storage_ref(
        &self,
        caller: &str,
        id: FileId,
        storage_ref: &str,
        file_size: u64,
    ) -> Result<()> {
        if storage_ref.is_empty() {
            return Err(Error::Invalid("empty storage ref"));
        }
        if id.is_root() {
            return Err(Error::Invalid("the root folder is immutable"));
        }
        let event = {
            let mut state = self.state.write();
            state.require_write(id, caller)?;
            let meta = state.files.get_mut(&id).ok_or(Error::FileNotFound(id))?;
            if meta.is_folder {
                return Err(Error::Invalid("folders carry no content"));
            }
            meta.storage_ref = storage_ref.to_string();
            meta.file_size = file_size;
            meta.last_modification = Utc::now();
            state.next_event(EventKind::FileChange, Some(Subject::File(id)))
        };
        self.publish(event);
        Ok(())
    }

    async fn set_file_name(&self, caller: &str, id: FileId, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Invalid("empty name"));
        }
        if id.is_root() {
            return Err(Error::Invalid("the root folder is immutable"));
        }
        let event = {
            let mut state = self.state.write();
            state.require_write(id, caller)?;
            let meta = state.files.get_mut(&id).ok_or(Error::FileNotFound(id))?;
            meta.name = name.to_string();
            meta.last_modification = Utc::now();
            state.next_event(EventKind::FileChange, Some(Subject::File(id)))
        };
        self.publish(event);
        Ok(())
    }

    async fn set_labels(&self, caller: &str, id: FileId, labels: Vec<String>) -> Result<()> {
        if id.is_root() {
            return Err(Error::Invalid("the root folder is immutable"));
        }
        let event = {
            let mut state = self.state.write();
            state.require_write(id, caller)?;
            let meta = state.files.get_mut(&id).ok_or(Error::FileNotFound(id))?;
            meta.labels = labels;
            state.next_event(EventKind::FileChange, Some(Subject::File(id)))
        };
        self.publish(event);
        Ok(())
    }

    async fn delete_file(&self, caller: &str, id: FileId) -> Result<()> {
        if id.is_root() {
            return Err(Error::Invalid("the root folder is immutable"));
        }
        let event = {
            let mut state = self.state.write();
            state.require_write(id, caller)?;
            let meta = state.files.get_mut(&id).ok_or(Error::FileNotFound(id))?;
            meta.is_deleted = true;
            state.next_event(EventKind::FileChange, Some(Subject::File(id)))
        };
        self.publish(event);
        Ok(())
    }

    async fn restore_file(&self, caller: &str, id: FileId) -> Result<()> {
        if id.is_root() {
            return Err(Error::Invalid("the root folder is immutable"));
        }
        let event = {
            let mut state = self.state.write();
            state.require_write(id, caller)?;
            let meta = state.files.get_mut(&id).ok_or(Error::FileNotFound(id))?;
            meta.is_deleted = false;
            state.next_event(EventKind::FileChange, Some(Subject::File(id)))
        };
        self.publish(event);
        Ok(())
    }

    async fn delete_file_permanently(&self, caller: &str, id: FileId) -> Result<()> {
        if id.is_root() {
            return Err(Error::Invalid("the root folder is immutable"));
        }
        let event = {
            let mut state = self.state.write();
            state.require_write(id, caller)?;
            state.files.remove(&id);
            state.acl.clear_file(id);
            state.next_event(EventKind::FileChange, Some(Subject::File(id)))
        };
        self.publish(event);
        Ok(())
    }

    async fn delete_files_permanently(&self, caller: &str, ids: &[FileId]) -> Result<()> {
        let events = {
            let mut state = self.state.write();
            state.require_manager(caller)?;
            for id in ids {
                if id.is_root() {
                    return Err(Error::Invalid("the root folder is immutable"));
                }
                state.meta(*id)?;
            }
            let mut events = Vec::with_capacity(ids.len());
            for id in ids {
                state.files.remove(id);
                state.acl.clear_file(*id);
                events.push(state.next_event(EventKind::FileChange, Some(Subject::File(*id))));
            }
            events
        };
        for event in events {
            self.publish(event);
        }
        Ok(())
    }

    async fn set_entity_permission(
        &self,
        caller: &str,
        file: FileId,
        entity: &str,
        grant: Grant,
    ) -> Result<()> {
        if entity.is_empty() {
            return Err(Error::Invalid("empty entity"));
        }
        let event = {
            let mut state = self.state.write();
            state.require_write(file, caller)?;
            state.acl.set_entity_permission(file, entity, grant);
            state.next_event(EventKind::PermissionChange, Some(Subject::File(file)))
        };
        self.publish(event);
        Ok(())
    }

    async fn set_group_permission(
        &self,
        caller: &str,
        file: FileId,
        group: GroupId,
        grant: Grant,
    ) -> Result<()> {
        let event = {
            let mut state = self.state.write();
            state.require_write(file, caller)?;
            state.acl.set_group_permission(file, group, grant)?;
            state.next_event(EventKind::PermissionChange, Some(Subject::File(file)))
        };
        self.publish(event);
        Ok(())
    }

    async fn remove_entity_from_file(
        &self,
        caller: &str,
        file: FileId,
        entity: &str,
    ) -> Result<()> {
        let event = {
            let mut state = self.state.write();
            state.require_write(file, caller)?;
            state.acl.remove_entity_from_file(file, entity);
            state.next_event(EventKind::PermissionChange, Some(Subject::File(file)))
        };
        self.publish(event);
        Ok(())
    }

    async fn remove_group_from_file(
        &self,
        caller: &str,
        file: FileId,
        group: GroupId,
    ) -> Result<()> {
        let event = {
            let mut state = self.state.write();
            state.require_write(file, caller)?;
            state.acl.remove_group_from_file(file, group);
            state.next_event(EventKind::PermissionChange, Some(Subject::File(file)))
        };
        self.publish(event);
        Ok(())
    }

    async fn set_multiple_permissions(
        &self,
        caller: &str,
        file: FileId,
        batch: PermissionBatch,
    ) -> Result<()> {
        let event = {
            let mut state = self.state.write();
            state.require_write(file, caller)?;
            if let Some((storage_ref, _)) = &batch.new_storage_ref {
                if storage_ref.is_empty() {
                    return Err(Error::Invalid("empty storage ref"));
                }
                if state.meta(file)?.is_folder {
                    return Err(Error::Invalid("folders carry no content"));
                }
            }
            state.acl.apply_batch(file, &batch)?;
            let meta = state.files.get_mut(&file).ok_or(Error::FileNotFound(file))?;
            meta.is_public = batch.is_public;
            if let Some((storage_ref, file_size)) = batch.new_storage_ref {
                meta.storage_ref = storage_ref;
                meta.file_size = file_size;
                meta.last_modification = Utc::now();
            }
            state.next_event(EventKind::PermissionChange, Some(Subject::File(file)))
        };
        self.publish(event);
        Ok(())
    }

    async fn create_group(&self, caller: &str, name: &str) -> Result<GroupId> {
        if name.is_empty() {
            return Err(Error::Invalid("empty name"));
        }
        let (id, event) = {
            let mut state = self.state.write();
            state.require_manager(caller)?;
            let id = state.acl.create_group(name);
            (
                id,
                state.next_event(EventKind::PermissionChange, Some(Subject::Group(id))),
            )
        };
        self.publish(event);
        Ok(id)
    }

    async fn rename_group(&self, caller: &str, id: GroupId, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Invalid("empty name"));
        }
        let event = {
            let mut state = self.state.write();
            state.require_manager(caller)?;
            state.acl.rename_group(id, name)?;
            state.next_event(EventKind::PermissionChange, Some(Subject::Group(id)))
        };
        self.publish(event);
        Ok(())
    }

    async fn delete_group(&self, caller: &str, id: GroupId) -> Result<()> {
        let event = {
            let mut state = self.state.write();
            state.require_manager(caller)?;
            state.acl.delete_group(id)?;
            state.next_event(EventKind::PermissionChange, Some(Subject::Group(id)))
        };
        self.publish(event);
        Ok(())
    }

    async fn add_entity_to_group(&self, caller: &str, id: GroupId, entity: &str) -> Result<()> {
        let event = {
            let mut state = self.state.write();
            state.require_manager(caller)?;
            state.acl.add_entity_to_group(id, entity)?;
            state.next_event(EventKind::PermissionChange, Some(Subject::Group(id)))
        };
        self.publish(event);
        Ok(())
    }

    async fn remove_entity_from_group(
        &self,
        caller: &str,
        id: GroupId,
        entity: &str,
    ) -> Result<()> {
        let event = {
            let mut state = self.state.write();
            state.require_manager(caller)?;
            state.acl.remove_entity_from_group(id, entity)?;
            state.next_event(EventKind::PermissionChange, Some(Subject::Group(id)))
        };
        self.publish(event);
        Ok(())
    }

    async fn set_settings(&self, caller: &str, settings: Settings) -> Result<()> {
        let event = {
            let mut state = self.state.write();
            state.require_manager(caller)?;
            state.settings = settings;
            state.next_event(EventKind::SettingsChange, None)
        };
        self.publish(event);
        Ok(())
    }
}
