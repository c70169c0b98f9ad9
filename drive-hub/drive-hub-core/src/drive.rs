//! High-level drive facade.
//!
//! Binds ledger commands, the tree cache, blob storage and payload
//! encryption into one client surface. Commands go to the ledger and also
//! raise a local change so the synchronizer refreshes without waiting for
//! the remote feed.

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::acl::Grant;
use crate::cache::{FolderView, TreeCache};
use crate::encryption::{EncryptionProvider, SealedContent};
use crate::error::{Error, Result};
use crate::events::LocalEvents;
use crate::ledger::{
    EntityGrant, FileId, FileRecord, GroupGrant, GroupId, GroupRecord, Ledger, PermissionBatch,
};
use crate::settings::Settings;
use crate::storage::{MemoryStorage, StorageProvider};

/// Chooses a storage provider for the given settings. Selectors must hand
/// back the same instance for the same backend, or stored content would
/// strand on a settings change.
pub type StorageSelector = dyn Fn(&Settings) -> anyhow::Result<Arc<dyn StorageProvider>> + Send + Sync;

/// Selector for single-process deployments: one shared in-memory store no
/// matter what the settings say.
pub fn memory_selector() -> Box<StorageSelector> {
    let store: Arc<dyn StorageProvider> = Arc::new(MemoryStorage::new());
    Box::new(move |_settings: &Settings| Ok(store.clone()))
}

/// Grants attached to one file, resolved for display.
#[derive(Debug, Clone, Serialize)]
pub struct FilePermissionsView {
    pub is_public: bool,
    pub entity_grants: Vec<EntityGrant>,
    pub group_grants: Vec<GroupGrant>,
}

pub struct Drive {
    ledger: Arc<dyn Ledger>,
    cache: TreeCache,
    local: LocalEvents,
    encryption: Arc<dyn EncryptionProvider>,
    storage: RwLock<Arc<dyn StorageProvider>>,
    selector: Box<StorageSelector>,
    settings: RwLock<Settings>,
}

impl Drive {
    pub async fn new(
        ledger: Arc<dyn Ledger>,
        cache: TreeCache,
        local: LocalEvents,
        encryption: Arc<dyn EncryptionProvider>,
        selector: Box<StorageSelector>,
    ) -> Result<Self> {
        let settings = ledger.settings().await?;
        let storage = (selector)(&settings).map_err(Error::Storage)?;
        Ok(Self {
            ledger,
            cache,
            local,
            encryption,
            storage: RwLock::new(storage),
            selector,
            settings: RwLock::new(settings),
        })
    }

    pub fn cache(&self) -> &TreeCache {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    fn storage_provider(&self) -> Arc<dyn StorageProvider> {
        self.storage.read().clone()
    }

    // ---- content ----

    /// Stores content and registers the file under `parent`. Private
    /// content is sealed before it touches storage; the recorded size is
    /// always the plaintext size.
    pub async fn add_file(
        &self,
        caller: &str,
        parent: FileId,
        name: &str,
        content: Bytes,
        is_public: bool,
    ) -> Result<FileId> {
        let size = content.len() as u64;
        let blob = self.outbound_blob(content, is_public).await?;
        let storage_ref = self
            .storage_provider()
            .put(blob)
            .await
            .map_err(Error::Storage)?;
        let id = self
            .ledger
            .add_file(caller, parent, name, &storage_ref, size, is_public)
            .await?;
        self.local.file_changed(id);
        Ok(id)
    }

    /// Fetches and, for private files, unseals content. Read access is
    /// checked against the ledger, not the cache, so a grant revoked a
    /// moment ago cannot leak through a stale tree.
    pub async fn file_content(&self, caller: &str, id: FileId) -> Result<Bytes> {
        let record = self
            .ledger
            .file(id)
            .await?
            .ok_or(Error::FileNotFound(id))?;
        if record.is_folder {
            return Err(Error::Invalid("folders carry no content"));
        }
        if !self.ledger.has_read_access(id, caller).await? {
            return Err(Error::AccessDenied(caller.to_string()));
        }
        let blob = self
            .storage_provider()
            .get(&record.storage_ref)
            .await
            .map_err(Error::Storage)?;
        if record.is_public {
            return Ok(blob);
        }
        let (exported_key, ciphertext) = unframe_sealed(blob)?;
        let plain = self
            .encryption
            .decrypt(&ciphertext, &exported_key)
            .await
            .map_err(Error::Encryption)?;
        Ok(Bytes::from(plain))
    }

    /// Replaces a file's content in place, keeping its visibility.
    pub async fn set_file_content(&self, caller: &str, id: FileId, content: Bytes) -> Result<()> {
        let record = self
            .ledger
            .file(id)
            .await?
            .ok_or(Error::FileNotFound(id))?;
        if record.is_folder {
            return Err(Error::Invalid("folders carry no content"));
        }
        let size = content.len() as u64;
        let blob = self.outbound_blob(content, record.is_public).await?;
        let storage_ref = self
            .storage_provider()
            .put(blob)
            .await
            .map_err(Error::Storage)?;
        self.ledger
            .set_storage_ref(caller, id, &storage_ref, size)
            .await?;
        self.local.file_changed(id);
        Ok(())
    }

    async fn outbound_blob(&self, content: Bytes, is_public: bool) -> Result<Bytes> {
        if is_public {
            return Ok(content);
        }
        let sealed = self
            .encryption
            .encrypt(&content)
            .await
            .map_err(Error::Encryption)?;
        Ok(frame_sealed(&sealed))
    }

    // ---- views ----

    /// Folder listing as the viewer may see it: soft-deleted children and
    /// records the viewer cannot read are dropped.
    pub async fn list_folder(&self, viewer: &str, id: FileId) -> Result<FolderView> {
        let mut view = self.cache.folder(id)?;
        let mut visible = Vec::with_capacity(view.children.len());
        for child in view.children {
            if child.is_deleted {
                continue;
            }
            if self.ledger.has_read_access(child.id, viewer).await? {
                visible.push(child);
            }
        }
        view.children = visible;
        Ok(view)
    }

    pub fn file_info(&self, id: FileId) -> Result<FileRecord> {
        self.cache.file(id).ok_or(Error::FileNotFound(id))
    }

    pub fn path(&self, id: FileId) -> Result<Vec<FileId>> {
        self.cache.path(id)
    }

    // ---- lifecycle ----

    pub async fn create_folder(&self, caller: &str, parent: FileId, name: &str) -> Result<FileId> {
        let id = self.ledger.add_folder(caller, parent, name).await?;
        self.local.file_changed(id);
        Ok(id)
    }

    pub async fn rename(&self, caller: &str, id: FileId, name: &str) -> Result<()> {
        self.ledger.set_file_name(caller, id, name).await?;
        self.local.file_changed(id);
        Ok(())
    }

    pub async fn set_labels(&self, caller: &str, id: FileId, labels: Vec<String>) -> Result<()> {
        self.ledger.set_labels(caller, id, labels).await?;
        self.local.file_changed(id);
        Ok(())
    }

    pub async fn delete(&self, caller: &str, id: FileId) -> Result<()> {
        self.ledger.delete_file(caller, id).await?;
        self.local.file_changed(id);
        Ok(())
    }

    pub async fn restore(&self, caller: &str, id: FileId) -> Result<()> {
        self.ledger.restore_file(caller, id).await?;
        self.local.file_changed(id);
        Ok(())
    }

    pub async fn delete_permanently(&self, caller: &str, id: FileId) -> Result<()> {
        self.ledger.delete_file_permanently(caller, id).await?;
        self.local.file_changed(id);
        Ok(())
    }

    pub async fn delete_batch_permanently(&self, caller: &str, ids: &[FileId]) -> Result<()> {
        self.ledger.delete_files_permanently(caller, ids).await?;
        for id in ids {
            self.local.file_changed(*id);
        }
        Ok(())
    }

    // ---- permissions ----

    pub async fn set_entity_permission(
        &self,
        caller: &str,
        file: FileId,
        entity: &str,
        grant: Grant,
    ) -> Result<()> {
        self.ledger
            .set_entity_permission(caller, file, entity, grant)
            .await?;
        self.local.permissions_changed(file);
        Ok(())
    }

    pub async fn set_group_permission(
        &self,
        caller: &str,
        file: FileId,
        group: GroupId,
        grant: Grant,
    ) -> Result<()> {
        self.ledger
            .set_group_permission(caller, file, group, grant)
            .await?;
        self.local.permissions_changed(file);
        Ok(())
    }

    pub async fn remove_entity_from_file(
        &self,
        caller: &str,
        file: FileId,
        entity: &str,
    ) -> Result<()> {
        self.ledger
            .remove_entity_from_file(caller, file, entity)
            .await?;
        self.local.permissions_changed(file);
        Ok(())
    }

    pub async fn remove_group_from_file(
        &self,
        caller: &str,
        file: FileId,
        group: GroupId,
    ) -> Result<()> {
        self.ledger
            .remove_group_from_file(caller, file, group)
            .await?;
        self.local.permissions_changed(file);
        Ok(())
    }

    pub async fn file_permissions(&self, file: FileId) -> Result<FilePermissionsView> {
        let record = self
            .ledger
            .file(file)
            .await?
            .ok_or(Error::FileNotFound(file))?;
        let mut entity_grants = Vec::with_capacity(record.permission_addresses.len());
        for entity in &record.permission_addresses {
            let grant = self.ledger.entity_grant(file, entity).await?;
            if !grant.is_none() {
                entity_grants.push(EntityGrant {
                    entity: entity.clone(),
                    grant,
                });
            }
        }
        let mut group_grants = Vec::with_capacity(record.permission_groups.len());
        for group in &record.permission_groups {
            let grant = self.ledger.group_grant(file, *group).await?;
            if !grant.is_none() {
                group_grants.push(GroupGrant {
                    group: *group,
                    grant,
                });
            }
        }
        Ok(FilePermissionsView {
            is_public: record.is_public,
            entity_grants,
            group_grants,
        })
    }

    /// Applies a grant batch atomically. When the public flag flips, file
    /// content is re-sealed (or unsealed) and the replacement ref rides
    /// the same batch, so visibility and ciphertext never disagree.
    pub async fn set_permissions(
        &self,
        caller: &str,
        file: FileId,
        entity_grants: Vec<EntityGrant>,
        group_grants: Vec<GroupGrant>,
        is_public: bool,
    ) -> Result<()> {
        let record = self
            .ledger
            .file(file)
            .await?
            .ok_or(Error::FileNotFound(file))?;
        let mut batch = PermissionBatch {
            entity_grants,
            group_grants,
            is_public,
            new_storage_ref: None,
        };
        if !record.is_folder && record.is_public != is_public {
            let content = self.file_content(caller, file).await?;
            let size = content.len() as u64;
            let blob = self.outbound_blob(content, is_public).await?;
            let storage_ref = self
                .storage_provider()
                .put(blob)
                .await
                .map_err(Error::Storage)?;
            batch.new_storage_ref = Some((storage_ref, size));
        }
        self.ledger
            .set_multiple_permissions(caller, file, batch)
            .await?;
        self.local.permissions_changed(file);
        Ok(())
    }

    // ---- groups ----

    pub async fn create_group(&self, caller: &str, name: &str) -> Result<GroupId> {
        let id = self.ledger.create_group(caller, name).await?;
        self.local.group_changed(id);
        Ok(id)
    }

    pub async fn rename_group(&self, caller: &str, group: GroupId, name: &str) -> Result<()> {
        self.ledger.rename_group(caller, group, name).await?;
        self.local.group_changed(group);
        Ok(())
    }

    pub async fn delete_group(&self, caller: &str, group: GroupId) -> Result<()> {
        self.ledger.delete_group(caller, group).await?;
        self.local.group_changed(group);
        Ok(())
    }

    pub async fn add_entity_to_group(
        &self,
        caller: &str,
        group: GroupId,
        entity: &str,
    ) -> Result<()> {
        self.ledger.add_entity_to_group(caller, group, entity).await?;
        self.local.group_changed(group);
        Ok(())
    }

    pub async fn remove_entity_from_group(
        &self,
        caller: &str,
        group: GroupId,
        entity: &str,
    ) -> Result<()> {
        self.ledger
            .remove_entity_from_group(caller, group, entity)
            .await?;
        self.local.group_changed(group);
        Ok(())
    }

    pub async fn group(&self, id: GroupId) -> Result<GroupRecord> {
        self.ledger
            .group(id)
            .await?
            .ok_or(Error::GroupNotFound(id))
    }

    pub async fn groups(&self) -> Result<Vec<GroupRecord>> {
        let ids = self.ledger.group_ids().await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.ledger.group(id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    // ---- settings ----

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub async fn set_settings(&self, caller: &str, settings: Settings) -> Result<()> {
        self.ledger.set_settings(caller, settings).await?;
        // Reselect immediately so this node reads its own write; peers
        // converge when the change notification reaches them.
        self.refresh_settings().await?;
        self.local.settings_changed();
        Ok(())
    }

    /// Re-reads settings and reselects the storage provider. Called when a
    /// settings change notification lands.
    pub async fn refresh_settings(&self) -> Result<Settings> {
        let settings = self.ledger.settings().await?;
        let storage = (self.selector)(&settings).map_err(Error::Storage)?;
        *self.storage.write() = storage;
        *self.settings.write() = settings.clone();
        info!(backend = ?settings.backend, "storage provider reselected");
        Ok(settings)
    }
}

// Private blobs are framed as `[u32 le key length][wrapped key][ciphertext]`
// so the wrapped content key travels inside the blob it opens.

fn frame_sealed(sealed: &SealedContent) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(4 + sealed.exported_key.len() + sealed.ciphertext.len());
    buf.put_u32_le(sealed.exported_key.len() as u32);
    buf.put_slice(&sealed.exported_key);
    buf.put_slice(&sealed.ciphertext);
    buf.freeze()
}

fn unframe_sealed(mut blob: Bytes) -> Result<(Vec<u8>, Vec<u8>)> {
    if blob.len() < 4 {
        return Err(Error::Encryption(anyhow!("truncated content frame")));
    }
    let key_len = blob.get_u32_le() as usize;
    if blob.len() < key_len {
        return Err(Error::Encryption(anyhow!("content frame key overruns blob")));
    }
    let exported_key = blob.split_to(key_len).to_vec();
    Ok((exported_key, blob.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{AesGcmEncryption, NoopEncryption};
    use crate::ledger::memory::MemoryLedger;

    async fn drive_with(encryption: Arc<dyn EncryptionProvider>) -> Drive {
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new("alice"));
        let (local, _rx) = LocalEvents::channel();
        Drive::new(ledger, TreeCache::new(), local, encryption, memory_selector())
            .await
            .unwrap()
    }

    async fn drive() -> Drive {
        drive_with(Arc::new(AesGcmEncryption::new(&[3u8; 32]).unwrap())).await
    }

    #[tokio::test]
    async fn public_content_round_trip() {
        let drive = drive().await;
        let id = drive
            .add_file("alice", FileId::ROOT, "notes.txt", Bytes::from_static(b"hello"), true)
            .await
            .unwrap();
        let content = drive.file_content("bob", id).await.unwrap();
        assert_eq!(content, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn private_content_is_sealed_at_rest() {
        let drive = drive().await;
        let id = drive
            .add_file("alice", FileId::ROOT, "secret.txt", Bytes::from_static(b"hush"), false)
            .await
            .unwrap();

        // Owner reads plaintext back.
        let content = drive.file_content("alice", id).await.unwrap();
        assert_eq!(content, Bytes::from_static(b"hush"));

        // The stored blob is not the plaintext.
        let record = drive.ledger().file(id).await.unwrap().unwrap();
        let raw = drive
            .storage_provider()
            .get(&record.storage_ref)
            .await
            .unwrap();
        assert_ne!(raw, Bytes::from_static(b"hush"));

        // Strangers get denied before storage is touched.
        let err = drive.file_content("mallory", id).await.unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));
    }

    #[tokio::test]
    async fn recorded_size_is_plaintext_size() {
        let drive = drive().await;
        let id = drive
            .add_file("alice", FileId::ROOT, "secret.txt", Bytes::from_static(b"12345"), false)
            .await
            .unwrap();
        let record = drive.ledger().file(id).await.unwrap().unwrap();
        assert_eq!(record.file_size, 5);
    }

    #[tokio::test]
    async fn visibility_flip_reencrypts_content() {
        let drive = drive().await;
        let id = drive
            .add_file("alice", FileId::ROOT, "memo.txt", Bytes::from_static(b"memo"), false)
            .await
            .unwrap();
        let before = drive.ledger().file(id).await.unwrap().unwrap();

        drive
            .set_permissions("alice", id, Vec::new(), Vec::new(), true)
            .await
            .unwrap();

        let after = drive.ledger().file(id).await.unwrap().unwrap();
        assert!(after.is_public);
        assert_ne!(before.storage_ref, after.storage_ref);

        // Now public: the stored blob is the plaintext itself.
        let raw = drive
            .storage_provider()
            .get(&after.storage_ref)
            .await
            .unwrap();
        assert_eq!(raw, Bytes::from_static(b"memo"));
        assert_eq!(
            drive.file_content("anyone", id).await.unwrap(),
            Bytes::from_static(b"memo")
        );
    }

    #[tokio::test]
    async fn noop_provider_stores_plaintext_frames() {
        let drive = drive_with(Arc::new(NoopEncryption)).await;
        let id = drive
            .add_file("alice", FileId::ROOT, "plain.txt", Bytes::from_static(b"data"), false)
            .await
            .unwrap();
        assert_eq!(
            drive.file_content("alice", id).await.unwrap(),
            Bytes::from_static(b"data")
        );
    }

    #[tokio::test]
    async fn folder_content_is_rejected() {
        let drive = drive().await;
        let folder = drive.create_folder("alice", FileId::ROOT, "docs").await.unwrap();
        assert!(matches!(
            drive.file_content("alice", folder).await.unwrap_err(),
            Error::Invalid(_)
        ));
        assert!(matches!(
            drive
                .set_file_content("alice", folder, Bytes::from_static(b"x"))
                .await
                .unwrap_err(),
            Error::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn frame_survives_round_trip() {
        let sealed = SealedContent {
            ciphertext: vec![9, 8, 7, 6],
            exported_key: vec![1, 2, 3],
        };
        let blob = frame_sealed(&sealed);
        let (key, ciphertext) = unframe_sealed(blob).unwrap();
        assert_eq!(key, vec![1, 2, 3]);
        assert_eq!(ciphertext, vec![9, 8, 7, 6]);
    }

    #[tokio::test]
    async fn truncated_frame_is_rejected() {
        assert!(unframe_sealed(Bytes::from_static(&[1, 2])).is_err());
        // Key length claims more bytes than the blob holds.
        let mut buf = BytesMut::new();
        buf.put_u32_le(100);
        buf.put_slice(&[1, 2, 3]);
        assert!(unframe_sealed(buf.freeze()).is_err());
    }
}
