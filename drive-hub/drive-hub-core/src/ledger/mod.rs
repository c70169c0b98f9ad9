//! The ledger contract: record shapes, the ordered event feed and the
//! query/command trait every ledger backend implements.
//!
//! The ledger is the source of truth. The rest of the crate only ever
//! consumes it through [`Ledger`]: queries for current state, commands for
//! mutations, and [`Ledger::subscribe`] for the ordered change feed the
//! synchronizer drains. [`memory::MemoryLedger`] is the in-process
//! reference backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::acl::Grant;
use crate::error::Result;
use crate::settings::Settings;

pub mod memory;


/// Ledger-assigned file identifier. Ids are handed out monotonically and
/// never reused, not even after permanent deletion. Id 0 is the root folder.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct FileId(pub u64);

impl FileId {
    pub const ROOT: FileId = FileId(0);

    pub fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ledger-assigned group identifier, monotonic and never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Acting subject, externally identified (an account address).
pub type EntityId = String;

/// Position in the ledger's totally ordered event feed. 0 means "no events".
pub type SequenceNumber = u64;

/// A file or folder as the ledger reports it. Records arrive complete, so
/// the cache replaces them wholesale on every refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub is_folder: bool,
    /// The root folder carries `parent_folder == id == 0` as its sentinel.
    pub parent_folder: FileId,
    /// Content address in external storage. Empty on a non-root file means
    /// the file was permanently deleted.
    pub storage_ref: String,
    pub file_size: u64,
    pub last_modification: DateTime<Utc>,
    pub name: String,
    pub labels: Vec<String>,
    /// The creating entity. Owners hold full access unconditionally.
    pub owner: EntityId,
    /// Public files are readable by any entity. Never confers write.
    pub is_public: bool,
    /// Soft-deletion flag; the record stays in the tree and can be restored.
    pub is_deleted: bool,
    /// Entities holding a direct grant, in grant order.
    pub permission_addresses: Vec<EntityId>,
    /// Groups holding a grant, in grant order.
    pub permission_groups: Vec<GroupId>,
}

impl FileRecord {
    pub fn is_root(&self) -> bool {
        self.id.is_root()
    }
}

/// A group as the ledger reports it: tombstoned member slots are already
/// filtered out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: GroupId,
    pub name: String,
    pub members: Vec<EntityId>,
}

impl GroupRecord {
    pub fn entity_count(&self) -> usize {
        self.members.len()
    }
}

/// What a ledger event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id")]
pub enum Subject {
    File(FileId),
    Group(GroupId),
}

impl Subject {
    pub fn file_id(self) -> Option<FileId> {
        match self {
            Subject::File(id) => Some(id),
            Subject::Group(_) => None,
        }
    }
}

/// Kind of change a ledger event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    FileChange,
    PermissionChange,
    SettingsChange,
}

/// One entry of the ordered ledger feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub sequence: SequenceNumber,
    pub kind: EventKind,
    /// File for content/grant changes, group for group lifecycle changes,
    /// absent for settings changes.
    pub subject: Option<Subject>,
}

/// A direct grant to hand to [`Ledger::set_multiple_permissions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityGrant {
    pub entity: EntityId,
    #[serde(flatten)]
    pub grant: Grant,
}

/// A group grant to hand to [`Ledger::set_multiple_permissions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupGrant {
    pub group: GroupId,
    #[serde(flatten)]
    pub grant: Grant,
}

/// Atomic permission batch: every grant, the public flag and (optionally) a
/// swapped content ref land together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionBatch {
    #[serde(default)]
    pub entity_grants: Vec<EntityGrant>,
    #[serde(default)]
    pub group_grants: Vec<GroupGrant>,
    pub is_public: bool,
    /// `(storage_ref, file_size)` when content was re-encrypted as part of
    /// a visibility change.
    #[serde(default)]
    pub new_storage_ref: Option<(String, u64)>,
}

/// Query and command surface of the ledger.
///
/// Commands are authority-checked server-side: grant lifecycle requires
/// write access on the target file, group lifecycle and settings require
/// the manager role. Every successful command assigns the next sequence
/// number and emits exactly one event on the feed.
#[async_trait]
pub trait Ledger: Send + Sync {
    // --- queries ---

    /// Current record for `id`; `None` for ids never assigned or
    /// permanently deleted.
    async fn file(&self, id: FileId) -> Result<Option<FileRecord>>;

    /// Highest file id assigned so far (drives full scans).
    async fn last_file_id(&self) -> Result<FileId>;

    async fn group(&self, id: GroupId) -> Result<Option<GroupRecord>>;

    async fn group_ids(&self) -> Result<Vec<GroupId>>;

    /// Direct grant of `entity` on `file`; the zero grant when none.
    async fn entity_grant(&self, file: FileId, entity: &str) -> Result<Grant>;

    /// Grant of `group` on `file`; the zero grant when none.
    async fn group_grant(&self, file: FileId, group: GroupId) -> Result<Grant>;

    /// Authoritative read decision for `entity` on `file`.
    async fn has_read_access(&self, file: FileId, entity: &str) -> Result<bool>;

    /// Authoritative write decision for `entity` on `file`.
    async fn has_write_access(&self, file: FileId, entity: &str) -> Result<bool>;

    async fn settings(&self) -> Result<Settings>;

    /// Sequence number of the newest event, 0 when the feed is empty.
    async fn current_sequence(&self) -> Result<SequenceNumber>;

    /// Ordered feed of events with `sequence > from`.
    async fn subscribe(&self, from: SequenceNumber) -> Result<BoxStream<'static, LedgerEvent>>;

    // --- file commands ---

    async fn add_file(
        &self,
        caller: &str,
        parent: FileId,
        name: &str,
        storage_ref: &str,
        file_size: u64,
        is_public: bool,
    ) -> Result<FileId>;

    async fn add_folder(&self, caller: &str, parent: FileId, name: &str) -> Result<FileId>;

    async fn set_storage_ref(
        &self,
        caller: &str,
        id: FileId,
        storage_ref: &str,
        file_size: u64,
    ) -> Result<()>;

    async fn set_file_name(&self, caller: &str, id: FileId, name: &str) -> Result<()>;

    async fn set_labels(&self, caller: &str, id: FileId, labels: Vec<String>) -> Result<()>;

    /// Soft delete: the record stays and can be restored.
    async fn delete_file(&self, caller: &str, id: FileId) -> Result<()>;

    async fn restore_file(&self, caller: &str, id: FileId) -> Result<()>;

    /// Permanent delete: clears the record and burns the id forever.
    async fn delete_file_permanently(&self, caller: &str, id: FileId) -> Result<()>;

    /// Batch permanent delete; requires the manager role.
    async fn delete_files_permanently(&self, caller: &str, ids: &[FileId]) -> Result<()>;

    // --- permission commands ---

    async fn set_entity_permission(
        &self,
        caller: &str,
        file: FileId,
        entity: &str,
        grant: Grant,
    ) -> Result<()>;

    async fn set_group_permission(
        &self,
        caller: &str,
        file: FileId,
        group: GroupId,
        grant: Grant,
    ) -> Result<()>;

    async fn remove_entity_from_file(&self, caller: &str, file: FileId, entity: &str)
        -> Result<()>;

    async fn remove_group_from_file(&self, caller: &str, file: FileId, group: GroupId)
        -> Result<()>;

    async fn set_multiple_permissions(
        &self,
        caller: &str,
        file: FileId,
        batch: PermissionBatch,
    ) -> Result<()>;

    // --- group commands ---

    async fn create_group(&self, caller: &str, name: &str) -> Result<GroupId>;

    async fn rename_group(&self, caller: &str, id: GroupId, name: &str) -> Result<()>;

    async fn delete_group(&self, caller: &str, id: GroupId) -> Result<()>;

    async fn add_entity_to_group(&self, caller: &str, id: GroupId, entity: &str) -> Result<()>;

    async fn remove_entity_from_group(
        &self,
        caller: &str,
        id: GroupId,
        entity: &str,
    ) -> Result<()>;

    // --- settings ---

    async fn set_settings(&self, caller: &str, settings: Settings) -> Result<()>;
}
