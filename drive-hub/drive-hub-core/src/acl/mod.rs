//! The permission engine: direct grants, group grants and group
//! membership, plus the read/write decision chain.
//!
//! Decisions are pure and synchronous. Authority checks (who may call a
//! mutating operation) live with the ledger command layer; this module owns
//! the state transitions and keeps the enumeration indexes consistent with
//! the grant maps.
//!
//! Folder and file grants are independent: a grant on a folder says nothing
//! about the files inside it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::ledger::{EntityId, FileId, GroupId, PermissionBatch};


/// Access bits attached to a (file, entity) or (file, group) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub read: bool,
    pub write: bool,
}

impl Grant {
    /// The zero grant. Conferring nothing, it is dropped from the
    /// enumeration indexes instead of being stored.
    pub const NONE: Grant = Grant {
        read: false,
        write: false,
    };

    pub const READ: Grant = Grant {
        read: true,
        write: false,
    };

    pub const READ_WRITE: Grant = Grant {
        read: true,
        write: true,
    };

    pub fn new(read: bool, write: bool) -> Self {
        Self { read, write }
    }

    pub fn is_none(self) -> bool {
        !self.read && !self.write
    }
}

/// Grant state of a single file.
#[derive(Debug, Clone, Default)]
struct FilePermissions {
    /// Entities with a live grant, in grant order.
    entity_index: Vec<EntityId>,
    entity_grants: HashMap<EntityId, Grant>,
    /// Groups with a live grant, in grant order.
    group_index: Vec<GroupId>,
    group_grants: HashMap<GroupId, Grant>,
}

impl FilePermissions {
    fn is_empty(&self) -> bool {
        self.entity_grants.is_empty() && self.group_grants.is_empty()
    }
}

/// A group of entities. Member removal tombstones the slot with an empty
/// entity instead of compacting, so positions handed out earlier stay
/// stable. Deleted groups keep their id burned.
#[derive(Debug, Clone)]
struct Group {
    name: String,
    slots: Vec<EntityId>,
    deleted: bool,
}

impl Group {
    fn is_member(&self, entity: &str) -> bool {
        !entity.is_empty() && self.slots.iter().any(|slot| slot == entity)
    }

    fn live_members(&self) -> Vec<EntityId> {
        self.slots
            .iter()
            .filter(|slot| !slot.is_empty())
            .cloned()
            .collect()
    }
}

/// Grant and group state for every file the ledger knows about.
#[derive(Debug, Default)]
pub struct Acl {
    files: HashMap<FileId, FilePermissions>,
    groups: HashMap<GroupId, Group>,
    next_group_id: u64,
}

impl Acl {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            groups: HashMap::new(),
            next_group_id: 1,
        }
    }

    // --- decisions ---

    /// Read decision: owner, then the public flag, then direct and group
    /// grants. Public confers read only.
    pub fn can_read(&self, file: FileId, owner: &str, is_public: bool, entity: &str) -> bool {
        if entity == owner {
            return true;
        }
        if is_public {
            return true;
        }
        self.granted(file, entity, |grant| grant.read)
    }

    /// Write decision: owner, then direct and group grants. The public
    /// flag never appears in this chain.
    pub fn can_write(&self, file: FileId, owner: &str, entity: &str) -> bool {
        if entity == owner {
            return true;
        }
        self.granted(file, entity, |grant| grant.write)
    }

    fn granted(&self, file: FileId, entity: &str, bit: impl Fn(Grant) -> bool) -> bool {
        let Some(perms) = self.files.get(&file) else {
            return false;
        };
        if let Some(grant) = perms.entity_grants.get(entity) {
            if bit(*grant) {
                return true;
            }
        }
        perms.group_grants.iter().any(|(group_id, grant)| {
            bit(*grant)
                && self
                    .groups
                    .get(group_id)
                    .is_some_and(|group| !group.deleted && group.is_member(entity))
        })
    }

    // --- grant lifecycle ---

    /// Upsert the direct grant of `entity` on `file`. The zero grant
    /// removes both the grant and its index entry.
    pub fn set_entity_permission(&mut self, file: FileId, entity: &str, grant: Grant) {
        if grant.is_none() {
            self.remove_entity_from_file(file, entity);
            return;
        }
        let perms = self.files.entry(file).or_default();
        if !perms.entity_index.iter().any(|e| e == entity) {
            perms.entity_index.push(entity.to_string());
        }
        perms.entity_grants.insert(entity.to_string(), grant);
    }

    /// Upsert the grant of `group` on `file`. Fails for unknown or deleted
    /// groups; the zero grant removes the entry.
    pub fn set_group_permission(&mut self, file: FileId, group: GroupId, grant: Grant) -> Result<()> {
        self.require_group(group)?;
        if grant.is_none() {
            self.remove_group_from_file(file, group);
            return Ok(());
        }
        let perms = self.files.entry(file).or_default();
        if !perms.group_index.contains(&group) {
            perms.group_index.push(group);
        }
        perms.group_grants.insert(group, grant);
        Ok(())
    }

    pub fn remove_entity_from_file(&mut self, file: FileId, entity: &str) {
        let Some(perms) = self.files.get_mut(&file) else {
            return;
        };
        perms.entity_grants.remove(entity);
        perms.entity_index.retain(|e| e != entity);
        if perms.is_empty() {
            self.files.remove(&file);
        }
    }

    pub fn remove_group_from_file(&mut self, file: FileId, group: GroupId) {
        let Some(perms) = self.files.get_mut(&file) else {
            return;
        };
        perms.group_grants.remove(&group);
        perms.group_index.retain(|g| *g != group);
        if perms.is_empty() {
            self.files.remove(&file);
        }
    }

    /// Apply a permission batch. Validates every named group up front so a
    /// bad batch leaves the file untouched; the public flag and content ref
    /// parts of the batch are the record owner's business.
    pub fn apply_batch(&mut self, file: FileId, batch: &PermissionBatch) -> Result<()> {
        for group_grant in &batch.group_grants {
            self.require_group(group_grant.group)?;
        }
        for entity_grant in &batch.entity_grants {
            if entity_grant.entity.is_empty() {
                return Err(Error::Invalid("empty entity in permission batch"));
            }
        }
        for entity_grant in &batch.entity_grants {
            self.set_entity_permission(file, &entity_grant.entity, entity_grant.grant);
        }
        for group_grant in &batch.group_grants {
            self.set_group_permission(file, group_grant.group, group_grant.grant)?;
        }
        Ok(())
    }

    /// Drop every grant on `file` (permanent deletion).
    pub fn clear_file(&mut self, file: FileId) {
        self.files.remove(&file);
    }

    // --- group lifecycle ---

    pub fn create_group(&mut self, name: &str) -> GroupId {
        let id = GroupId(self.next_group_id);
        self.next_group_id += 1;
        self.groups.insert(
            id,
            Group {
                name: name.to_string(),
                slots: Vec::new(),
                deleted: false,
            },
        );
        id
    }

    pub fn rename_group(&mut self, id: GroupId, name: &str) -> Result<()> {
        let group = self.live_group_mut(id)?;
        group.name = name.to_string();
        Ok(())
    }

    /// Tombstone the group: the id stays burned, the name is cleared and
    /// every grant referencing it stops conferring access.
    pub fn delete_group(&mut self, id: GroupId) -> Result<()> {
        let group = self.live_group_mut(id)?;
        group.deleted = true;
        group.name.clear();
        group.slots.clear();
        Ok(())
    }

    /// Append `entity` as a member. Appending never reuses a tombstoned
    /// slot, so a removed member's old position can never resurrect access.
    pub fn add_entity_to_group(&mut self, id: GroupId, entity: &str) -> Result<()> {
        if entity.is_empty() {
            return Err(Error::Invalid("empty entity"));
        }
        let group = self.live_group_mut(id)?;
        if !group.is_member(entity) {
            group.slots.push(entity.to_string());
        }
        Ok(())
    }

    /// Tombstone the member's slot. Removing a non-member is a no-op.
    pub fn remove_entity_from_group(&mut self, id: GroupId, entity: &str) -> Result<()> {
        if entity.is_empty() {
            return Err(Error::Invalid("empty entity"));
        }
        let group = self.live_group_mut(id)?;
        for slot in &mut group.slots {
            if slot == entity {
                slot.clear();
            }
        }
        Ok(())
    }

    // --- queries ---

    pub fn entity_grant(&self, file: FileId, entity: &str) -> Grant {
        self.files
            .get(&file)
            .and_then(|perms| perms.entity_grants.get(entity))
            .copied()
            .unwrap_or(Grant::NONE)
    }

    pub fn group_grant(&self, file: FileId, group: GroupId) -> Grant {
        self.files
            .get(&file)
            .and_then(|perms| perms.group_grants.get(&group))
            .copied()
            .unwrap_or(Grant::NONE)
    }

    /// Entities with a live grant on `file`, in grant order.
    pub fn entities_with_grants(&self, file: FileId) -> Vec<EntityId> {
        self.files
            .get(&file)
            .map(|perms| perms.entity_index.clone())
            .unwrap_or_default()
    }

    /// Groups with a live grant on `file`, in grant order.
    pub fn groups_with_grants(&self, file: FileId) -> Vec<GroupId> {
        self.files
            .get(&file)
            .map(|perms| perms.group_index.clone())
            .unwrap_or_default()
    }

    /// Live groups only; deleted ids stay burned and are not listed.
    pub fn group_ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, group)| !group.deleted)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn group_name(&self, id: GroupId) -> Option<String> {
        self.groups
            .get(&id)
            .filter(|group| !group.deleted)
            .map(|group| group.name.clone())
    }

    /// Members of a live group with tombstoned slots filtered out.
    pub fn group_members(&self, id: GroupId) -> Option<Vec<EntityId>> {
        self.groups
            .get(&id)
            .filter(|group| !group.deleted)
            .map(Group::live_members)
    }

    /// Raw slot view including tombstones, for positional callers.
    pub fn group_slots(&self, id: GroupId) -> Option<Vec<EntityId>> {
        self.groups
            .get(&id)
            .filter(|group| !group.deleted)
            .map(|group| group.slots.clone())
    }

    fn require_group(&self, id: GroupId) -> Result<()> {
        match self.groups.get(&id) {
            Some(group) if !group.deleted => Ok(()),
            _ => Err(Error::GroupNotFound(id)),
        }
    }

    fn live_group_mut(&mut self, id: GroupId) -> Result<&mut Group> {
        match self.groups.get_mut(&id) {
            Some(group) if !group.deleted => Ok(group),
            _ => Err(Error::GroupNotFound(id)),
        }
    }
}
