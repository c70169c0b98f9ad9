//! In-memory folder/file tree assembled from flat ledger records.
//!
//! [`FileTree`] holds the records plus materialized child links and offers
//! the pure walks (folder listing, path resolution). [`TreeCache`] wraps a
//! tree for concurrent use: reads are synchronous and never suspend, all
//! mutation funnels through the single-writer [`TreeCache::lock_and_update`]
//! so readers observe the pre- or post-refresh state and never a partial
//! one.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::ledger::{FileId, FileRecord};

#[cfg(test)]
mod tests;

/// One cached file plus the ids of its direct children (folders only; files
/// keep the list empty).
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFile {
    pub record: FileRecord,
    pub child_ids: Vec<FileId>,
}

/// A folder with its children resolved to records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderView {
    pub record: FileRecord,
    pub children: Vec<FileRecord>,
}

/// Entries touched by an upsert, captured before a refresh so a failed
/// fetch can put them back exactly as they were.
#[derive(Debug)]
struct TreeSnapshot {
    entries: Vec<(FileId, Option<CachedFile>)>,
}

/// The tree itself: records keyed by id, child links maintained on every
/// mutation so no id is ever orphaned or listed under two parents.
#[derive(Debug, Default)]
pub struct FileTree {
    entries: HashMap<FileId, CachedFile>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from a flat record scan.
    ///
    /// All records are inserted first; child lists are then materialized by
    /// walking folders outward from the root with a visited set keyed by
    /// id, so each folder is scanned exactly once and corrupt parent links
    /// cannot cause re-scanning. Records whose parent is missing stay in
    /// the map unlinked until the parent arrives.
    pub fn build(records: impl IntoIterator<Item = FileRecord>) -> Self {
        let mut tree = Self::new();
        for record in records {
            let id = record.id;
            tree.entries.insert(
                id,
                CachedFile {
                    record,
                    child_ids: Vec::new(),
                },
            );
        }
        tree.link_from_root();
        tree
    }

    fn link_from_root(&mut self) {
        let mut by_parent: HashMap<FileId, Vec<FileId>> = HashMap::new();
        for (id, entry) in &self.entries {
            if entry.record.is_root() {
                continue;
            }
            by_parent.entry(entry.record.parent_folder).or_default().push(*id);
        }
        for children in by_parent.values_mut() {
            children.sort();
        }

        let mut visited: HashSet<FileId> = HashSet::new();
        let mut worklist = vec![FileId::ROOT];
        while let Some(folder) = worklist.pop() {
            if !visited.insert(folder) {
                continue;
            }
            let Some(children) = by_parent.get(&folder) else {
                continue;
            };
            let children = children.clone();
            for child in &children {
                if let Some(entry) = self.entries.get(child) {
                    if entry.record.is_folder {
                        worklist.push(*child);
                    }
                }
            }
            if let Some(entry) = self.entries.get_mut(&folder) {
                entry.child_ids = children;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: FileId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn file(&self, id: FileId) -> Option<FileRecord> {
        self.entries.get(&id).map(|entry| entry.record.clone())
    }

    /// Folder plus resolved children. Children whose records have not
    /// arrived yet simply do not appear.
    pub fn folder(&self, id: FileId) -> Result<FolderView> {
        let entry = self.entries.get(&id).ok_or(Error::FileNotFound(id))?;
        if !entry.record.is_folder {
            return Err(Error::NotAFolder(id));
        }
        let children = entry
            .child_ids
            .iter()
            .filter_map(|child| self.entries.get(child))
            .map(|child| child.record.clone())
            .collect();
        Ok(FolderView {
            record: entry.record.clone(),
            children,
        })
    }

    /// Parent-link walk from `id` to the root sentinel, returned
    /// root-first: starts with 0, ends with `id`, length == depth + 1.
    pub fn path(&self, id: FileId) -> Result<Vec<FileId>> {
        let mut path = Vec::new();
        let mut seen: HashSet<FileId> = HashSet::new();
        let mut cursor = id;
        loop {
            let entry = self.entries.get(&cursor).ok_or(Error::FileNotFound(cursor))?;
            if !seen.insert(cursor) {
                return Err(Error::ParentCycle(id));
            }
            path.push(cursor);
            if entry.record.is_root() {
                break;
            }
            cursor = entry.record.parent_folder;
        }
        path.reverse();
        Ok(path)
    }

    /// The only mutation. `None` is the deletion signal; otherwise the
    /// record is inserted or replaced wholesale and the parent/child links
    /// are kept consistent, including a parent change.
    pub fn upsert(&mut self, id: FileId, record: Option<FileRecord>) {
        match record {
            None => self.remove(id),
            Some(record) => match self.entries.get(&id).map(|e| e.record.parent_folder) {
                None => self.insert(record),
                Some(old_parent) => {
                    let new_parent = record.parent_folder;
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.record = record;
                    }
                    if old_parent != new_parent {
                        self.unlink(old_parent, id);
                        self.link(new_parent, id);
                    }
                }
            },
        }
    }

    fn insert(&mut self, record: FileRecord) {
        let id = record.id;
        let parent = record.parent_folder;
        let is_folder = record.is_folder;
        let is_root = record.is_root();
        self.entries.insert(
            id,
            CachedFile {
                record,
                child_ids: Vec::new(),
            },
        );
        if is_folder {
            self.adopt_children(id);
        }
        if !is_root {
            self.link(parent, id);
        }
    }

    /// A folder arriving after its children picks up every present record
    /// that already names it as parent, so linkage does not depend on
    /// arrival order.
    fn adopt_children(&mut self, folder: FileId) {
        let mut children: Vec<FileId> = self
            .entries
            .iter()
            .filter(|(id, entry)| **id != folder && entry.record.parent_folder == folder)
            .map(|(id, _)| *id)
            .collect();
        children.sort();
        if let Some(entry) = self.entries.get_mut(&folder) {
            entry.child_ids = children;
        }
    }

    fn link(&mut self, parent: FileId, id: FileId) {
        if let Some(entry) = self.entries.get_mut(&parent) {
            if !entry.child_ids.contains(&id) {
                entry.child_ids.push(id);
            }
        }
    }

    fn unlink(&mut self, parent: FileId, id: FileId) {
        if let Some(entry) = self.entries.get_mut(&parent) {
            entry.child_ids.retain(|child| *child != id);
        }
    }

    fn remove(&mut self, id: FileId) {
        if let Some(entry) = self.entries.remove(&id) {
            if !entry.record.is_root() {
                self.unlink(entry.record.parent_folder, id);
            }
        }
    }

    fn snapshot_for(&self, id: FileId) -> TreeSnapshot {
        let mut ids = vec![id];
        if let Some(entry) = self.entries.get(&id) {
            let parent = entry.record.parent_folder;
            if parent != id {
                ids.push(parent);
            }
        }
        TreeSnapshot {
            entries: ids
                .into_iter()
                .map(|fid| (fid, self.entries.get(&fid).cloned()))
                .collect(),
        }
    }

    fn restore(&mut self, snapshot: TreeSnapshot) {
        for (id, entry) in snapshot.entries {
            match entry {
                Some(entry) => {
                    self.entries.insert(id, entry);
                }
                None => {
                    self.entries.remove(&id);
                }
            }
        }
    }
}

/// Shared handle over a [`FileTree`].
///
/// Clones share the same tree. Reads go through a `parking_lot` read lock
/// and never suspend; writes serialize through an async writer queue.
#[derive(Debug, Clone, Default)]
pub struct TreeCache {
    tree: Arc<RwLock<FileTree>>,
    writer: Arc<Mutex<()>>,
}

impl TreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tree(tree: FileTree) -> Self {
        Self {
            tree: Arc::new(RwLock::new(tree)),
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Swap in a freshly built tree (initial scan, full refresh).
    pub fn replace(&self, tree: FileTree) {
        *self.tree.write() = tree;
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }

    pub fn contains(&self, id: FileId) -> bool {
        self.tree.read().contains(id)
    }

    pub fn file(&self, id: FileId) -> Option<FileRecord> {
        self.tree.read().file(id)
    }

    pub fn folder(&self, id: FileId) -> Result<FolderView> {
        self.tree.read().folder(id)
    }

    pub fn path(&self, id: FileId) -> Result<Vec<FileId>> {
        self.tree.read().path(id)
    }

    /// Single-writer refresh of one file.
    ///
    /// Takes the writer queue, snapshots the entries the upsert may touch,
    /// then awaits `fetch` without holding any lock, so readers keep
    /// walking the previous state. On success the produced record (or
    /// deletion signal) is applied atomically with respect to readers; on
    /// failure the snapshot is put back and the cache is byte-for-byte the
    /// pre-call state.
    pub async fn lock_and_update<F>(&self, id: FileId, fetch: F) -> Result<Option<FileRecord>>
    where
        F: Future<Output = Result<Option<FileRecord>>> + Send,
    {
        let _writer = self.writer.lock().await;
        let snapshot = self.tree.read().snapshot_for(id);
        match fetch.await {
            Ok(record) => {
                self.tree.write().upsert(id, record.clone());
                Ok(record)
            }
            Err(err) => {
                self.tree.write().restore(snapshot);
                warn!(file = %id, error = %err, "refresh failed, cache kept on previous state");
                Err(Error::TransientSync {
                    file: id,
                    message: err.to_string(),
                })
            }
        }
    }
}
