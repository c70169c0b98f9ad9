use super::*;
use anyhow::anyhow;
use chrono::Utc;

fn record(id: u64, parent: u64, is_folder: bool, name: &str) -> FileRecord {
    FileRecord {
        id: FileId(id),
        is_folder,
        parent_folder: FileId(parent),
        storage_ref: if is_folder {
            String::new()
        } else {
            format!("ref-{id}")
        },
        file_size: 0,
        last_modification: Utc::now(),
        name: name.to_string(),
        labels: Vec::new(),
        owner: "alice".to_string(),
        is_public: true,
        is_deleted: false,
        permission_addresses: Vec::new(),
        permission_groups: Vec::new(),
    }
}

fn root() -> FileRecord {
    record(0, 0, true, "")
}

fn sample_tree() -> FileTree {
    // root(0) -> docs(1) -> [a.txt(2), b.txt(3)], root -> readme(4)
    FileTree::build(vec![
        root(),
        record(1, 0, true, "docs"),
        record(2, 1, false, "a.txt"),
        record(3, 1, false, "b.txt"),
        record(4, 0, false, "readme"),
    ])
}

#[test]
fn build_links_children_under_their_folders() {
    let tree = sample_tree();
    assert_eq!(tree.len(), 5);

    let top = tree.folder(FileId::ROOT).unwrap();
    let ids: Vec<FileId> = top.children.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![FileId(1), FileId(4)]);

    let docs = tree.folder(FileId(1)).unwrap();
    let ids: Vec<FileId> = docs.children.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![FileId(2), FileId(3)]);
}

#[test]
fn build_does_not_depend_on_record_order() {
    // Children before parents, parents before root.
    let shuffled = FileTree::build(vec![
        record(3, 1, false, "b.txt"),
        record(2, 1, false, "a.txt"),
        record(4, 0, false, "readme"),
        record(1, 0, true, "docs"),
        root(),
    ]);
    let ordered = sample_tree();
    assert_eq!(
        shuffled.folder(FileId::ROOT).unwrap(),
        ordered.folder(FileId::ROOT).unwrap()
    );
    assert_eq!(
        shuffled.folder(FileId(1)).unwrap(),
        ordered.folder(FileId(1)).unwrap()
    );
}

#[test]
fn build_tolerates_id_gaps() {
    // Ids 2..=4 were burned by permanent deletions.
    let tree = FileTree::build(vec![root(), record(1, 0, true, "docs"), record(5, 1, false, "late")]);
    assert_eq!(tree.len(), 3);
    let docs = tree.folder(FileId(1)).unwrap();
    assert_eq!(docs.children.len(), 1);
    assert_eq!(docs.children[0].id, FileId(5));
}

#[test]
fn root_is_not_its_own_child() {
    let tree = sample_tree();
    let top = tree.folder(FileId::ROOT).unwrap();
    assert!(top.children.iter().all(|c| c.id != FileId::ROOT));
}

#[test]
fn folder_of_a_file_is_rejected() {
    let tree = sample_tree();
    assert!(matches!(tree.folder(FileId(2)), Err(Error::NotAFolder(_))));
    assert!(matches!(
        tree.folder(FileId(99)),
        Err(Error::FileNotFound(_))
    ));
}

#[test]
fn path_walks_root_first() {
    let tree = sample_tree();
    assert_eq!(
        tree.path(FileId(3)).unwrap(),
        vec![FileId::ROOT, FileId(1), FileId(3)]
    );
    assert_eq!(tree.path(FileId::ROOT).unwrap(), vec![FileId::ROOT]);
}

#[test]
fn path_with_missing_ancestor_fails() {
    let mut tree = FileTree::new();
    tree.upsert(FileId(7), Some(record(7, 6, false, "stray")));
    assert!(matches!(
        tree.path(FileId(7)),
        Err(Error::FileNotFound(FileId(6)))
    ));
}

#[test]
fn path_detects_a_parent_cycle() {
    // 1 and 2 point at each other; neither reaches the root.
    let mut tree = FileTree::new();
    tree.upsert(FileId(1), Some(record(1, 2, true, "a")));
    tree.upsert(FileId(2), Some(record(2, 1, true, "b")));
    assert!(matches!(
        tree.path(FileId(1)),
        Err(Error::ParentCycle(FileId(1)))
    ));
}

#[test]
fn upsert_insert_links_into_the_parent() {
    let mut tree = sample_tree();
    tree.upsert(FileId(6), Some(record(6, 1, false, "c.txt")));
    let docs = tree.folder(FileId(1)).unwrap();
    let ids: Vec<FileId> = docs.children.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![FileId(2), FileId(3), FileId(6)]);
}

#[test]
fn folder_arriving_late_adopts_waiting_children() {
    let mut tree = FileTree::build(vec![root()]);
    // The child's record lands before its folder exists in the tree.
    tree.upsert(FileId(5), Some(record(5, 4, false, "orphan.txt")));
    assert!(tree.contains(FileId(5)));

    tree.upsert(FileId(4), Some(record(4, 0, true, "late-folder")));
    let folder = tree.folder(FileId(4)).unwrap();
    assert_eq!(folder.children.len(), 1);
    assert_eq!(folder.children[0].id, FileId(5));
}

#[test]
fn upsert_replaces_the_record_wholesale() {
    let mut tree = sample_tree();
    let mut renamed = record(2, 1, false, "renamed.txt");
    renamed.labels = vec!["draft".to_string()];
    tree.upsert(FileId(2), Some(renamed.clone()));

    assert_eq!(tree.file(FileId(2)), Some(renamed));
    // Links survive an in-place replace.
    let docs = tree.folder(FileId(1)).unwrap();
    assert!(docs.children.iter().any(|c| c.id == FileId(2)));
}

#[test]
fn upsert_with_a_new_parent_relinks() {
    let mut tree = sample_tree();
    tree.upsert(FileId(2), Some(record(2, 0, false, "a.txt")));

    let docs = tree.folder(FileId(1)).unwrap();
    assert!(docs.children.iter().all(|c| c.id != FileId(2)));
    let top = tree.folder(FileId::ROOT).unwrap();
    assert!(top.children.iter().any(|c| c.id == FileId(2)));
}

#[test]
fn upsert_none_removes_and_unlinks() {
    let mut tree = sample_tree();
    tree.upsert(FileId(3), None);
    assert!(!tree.contains(FileId(3)));
    let docs = tree.folder(FileId(1)).unwrap();
    assert!(docs.children.iter().all(|c| c.id != FileId(3)));
    // Removing an id twice is a no-op.
    tree.upsert(FileId(3), None);
}

#[tokio::test]
async fn lock_and_update_applies_the_fetched_record() {
    let cache = TreeCache::from_tree(sample_tree());
    let fetched = record(2, 1, false, "fresh.txt");
    let applied = cache
        .lock_and_update(FileId(2), async { Ok(Some(fetched.clone())) })
        .await
        .unwrap();
    assert_eq!(applied, Some(fetched.clone()));
    assert_eq!(cache.file(FileId(2)), Some(fetched));
}

#[tokio::test]
async fn lock_and_update_none_is_the_deletion_signal() {
    let cache = TreeCache::from_tree(sample_tree());
    cache
        .lock_and_update(FileId(4), async { Ok(None) })
        .await
        .unwrap();
    assert!(!cache.contains(FileId(4)));
    let top = cache.folder(FileId::ROOT).unwrap();
    assert!(top.children.iter().all(|c| c.id != FileId(4)));
}

#[tokio::test]
async fn failed_fetch_leaves_the_cache_on_its_previous_state() {
    let cache = TreeCache::from_tree(sample_tree());
    let before_file = cache.file(FileId(2));
    let before_docs = cache.folder(FileId(1)).unwrap();

    let err = cache
        .lock_and_update(FileId(2), async { Err(Error::Ledger(anyhow!("boom"))) })
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(
        err,
        Error::TransientSync {
            file: FileId(2),
            ..
        }
    ));

    assert_eq!(cache.file(FileId(2)), before_file);
    assert_eq!(cache.folder(FileId(1)).unwrap(), before_docs);
}

#[tokio::test]
async fn reads_keep_working_while_a_fetch_is_in_flight() {
    let cache = TreeCache::from_tree(sample_tree());
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let slow = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .lock_and_update(FileId(2), async {
                    let _ = rx.await;
                    Ok(Some(record(2, 1, false, "slow.txt")))
                })
                .await
        })
    };

    // The fetch has not resolved; readers still see the old state.
    tokio::task::yield_now().await;
    assert_eq!(cache.file(FileId(2)).unwrap().name, "a.txt");
    assert_eq!(cache.folder(FileId(1)).unwrap().children.len(), 2);

    tx.send(()).ok();
    slow.await.unwrap().unwrap();
    assert_eq!(cache.file(FileId(2)).unwrap().name, "slow.txt");
}

#[test]
fn replace_swaps_the_whole_tree() {
    let cache = TreeCache::from_tree(sample_tree());
    cache.replace(FileTree::build(vec![root()]));
    assert_eq!(cache.len(), 1);
    assert!(!cache.contains(FileId(1)));
}
