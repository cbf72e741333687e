//! Basic open/insert/get/seek lifecycle

use stratum::{Error, OnConflict, Tree, TreeOptions};

fn open(path: &std::path::Path) -> Tree {
    TreeOptions::new().page_size(512).open(path).unwrap()
}

#[test]
fn test_insert_and_get() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open(&dir.path().join("tree.db"));

    let mut writer = tree.writer().unwrap();
    writer.insert(b"apple", b"red", OnConflict::Fail).unwrap();
    writer.insert(b"banana", b"yellow", OnConflict::Fail).unwrap();
    writer.insert(b"cherry", b"dark", OnConflict::Fail).unwrap();
    drop(writer);

    assert_eq!(tree.get(b"banana").unwrap(), Some(b"yellow".to_vec()));
    assert_eq!(tree.get(b"apple").unwrap(), Some(b"red".to_vec()));
    assert_eq!(tree.get(b"durian").unwrap(), None);
}

#[test]
fn test_overwrite_returns_previous_value() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open(&dir.path().join("tree.db"));

    let mut writer = tree.writer().unwrap();
    assert_eq!(writer.insert(b"k", b"one", OnConflict::Overwrite).unwrap(), None);
    assert_eq!(
        writer.insert(b"k", b"two", OnConflict::Overwrite).unwrap(),
        Some(b"one".to_vec())
    );
    // different value size forces the remove-and-reinsert path
    assert_eq!(
        writer.insert(b"k", b"three33", OnConflict::Overwrite).unwrap(),
        Some(b"two".to_vec())
    );
    drop(writer);

    assert_eq!(tree.get(b"k").unwrap(), Some(b"three33".to_vec()));
}

#[test]
fn test_fail_on_existing_leaves_tree_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open(&dir.path().join("tree.db"));

    let mut writer = tree.writer().unwrap();
    writer.insert(b"k", b"v", OnConflict::Fail).unwrap();
    let err = writer.insert(b"k", b"other", OnConflict::Fail).unwrap_err();
    assert!(matches!(err, Error::KeyAlreadyExists));
    drop(writer);

    assert_eq!(tree.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_single_writer_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open(&dir.path().join("tree.db"));

    let writer = tree.writer().unwrap();
    assert!(matches!(tree.writer(), Err(Error::Usage(_))));
    drop(writer);
    assert!(tree.writer().is_ok());
}

#[test]
fn test_checkpoint_blocked_while_writer_open() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open(&dir.path().join("tree.db"));

    let writer = tree.writer().unwrap();
    assert!(matches!(tree.checkpoint(), Err(Error::Usage(_))));
    drop(writer);
    tree.checkpoint().unwrap();
}

#[test]
fn test_operations_after_close_fail() {
    let dir = tempfile::tempdir().unwrap();
    let tree = open(&dir.path().join("tree.db"));
    tree.close().unwrap();

    assert!(matches!(tree.writer(), Err(Error::Usage(_))));
    assert!(matches!(tree.get(b"k"), Err(Error::Usage(_))));
    assert!(matches!(tree.seek_all(), Err(Error::Usage(_))));
    assert!(matches!(tree.checkpoint(), Err(Error::Usage(_))));
    // close is idempotent
    tree.close().unwrap();
}

#[test]
fn test_checkpointed_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.db");
    {
        let tree = open(&path);
        let mut writer = tree.writer().unwrap();
        for i in 0..50u32 {
            let key = format!("key{i:04}");
            writer.insert(key.as_bytes(), &i.to_be_bytes(), OnConflict::Fail).unwrap();
        }
        drop(writer);
        tree.checkpoint().unwrap();
        tree.close().unwrap();
    }

    let tree = open(&path);
    for i in 0..50u32 {
        let key = format!("key{i:04}");
        assert_eq!(tree.get(key.as_bytes()).unwrap(), Some(i.to_be_bytes().to_vec()));
    }
    let entries: Vec<_> = tree.seek_all().unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(entries.len(), 50);
}

#[test]
fn test_page_size_adopted_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.db");
    {
        let tree: Tree = TreeOptions::new().page_size(1024).open(&path).unwrap();
        tree.close().unwrap();
    }
    // no explicit size: the header's size wins
    let tree: Tree = TreeOptions::new().open(&path).unwrap();
    assert_eq!(tree.page_size(), 1024);
}
