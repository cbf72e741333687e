//! Remove semantics: returned values, idempotence, lazy underflow

use stratum::{OnConflict, Tree, TreeOptions};

fn scan(tree: &Tree) -> Vec<Vec<u8>> {
    tree.seek_all().unwrap().map(|e| e.unwrap().0).collect()
}

#[test]
fn test_remove_returns_value() {
    let dir = tempfile::tempdir().unwrap();
    let tree: Tree = TreeOptions::new().page_size(512).open(&dir.path().join("tree.db")).unwrap();

    let mut writer = tree.writer().unwrap();
    writer.insert(b"k", b"payload", OnConflict::Fail).unwrap();
    assert_eq!(writer.remove(b"k").unwrap(), Some(b"payload".to_vec()));
    assert_eq!(writer.remove(b"k").unwrap(), None);
    drop(writer);

    assert_eq!(tree.get(b"k").unwrap(), None);
}

#[test]
fn test_remove_missing_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let tree: Tree = TreeOptions::new().page_size(512).open(&dir.path().join("tree.db")).unwrap();

    let mut writer = tree.writer().unwrap();
    for key in ["a", "b", "c"] {
        writer.insert(key.as_bytes(), b"v", OnConflict::Fail).unwrap();
    }
    let before = {
        drop(writer);
        scan(&tree)
    };

    let mut writer = tree.writer().unwrap();
    assert_eq!(writer.remove(b"nope").unwrap(), None);
    assert_eq!(writer.remove(b"zz").unwrap(), None);
    drop(writer);

    assert_eq!(scan(&tree), before);
}

#[test]
fn test_remove_half_then_verify() {
    let dir = tempfile::tempdir().unwrap();
    let tree: Tree = TreeOptions::new().page_size(256).open(&dir.path().join("tree.db")).unwrap();

    let mut writer = tree.writer().unwrap();
    for i in 0..1000u32 {
        let key = format!("key{i:06}");
        writer.insert(key.as_bytes(), &i.to_be_bytes(), OnConflict::Fail).unwrap();
    }
    for i in (0..1000u32).step_by(2) {
        let key = format!("key{i:06}");
        assert_eq!(writer.remove(key.as_bytes()).unwrap(), Some(i.to_be_bytes().to_vec()));
    }
    drop(writer);

    let keys = scan(&tree);
    assert_eq!(keys.len(), 500);
    for key in &keys {
        let i: u32 = std::str::from_utf8(&key[3..]).unwrap().parse().unwrap();
        assert_eq!(i % 2, 1);
    }
    // underflow is lazy: the tree stays consistent without merging
    assert!(tree.consistency_check().unwrap().is_empty());
}

#[test]
fn test_remove_all_then_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let tree: Tree = TreeOptions::new().page_size(256).open(&dir.path().join("tree.db")).unwrap();

    let mut writer = tree.writer().unwrap();
    for i in 0..500u32 {
        let key = format!("key{i:06}");
        writer.insert(key.as_bytes(), b"v", OnConflict::Fail).unwrap();
    }
    for i in 0..500u32 {
        let key = format!("key{i:06}");
        assert!(writer.remove(key.as_bytes()).unwrap().is_some());
    }
    drop(writer);

    assert!(scan(&tree).is_empty());
    assert!(tree.consistency_check().unwrap().is_empty());

    let mut writer = tree.writer().unwrap();
    writer.insert(b"again", b"works", OnConflict::Fail).unwrap();
    drop(writer);
    assert_eq!(tree.get(b"again").unwrap(), Some(b"works".to_vec()));
}

#[test]
fn test_removes_survive_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.db");
    {
        let tree: Tree = TreeOptions::new().page_size(512).open(&path).unwrap();
        let mut writer = tree.writer().unwrap();
        for key in ["a", "b", "c", "d"] {
            writer.insert(key.as_bytes(), b"v", OnConflict::Fail).unwrap();
        }
        writer.remove(b"b").unwrap();
        writer.remove(b"d").unwrap();
        drop(writer);
        tree.checkpoint().unwrap();
        tree.close().unwrap();
    }

    let tree: Tree = TreeOptions::new().open(&path).unwrap();
    assert_eq!(scan(&tree), vec![b"a".to_vec(), b"c".to_vec()]);
}
