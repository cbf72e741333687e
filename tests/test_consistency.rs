//! Consistency checker: clean trees report nothing, corruption is reported
//! and never repaired

use std::os::unix::fs::FileExt;
use stratum::{ConsistencyViolation, OnConflict, Tree, TreeOptions};

#[test]
fn test_clean_tree_reports_no_violations() {
    let dir = tempfile::tempdir().unwrap();
    let tree: Tree = TreeOptions::new().page_size(256).open(&dir.path().join("t.db")).unwrap();

    let mut writer = tree.writer().unwrap();
    for i in 0..800u32 {
        let key = format!("key{i:06}");
        writer.insert(key.as_bytes(), &i.to_be_bytes(), OnConflict::Fail).unwrap();
    }
    for i in (0..800u32).step_by(3) {
        let key = format!("key{i:06}");
        writer.remove(key.as_bytes()).unwrap();
    }
    drop(writer);

    assert!(tree.consistency_check().unwrap().is_empty());
    tree.checkpoint().unwrap();
    assert!(tree.consistency_check().unwrap().is_empty());
}

#[test]
fn test_corrupted_node_type_is_reported_not_repaired() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.db");
    let page_size = 512u64;
    {
        let tree: Tree = TreeOptions::new().page_size(512).open(&path).unwrap();
        let mut writer = tree.writer().unwrap();
        writer.insert(b"k", b"v", OnConflict::Fail).unwrap();
        drop(writer);
        tree.checkpoint().unwrap();
        tree.close().unwrap();
    }

    // clobber the root page's node type tag on disk
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all_at(&[9u8], page_size).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let tree: Tree = TreeOptions::new().open(&path).unwrap();
    let violations = tree.consistency_check().unwrap();
    assert!(!violations.is_empty());
    assert!(violations
        .iter()
        .any(|violation| matches!(violation, ConsistencyViolation::BadNode { .. })));

    // the checker reports; the page is still broken on a second run
    let again = tree.consistency_check().unwrap();
    assert_eq!(violations, again);
}

#[test]
fn test_violations_render_for_humans() {
    let violation = ConsistencyViolation::KeyOrder { page_id: stratum::PageId(7), index: 3 };
    let text = violation.to_string();
    assert!(text.contains("7"));
    assert!(text.contains("3"));
}
