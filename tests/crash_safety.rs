use serde_json::json;
use synced_json::{Error, Registry};

#[test]
fn corrupt_file_is_reported_not_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, b"{ not json }").unwrap();

    let err = Registry::new().open_dict(&path).unwrap_err();
    match &err {
        Error::Corruption { resource, .. } => assert!(resource.ends_with("bad.json")),
        other => panic!("expected Corruption, got {other:?}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(std::fs::read(&path).unwrap(), b"{ not json }");
}

#[test]
fn truncated_file_is_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("half.json");
    std::fs::write(&path, br#"{"a": [1, 2"#).unwrap();
    assert!(matches!(
        Registry::new().open_dict(&path),
        Err(Error::Corruption { .. })
    ));
}

#[test]
fn corruption_found_on_load_keeps_memory_intact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    let reg = Registry::new();
    let doc = reg.open_dict(&path).unwrap();
    doc.set("safe", 1).unwrap();

    std::fs::write(&path, b"garbage").unwrap();
    assert!(matches!(doc.load(), Err(Error::Corruption { .. })));
    assert_eq!(doc, json!({"safe": 1}));
}

#[test]
fn wrong_top_level_shape_is_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("obj.json");
    std::fs::write(&path, br#"{"a": 1}"#).unwrap();
    assert!(matches!(
        Registry::new().open_list(&path),
        Err(Error::Corruption { .. })
    ));
}

#[test]
fn leftover_tmp_file_is_ignored_and_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    std::fs::write(&path, br#"{"committed": true}"#).unwrap();
    // What a crash between write and rename leaves behind.
    std::fs::write(dir.path().join("doc.json.tmp"), b"{\"half").unwrap();

    let reg = Registry::new();
    let doc = reg.open_dict(&path).unwrap();
    assert_eq!(doc, json!({"committed": true}));

    doc.set("next", 1).unwrap();
    assert!(!dir.path().join("doc.json.tmp").exists());
    let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw, json!({"committed": true, "next": 1}));
}

#[test]
fn writes_leave_no_lock_or_tmp_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    let reg = Registry::new();
    let doc = reg.open_dict(&path).unwrap();
    for i in 0..10 {
        doc.set(format!("k{i}"), i).unwrap();
    }
    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["doc.json".to_string()]);
}

#[test]
fn missing_parent_directory_is_created_on_first_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("deeper").join("doc.json");
    let reg = Registry::new();
    let doc = reg.open_dict(&path).unwrap();
    doc.set("a", 1).unwrap();
    assert!(path.exists());
}

#[test]
fn invalid_content_on_disk_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    std::fs::write(&path, br#"{"a.b": 1}"#).unwrap();
    let err = Registry::new()
        .document(&path)
        .validators(synced_json::ValidatorChain::json().with(synced_json::NoDotInKey))
        .open_dict()
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
