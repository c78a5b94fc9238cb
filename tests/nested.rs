use serde_json::{json, Value};
use synced_json::{Error, Item, Registry};

fn on_disk(path: &std::path::Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

#[test]
fn nested_write_reaches_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.json");
    let reg = Registry::new();

    let doc = reg.open_dict(&path).unwrap();
    doc.set("a", 1).unwrap();
    doc.set("b", json!({"c": 2})).unwrap();

    let b = doc.dict("b").unwrap();
    assert_eq!(b.get_as::<i64>("c").unwrap(), Some(2));
    assert_eq!(b.location(), "$.b");
    assert!(!b.is_root());

    b.set("c", 3).unwrap();
    assert_eq!(on_disk(&path), json!({"a": 1, "b": {"c": 3}}));

    let fresh = Registry::new().open_dict(&path).unwrap();
    assert_eq!(fresh.dict("b").unwrap().get_value("c").unwrap(), Some(json!(3)));
}

#[test]
fn nested_write_inside_scope_flushes_whole_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.json");
    let reg = Registry::new();
    let doc = reg.open_dict(&path).unwrap();
    doc.set("a", 1).unwrap();
    doc.set("b", json!({"c": 2})).unwrap();

    reg.with_buffer(|| {
        doc.dict("b")?.set("c", 3)?;
        assert_eq!(on_disk(&path), json!({"a": 1, "b": {"c": 2}}));
        Ok(())
    })
    .unwrap();

    assert_eq!(on_disk(&path), json!({"a": 1, "b": {"c": 3}}));
}

#[test]
fn dirty_flag_is_shared_with_the_root() {
    let dir = tempfile::tempdir().unwrap();
    let reg = Registry::new();
    let doc = reg.open_dict(dir.path().join("job.json")).unwrap();
    doc.set("outer", json!({"inner": {"leaf": 0}})).unwrap();

    let guard = reg.buffered();
    let leaf_parent = doc.dict("outer").unwrap().dict("inner").unwrap();
    leaf_parent.set("leaf", 1).unwrap();
    assert!(doc.is_dirty());
    assert!(leaf_parent.is_dirty());
    guard.finish().unwrap();
    assert!(!doc.is_dirty());
}

#[test]
fn sibling_handles_see_each_others_changes() {
    let dir = tempfile::tempdir().unwrap();
    let reg = Registry::new();
    let doc = reg.open_dict(dir.path().join("job.json")).unwrap();
    doc.set("cfg", json!({"n": 1})).unwrap();

    let one = doc.dict("cfg").unwrap();
    let two = doc.dict("cfg").unwrap();
    one.set("n", 2).unwrap();
    assert_eq!(two.get_value("n").unwrap(), Some(json!(2)));
    assert_eq!(one, two);
}

#[test]
fn replaced_child_is_detached() {
    let dir = tempfile::tempdir().unwrap();
    let reg = Registry::new();
    let doc = reg.open_dict(dir.path().join("job.json")).unwrap();
    doc.set("b", json!({"c": 1})).unwrap();

    let b = doc.dict("b").unwrap();
    doc.set("b", 5).unwrap();
    assert!(matches!(b.get_value("c"), Err(Error::Detached { .. })));
    assert!(matches!(b.set("c", 2), Err(Error::Detached { .. })));
    assert_eq!(doc.get_value("b").unwrap(), Some(json!(5)));

    // Same path, new container: the old handle follows the path.
    doc.set("b", json!({"c": 9})).unwrap();
    assert_eq!(b.get_value("c").unwrap(), Some(json!(9)));
}

#[test]
fn removed_child_is_detached() {
    let dir = tempfile::tempdir().unwrap();
    let reg = Registry::new();
    let doc = reg.open_dict(dir.path().join("job.json")).unwrap();
    doc.set("runs", json!([1, 2])).unwrap();

    let runs = doc.list("runs").unwrap();
    doc.remove("runs").unwrap();
    match runs.push(3) {
        Err(Error::Detached { path, expected, .. }) => {
            assert_eq!(path, "$.runs");
            assert_eq!(expected, "sequence");
        }
        other => panic!("expected Detached, got {other:?}"),
    }
}

#[test]
fn lists_of_mappings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.json");
    let reg = Registry::new();
    let runs = reg.open_list(&path).unwrap();
    runs.push(json!({"id": 1, "tags": []})).unwrap();
    runs.push(json!({"id": 2, "tags": []})).unwrap();

    let second = runs.dict(1).unwrap();
    assert_eq!(second.location(), "$[1]");
    second.list("tags").unwrap().push("fast").unwrap();

    assert_eq!(
        on_disk(&path),
        json!([{"id": 1, "tags": []}, {"id": 2, "tags": ["fast"]}])
    );
    assert!(matches!(runs.list(1), Err(Error::Detached { .. })));
    assert!(matches!(
        runs.dict(5),
        Err(Error::IndexOutOfRange { index: 5, len: 2 })
    ));
}

#[test]
fn list_handles_follow_indices() {
    let dir = tempfile::tempdir().unwrap();
    let reg = Registry::new();
    let runs = reg.open_list(dir.path().join("runs.json")).unwrap();
    runs.extend([json!({"id": "a"}), json!({"id": "b"})]).unwrap();

    let first = runs.dict(0).unwrap();
    runs.insert(0, json!({"id": "new"})).unwrap();
    assert_eq!(first.get_value("id").unwrap(), Some(json!("new")));
}

#[test]
fn typed_lookup_of_wrong_kind() {
    let dir = tempfile::tempdir().unwrap();
    let reg = Registry::new();
    let doc = reg.open_dict(dir.path().join("job.json")).unwrap();
    doc.set("s", "text").unwrap();
    doc.set("l", json!([1])).unwrap();

    assert!(matches!(doc.dict("s"), Err(Error::Detached { .. })));
    assert!(matches!(doc.dict("l"), Err(Error::Detached { .. })));
    assert!(matches!(doc.dict("missing"), Err(Error::KeyNotFound(_))));
    assert!(matches!(
        doc.get("l").unwrap().and_then(Item::into_list),
        Some(_)
    ));
}

#[test]
fn same_document_from_two_opens_shares_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.json");
    let reg = Registry::new();
    let one = reg.open_dict(&path).unwrap();
    let two = reg.open_dict(&path).unwrap();

    let guard = reg.buffered();
    one.set("x", 1).unwrap();
    assert_eq!(two.get_value("x").unwrap(), Some(json!(1)));
    assert!(two.is_dirty());
    guard.finish().unwrap();
    assert_eq!(reg.len(), 1);
}
