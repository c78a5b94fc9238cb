use serde_json::json;
use std::time::Duration;
use synced_json::{Backend, Error, FileBackend, JsonSerializer, MemoryStore, Registry};

// ---- file backend -----------------------------------------------------------

#[test]
fn file_backend_read_write_contract() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileBackend::new(dir.path().join("doc.json")).unwrap();

    assert_eq!(backend.read().unwrap(), None);
    backend.write(br#"{"a":1}"#).unwrap();
    assert_eq!(backend.read().unwrap().as_deref(), Some(&br#"{"a":1}"#[..]));
    assert_eq!(backend.resource(), backend.path().display().to_string());
    assert!(backend.path().is_absolute());
}

#[test]
fn file_backend_lock_is_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    let one = FileBackend::new(&path).unwrap();
    let two = FileBackend::new(&path).unwrap();

    let held = one.acquire_lock(Duration::from_millis(100)).unwrap();
    assert!(matches!(
        two.acquire_lock(Duration::from_millis(20)),
        Err(Error::LockTimeout { .. })
    ));
    drop(held);
    two.acquire_lock(Duration::from_millis(100)).map(drop).unwrap();
}

#[test]
fn file_backend_codec_reports_corruption_against_resource() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileBackend::new(dir.path().join("doc.json")).unwrap();
    match backend.deserialize(b"[1,") {
        Err(Error::Corruption { resource, .. }) => assert_eq!(resource, backend.resource()),
        other => panic!("expected Corruption, got {other:?}"),
    }
}

#[test]
fn relative_and_dotted_paths_share_identity() {
    let dir = tempfile::tempdir().unwrap();
    let plain = FileBackend::new(dir.path().join("doc.json")).unwrap();
    let dotted = FileBackend::new(dir.path().join("sub").join("..").join(".").join("doc.json")).unwrap();
    assert_eq!(plain.resource(), dotted.resource());
}

#[test]
fn pretty_serializer_through_builder() {
    let dir = tempfile::tempdir().unwrap();
    let backend =
        FileBackend::with_serializer(dir.path().join("doc.json"), JsonSerializer::pretty()).unwrap();
    let bytes = backend.serialize(&json!({"a": {"b": 1}})).unwrap();
    assert!(bytes.contains(&b'\n'));
}

// ---- memory backend ---------------------------------------------------------

#[test]
fn memory_backend_read_write_contract() {
    let store = MemoryStore::new();
    let backend = store.backend("k");
    assert_eq!(backend.resource(), "k");
    assert_eq!(backend.read().unwrap(), None);

    backend.write(b"[]").unwrap();
    backend.write(b"[1]").unwrap();
    assert_eq!(store.get("k").as_deref(), Some(&b"[1]"[..]));
    assert_eq!(store.write_count("k"), 2);
    assert_eq!(store.write_count("other"), 0);
}

#[test]
fn memory_backends_share_their_store() {
    let store = MemoryStore::new();
    let reg = Registry::new();
    let list = reg.document_with(store.backend("items")).open_list().unwrap();
    list.push("a").unwrap();

    let other = MemoryStore::clone(&store);
    assert_eq!(other.get("items").as_deref(), Some(&br#"["a"]"#[..]));
}

// ---- registry -----------------------------------------------------------------

#[test]
fn registry_returns_the_same_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    let reg = Registry::new();

    let one = reg.open_dict(&path).unwrap();
    let two = reg.open_dict(dir.path().join(".").join("doc.json")).unwrap();
    one.set("a", 1).unwrap();
    assert_eq!(two.get_value("a").unwrap(), Some(json!(1)));
    assert_eq!(reg.len(), 1);
    assert!(reg.contains(one.resource()));
    assert_eq!(reg.resources(), vec![one.resource().to_string()]);
}

#[test]
fn opening_with_the_other_kind_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    let reg = Registry::new();
    let _doc = reg.open_dict(&path).unwrap();
    assert!(matches!(reg.open_list(&path), Err(Error::Config(_))));
}

#[test]
fn release_forgets_a_document() {
    let store = MemoryStore::new();
    let reg = Registry::new();
    let doc = reg.document_with(store.backend("doc")).open_dict().unwrap();
    doc.set("a", 1).unwrap();

    assert!(reg.release("doc"));
    assert!(!reg.release("doc"));
    assert!(reg.is_empty());

    // Old handles keep working against their own copy.
    doc.set("b", 2).unwrap();
    let again = reg.document_with(store.backend("doc")).open_dict().unwrap();
    assert_eq!(again, json!({"a": 1, "b": 2}));
}

#[test]
fn clear_all_empties_the_registry() {
    let store = MemoryStore::new();
    let reg = Registry::new();
    for key in ["a", "b", "c"] {
        reg.document_with(store.backend(key)).open_list().unwrap();
    }
    assert_eq!(reg.resources(), vec!["a", "b", "c"]);
    reg.clear_all();
    assert!(reg.is_empty());
}

#[test]
fn builder_options_only_apply_on_first_open() {
    let store = MemoryStore::new();
    let reg = Registry::new();
    let first = reg.document_with(store.backend("doc")).open_dict().unwrap();
    let second = reg
        .document_with(store.backend("doc"))
        .validators(synced_json::ValidatorChain::json().with(synced_json::NoDotInKey))
        .open_dict()
        .unwrap();
    // The first open's chain (no dot check) is what the document uses.
    second.set("a.b", 1).unwrap();
    assert_eq!(first.get_value("a.b").unwrap(), Some(json!(1)));
}
