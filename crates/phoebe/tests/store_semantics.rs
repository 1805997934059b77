//! Store semantics: revisions, deletion, index cache, change log.

use std::sync::Arc;
use std::thread;

use phoebe::error::ServerError;
use phoebe::store::Store;

fn scratch_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::new(dir.path());
    (dir, store)
}

#[test]
fn writes_produce_consecutive_revisions() {
    let (_dir, store) = scratch_store();
    assert_eq!(store.write_page("", "Welcome", "one", "0001").unwrap(), 1);
    assert_eq!(store.write_page("", "Welcome", "two", "0002").unwrap(), 2);
    assert_eq!(store.write_page("", "Welcome", "three", "0003").unwrap(), 3);

    let page = store.read_page("", "Welcome").unwrap();
    assert_eq!(page.text, "three");
    assert_eq!(page.revision, 3);

    assert_eq!(store.read_page_revision("", "Welcome", 1).unwrap(), "one");
    assert_eq!(store.read_page_revision("", "Welcome", 2).unwrap(), "two");
    assert_eq!(store.read_page_revision("", "Welcome", 3).unwrap(), "three");
}

#[test]
fn unknown_page_and_revision_are_not_found() {
    let (_dir, store) = scratch_store();
    assert!(matches!(
        store.read_page("", "Missing"),
        Err(ServerError::NotFound(_))
    ));
    store.write_page("", "Welcome", "one", "0001").unwrap();
    assert!(matches!(
        store.read_page_revision("", "Welcome", 9),
        Err(ServerError::NotFound(_))
    ));
}

#[test]
fn empty_write_deletes_but_preserves_history_and_numbering() {
    let (_dir, store) = scratch_store();
    store.write_page("", "Welcome", "one", "0001").unwrap();
    store.write_page("", "Welcome", "two", "0002").unwrap();
    // Deletion is a revision.
    assert_eq!(store.write_page("", "Welcome", "", "0003").unwrap(), 3);
    assert!(matches!(
        store.read_page("", "Welcome"),
        Err(ServerError::NotFound(_))
    ));
    // Prior revisions survive.
    assert_eq!(store.read_page_revision("", "Welcome", 2).unwrap(), "two");
    // Numbering never resets.
    assert_eq!(store.write_page("", "Welcome", "back", "0004").unwrap(), 4);
    assert_eq!(store.read_page("", "Welcome").unwrap().revision, 4);
}

#[test]
fn revisions_list_is_newest_first() {
    let (_dir, store) = scratch_store();
    for text in ["a", "b", "c"] {
        store.write_page("", "Welcome", text, "0001").unwrap();
    }
    assert_eq!(store.revisions("", "Welcome").unwrap(), vec![3, 2, 1]);
}

#[test]
fn index_is_rebuilt_identically_after_invalidation() {
    let (dir, store) = scratch_store();
    for name in ["Beta", "Alpha", "Gamma"] {
        store.write_page("", name, "text", "0001").unwrap();
    }
    let names = store.list_pages("").unwrap();
    assert_eq!(names, vec!["Alpha", "Beta", "Gamma"]);

    let index_path = dir.path().join("index");
    let cached = std::fs::read(&index_path).unwrap();
    std::fs::remove_file(&index_path).unwrap();

    assert_eq!(store.list_pages("").unwrap(), names);
    assert_eq!(std::fs::read(&index_path).unwrap(), cached);
}

#[test]
fn page_writes_invalidate_the_index() {
    let (_dir, store) = scratch_store();
    store.write_page("", "Alpha", "text", "0001").unwrap();
    assert_eq!(store.list_pages("").unwrap(), vec!["Alpha"]);
    store.write_page("", "Beta", "text", "0001").unwrap();
    assert_eq!(store.list_pages("").unwrap(), vec!["Alpha", "Beta"]);
}

#[test]
fn change_log_reads_newest_first_with_codes() {
    let (_dir, store) = scratch_store();
    store.write_page("", "One", "a", "0001").unwrap();
    store.write_page("", "Two", "b", "0002").unwrap();
    store.write_page("", "One", "c", "0003").unwrap();

    let entries = store.read_changes("", 10, 0).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].name, "One");
    assert_eq!(entries[0].revision, 2);
    assert_eq!(entries[0].code, "0003");
    assert_eq!(entries[2].name, "One");
    assert_eq!(entries[2].revision, 1);
}

#[test]
fn file_and_sidecar_roundtrip_without_history() {
    let (_dir, store) = scratch_store();
    let first = vec![0xde, 0xad, 0xbe, 0xef];
    store
        .write_file("", "blob.bin", &first, "application/octet-stream", "0001")
        .unwrap();
    let (bytes, mime) = store.read_file("", "blob.bin").unwrap();
    assert_eq!(bytes, first);
    assert_eq!(mime, "application/octet-stream");

    // Last writer wins; the change log records revision 0.
    store
        .write_file("", "blob.bin", b"v2", "application/octet-stream", "0002")
        .unwrap();
    let (bytes, _) = store.read_file("", "blob.bin").unwrap();
    assert_eq!(bytes, b"v2");
    let entries = store.read_changes("", 10, 0).unwrap();
    assert!(entries.iter().all(|e| e.revision == 0));
}

#[test]
fn spaces_are_isolated() {
    let (_dir, store) = scratch_store();
    store.write_page("", "Page", "root", "0001").unwrap();
    store.write_page("alpha", "Page", "alpha", "0001").unwrap();

    assert_eq!(store.read_page("", "Page").unwrap().text, "root");
    assert_eq!(store.read_page("alpha", "Page").unwrap().text, "alpha");
    assert_eq!(store.list_pages("alpha").unwrap(), vec!["Page"]);
    assert_eq!(store.read_changes("alpha", 10, 0).unwrap().len(), 1);
}

#[test]
fn names_round_trip_through_the_store() {
    let (_dir, store) = scratch_store();
    let name = "Some Page with sp\u{e4}ces";
    store.write_page("", name, "text", "0001").unwrap();
    assert_eq!(store.list_pages("").unwrap(), vec![name.to_string()]);
    assert_eq!(store.read_page("", name).unwrap().text, "text");
}

#[test]
fn invalid_names_are_rejected_without_side_effects() {
    let (dir, store) = scratch_store();
    for name in ["", ".hidden", "a/b", "nul\0"] {
        assert!(matches!(
            store.write_page("", name, "text", "0001"),
            Err(ServerError::InvalidName(_))
        ));
    }
    assert!(!dir.path().join("changes.log").exists());
}

#[test]
fn concurrent_writers_get_a_total_order() {
    let (_dir, store) = scratch_store();
    let store = Arc::new(store);
    let writers: Vec<_> = (0..4)
        .map(|worker| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..5 {
                    store
                        .write_page("", "Contended", &format!("w{worker}-{i}"), "0001")
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    // 20 writes, consecutive revisions, no gaps.
    assert_eq!(store.read_page("", "Contended").unwrap().revision, 20);
    for rev in 1..=20 {
        assert!(store.read_page_revision("", "Contended", rev).is_ok());
    }
    let entries = store.read_changes("", 30, 0).unwrap();
    let mut revisions: Vec<u32> = entries.iter().map(|e| e.revision).collect();
    revisions.sort_unstable();
    assert_eq!(revisions, (1..=20).collect::<Vec<_>>());
}
