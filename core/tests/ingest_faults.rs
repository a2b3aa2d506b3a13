use evidence_core::config::StoreConfig;
use evidence_core::error::{CoreError, CoreResult, ErrorKind};
use evidence_core::evidence::model::{
    AutomatedCheck, EvidenceType, FileUpload, NewEvidence, SearchFilter,
};
use evidence_core::evidence::store::db_path;
use evidence_core::evidence::EvidenceStore;
use evidence_core::session::{CancelToken, Session};
use evidence_core::storage::object_store::ObjectStore;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MemoryObjects {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_put: AtomicBool,
    fail_delete: AtomicBool,
    deletes: Mutex<Vec<String>>,
    // When set, every put moves the store's versions to review first, as a
    // reviewer's submit landing mid-upload would.
    submit_during_put: Mutex<Option<PathBuf>>,
}

impl MemoryObjects {
    fn keys(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }
}

impl ObjectStore for MemoryObjects {
    fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> CoreResult<()> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(CoreError::ObjectStoreUnavailable("bucket offline".to_string()));
        }
        if let Some(root) = self.submit_during_put.lock().unwrap().as_ref() {
            let conn = rusqlite::Connection::open(db_path(root)).unwrap();
            conn.execute_batch(
                "UPDATE evidence_versions SET status = 'review';
                 UPDATE evidence_items SET status = 'review';",
            )
            .unwrap();
        }
        self.blobs.lock().unwrap().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> CoreResult<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(key.to_string()))
    }

    fn public_url(&self, key: &str) -> CoreResult<String> {
        Ok(format!("mem://{}", key))
    }

    fn delete(&self, key: &str) -> CoreResult<()> {
        self.deletes.lock().unwrap().push(key.to_string());
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(CoreError::ObjectStoreUnavailable("bucket offline".to_string()));
        }
        self.blobs.lock().unwrap().remove(key);
        Ok(())
    }
}

fn cfg() -> StoreConfig {
    StoreConfig::new("store_faults", "https://evidence.example/objects/")
}

fn file(name: &str, bytes: &[u8]) -> FileUpload {
    FileUpload {
        file_name: name.to_string(),
        mime_type: Some("text/plain".to_string()),
        bytes: bytes.to_vec(),
        notes: None,
    }
}

// Makes every evidence_files insert abort, as a failing metadata store would.
fn inject_file_insert_fault(root: &Path) {
    let conn = rusqlite::Connection::open(db_path(root)).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER fail_file_insert BEFORE INSERT ON evidence_files
         BEGIN SELECT RAISE(ABORT, 'injected fault'); END;",
    )
    .unwrap();
}

fn clear_fault(root: &Path) {
    let conn = rusqlite::Connection::open(db_path(root)).unwrap();
    conn.execute_batch("DROP TRIGGER fail_file_insert;").unwrap();
}

#[test]
fn failed_record_insert_removes_stored_object() {
    let dir = tempfile::tempdir().unwrap();
    let store = EvidenceStore::create(dir.path(), cfg()).unwrap();
    let session = Session::for_scope("org_acme", "alice").unwrap();
    let id = store
        .create_evidence(&session, NewEvidence::new("AC-030", "Faulty", EvidenceType::Log))
        .unwrap();

    inject_file_insert_fault(dir.path());
    let err = store
        .upload_file(&session, &id, file("app.log", b"lines"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PERSISTENCE);
    assert!(err.to_string().contains("injected fault"));
    assert!(err.cleanup_warning().is_none());

    assert!(store.objects().list_keys().unwrap().is_empty());
    let record = store.get_evidence(&session, &id).unwrap();
    assert!(record.versions[0].files.is_empty());

    clear_fault(dir.path());
    store
        .upload_file(&session, &id, file("app.log", b"lines"))
        .unwrap();
    assert_eq!(store.objects().list_keys().unwrap().len(), 1);
    assert!(store.find_orphaned_objects(&session).unwrap().is_empty());
}

#[test]
fn failed_cleanup_is_reported_alongside_primary_error() {
    let dir = tempfile::tempdir().unwrap();
    let objects = Arc::new(MemoryObjects::default());
    let store = EvidenceStore::with_object_store(dir.path(), cfg(), objects.clone()).unwrap();
    let session = Session::for_scope("org_acme", "alice").unwrap();
    let id = store
        .create_evidence(&session, NewEvidence::new("AC-031", "Faulty", EvidenceType::Log))
        .unwrap();

    inject_file_insert_fault(dir.path());
    objects.fail_delete.store(true, Ordering::SeqCst);
    let err = store
        .upload_file(&session, &id, file("app.log", b"lines"))
        .unwrap_err();

    match &err {
        CoreError::CompensationFailed { primary, warning } => {
            assert!(primary.to_string().contains("injected fault"));
            assert!(warning.contains("bucket offline"));
        }
        other => panic!("expected CompensationFailed, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::PERSISTENCE);
    assert_eq!(objects.deletes.lock().unwrap().len(), 1);
    assert_eq!(objects.keys().len(), 1);
}

#[test]
fn cross_scope_file_delete_is_refused_without_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let objects = Arc::new(MemoryObjects::default());
    let store = EvidenceStore::with_object_store(dir.path(), cfg(), objects.clone()).unwrap();
    let owner = Session::for_scope("org_acme", "alice").unwrap();
    let intruder = Session::for_scope("org_other", "mallory").unwrap();

    let id = store
        .create_evidence(&owner, NewEvidence::new("AC-032", "Owned", EvidenceType::Document))
        .unwrap();
    let up = store.upload_file(&owner, &id, file("doc.txt", b"mine")).unwrap();
    let before = store.get_evidence(&owner, &id).unwrap();

    let err = store.delete_file(&intruder, &up.file.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UNAUTHORIZED);

    assert!(objects.deletes.lock().unwrap().is_empty());
    assert_eq!(objects.keys(), vec![up.file.storage_key.clone()]);
    assert_eq!(store.get_evidence(&owner, &id).unwrap(), before);
    assert!(matches!(
        store.verify_file(&intruder, &up.file.id),
        Err(CoreError::NotFound(_))
    ));
}

#[test]
fn owner_file_delete_removes_record_and_object() {
    let dir = tempfile::tempdir().unwrap();
    let objects = Arc::new(MemoryObjects::default());
    let store = EvidenceStore::with_object_store(dir.path(), cfg(), objects.clone()).unwrap();
    let session = Session::for_scope("org_acme", "alice").unwrap();
    let id = store
        .create_evidence(&session, NewEvidence::new("AC-033", "Owned", EvidenceType::Document))
        .unwrap();
    let keep = store.upload_file(&session, &id, file("keep.txt", b"k")).unwrap();
    let dropped = store.upload_file(&session, &id, file("drop.txt", b"d")).unwrap();

    store.delete_file(&session, &dropped.file.id).unwrap();
    assert_eq!(objects.keys(), vec![keep.file.storage_key.clone()]);
    let record = store.get_evidence(&session, &id).unwrap();
    let files = &record.versions[0].files;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].id, keep.file.id);
    assert!(matches!(
        store.delete_file(&session, &dropped.file.id),
        Err(CoreError::NotFound(_))
    ));
}

#[test]
fn files_of_final_versions_cannot_be_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let store = EvidenceStore::create(dir.path(), cfg()).unwrap();
    let session = Session::for_scope("org_acme", "alice").unwrap();
    let id = store
        .create_evidence(&session, NewEvidence::new("AC-034", "Approved", EvidenceType::Document))
        .unwrap();
    let up = store.upload_file(&session, &id, file("proof.txt", b"p")).unwrap();
    store.submit_for_review(&session, &id).unwrap();
    store.approve(&session, &id, "reviewer1").unwrap();

    let err = store.delete_file(&session, &up.file.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::INVALID_TRANSITION);
    store.verify_file(&session, &up.file.id).unwrap();
}

#[test]
fn files_of_versions_under_review_cannot_be_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let store = EvidenceStore::create(dir.path(), cfg()).unwrap();
    let session = Session::for_scope("org_acme", "alice").unwrap();
    let id = store
        .create_evidence(&session, NewEvidence::new("AC-036", "Under review", EvidenceType::Document))
        .unwrap();
    let up = store.upload_file(&session, &id, file("proof.txt", b"p")).unwrap();
    store.submit_for_review(&session, &id).unwrap();

    let err = store.delete_file(&session, &up.file.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::INVALID_TRANSITION);
    store.verify_file(&session, &up.file.id).unwrap();

    store.reject(&session, &id, None).unwrap();
    store.delete_file(&session, &up.file.id).unwrap();
    assert!(store.objects().list_keys().unwrap().is_empty());
}

#[test]
fn submit_during_upload_rejects_the_file_and_removes_its_object() {
    let dir = tempfile::tempdir().unwrap();
    let objects = Arc::new(MemoryObjects::default());
    let store = EvidenceStore::with_object_store(dir.path(), cfg(), objects.clone()).unwrap();
    let session = Session::for_scope("org_acme", "alice").unwrap();
    let id = store
        .create_evidence(&session, NewEvidence::new("AC-037", "Racing", EvidenceType::Log))
        .unwrap();

    *objects.submit_during_put.lock().unwrap() = Some(dir.path().to_path_buf());
    let err = store
        .upload_file(&session, &id, file("late.log", b"late"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::INVALID_TRANSITION);
    assert!(objects.keys().is_empty());
    assert_eq!(objects.deletes.lock().unwrap().len(), 1);
    assert!(store.get_evidence(&session, &id).unwrap().versions[0].files.is_empty());
}

fn scan_result() -> AutomatedCheck {
    AutomatedCheck {
        title: "Disk encryption enabled".to_string(),
        details: "40 of 40 hosts encrypted".to_string(),
        payload: serde_json::json!({"hosts": 40, "encrypted": 40}),
        status: "passed".to_string(),
    }
}

#[test]
fn failed_automated_intake_leaves_no_item_behind() {
    let dir = tempfile::tempdir().unwrap();
    let objects = Arc::new(MemoryObjects::default());
    let store = EvidenceStore::with_object_store(dir.path(), cfg(), objects.clone()).unwrap();
    let session = Session::for_scope("org_acme", "scanner").unwrap();

    objects.fail_put.store(true, Ordering::SeqCst);
    let err = store
        .create_from_automated_check(&session, "mdm", "AC-038", scan_result())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OBJECT_STORE_UNAVAILABLE);
    assert!(store
        .search_evidence(&session, &SearchFilter::default())
        .unwrap()
        .is_empty());

    objects.fail_put.store(false, Ordering::SeqCst);
    let res = store
        .create_from_automated_check(&session, "mdm", "AC-038", scan_result())
        .unwrap();

    let dedup = store.remove_duplicates(&session, &CancelToken::new()).unwrap();
    assert!(dedup.removed_ids.is_empty());
    let live = store.search_evidence(&session, &SearchFilter::default()).unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, res.evidence_id);
    let record = store.get_evidence(&session, &res.evidence_id).unwrap();
    assert_eq!(record.versions[0].files.len(), 1);
}

#[test]
fn failed_automated_record_insert_removes_item_and_object() {
    let dir = tempfile::tempdir().unwrap();
    let objects = Arc::new(MemoryObjects::default());
    let store = EvidenceStore::with_object_store(dir.path(), cfg(), objects.clone()).unwrap();
    let session = Session::for_scope("org_acme", "scanner").unwrap();

    inject_file_insert_fault(dir.path());
    let err = store
        .create_from_automated_check(&session, "mdm", "AC-039", scan_result())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PERSISTENCE);
    assert!(objects.keys().is_empty());
    assert!(store
        .search_evidence(&session, &SearchFilter::default())
        .unwrap()
        .is_empty());
}

#[test]
fn tampered_object_is_detected_not_repaired() {
    let dir = tempfile::tempdir().unwrap();
    let objects = Arc::new(MemoryObjects::default());
    let store = EvidenceStore::with_object_store(dir.path(), cfg(), objects.clone()).unwrap();
    let session = Session::for_scope("org_acme", "alice").unwrap();
    let id = store
        .create_evidence(&session, NewEvidence::new("AC-035", "Log", EvidenceType::Log))
        .unwrap();
    let up = store.upload_file(&session, &id, file("a.log", b"original")).unwrap();

    objects.put(&up.file.storage_key, b"tampered", "text/plain").unwrap();
    let err = store.verify_file(&session, &up.file.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::INTEGRITY_MISMATCH);
    assert_eq!(objects.get(&up.file.storage_key).unwrap(), b"tampered");

    objects.blobs.lock().unwrap().clear();
    match store.verify_file(&session, &up.file.id).unwrap_err() {
        CoreError::IntegrityMismatch { actual, .. } => assert_eq!(actual, "missing object"),
        other => panic!("unexpected {other:?}"),
    }
}
