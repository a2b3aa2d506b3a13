use evidence_core::config::StoreConfig;
use evidence_core::evidence::model::{EvidenceType, FileUpload, NewEvidence};
use evidence_core::evidence::EvidenceStore;
use evidence_core::session::Session;
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

// Two independent handles on one database file behave like two processes: they share
// nothing but SQLite locking and the schema's unique index.
fn two_handles(dir: &std::path::Path) -> (EvidenceStore, EvidenceStore) {
    let mut cfg = StoreConfig::new("store_race", "https://evidence.example/objects/");
    cfg.audit_log = false;
    cfg.version_conflict_retries = 32;
    let a = EvidenceStore::create(dir, cfg).unwrap();
    let b = EvidenceStore::open(dir).unwrap();
    (a, b)
}

#[test]
fn racing_version_creators_never_share_a_number() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = two_handles(dir.path());
    let session = Session::for_scope("org_acme", "alice").unwrap();
    let id = a
        .create_evidence(&session, NewEvidence::new("AC-020", "Contended", EvidenceType::Document))
        .unwrap();

    let per_thread = 6;
    let barrier = Arc::new(Barrier::new(2));
    let results: Vec<Vec<u32>> = thread::scope(|s| {
        let handles: Vec<_> = [&a, &b]
            .into_iter()
            .map(|store| {
                let barrier = barrier.clone();
                let session = session.clone();
                let id = id.clone();
                s.spawn(move || {
                    barrier.wait();
                    (0..per_thread)
                        .map(|_| store.create_version(&session, &id, "race").unwrap())
                        .collect::<Vec<u32>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let won: BTreeSet<u32> = results.iter().flatten().copied().collect();
    assert_eq!(won.len(), 2 * per_thread, "a number was handed out twice");
    let expected: BTreeSet<u32> = (2..=(1 + 2 * per_thread as u32)).collect();
    assert_eq!(won, expected);

    let record = a.get_evidence(&session, &id).unwrap();
    assert_eq!(record.item.current_version, 1 + 2 * per_thread as u32);
    let mut numbers: Vec<u32> = record.versions.iter().map(|v| v.version_number).collect();
    numbers.sort();
    assert_eq!(numbers, (1..=record.item.current_version).collect::<Vec<u32>>());
}

#[test]
fn concurrent_uploads_into_one_version_keep_both_files() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = two_handles(dir.path());
    let session = Session::for_scope("org_acme", "alice").unwrap();
    let id = a
        .create_evidence(&session, NewEvidence::new("AC-021", "Shared", EvidenceType::Screenshot))
        .unwrap();

    thread::scope(|s| {
        for (n, store) in [&a, &b].into_iter().enumerate() {
            let session = session.clone();
            let id = id.clone();
            s.spawn(move || {
                store
                    .upload_file(
                        &session,
                        &id,
                        FileUpload {
                            file_name: "same-name.png".to_string(),
                            mime_type: None,
                            bytes: vec![n as u8; 64],
                            notes: None,
                        },
                    )
                    .unwrap();
            });
        }
    });

    let record = b.get_evidence(&session, &id).unwrap();
    assert_eq!(record.versions.len(), 1);
    assert_eq!(record.versions[0].files.len(), 2);
    let keys: BTreeSet<&str> = record.versions[0]
        .files
        .iter()
        .map(|f| f.storage_key.as_str())
        .collect();
    assert_eq!(keys.len(), 2);
}
