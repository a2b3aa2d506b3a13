use evidence_core::config::StoreConfig;
use evidence_core::evidence::model::{EvidenceType, FileUpload, NewEvidence};
use evidence_core::evidence::EvidenceStore;
use evidence_core::session::Session;
use evidence_core::storage::crypto::EncryptionAlgorithm;
use evidence_core::storage::object_store::ObjectStore;
use walkdir::WalkDir;

fn raw_blob_bytes(root: &std::path::Path) -> Vec<Vec<u8>> {
    WalkDir::new(root.join("objects").join("blobs"))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.path().extension().map_or(false, |x| x == "bin"))
        .map(|e| std::fs::read(e.path()).unwrap())
        .collect()
}

fn roundtrip_with(algorithm: EncryptionAlgorithm) {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = StoreConfig::new("store_vault", "https://evidence.example/objects/");
    cfg.encryption_algorithm = algorithm;
    let session = Session::for_scope("org_acme", "alice").unwrap();

    let (id, key) = {
        let store = EvidenceStore::create(dir.path(), cfg).unwrap();
        assert!(store.objects().encrypted_at_rest());
        let id = store
            .create_evidence(&session, NewEvidence::new("AC-090", "Keys", EvidenceType::Configuration))
            .unwrap();
        let res = store
            .upload_file(
                &session,
                &id,
                FileUpload {
                    file_name: "kms.json".to_string(),
                    mime_type: Some("application/json".to_string()),
                    bytes: b"top-secret-blob".to_vec(),
                    notes: None,
                },
            )
            .unwrap();
        (id, res.file.storage_key)
    };

    let blobs = raw_blob_bytes(dir.path());
    assert_eq!(blobs.len(), 1);
    assert!(!String::from_utf8_lossy(&blobs[0]).contains("top-secret-blob"));

    let reopened = EvidenceStore::open(dir.path()).unwrap();
    assert_eq!(reopened.objects().get(&key).unwrap(), b"top-secret-blob");
    let file_id = reopened.get_evidence(&session, &id).unwrap().versions[0].files[0]
        .id
        .clone();
    reopened.verify_file(&session, &file_id).unwrap();
}

#[test]
fn xchacha_blobs_are_encrypted_at_rest() {
    roundtrip_with(EncryptionAlgorithm::XCHACHA20_POLY1305);
}

#[test]
fn aes_gcm_blobs_are_encrypted_at_rest() {
    roundtrip_with(EncryptionAlgorithm::AES_256_GCM);
}

#[test]
fn plaintext_mode_stores_bytes_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = StoreConfig::new("store_plain", "https://evidence.example/objects/");
    cfg.encryption_at_rest = false;
    let store = EvidenceStore::create(dir.path(), cfg).unwrap();
    store.objects().put("org_acme/k", b"visible", "text/plain").unwrap();
    assert_eq!(raw_blob_bytes(dir.path()), vec![b"visible".to_vec()]);
}
