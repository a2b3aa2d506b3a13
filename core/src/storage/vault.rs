use crate::determinism::json_canonical;
use crate::error::{CoreError, CoreResult};
use crate::evidence::integrity::digest;
use crate::storage::crypto::{generate_key_32, BlobCipher, EncryptionAlgorithm, SealedBlob};
use crate::storage::object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub public_base_url: String,
    pub encryption_algorithm: EncryptionAlgorithm,
    pub encryption_at_rest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// Filesystem object store. Blob paths are derived from SHA-256 of the key,
/// sharded by the first two hex chars.
pub struct VaultObjectStore {
    root: PathBuf,
    base_url: Url,
    cipher: Option<BlobCipher>,
}

impl VaultObjectStore {
    pub fn open(root: impl AsRef<Path>, cfg: &VaultConfig) -> CoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("meta"))?;
        let base_url = Url::parse(&cfg.public_base_url)
            .map_err(|e| CoreError::Validation(format!("invalid public_base_url: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(CoreError::Validation(
                "public_base_url cannot carry a path".to_string(),
            ));
        }
        let cipher = if cfg.encryption_at_rest {
            let key = get_or_create_data_key(&root.join("meta").join("dek.bin"))?;
            Some(BlobCipher::new(cfg.encryption_algorithm, key))
        } else {
            None
        };
        Ok(Self {
            root,
            base_url,
            cipher,
        })
    }

    fn blob_paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let h = digest(key.as_bytes());
        let dir = self.root.join("blobs").join(&h[..2]);
        (
            dir.join(format!("{}.bin", h)),
            dir.join(format!("{}.meta.json", h)),
        )
    }

    pub fn encrypted_at_rest(&self) -> bool {
        self.cipher.is_some()
    }

    /// Every key currently held, read from the sidecar metadata files.
    pub fn list_keys(&self) -> CoreResult<Vec<ObjectMeta>> {
        let mut out = Vec::new();
        for ent in WalkDir::new(self.root.join("blobs")) {
            let ent = ent.map_err(|e| CoreError::ObjectStoreUnavailable(e.to_string()))?;
            let name = ent.file_name().to_string_lossy();
            if !ent.file_type().is_file() || !name.ends_with(".meta.json") {
                continue;
            }
            let meta: ObjectMeta = serde_json::from_slice(&fs::read(ent.path())?)?;
            out.push(meta);
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

impl ObjectStore for VaultObjectStore {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> CoreResult<()> {
        let (blob_path, meta_path) = self.blob_paths(key);
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let stored = match &self.cipher {
            Some(c) => serde_json::to_vec(&c.seal(bytes)?)?,
            None => bytes.to_vec(),
        };
        let meta = ObjectMeta {
            key: key.to_string(),
            content_type: content_type.to_string(),
            size_bytes: bytes.len() as u64,
        };
        write_atomic(&blob_path, &stored)?;
        write_atomic(&meta_path, &json_canonical::to_canonical_bytes(&meta)?)?;
        debug!(key, size = bytes.len(), "object stored");
        Ok(())
    }

    fn get(&self, key: &str) -> CoreResult<Vec<u8>> {
        let (blob_path, _) = self.blob_paths(key);
        let bytes = fs::read(&blob_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound(format!("object {}", key))
            } else {
                CoreError::ObjectStoreUnavailable(e.to_string())
            }
        })?;
        match &self.cipher {
            Some(c) => {
                let sealed: SealedBlob = serde_json::from_slice(&bytes)?;
                c.open(&sealed)
            }
            None => Ok(bytes),
        }
    }

    fn public_url(&self, key: &str) -> CoreResult<String> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CoreError::Validation("public_base_url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(key.split('/'));
        Ok(url.to_string())
    }

    fn delete(&self, key: &str) -> CoreResult<()> {
        let (blob_path, meta_path) = self.blob_paths(key);
        for p in [blob_path, meta_path] {
            match fs::remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CoreError::ObjectStoreUnavailable(e.to_string())),
            }
        }
        debug!(key, "object deleted");
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    let tmp = path.with_extension(format!("tmp-{}", ulid::Ulid::new()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn get_or_create_data_key(path: &Path) -> CoreResult<[u8; 32]> {
    if path.exists() {
        let bytes = fs::read(path)?;
        if bytes.len() != 32 {
            return Err(CoreError::Validation(
                "data key file must hold exactly 32 bytes".to_string(),
            ));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Ok(key);
    }
    let key = generate_key_32();
    write_atomic(path, &key)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(encrypted: bool) -> VaultConfig {
        VaultConfig {
            public_base_url: "https://evidence.example/objects/".to_string(),
            encryption_algorithm: EncryptionAlgorithm::XCHACHA20_POLY1305,
            encryption_at_rest: encrypted,
        }
    }

    #[test]
    fn encrypted_blob_is_not_plaintext_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = VaultObjectStore::open(dir.path(), &cfg(true)).unwrap();
        store
            .put("org/ev/v1/1-a-secret.txt", b"top-secret-blob", "text/plain")
            .unwrap();
        let (blob_path, _) = store.blob_paths("org/ev/v1/1-a-secret.txt");
        let on_disk = fs::read(blob_path).unwrap();
        assert!(!String::from_utf8_lossy(&on_disk).contains("top-secret-blob"));

        let reopened = VaultObjectStore::open(dir.path(), &cfg(true)).unwrap();
        assert_eq!(
            reopened.get("org/ev/v1/1-a-secret.txt").unwrap(),
            b"top-secret-blob"
        );
    }

    #[test]
    fn public_url_encodes_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = VaultObjectStore::open(dir.path(), &cfg(false)).unwrap();
        let url = store.public_url("org 1/ev_1/v1/a b.png").unwrap();
        assert_eq!(
            url,
            "https://evidence.example/objects/org%201/ev_1/v1/a%20b.png"
        );
    }

    #[test]
    fn delete_is_idempotent_and_list_tracks_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = VaultObjectStore::open(dir.path(), &cfg(false)).unwrap();
        store.put("k1", b"a", "text/plain").unwrap();
        store.put("k2", b"bb", "text/plain").unwrap();
        assert_eq!(store.list_keys().unwrap().len(), 2);
        store.delete("k1").unwrap();
        store.delete("k1").unwrap();
        let keys = store.list_keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key, "k2");
        assert!(matches!(store.get("k1"), Err(CoreError::NotFound(_))));
    }
}
