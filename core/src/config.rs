use crate::error::{CoreError, CoreResult};
use crate::storage::crypto::EncryptionAlgorithm;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "store_config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub store_id: String,
    pub public_base_url: String,
    #[serde(default = "default_true")]
    pub encryption_at_rest: bool,
    #[serde(default = "default_algorithm")]
    pub encryption_algorithm: EncryptionAlgorithm,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_conflict_retries")]
    pub version_conflict_retries: u32,
    #[serde(default = "default_batch_size")]
    pub dedup_batch_size: usize,
    #[serde(default = "default_expiring_soon_days")]
    pub expiring_soon_days: u32,
    #[serde(default = "default_true")]
    pub audit_log: bool,
}

fn default_true() -> bool {
    true
}

fn default_algorithm() -> EncryptionAlgorithm {
    EncryptionAlgorithm::XCHACHA20_POLY1305
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_conflict_retries() -> u32 {
    8
}

fn default_batch_size() -> usize {
    100
}

fn default_expiring_soon_days() -> u32 {
    30
}

impl StoreConfig {
    pub fn new(store_id: &str, public_base_url: &str) -> Self {
        Self {
            store_id: store_id.to_string(),
            public_base_url: public_base_url.to_string(),
            encryption_at_rest: default_true(),
            encryption_algorithm: default_algorithm(),
            busy_timeout_ms: default_busy_timeout_ms(),
            version_conflict_retries: default_conflict_retries(),
            dedup_batch_size: default_batch_size(),
            expiring_soon_days: default_expiring_soon_days(),
            audit_log: default_true(),
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.store_id.trim().is_empty() {
            return Err(CoreError::Validation("store_id cannot be empty".to_string()));
        }
        url::Url::parse(&self.public_base_url).map_err(|e| {
            CoreError::Validation(format!("public_base_url is not a URL: {}", e))
        })?;
        if self.version_conflict_retries == 0 {
            return Err(CoreError::Validation(
                "version_conflict_retries must be at least 1".to_string(),
            ));
        }
        if self.dedup_batch_size == 0 {
            return Err(CoreError::Validation(
                "dedup_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn path_in(root: impl AsRef<Path>) -> PathBuf {
        root.as_ref().join("meta").join(CONFIG_FILE)
    }

    pub fn load(root: impl AsRef<Path>) -> CoreResult<Self> {
        let bytes = fs::read(Self::path_in(root))?;
        let cfg: StoreConfig = serde_json::from_slice(&bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, root: impl AsRef<Path>) -> CoreResult<()> {
        self.validate()?;
        let path = Self::path_in(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}
