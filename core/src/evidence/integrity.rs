use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of exactly these bytes.
pub fn digest(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

pub fn verify_digest(file_id: &str, recorded: &str, bytes: &[u8]) -> CoreResult<()> {
    let actual = digest(bytes);
    if !actual.eq_ignore_ascii_case(recorded) {
        return Err(CoreError::IntegrityMismatch {
            file_id: file_id.to_string(),
            recorded: recorded.to_string(),
            actual,
        });
    }
    Ok(())
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IntegrityOutcome {
    MATCH,
    MISMATCH,
    MISSING_OBJECT,
    UNREADABLE,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityCheckRow {
    pub file_id: String,
    pub evidence_id: String,
    pub storage_key: String,
    pub recorded_digest: String,
    pub outcome: IntegrityOutcome,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub files_checked: u64,
    pub rows: Vec<IntegrityCheckRow>,
}

impl IntegrityReport {
    pub fn failures(&self) -> impl Iterator<Item = &IntegrityCheckRow> {
        self.rows
            .iter()
            .filter(|r| r.outcome != IntegrityOutcome::MATCH)
    }

    pub fn all_match(&self) -> bool {
        self.failures().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(
            digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn mismatch_reports_both_digests() {
        let recorded = digest(b"original");
        let err = verify_digest("evf_1", &recorded, b"tampered").unwrap_err();
        match err {
            CoreError::IntegrityMismatch {
                recorded: r,
                actual,
                ..
            } => {
                assert_eq!(r, recorded);
                assert_eq!(actual, digest(b"tampered"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(verify_digest("evf_1", &recorded, b"original").is_ok());
    }
}
