use crate::determinism::json_canonical;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    System,
    User(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceAuditEvent {
    pub ts_utc: String, // RFC3339 UTC string
    pub event_type: String,
    pub org_id: String,
    pub evidence_id: String,
    pub actor: Actor,
    pub details: serde_json::Value,
    pub prev_event_hash: String, // hex 64
    pub event_hash: String,      // hex 64
}

pub const ZERO_HASH_64: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub const EVIDENCE_CREATED: &str = "EVIDENCE_CREATED";
pub const EVIDENCE_UPDATED: &str = "EVIDENCE_UPDATED";
pub const EVIDENCE_ARCHIVED: &str = "EVIDENCE_ARCHIVED";
pub const EVIDENCE_DISCARDED: &str = "EVIDENCE_DISCARDED";
pub const VERSION_CREATED: &str = "VERSION_CREATED";
pub const FILE_INGESTED: &str = "FILE_INGESTED";
pub const FILE_DELETED: &str = "FILE_DELETED";
pub const STATUS_CHANGED: &str = "STATUS_CHANGED";
pub const DUPLICATES_REMOVED: &str = "DUPLICATES_REMOVED";
pub const RETENTION_PURGED: &str = "RETENTION_PURGED";
pub const INTEGRITY_CHECKED: &str = "INTEGRITY_CHECKED";

impl EvidenceAuditEvent {
    pub fn new(
        event_type: &str,
        org_id: &str,
        evidence_id: &str,
        actor: Actor,
        details: serde_json::Value,
    ) -> Self {
        Self {
            ts_utc: now_rfc3339_utc(),
            event_type: event_type.to_string(),
            org_id: org_id.to_string(),
            evidence_id: evidence_id.to_string(),
            actor,
            details,
            prev_event_hash: String::new(),
            event_hash: String::new(),
        }
    }
}

// event_hash covers the full envelope with event_hash itself forced to zeros, so
// the hashed key set is identical before and after finalization.
pub fn compute_event_hash(event: &EvidenceAuditEvent) -> CoreResult<String> {
    let mut e = event.clone();
    e.event_hash = ZERO_HASH_64.to_string();
    let bytes = json_canonical::to_canonical_bytes(&e)?;
    let mut h = Sha256::new();
    h.update(bytes);
    Ok(hex::encode(h.finalize()))
}

pub fn finalize_event(mut event: EvidenceAuditEvent) -> CoreResult<EvidenceAuditEvent> {
    if event.prev_event_hash.len() != 64
        || !event.prev_event_hash.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(CoreError::Validation(
            "prev_event_hash must be 64 hex chars".to_string(),
        ));
    }
    validate_event_taxonomy(&event)?;
    event.event_hash = compute_event_hash(&event)?;
    Ok(event)
}

fn validate_event_taxonomy(event: &EvidenceAuditEvent) -> CoreResult<()> {
    let required = required_detail_keys(&event.event_type).ok_or_else(|| {
        CoreError::Validation(format!("unknown event_type {}", event.event_type))
    })?;
    for k in required {
        if event.details.get(k).is_none() {
            return Err(CoreError::Validation(format!(
                "event {} missing details.{}",
                event.event_type, k
            )));
        }
    }
    Ok(())
}

fn required_detail_keys(event_type: &str) -> Option<&'static [&'static str]> {
    let keys: &'static [&'static str] = match event_type {
        EVIDENCE_CREATED => &["control_id", "evidence_type", "source"],
        EVIDENCE_UPDATED => &["fields"],
        EVIDENCE_ARCHIVED => &["previous_status"],
        EVIDENCE_DISCARDED => &["reason"],
        VERSION_CREATED => &["version_number"],
        FILE_INGESTED => &[
            "file_id",
            "version_number",
            "content_digest",
            "size_bytes",
            "mime_type",
        ],
        FILE_DELETED => &["file_id", "storage_key"],
        STATUS_CHANGED => &["version_number", "from_status", "to_status"],
        DUPLICATES_REMOVED => &["removed_ids", "batches_failed", "cancelled"],
        RETENTION_PURGED => &["removed_ids", "batches_failed", "cancelled"],
        INTEGRITY_CHECKED => &["files_checked", "mismatches"],
        _ => return None,
    };
    Some(keys)
}

pub fn now_rfc3339_utc() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> EvidenceAuditEvent {
        EvidenceAuditEvent {
            ts_utc: "2026-02-10T00:00:00Z".to_string(),
            event_type: VERSION_CREATED.to_string(),
            org_id: "org_1".to_string(),
            evidence_id: "ev_1".to_string(),
            actor: Actor::User("alice".to_string()),
            details: json!({"version_number": 2}),
            prev_event_hash: ZERO_HASH_64.to_string(),
            event_hash: String::new(),
        }
    }

    #[test]
    fn event_hash_is_stable() {
        let a = finalize_event(sample()).unwrap().event_hash;
        let b = finalize_event(sample()).unwrap().event_hash;
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn missing_detail_key_is_rejected() {
        let mut ev = sample();
        ev.details = json!({});
        let err = finalize_event(ev).unwrap_err();
        assert!(err.to_string().contains("details.version_number"));
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let mut ev = sample();
        ev.event_type = "RUN_CREATED".to_string();
        assert!(finalize_event(ev).is_err());
    }
}
