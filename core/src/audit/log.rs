use crate::audit::event::{compute_event_hash, finalize_event, EvidenceAuditEvent, ZERO_HASH_64};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Append-only NDJSON audit trail; every line carries the hash of the line before it.
pub struct AuditLog {
    path: PathBuf,
    last_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainVerification {
    pub events_checked: u64,
    pub intact: bool,
    pub first_broken_line: Option<u64>,
    pub message: String,
}

impl AuditLog {
    pub fn open_or_create(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            File::create(&path)?;
            return Ok(Self {
                path,
                last_hash: ZERO_HASH_64.to_string(),
            });
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut last_hash = ZERO_HASH_64.to_string();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let v: Value = serde_json::from_str(&line)?;
            let eh = v
                .get("event_hash")
                .and_then(|x| x.as_str())
                .ok_or_else(|| {
                    CoreError::Validation("audit log line missing event_hash".to_string())
                })?;
            last_hash = eh.to_string();
        }
        Ok(Self { path, last_hash })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, mut event: EvidenceAuditEvent) -> CoreResult<EvidenceAuditEvent> {
        event.prev_event_hash = self.last_hash.clone();
        let event = finalize_event(event)?;
        let line = serde_json::to_string(&event)?;
        let mut f = OpenOptions::new().append(true).open(&self.path)?;
        f.write_all(line.as_bytes())?;
        f.write_all(b"\n")?;
        self.last_hash = event.event_hash.clone();
        Ok(event)
    }

    pub fn verify(path: impl AsRef<Path>) -> CoreResult<ChainVerification> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut expected_prev = ZERO_HASH_64.to_string();
        let mut checked = 0u64;
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let line_no = idx as u64 + 1;
            let event: EvidenceAuditEvent = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(e) => return Ok(broken(checked, line_no, format!("unparsable event: {}", e))),
            };
            if event.prev_event_hash != expected_prev {
                return Ok(broken(checked, line_no, "prev_event_hash does not chain".to_string()));
            }
            if compute_event_hash(&event)? != event.event_hash {
                return Ok(broken(checked, line_no, "event_hash does not match".to_string()));
            }
            expected_prev = event.event_hash;
            checked += 1;
        }
        Ok(ChainVerification {
            events_checked: checked,
            intact: true,
            first_broken_line: None,
            message: "chain intact".to_string(),
        })
    }
}

fn broken(checked: u64, line_no: u64, message: String) -> ChainVerification {
    ChainVerification {
        events_checked: checked,
        intact: false,
        first_broken_line: Some(line_no),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::AuditLog;
    use crate::audit::event::{Actor, EvidenceAuditEvent, EVIDENCE_ARCHIVED};
    use serde_json::json;

    #[test]
    fn reopened_log_continues_chain_and_tampering_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("log.ndjson");
        {
            let mut log = AuditLog::open_or_create(&path).unwrap();
            log.append(EvidenceAuditEvent::new(
                EVIDENCE_ARCHIVED,
                "org_1",
                "ev_1",
                Actor::System,
                json!({"previous_status": "draft"}),
            ))
            .unwrap();
        }
        let mut log = AuditLog::open_or_create(&path).unwrap();
        log.append(EvidenceAuditEvent::new(
            EVIDENCE_ARCHIVED,
            "org_1",
            "ev_2",
            Actor::User("bob".to_string()),
            json!({"previous_status": "final"}),
        ))
        .unwrap();

        let ok = AuditLog::verify(&path).unwrap();
        assert!(ok.intact);
        assert_eq!(ok.events_checked, 2);

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("ev_2", "ev_9")).unwrap();
        let bad = AuditLog::verify(&path).unwrap();
        assert!(!bad.intact);
        assert_eq!(bad.first_broken_line, Some(2));
    }
}
