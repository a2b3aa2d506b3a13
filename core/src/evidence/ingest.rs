use crate::audit::event::{
    EvidenceAuditEvent, EVIDENCE_DISCARDED, FILE_DELETED, FILE_INGESTED, INTEGRITY_CHECKED,
};
use crate::determinism::json_canonical;
use crate::error::{CoreError, CoreResult};
use crate::evidence::integrity::{
    digest, verify_digest, IntegrityCheckRow, IntegrityOutcome, IntegrityReport,
};
use crate::evidence::model::{
    AutomatedCheck, EvidenceFile, EvidenceSource, EvidenceStatus, EvidenceType, FileUpload,
    NewEvidence, UploadResult, VersionStatus,
};
use crate::records::{self, file_from_row, now_ms, FILE_COLUMNS};
use crate::session::{Scope, Session};
use crate::storage::object_store::ObjectStore;
use crate::storage::vault::{ObjectMeta, VaultObjectStore};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeSet;
use tracing::{info, warn};

use super::retention::delete_items;
use super::store::{actor, EvidenceStore};
use super::versions::ensure_draft;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
const MAX_KEY_FILENAME_CHARS: usize = 120;

impl<O: ObjectStore> EvidenceStore<O> {
    /// Digest, store, then record. A record that fails to land triggers one attempt
    /// to delete the just-stored object so no blob is left unreferenced.
    pub fn upload_file(
        &self,
        session: &Session,
        evidence_id: &str,
        upload: FileUpload,
    ) -> CoreResult<UploadResult> {
        let scope = session.scope()?;
        if upload.file_name.trim().is_empty() {
            return Err(CoreError::Validation("file name cannot be empty".to_string()));
        }
        let mime_type = upload
            .mime_type
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();

        let content_digest = digest(&upload.bytes);
        let version = self.get_or_create_current_version(scope, evidence_id)?;
        let uploaded_at_ms = now_ms();
        let storage_key = storage_key(
            &scope.org_id,
            evidence_id,
            version.version_number,
            uploaded_at_ms,
            &upload.file_name,
        )?;

        self.objects.put(&storage_key, &upload.bytes, &mime_type)?;

        let recorded = self.objects.public_url(&storage_key).and_then(|url| {
            let file = EvidenceFile {
                id: records::new_id("evf"),
                version_id: version.id.clone(),
                evidence_id: evidence_id.to_string(),
                storage_key: storage_key.clone(),
                file_name: upload.file_name.clone(),
                mime_type: mime_type.clone(),
                size_bytes: upload.bytes.len() as u64,
                url,
                content_digest: content_digest.clone(),
                uploaded_by: scope.actor_id.clone(),
                uploaded_at_ms,
            };
            self.records.with_tx(|conn| {
                // A submit may have landed since the version was resolved.
                let status: String = conn.query_row(
                    "SELECT status FROM evidence_versions WHERE id = ?1",
                    params![version.id],
                    |r| r.get(0),
                )?;
                ensure_draft(evidence_id, version.version_number, VersionStatus::parse(&status)?)?;
                insert_file(conn, &file)?;
                if let Some(notes) = upload.notes.as_deref().filter(|n| !n.trim().is_empty()) {
                    append_version_notes(conn, &version.id, notes)?;
                }
                conn.execute(
                    "UPDATE evidence_items SET updated_at_ms = ?1 WHERE id = ?2 AND org_id = ?3",
                    params![uploaded_at_ms, evidence_id, scope.org_id],
                )?;
                Ok(())
            })?;
            Ok(file)
        });

        let file = match recorded {
            Ok(file) => file,
            Err(primary) => return Err(self.discard_stored_object(&storage_key, primary)),
        };

        info!(evidence_id, file_id = %file.id, digest = %file.content_digest, "file ingested");
        self.record_event(EvidenceAuditEvent::new(
            FILE_INGESTED,
            &scope.org_id,
            evidence_id,
            actor(scope),
            json!({
                "file_id": file.id,
                "version_number": version.version_number,
                "content_digest": file.content_digest,
                "size_bytes": file.size_bytes,
                "mime_type": file.mime_type,
            }),
        ));
        Ok(UploadResult {
            evidence_id: evidence_id.to_string(),
            version_number: version.version_number,
            file,
        })
    }

    fn discard_stored_object(&self, storage_key: &str, primary: CoreError) -> CoreError {
        match self.objects.delete(storage_key) {
            Ok(()) => {
                warn!(storage_key, error = %primary, "file record failed; stored object removed");
                primary
            }
            Err(cleanup) => {
                warn!(
                    storage_key,
                    error = %primary,
                    cleanup_error = %cleanup,
                    "file record failed and stored object could not be removed"
                );
                CoreError::CompensationFailed {
                    primary: Box::new(primary),
                    warning: format!("orphaned object {}: {}", storage_key, cleanup),
                }
            }
        }
    }

    // An intake item without its payload would win the next dedup pass over a
    // successful retry, so it is removed outright.
    fn discard_created_item(
        &self,
        scope: &Scope,
        evidence_id: &str,
        primary: CoreError,
    ) -> CoreError {
        let ids = [evidence_id.to_string()];
        match self
            .records
            .with_tx(|conn| delete_items(conn, &scope.org_id, &ids))
        {
            Ok(_) => {
                warn!(evidence_id, error = %primary, "automated intake failed; item removed");
                self.record_event(EvidenceAuditEvent::new(
                    EVIDENCE_DISCARDED,
                    &scope.org_id,
                    evidence_id,
                    actor(scope),
                    json!({ "reason": primary.to_string() }),
                ));
                primary
            }
            Err(cleanup) => {
                warn!(
                    evidence_id,
                    error = %primary,
                    cleanup_error = %cleanup,
                    "automated intake failed and its item could not be removed"
                );
                CoreError::CompensationFailed {
                    primary: Box::new(primary),
                    warning: format!("empty item {} left behind: {}", evidence_id, cleanup),
                }
            }
        }
    }

    /// Scope is re-derived through file -> version -> item before anything is touched.
    /// The checks and the delete share one immediate transaction, so a concurrent
    /// submit or approve cannot slip between them.
    pub fn delete_file(&self, session: &Session, file_id: &str) -> CoreResult<()> {
        let scope = session.scope()?;
        let file = self.records.with_tx(|conn| {
            let Some(owned) = load_owned_file(conn, file_id)? else {
                return Err(CoreError::NotFound(format!("file {}", file_id)));
            };
            if owned.org_id != scope.org_id {
                warn!(file_id, "cross-scope file delete rejected");
                return Err(CoreError::Unauthorized(format!(
                    "file {} is outside the bound scope",
                    file_id
                )));
            }
            if owned.item_status == EvidenceStatus::Archived {
                return Err(CoreError::InvalidTransition(format!(
                    "evidence {} is archived",
                    owned.file.evidence_id
                )));
            }
            ensure_draft(&owned.file.evidence_id, owned.version_number, owned.version_status)?;

            conn.execute("DELETE FROM evidence_files WHERE id = ?1", params![owned.file.id])?;
            conn.execute(
                "UPDATE evidence_items SET updated_at_ms = ?1 WHERE id = ?2",
                params![now_ms(), owned.file.evidence_id],
            )?;
            Ok(owned.file)
        })?;

        // Record first, then object: a record never outlives its object, and a failed
        // object delete leaves something the orphan sweep can find.
        if let Err(e) = self.objects.delete(&file.storage_key) {
            warn!(file_id, storage_key = %file.storage_key, error = %e, "object delete failed");
            return Err(CoreError::ObjectStoreUnavailable(format!(
                "record for {} removed but object {} remains: {}",
                file_id, file.storage_key, e
            )));
        }
        info!(file_id, "file deleted");
        self.record_event(EvidenceAuditEvent::new(
            FILE_DELETED,
            &scope.org_id,
            &file.evidence_id,
            actor(scope),
            json!({ "file_id": file.id, "storage_key": file.storage_key }),
        ));
        Ok(())
    }

    /// Re-reads the stored bytes and checks them against the recorded digest.
    pub fn verify_file(&self, session: &Session, file_id: &str) -> CoreResult<EvidenceFile> {
        let scope = session.scope()?;
        let file = self
            .records
            .with_conn(|conn| load_owned_file(conn, file_id))?
            .filter(|owned| owned.org_id == scope.org_id)
            .map(|owned| owned.file)
            .ok_or_else(|| CoreError::NotFound(format!("file {}", file_id)))?;
        let bytes = match self.objects.get(&file.storage_key) {
            Ok(bytes) => bytes,
            Err(CoreError::NotFound(_)) => {
                return Err(CoreError::IntegrityMismatch {
                    file_id: file.id.clone(),
                    recorded: file.content_digest.clone(),
                    actual: "missing object".to_string(),
                })
            }
            Err(e) => return Err(e),
        };
        verify_digest(&file.id, &file.content_digest, &bytes)?;
        Ok(file)
    }

    /// Checks every file in scope. Mismatches are reported, never repaired.
    pub fn verify_all(&self, session: &Session) -> CoreResult<IntegrityReport> {
        let scope = session.scope()?;
        let files = self
            .records
            .with_conn(|conn| load_scope_files(conn, &scope.org_id))?;
        let mut report = IntegrityReport::default();
        for file in files {
            let (outcome, message) = match self.objects.get(&file.storage_key) {
                Ok(bytes) => match verify_digest(&file.id, &file.content_digest, &bytes) {
                    Ok(()) => (IntegrityOutcome::MATCH, String::new()),
                    Err(e) => (IntegrityOutcome::MISMATCH, e.to_string()),
                },
                Err(CoreError::NotFound(_)) => (
                    IntegrityOutcome::MISSING_OBJECT,
                    "stored object missing".to_string(),
                ),
                Err(e) => (IntegrityOutcome::UNREADABLE, e.to_string()),
            };
            if outcome != IntegrityOutcome::MATCH {
                warn!(file_id = %file.id, ?outcome, "integrity check failed");
            }
            report.files_checked += 1;
            report.rows.push(IntegrityCheckRow {
                file_id: file.id,
                evidence_id: file.evidence_id,
                storage_key: file.storage_key,
                recorded_digest: file.content_digest,
                outcome,
                message,
            });
        }
        let mismatches = report.failures().count();
        self.record_event(EvidenceAuditEvent::new(
            INTEGRITY_CHECKED,
            &scope.org_id,
            "",
            actor(scope),
            json!({ "files_checked": report.files_checked, "mismatches": mismatches }),
        ));
        Ok(report)
    }

    /// Intake for automated verification results: one `automated` item whose first
    /// file is the check payload rendered as sorted, pretty-printed JSON.
    pub fn create_from_automated_check(
        &self,
        session: &Session,
        source: &str,
        control_id: &str,
        check: AutomatedCheck,
    ) -> CoreResult<UploadResult> {
        let scope = session.scope()?;
        if source.trim().is_empty() {
            return Err(CoreError::Validation("source cannot be empty".to_string()));
        }
        let mut new = NewEvidence::new(control_id, &check.title, EvidenceType::Automated);
        new.description = check.details.clone();
        new.source = Some(EvidenceSource::External(source.to_string()));
        new.tags = vec![
            "automated".to_string(),
            source.to_string(),
            check.status.clone(),
        ];
        let bytes = json_canonical::to_sorted_pretty_bytes(&check.payload)?;
        let evidence_id = self.create_evidence(session, new)?;

        let file_name = format!("{}-{}-{}.json", source, control_id, now_ms());
        let uploaded = self.upload_file(
            session,
            &evidence_id,
            FileUpload {
                file_name,
                mime_type: Some("application/json".to_string()),
                bytes,
                notes: Some(check.details),
            },
        );
        let result = match uploaded {
            Ok(result) => result,
            Err(primary) => return Err(self.discard_created_item(scope, &evidence_id, primary)),
        };
        info!(
            evidence_id = %result.evidence_id,
            org_id = %scope.org_id,
            source,
            "automated check recorded"
        );
        Ok(result)
    }
}

impl EvidenceStore<VaultObjectStore> {
    /// Stored objects under this scope's key prefix that no file record points at.
    pub fn find_orphaned_objects(&self, session: &Session) -> CoreResult<Vec<ObjectMeta>> {
        let scope = session.scope()?;
        let referenced: BTreeSet<String> = self
            .records
            .with_conn(|conn| load_scope_files(conn, &scope.org_id))?
            .into_iter()
            .map(|f| f.storage_key)
            .collect();
        let prefix = format!("{}/", scope.org_id);
        Ok(self
            .objects
            .list_keys()?
            .into_iter()
            .filter(|m| m.key.starts_with(&prefix) && !referenced.contains(&m.key))
            .collect())
    }
}

pub fn storage_key(
    org_id: &str,
    evidence_id: &str,
    version_number: u32,
    ts_ms: i64,
    file_name: &str,
) -> CoreResult<String> {
    let re = Regex::new(r"[^A-Za-z0-9._-]+")
        .map_err(|_| CoreError::Validation("file name pattern failed to compile".to_string()))?;
    let mut safe: String = re
        .replace_all(file_name.trim(), "_")
        .chars()
        .take(MAX_KEY_FILENAME_CHARS)
        .collect();
    if safe.trim_matches(|c| c == '_' || c == '.').is_empty() {
        safe = "file".to_string();
    }
    Ok(format!(
        "{}/{}/v{}/{}-{}-{}",
        org_id,
        evidence_id,
        version_number,
        ts_ms,
        ulid::Ulid::new().to_string().to_ascii_lowercase(),
        safe
    ))
}

fn insert_file(conn: &Connection, file: &EvidenceFile) -> CoreResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO evidence_files({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            FILE_COLUMNS
        ),
        params![
            file.id,
            file.version_id,
            file.evidence_id,
            file.storage_key,
            file.file_name,
            file.mime_type,
            file.size_bytes as i64,
            file.url,
            file.content_digest,
            file.uploaded_by,
            file.uploaded_at_ms
        ],
    )?;
    Ok(())
}

pub(crate) fn append_version_notes(conn: &Connection, version_id: &str, text: &str) -> CoreResult<()> {
    let existing: String = conn.query_row(
        "SELECT notes FROM evidence_versions WHERE id = ?1",
        params![version_id],
        |r| r.get(0),
    )?;
    let notes = if existing.trim().is_empty() {
        text.to_string()
    } else {
        format!("{}\n\n{}", existing, text)
    };
    conn.execute(
        "UPDATE evidence_versions SET notes = ?1 WHERE id = ?2",
        params![notes, version_id],
    )?;
    Ok(())
}

struct OwnedFile {
    file: EvidenceFile,
    org_id: String,
    item_status: EvidenceStatus,
    version_number: u32,
    version_status: VersionStatus,
}

fn load_owned_file(conn: &Connection, file_id: &str) -> CoreResult<Option<OwnedFile>> {
    let cols = FILE_COLUMNS
        .split(", ")
        .map(|c| format!("f.{}", c))
        .collect::<Vec<_>>()
        .join(", ");
    let row = conn
        .query_row(
            &format!(
                "SELECT {}, i.org_id, i.status, v.status, v.version_number
                 FROM evidence_files f
                 JOIN evidence_versions v ON v.id = f.version_id
                 JOIN evidence_items i ON i.id = v.evidence_id
                 WHERE f.id = ?1",
                cols
            ),
            params![file_id],
            |row| {
                Ok((
                    file_from_row(row)?,
                    row.get::<_, String>(11)?,
                    row.get::<_, String>(12)?,
                    row.get::<_, String>(13)?,
                    row.get::<_, u32>(14)?,
                ))
            },
        )
        .optional()?;
    row.map(
        |(file, org_id, item_status, version_status, version_number)| -> CoreResult<OwnedFile> {
            Ok(OwnedFile {
                file,
                org_id,
                item_status: EvidenceStatus::parse(&item_status)?,
                version_number,
                version_status: VersionStatus::parse(&version_status)?,
            })
        },
    )
    .transpose()
}

fn load_scope_files(conn: &Connection, org_id: &str) -> CoreResult<Vec<EvidenceFile>> {
    let cols = FILE_COLUMNS
        .split(", ")
        .map(|c| format!("f.{}", c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM evidence_files f JOIN evidence_items i ON i.id = f.evidence_id
         WHERE i.org_id = ?1 ORDER BY f.uploaded_at_ms, f.rowid",
        cols
    ))?;
    let files = stmt
        .query_map(params![org_id], file_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(files)
}
