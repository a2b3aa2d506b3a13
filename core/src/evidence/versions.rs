use crate::audit::event::{EvidenceAuditEvent, VERSION_CREATED};
use crate::error::{CoreError, CoreResult};
use crate::evidence::model::{EvidenceStatus, EvidenceVersion, VersionStatus};
use crate::records::{
    self, file_from_row, now_ms, version_from_row, FILE_COLUMNS, VERSION_COLUMNS,
};
use crate::session::{Scope, Session};
use crate::storage::object_store::ObjectStore;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use tracing::{debug, info};

use super::store::{actor, load_item, EvidenceStore};

impl<O: ObjectStore> EvidenceStore<O> {
    /// Supersedes the current proof with a fresh draft version and returns its number.
    ///
    /// The next number is computed from an unlocked read; the `(evidence_id,
    /// version_number)` unique index decides the winner when callers race, and
    /// losers re-read and try the following number.
    pub fn create_version(
        &self,
        session: &Session,
        evidence_id: &str,
        notes: &str,
    ) -> CoreResult<u32> {
        let scope = session.scope()?;
        let attempts = self.config.version_conflict_retries;

        for attempt in 1..=attempts {
            let item = self
                .records
                .with_conn(|conn| load_item(conn, &scope.org_id, evidence_id))?;
            if item.status == EvidenceStatus::Archived {
                return Err(CoreError::InvalidTransition(format!(
                    "evidence {} is archived",
                    evidence_id
                )));
            }
            let next = item.current_version + 1;

            match self.try_insert_version(scope, evidence_id, item.current_version, notes) {
                Ok(()) => {
                    info!(evidence_id, version = next, attempt, "version created");
                    self.record_event(EvidenceAuditEvent::new(
                        VERSION_CREATED,
                        &scope.org_id,
                        evidence_id,
                        actor(scope),
                        json!({ "version_number": next }),
                    ));
                    return Ok(next);
                }
                Err(CoreError::ConflictRetryExceeded { .. }) => {
                    debug!(evidence_id, version = next, attempt, "version number taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::ConflictRetryExceeded {
            evidence_id: evidence_id.to_string(),
            attempts,
        })
    }

    // One optimistic attempt. A lost race surfaces as ConflictRetryExceeded so the
    // transaction rolls back; the caller loop treats it as "try again".
    fn try_insert_version(
        &self,
        scope: &Scope,
        evidence_id: &str,
        expected_current: u32,
        notes: &str,
    ) -> CoreResult<()> {
        let next = expected_current + 1;
        let conflict = || CoreError::ConflictRetryExceeded {
            evidence_id: evidence_id.to_string(),
            attempts: 1,
        };
        self.records.with_tx(|conn| {
            let now = now_ms();
            let inserted = conn.execute(
                "INSERT INTO evidence_versions(id, evidence_id, version_number, notes, status, created_by, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    records::new_id("evv"),
                    evidence_id,
                    next,
                    notes,
                    VersionStatus::Draft.as_str(),
                    scope.actor_id,
                    now
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if CoreError::is_unique_violation(&e) => return Err(conflict()),
                Err(e) => return Err(e.into()),
            }
            let moved = conn.execute(
                "UPDATE evidence_items
                 SET current_version = ?1, status = 'draft', updated_at_ms = ?2
                 WHERE id = ?3 AND org_id = ?4 AND current_version = ?5 AND status != 'archived'",
                params![next, now, evidence_id, scope.org_id, expected_current],
            )?;
            if moved != 1 {
                return Err(conflict());
            }
            Ok(())
        })
    }

    /// The version uploads attach to. Creates the row for `current_version` if an
    /// older record never had one; concurrent callers converge on the same row.
    /// Only a draft version takes files: review and final versions are snapshots.
    pub(crate) fn get_or_create_current_version(
        &self,
        scope: &Scope,
        evidence_id: &str,
    ) -> CoreResult<EvidenceVersion> {
        self.records.with_tx(|conn| {
            let item = load_item(conn, &scope.org_id, evidence_id)?;
            if item.status == EvidenceStatus::Archived {
                return Err(CoreError::InvalidTransition(format!(
                    "evidence {} is archived",
                    evidence_id
                )));
            }
            if let Some(v) = load_version(conn, evidence_id, item.current_version)? {
                ensure_accepts_files(&v)?;
                return Ok(v);
            }
            conn.execute(
                "INSERT OR IGNORE INTO evidence_versions(id, evidence_id, version_number, notes, status, created_by, created_at_ms)
                 VALUES (?1, ?2, ?3, '', ?4, ?5, ?6)",
                params![
                    records::new_id("evv"),
                    evidence_id,
                    item.current_version,
                    VersionStatus::from_item(item.status).as_str(),
                    scope.actor_id,
                    now_ms()
                ],
            )?;
            let v = load_version(conn, evidence_id, item.current_version)?.ok_or_else(|| {
                CoreError::Persistence(format!(
                    "version {} of {} missing after insert",
                    item.current_version, evidence_id
                ))
            })?;
            ensure_accepts_files(&v)?;
            Ok(v)
        })
    }

    pub fn get_version_history(
        &self,
        session: &Session,
        evidence_id: &str,
    ) -> CoreResult<Vec<EvidenceVersion>> {
        let scope = session.scope()?;
        self.records.with_conn(|conn| {
            let item = load_item(conn, &scope.org_id, evidence_id)?;
            load_history(conn, &item.id)
        })
    }
}

impl VersionStatus {
    fn from_item(status: EvidenceStatus) -> Self {
        match status {
            EvidenceStatus::Review => VersionStatus::Review,
            EvidenceStatus::Final => VersionStatus::Final,
            EvidenceStatus::Draft | EvidenceStatus::Archived => VersionStatus::Draft,
        }
    }
}

fn ensure_accepts_files(version: &EvidenceVersion) -> CoreResult<()> {
    ensure_draft(&version.evidence_id, version.version_number, version.status)
}

pub(crate) fn ensure_draft(
    evidence_id: &str,
    version_number: u32,
    status: VersionStatus,
) -> CoreResult<()> {
    if status == VersionStatus::Draft {
        return Ok(());
    }
    Err(CoreError::InvalidTransition(format!(
        "version {} of {} is {}; create a new version to change its files",
        version_number,
        evidence_id,
        status.as_str()
    )))
}

pub(crate) fn load_version(
    conn: &Connection,
    evidence_id: &str,
    version_number: u32,
) -> CoreResult<Option<EvidenceVersion>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM evidence_versions WHERE evidence_id = ?1 AND version_number = ?2",
                VERSION_COLUMNS
            ),
            params![evidence_id, version_number],
            version_from_row,
        )
        .optional()?)
}

/// All versions newest-first, each with its files in upload order.
pub(crate) fn load_history(
    conn: &Connection,
    evidence_id: &str,
) -> CoreResult<Vec<EvidenceVersion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM evidence_versions WHERE evidence_id = ?1 ORDER BY version_number DESC",
        VERSION_COLUMNS
    ))?;
    let mut versions = stmt
        .query_map(params![evidence_id], version_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM evidence_files WHERE evidence_id = ?1 ORDER BY uploaded_at_ms, rowid",
        FILE_COLUMNS
    ))?;
    let files = stmt
        .query_map(params![evidence_id], file_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for file in files {
        if let Some(v) = versions.iter_mut().find(|v| v.id == file.version_id) {
            v.files.push(file);
        }
    }
    Ok(versions)
}
