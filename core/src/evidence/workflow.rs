use crate::audit::event::{Actor, EvidenceAuditEvent, STATUS_CHANGED};
use crate::error::{CoreError, CoreResult};
use crate::evidence::model::{EvidenceStatus, EvidenceVersion, VersionStatus};
use crate::records::now_ms;
use crate::session::Session;
use crate::storage::object_store::ObjectStore;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::ingest::append_version_notes;
use super::store::{actor, load_item, EvidenceStore};
use super::versions::load_version;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Submit,
    Approve,
    Reject,
}

/// The approval state machine for a single version. Everything not listed is refused.
pub fn next_status(from: VersionStatus, action: WorkflowAction) -> CoreResult<VersionStatus> {
    let next = match (from, action) {
        (VersionStatus::Draft, WorkflowAction::Submit) => VersionStatus::Review,
        (VersionStatus::Review, WorkflowAction::Approve) => VersionStatus::Final,
        (VersionStatus::Review, WorkflowAction::Reject) => VersionStatus::Draft,
        _ => {
            return Err(CoreError::InvalidTransition(format!(
                "cannot {:?} a version in {}",
                action,
                from.as_str()
            )))
        }
    };
    Ok(next)
}

impl<O: ObjectStore> EvidenceStore<O> {
    pub fn submit_for_review(
        &self,
        session: &Session,
        evidence_id: &str,
    ) -> CoreResult<EvidenceVersion> {
        self.transition(session, evidence_id, WorkflowAction::Submit, None, None)
    }

    /// Review -> final. The approver is recorded on the version, independent of the
    /// session actor that issues the call.
    pub fn approve(
        &self,
        session: &Session,
        evidence_id: &str,
        approver_id: &str,
    ) -> CoreResult<EvidenceVersion> {
        if approver_id.trim().is_empty() {
            return Err(CoreError::Validation("approver cannot be empty".to_string()));
        }
        self.transition(
            session,
            evidence_id,
            WorkflowAction::Approve,
            Some(approver_id.trim()),
            None,
        )
    }

    /// Review -> draft. The reason is appended to the version notes, never replacing them.
    pub fn reject(
        &self,
        session: &Session,
        evidence_id: &str,
        reason: Option<&str>,
    ) -> CoreResult<EvidenceVersion> {
        self.transition(session, evidence_id, WorkflowAction::Reject, None, reason)
    }

    fn transition(
        &self,
        session: &Session,
        evidence_id: &str,
        action: WorkflowAction,
        approver: Option<&str>,
        reason: Option<&str>,
    ) -> CoreResult<EvidenceVersion> {
        let scope = session.scope()?;
        let (from, version) = self.records.with_tx(|conn| {
            let item = load_item(conn, &scope.org_id, evidence_id)?;
            if item.status == EvidenceStatus::Archived {
                return Err(CoreError::InvalidTransition(format!(
                    "evidence {} is archived",
                    evidence_id
                )));
            }
            let version = load_version(conn, evidence_id, item.current_version)?.ok_or_else(
                || {
                    CoreError::Persistence(format!(
                        "evidence {} has no row for version {}",
                        evidence_id, item.current_version
                    ))
                },
            )?;
            let to = next_status(version.status, action)?;
            let now = now_ms();

            let changed = match action {
                WorkflowAction::Approve => conn.execute(
                    "UPDATE evidence_versions SET status = ?1, approved_by = ?2, approved_at_ms = ?3
                     WHERE id = ?4 AND status = ?5",
                    params![to.as_str(), approver, now, version.id, version.status.as_str()],
                )?,
                _ => conn.execute(
                    "UPDATE evidence_versions SET status = ?1, approved_by = NULL, approved_at_ms = NULL
                     WHERE id = ?2 AND status = ?3",
                    params![to.as_str(), version.id, version.status.as_str()],
                )?,
            };
            if changed != 1 {
                return Err(CoreError::InvalidTransition(format!(
                    "version {} of {} changed concurrently",
                    version.version_number, evidence_id
                )));
            }
            if action == WorkflowAction::Reject {
                let text = match reason.map(str::trim).filter(|r| !r.is_empty()) {
                    Some(r) => format!("Rejected: {}", r),
                    None => "Rejected".to_string(),
                };
                append_version_notes(conn, &version.id, &text)?;
            }

            let mirrored = conn.execute(
                "UPDATE evidence_items SET status = ?1, updated_at_ms = ?2
                 WHERE id = ?3 AND org_id = ?4 AND current_version = ?5 AND status != 'archived'",
                params![
                    to.as_str(),
                    now,
                    evidence_id,
                    scope.org_id,
                    version.version_number
                ],
            )?;
            if mirrored != 1 {
                return Err(CoreError::InvalidTransition(format!(
                    "evidence {} moved past version {}",
                    evidence_id, version.version_number
                )));
            }
            let updated = load_version(conn, evidence_id, version.version_number)?
                .ok_or_else(|| CoreError::NotFound(format!("version {}", version.id)))?;
            Ok((version.status, updated))
        })?;

        info!(
            evidence_id,
            version = version.version_number,
            from = from.as_str(),
            to = version.status.as_str(),
            "status changed"
        );
        let event_actor = match approver {
            Some(a) => Actor::User(a.to_string()),
            None => actor(scope),
        };
        self.record_event(EvidenceAuditEvent::new(
            STATUS_CHANGED,
            &scope.org_id,
            evidence_id,
            event_actor,
            json!({
                "version_number": version.version_number,
                "from_status": from.as_str(),
                "to_status": version.status.as_str(),
            }),
        ));
        Ok(version)
    }
}
