use crate::audit::event::{EvidenceAuditEvent, DUPLICATES_REMOVED, RETENTION_PURGED};
use crate::error::{CoreError, CoreResult};
use crate::evidence::model::{EvidenceItem, EvidenceStatus, RetentionPolicy};
use crate::records::{self, item_from_row, policy_from_row, ITEM_COLUMNS, POLICY_COLUMNS};
use crate::session::{CancelToken, Scope, Session};
use crate::storage::object_store::ObjectStore;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use tracing::{info, warn};

use super::store::{actor, EvidenceStore};

pub const MS_PER_DAY: i64 = 86_400_000;

/// Outcome of a batched hard delete (deduplication or retention purge). Batches that
/// committed stay committed; a failed batch is counted and the pass moves on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DedupReport {
    pub removed_ids: Vec<String>,
    pub batches_failed: u32,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl DedupReport {
    pub fn removed(&self) -> usize {
        self.removed_ids.len()
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RetentionClass {
    EXPIRED,
    EXPIRING_SOON,
    RETAINED,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionRow {
    pub evidence_id: String,
    pub control_id: String,
    pub title: String,
    pub retention_until_ms: i64,
    pub class: RetentionClass,
    pub policy: Option<String>,
}

impl<O: ObjectStore> EvidenceStore<O> {
    /// Earliest-created item per control id wins; every later item for the same
    /// control id is hard-deleted. A control-id heuristic, not a content comparison.
    pub fn remove_duplicates(
        &self,
        session: &Session,
        cancel: &CancelToken,
    ) -> CoreResult<DedupReport> {
        let scope = session.scope()?;
        let items = self
            .records
            .with_conn(|conn| load_scope_items(conn, &scope.org_id, false))?;
        let candidates = duplicate_candidates(&items);
        info!(
            org_id = %scope.org_id,
            items = items.len(),
            candidates = candidates.len(),
            "deduplication pass"
        );
        let report = self.delete_in_batches(scope, &candidates, cancel);
        self.record_event(EvidenceAuditEvent::new(
            DUPLICATES_REMOVED,
            &scope.org_id,
            "",
            actor(scope),
            json!({
                "removed_ids": report.removed_ids,
                "batches_failed": report.batches_failed,
                "cancelled": report.cancelled,
            }),
        ));
        Ok(report)
    }

    /// Runs the deduplication pass at most once per session scope. `None` means it
    /// already ran. A cancelled or partly failed pass does not count as the run.
    pub fn remove_duplicates_once(
        &self,
        session: &mut Session,
        cancel: &CancelToken,
    ) -> CoreResult<Option<DedupReport>> {
        if session.dedup_ran() {
            return Ok(None);
        }
        let report = self.remove_duplicates(session, cancel)?;
        if !report.cancelled && report.batches_failed == 0 {
            session.mark_dedup_ran();
        }
        Ok(Some(report))
    }

    fn delete_in_batches(&self, scope: &Scope, ids: &[String], cancel: &CancelToken) -> DedupReport {
        let mut report = DedupReport::default();
        for batch in ids.chunks(self.config.dedup_batch_size.max(1)) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                warn!(remaining = ids.len() - report.removed(), "batch delete cancelled");
                break;
            }
            match self
                .records
                .with_tx(|conn| delete_items(conn, &scope.org_id, batch))
            {
                Ok(keys) => {
                    report.removed_ids.extend(batch.iter().cloned());
                    for key in keys {
                        if let Err(e) = self.objects.delete(&key) {
                            warn!(storage_key = %key, error = %e, "object left behind after delete");
                        }
                    }
                }
                Err(e) => {
                    warn!(batch = batch.len(), error = %e, "delete batch failed");
                    report.batches_failed += 1;
                    report.errors.push(e.to_string());
                }
            }
        }
        report
    }

    /// Inserts or replaces the named policy. At most one policy per scope is the default.
    pub fn upsert_retention_policy(
        &self,
        session: &Session,
        mut policy: RetentionPolicy,
    ) -> CoreResult<RetentionPolicy> {
        let scope = session.scope()?;
        policy.name = policy.name.trim().to_string();
        if policy.name.is_empty() {
            return Err(CoreError::Validation("policy name cannot be empty".to_string()));
        }
        if policy.retention_days == 0 {
            return Err(CoreError::Validation(
                "retention_days must be at least 1".to_string(),
            ));
        }
        if policy.id.trim().is_empty() {
            policy.id = records::new_id("rp");
        }
        policy.frameworks = super::model::normalize_labels(policy.frameworks);
        policy.evidence_types.sort();
        policy.evidence_types.dedup();

        self.records.with_tx(|conn| {
            if policy.is_default {
                conn.execute(
                    "UPDATE retention_policies SET is_default = 0 WHERE org_id = ?1 AND name != ?2",
                    params![scope.org_id, policy.name],
                )?;
            }
            conn.execute(
                "INSERT INTO retention_policies(id, org_id, name, retention_days, auto_delete, frameworks, evidence_types, is_default)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(org_id, name) DO UPDATE SET
                   retention_days = excluded.retention_days,
                   auto_delete = excluded.auto_delete,
                   frameworks = excluded.frameworks,
                   evidence_types = excluded.evidence_types,
                   is_default = excluded.is_default",
                params![
                    policy.id,
                    scope.org_id,
                    policy.name,
                    policy.retention_days,
                    policy.auto_delete,
                    serde_json::to_string(&policy.frameworks)?,
                    serde_json::to_string(&policy.evidence_types)?,
                    policy.is_default
                ],
            )?;
            Ok(conn.query_row(
                &format!(
                    "SELECT {} FROM retention_policies WHERE org_id = ?1 AND name = ?2",
                    POLICY_COLUMNS
                ),
                params![scope.org_id, policy.name],
                policy_from_row,
            )?)
        })
    }

    /// Specific policies by name, then the default policy last.
    pub fn list_retention_policies(&self, session: &Session) -> CoreResult<Vec<RetentionPolicy>> {
        let scope = session.scope()?;
        self.records
            .with_conn(|conn| load_policies(conn, &scope.org_id))
    }

    /// Read-only classification of every live item that has a retention date.
    pub fn expiring_soon(&self, session: &Session, now_ms: i64) -> CoreResult<Vec<RetentionRow>> {
        let scope = session.scope()?;
        let (items, policies) = self.records.with_conn(|conn| {
            Ok((
                load_scope_items(conn, &scope.org_id, false)?,
                load_policies(conn, &scope.org_id)?,
            ))
        })?;
        let window = i64::from(self.config.expiring_soon_days) * MS_PER_DAY;
        Ok(items
            .iter()
            .filter_map(|item| {
                let until = effective_retention_date(item, &policies)?;
                Some(RetentionRow {
                    evidence_id: item.id.clone(),
                    control_id: item.control_id.clone(),
                    title: item.title.clone(),
                    retention_until_ms: until,
                    class: classify(until, now_ms, window),
                    policy: governing_policy(item, &policies).map(|p| p.name.clone()),
                })
            })
            .collect())
    }

    pub(crate) fn count_expiring_soon(&self, session: &Session, now_ms: i64) -> CoreResult<u64> {
        Ok(self
            .expiring_soon(session, now_ms)?
            .iter()
            .filter(|r| r.class == RetentionClass::EXPIRING_SOON)
            .count() as u64)
    }

    /// The explicit auto-delete action: hard-deletes expired items (archived included)
    /// whose governing policy has `auto_delete` set. Never runs implicitly.
    pub fn purge_expired(
        &self,
        session: &Session,
        now_ms: i64,
        cancel: &CancelToken,
    ) -> CoreResult<DedupReport> {
        let scope = session.scope()?;
        let (items, policies) = self.records.with_conn(|conn| {
            Ok((
                load_scope_items(conn, &scope.org_id, true)?,
                load_policies(conn, &scope.org_id)?,
            ))
        })?;
        let doomed: Vec<String> = items
            .iter()
            .filter(|item| {
                let auto = governing_policy(item, &policies)
                    .map(|p| p.auto_delete)
                    .unwrap_or(false);
                auto && effective_retention_date(item, &policies)
                    .map(|until| until <= now_ms)
                    .unwrap_or(false)
            })
            .map(|item| item.id.clone())
            .collect();
        info!(org_id = %scope.org_id, expired = doomed.len(), "retention purge");
        let report = self.delete_in_batches(scope, &doomed, cancel);
        self.record_event(EvidenceAuditEvent::new(
            RETENTION_PURGED,
            &scope.org_id,
            "",
            actor(scope),
            json!({
                "removed_ids": report.removed_ids,
                "batches_failed": report.batches_failed,
                "cancelled": report.cancelled,
            }),
        ));
        Ok(report)
    }
}

/// Every item after the first (by creation order) that shares a control id.
pub fn duplicate_candidates(items_by_creation: &[EvidenceItem]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items_by_creation
        .iter()
        .filter(|item| item.status != EvidenceStatus::Archived)
        .filter(|item| !seen.insert(item.control_id.as_str()))
        .map(|item| item.id.clone())
        .collect()
}

/// First matching specific policy, else the default policy if it applies.
pub fn governing_policy<'a>(
    item: &EvidenceItem,
    policies: &'a [RetentionPolicy],
) -> Option<&'a RetentionPolicy> {
    policies
        .iter()
        .filter(|p| !p.is_default)
        .find(|p| p.applies_to(item))
        .or_else(|| policies.iter().find(|p| p.is_default && p.applies_to(item)))
}

/// The explicit date wins; otherwise creation time plus the governing policy's period.
pub fn effective_retention_date(item: &EvidenceItem, policies: &[RetentionPolicy]) -> Option<i64> {
    item.retention_until_ms.or_else(|| {
        governing_policy(item, policies)
            .map(|p| item.created_at_ms + i64::from(p.retention_days) * MS_PER_DAY)
    })
}

pub fn classify(retention_until_ms: i64, now_ms: i64, window_ms: i64) -> RetentionClass {
    if retention_until_ms <= now_ms {
        RetentionClass::EXPIRED
    } else if retention_until_ms <= now_ms.saturating_add(window_ms) {
        RetentionClass::EXPIRING_SOON
    } else {
        RetentionClass::RETAINED
    }
}

pub(crate) fn load_scope_items(
    conn: &Connection,
    org_id: &str,
    include_archived: bool,
) -> CoreResult<Vec<EvidenceItem>> {
    let filter = if include_archived {
        ""
    } else {
        " AND status != 'archived'"
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM evidence_items WHERE org_id = ?1{} ORDER BY created_at_ms, rowid",
        ITEM_COLUMNS, filter
    ))?;
    let items = stmt
        .query_map(params![org_id], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

fn load_policies(conn: &Connection, org_id: &str) -> CoreResult<Vec<RetentionPolicy>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM retention_policies WHERE org_id = ?1 ORDER BY is_default, name",
        POLICY_COLUMNS
    ))?;
    let policies = stmt
        .query_map(params![org_id], policy_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(policies)
}

// Returns the storage keys of the removed files so objects can be cleaned up after commit.
pub(crate) fn delete_items(conn: &Connection, org_id: &str, ids: &[String]) -> CoreResult<Vec<String>> {
    let marks = vec!["?"; ids.len()].join(", ");
    let mut args = vec![Value::Text(org_id.to_string())];
    args.extend(ids.iter().map(|id| Value::Text(id.clone())));

    let mut stmt = conn.prepare(&format!(
        "SELECT f.storage_key FROM evidence_files f JOIN evidence_items i ON i.id = f.evidence_id
         WHERE i.org_id = ? AND i.id IN ({})",
        marks
    ))?;
    let keys = stmt
        .query_map(params_from_iter(args.iter()), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    conn.execute(
        &format!(
            "DELETE FROM evidence_items WHERE org_id = ? AND id IN ({})",
            marks
        ),
        params_from_iter(args.iter()),
    )?;
    Ok(keys)
}
