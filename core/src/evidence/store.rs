use crate::audit::event::{
    Actor, EvidenceAuditEvent, EVIDENCE_ARCHIVED, EVIDENCE_CREATED, EVIDENCE_UPDATED,
};
use crate::audit::log::AuditLog;
use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::evidence::model::{
    normalize_labels, normalize_mappings, EvidenceItem, EvidencePatch, EvidenceRecord,
    EvidenceSource, EvidenceStats, EvidenceStatus, EvidenceType, NewEvidence, SearchFilter,
    VersionStatus,
};
use crate::records::{self, item_from_row, now_ms, Records, ITEM_COLUMNS};
use crate::session::{Scope, Session};
use crate::storage::object_store::ObjectStore;
use crate::storage::vault::{VaultConfig, VaultObjectStore};
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MAX_TITLE_CHARS: usize = 500;

/// Aggregate root over evidence items. Every call is scoped by the caller's session;
/// records owned by another organization behave exactly like missing records.
pub struct EvidenceStore<O: ObjectStore = VaultObjectStore> {
    pub(crate) records: Records,
    pub(crate) objects: O,
    pub(crate) config: StoreConfig,
    audit: Option<Mutex<AuditLog>>,
}

impl EvidenceStore<VaultObjectStore> {
    /// Lays out `<root>/{meta,db,objects,audit}` and persists the config.
    pub fn create(root: impl AsRef<Path>, config: StoreConfig) -> CoreResult<Self> {
        config.save(root.as_ref())?;
        Self::open(root)
    }

    pub fn open(root: impl AsRef<Path>) -> CoreResult<Self> {
        let root = root.as_ref();
        let config = StoreConfig::load(root)?;
        let objects = VaultObjectStore::open(
            root.join("objects"),
            &VaultConfig {
                public_base_url: config.public_base_url.clone(),
                encryption_algorithm: config.encryption_algorithm,
                encryption_at_rest: config.encryption_at_rest,
            },
        )?;
        Self::with_object_store(root, config, objects)
    }
}

impl<O: ObjectStore> EvidenceStore<O> {
    pub fn with_object_store(
        root: impl AsRef<Path>,
        config: StoreConfig,
        objects: O,
    ) -> CoreResult<Self> {
        config.validate()?;
        let root = root.as_ref();
        let records = Records::open(
            db_path(root),
            Duration::from_millis(config.busy_timeout_ms),
        )?;
        let audit = if config.audit_log {
            Some(Mutex::new(AuditLog::open_or_create(audit_path(root))?))
        } else {
            None
        };
        info!(store_id = %config.store_id, root = %root.display(), "evidence store opened");
        Ok(Self {
            records,
            objects,
            config,
            audit,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn objects(&self) -> &O {
        &self.objects
    }

    // The record mutation is already committed when this runs; a failed append is
    // logged loudly but does not turn a durable write into a reported failure.
    pub(crate) fn record_event(&self, event: EvidenceAuditEvent) {
        let Some(audit) = &self.audit else {
            return;
        };
        let event_type = event.event_type.clone();
        let res = audit
            .lock()
            .map_err(|_| CoreError::Persistence("audit log mutex poisoned".to_string()))
            .and_then(|mut log| log.append(event));
        if let Err(e) = res {
            warn!(event_type = %event_type, error = %e, "audit append failed");
        }
    }

    pub fn create_evidence(&self, session: &Session, new: NewEvidence) -> CoreResult<String> {
        let scope = session.scope()?;
        validate_control_id(&new.control_id)?;
        validate_title(&new.title)?;

        let now = now_ms();
        let item = EvidenceItem {
            id: records::new_id("ev"),
            org_id: scope.org_id.clone(),
            control_id: new.control_id.trim().to_string(),
            title: new.title.trim().to_string(),
            description: new.description,
            evidence_type: new.evidence_type,
            source: new.source.unwrap_or(EvidenceSource::Manual),
            status: EvidenceStatus::Draft,
            current_version: 1,
            tags: normalize_labels(new.tags),
            retention_until_ms: new.retention_until_ms,
            framework_mappings: normalize_mappings(new.framework_mappings),
            created_at_ms: now,
            updated_at_ms: now,
        };
        let version_id = records::new_id("evv");

        self.records.with_tx(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO evidence_items({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    ITEM_COLUMNS
                ),
                params![
                    item.id,
                    item.org_id,
                    item.control_id,
                    item.title,
                    item.description,
                    item.evidence_type.as_str(),
                    item.source.as_str(),
                    item.status.as_str(),
                    item.current_version,
                    serde_json::to_string(&item.tags)?,
                    item.retention_until_ms,
                    serde_json::to_string(&item.framework_mappings)?,
                    item.created_at_ms,
                    item.updated_at_ms,
                ],
            )?;
            conn.execute(
                "INSERT INTO evidence_versions(id, evidence_id, version_number, notes, status, created_by, created_at_ms)
                 VALUES (?1, ?2, 1, '', ?3, ?4, ?5)",
                params![
                    version_id,
                    item.id,
                    VersionStatus::Draft.as_str(),
                    scope.actor_id,
                    now
                ],
            )?;
            Ok(())
        })?;

        info!(evidence_id = %item.id, control_id = %item.control_id, "evidence created");
        self.record_event(EvidenceAuditEvent::new(
            EVIDENCE_CREATED,
            &scope.org_id,
            &item.id,
            actor(scope),
            json!({
                "control_id": item.control_id,
                "evidence_type": item.evidence_type.as_str(),
                "source": item.source.as_str(),
            }),
        ));
        Ok(item.id)
    }

    pub fn get_evidence(&self, session: &Session, evidence_id: &str) -> CoreResult<EvidenceRecord> {
        let scope = session.scope()?;
        self.records.with_conn(|conn| {
            let item = load_item(conn, &scope.org_id, evidence_id)?;
            let versions = super::versions::load_history(conn, &item.id)?;
            Ok(EvidenceRecord { item, versions })
        })
    }

    pub fn search_evidence(
        &self,
        session: &Session,
        filter: &SearchFilter,
    ) -> CoreResult<Vec<EvidenceItem>> {
        let scope = session.scope()?;
        let (sql, args) = build_search_sql(&scope.org_id, filter);
        debug!(sql = %sql, "evidence search");
        self.records.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), item_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Dashboard variant: transient outages read as "nothing to show".
    pub fn search_or_empty(
        &self,
        session: &Session,
        filter: &SearchFilter,
    ) -> CoreResult<Vec<EvidenceItem>> {
        match self.search_evidence(session, filter) {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "search degraded to empty result");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    pub fn update_evidence(
        &self,
        session: &Session,
        evidence_id: &str,
        patch: EvidencePatch,
    ) -> CoreResult<EvidenceItem> {
        let scope = session.scope()?;
        if let Some(title) = &patch.title {
            validate_title(title)?;
        }
        let fields = patch.changed_fields();

        let item = self.records.with_tx(|conn| {
            let mut item = load_item(conn, &scope.org_id, evidence_id)?;
            if item.status == EvidenceStatus::Archived {
                return Err(CoreError::InvalidTransition(format!(
                    "evidence {} is archived",
                    evidence_id
                )));
            }
            if fields.is_empty() {
                return Ok(item);
            }
            if let Some(title) = patch.title {
                item.title = title.trim().to_string();
            }
            if let Some(description) = patch.description {
                item.description = description;
            }
            if let Some(tags) = patch.tags {
                item.tags = normalize_labels(tags);
            }
            if let Some(mappings) = patch.framework_mappings {
                item.framework_mappings = normalize_mappings(mappings);
            }
            item.updated_at_ms = now_ms();
            conn.execute(
                "UPDATE evidence_items
                 SET title = ?1, description = ?2, tags = ?3, framework_mappings = ?4, updated_at_ms = ?5
                 WHERE id = ?6 AND org_id = ?7",
                params![
                    item.title,
                    item.description,
                    serde_json::to_string(&item.tags)?,
                    serde_json::to_string(&item.framework_mappings)?,
                    item.updated_at_ms,
                    item.id,
                    scope.org_id
                ],
            )?;
            Ok(item)
        })?;

        if !fields.is_empty() {
            self.record_event(EvidenceAuditEvent::new(
                EVIDENCE_UPDATED,
                &scope.org_id,
                evidence_id,
                actor(scope),
                json!({ "fields": fields }),
            ));
        }
        Ok(item)
    }

    /// Soft delete. Versions and files stay in place for the audit trail.
    pub fn archive_evidence(&self, session: &Session, evidence_id: &str) -> CoreResult<()> {
        let scope = session.scope()?;
        let previous = self.records.with_tx(|conn| {
            let item = load_item(conn, &scope.org_id, evidence_id)?;
            if item.status == EvidenceStatus::Archived {
                return Ok(None);
            }
            conn.execute(
                "UPDATE evidence_items SET status = 'archived', updated_at_ms = ?1 WHERE id = ?2 AND org_id = ?3",
                params![now_ms(), evidence_id, scope.org_id],
            )?;
            Ok(Some(item.status))
        })?;

        if let Some(previous) = previous {
            info!(evidence_id, "evidence archived");
            self.record_event(EvidenceAuditEvent::new(
                EVIDENCE_ARCHIVED,
                &scope.org_id,
                evidence_id,
                actor(scope),
                json!({ "previous_status": previous.as_str() }),
            ));
        }
        Ok(())
    }

    pub fn get_stats(&self, session: &Session) -> CoreResult<EvidenceStats> {
        let scope = session.scope()?;
        let mut stats = self.records.with_conn(|conn| {
            let mut stats = EvidenceStats {
                total: conn.query_row(
                    "SELECT COUNT(*) FROM evidence_items WHERE org_id = ?1",
                    params![scope.org_id],
                    |r| r.get::<_, i64>(0),
                )? as u64,
                ..EvidenceStats::default()
            };
            for (status, n) in grouped_counts(conn, "status", &scope.org_id)? {
                stats.by_status.push((EvidenceStatus::parse(&status)?, n));
            }
            for (t, n) in grouped_counts(conn, "evidence_type", &scope.org_id)? {
                stats.by_type.push((EvidenceType::parse(&t)?, n));
            }
            stats.by_source = grouped_counts(conn, "source", &scope.org_id)?;
            let (files, bytes): (i64, i64) = conn.query_row(
                "SELECT COUNT(f.id), COALESCE(SUM(f.size_bytes), 0)
                 FROM evidence_files f JOIN evidence_items i ON i.id = f.evidence_id
                 WHERE i.org_id = ?1",
                params![scope.org_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            stats.files = files as u64;
            stats.total_bytes = bytes as u64;
            Ok(stats)
        })?;
        stats.expiring_soon = self.count_expiring_soon(session, now_ms())?;
        Ok(stats)
    }

    pub fn stats_or_default(&self, session: &Session) -> CoreResult<EvidenceStats> {
        match self.get_stats(session) {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "stats degraded to zero");
                Ok(EvidenceStats::default())
            }
            other => other,
        }
    }
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join("db").join("evidence.db")
}

pub fn audit_path(root: &Path) -> PathBuf {
    root.join("audit").join("evidence_audit.ndjson")
}

pub(crate) fn actor(scope: &Scope) -> Actor {
    Actor::User(scope.actor_id.clone())
}

pub(crate) fn load_item(
    conn: &Connection,
    org_id: &str,
    evidence_id: &str,
) -> CoreResult<EvidenceItem> {
    conn.query_row(
        &format!(
            "SELECT {} FROM evidence_items WHERE id = ?1 AND org_id = ?2",
            ITEM_COLUMNS
        ),
        params![evidence_id, org_id],
        item_from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::NotFound(format!("evidence {}", evidence_id)))
}

fn grouped_counts(
    conn: &Connection,
    column: &str,
    org_id: &str,
) -> CoreResult<Vec<(String, u64)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {col}, COUNT(*) FROM evidence_items WHERE org_id = ?1 GROUP BY {col} ORDER BY {col}",
        col = column
    ))?;
    let rows = stmt.query_map(params![org_id], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn validate_title(title: &str) -> CoreResult<()> {
    let t = title.trim();
    if t.is_empty() {
        return Err(CoreError::Validation("title cannot be empty".to_string()));
    }
    if t.chars().count() > MAX_TITLE_CHARS {
        return Err(CoreError::Validation(format!(
            "title exceeds {} characters",
            MAX_TITLE_CHARS
        )));
    }
    Ok(())
}

pub fn validate_control_id(control_id: &str) -> CoreResult<()> {
    let re = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]*$")
        .map_err(|_| CoreError::Validation("control id pattern failed to compile".to_string()))?;
    if !re.is_match(control_id.trim()) {
        return Err(CoreError::Validation(format!(
            "invalid control id {:?}",
            control_id
        )));
    }
    Ok(())
}

/// Escapes LIKE wildcards so user text only ever matches literally.
pub fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn build_search_sql(org_id: &str, filter: &SearchFilter) -> (String, Vec<Value>) {
    let mut sql = format!("SELECT {} FROM evidence_items WHERE org_id = ?", ITEM_COLUMNS);
    let mut args = vec![Value::Text(org_id.to_string())];

    if !filter.control_ids.is_empty() {
        sql.push_str(&format!(
            " AND control_id IN ({})",
            placeholders(filter.control_ids.len())
        ));
        args.extend(filter.control_ids.iter().map(|c| Value::Text(c.clone())));
    }
    if let Some(t) = filter.evidence_type {
        sql.push_str(" AND evidence_type = ?");
        args.push(Value::Text(t.as_str().to_string()));
    }
    if let Some(source) = &filter.source {
        sql.push_str(" AND source = ?");
        args.push(Value::Text(source.as_str().to_string()));
    }
    match filter.status {
        Some(status) => {
            sql.push_str(" AND status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        None if !filter.include_archived => sql.push_str(" AND status != 'archived'"),
        None => {}
    }
    if !filter.tags_any.is_empty() {
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM json_each(evidence_items.tags) t WHERE t.value IN ({}))",
            placeholders(filter.tags_any.len())
        ));
        args.extend(filter.tags_any.iter().map(|t| Value::Text(t.trim().to_string())));
    }
    if let Some(framework) = &filter.framework {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM json_each(evidence_items.framework_mappings) m \
             WHERE json_extract(m.value, '$.framework') = ?)",
        );
        args.push(Value::Text(framework.clone()));
    }
    if let Some(text) = filter.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let pattern = format!("%{}%", escape_like(text));
        sql.push_str(" AND (title LIKE ? ESCAPE '\\' OR description LIKE ? ESCAPE '\\')");
        args.push(Value::Text(pattern.clone()));
        args.push(Value::Text(pattern));
    }
    if let Some(from) = filter.created_from_ms {
        sql.push_str(" AND created_at_ms >= ?");
        args.push(Value::Integer(from));
    }
    if let Some(to) = filter.created_to_ms {
        sql.push_str(" AND created_at_ms <= ?");
        args.push(Value::Integer(to));
    }
    sql.push_str(" ORDER BY updated_at_ms DESC, rowid DESC LIMIT ? OFFSET ?");
    args.push(Value::Integer(filter.limit.map(i64::from).unwrap_or(-1)));
    args.push(Value::Integer(filter.offset.map(i64::from).unwrap_or(0)));
    (sql, args)
}
