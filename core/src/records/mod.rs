//! Relational persistence for evidence items, versions, files and retention policies.

pub mod schema;

use crate::error::{CoreError, CoreResult};
use crate::evidence::model::{
    EvidenceFile, EvidenceItem, EvidenceSource, EvidenceStatus, EvidenceType, EvidenceVersion,
    RetentionPolicy, VersionStatus,
};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub const ITEM_COLUMNS: &str = "id, org_id, control_id, title, description, evidence_type, \
     source, status, current_version, tags, retention_until_ms, framework_mappings, \
     created_at_ms, updated_at_ms";

pub const VERSION_COLUMNS: &str = "id, evidence_id, version_number, notes, status, created_by, \
     created_at_ms, approved_by, approved_at_ms";

pub const FILE_COLUMNS: &str = "id, version_id, evidence_id, storage_key, file_name, mime_type, \
     size_bytes, url, content_digest, uploaded_by, uploaded_at_ms";

pub const POLICY_COLUMNS: &str =
    "id, name, retention_days, auto_delete, frameworks, evidence_types, is_default";

/// One connection per store handle. Independent handles (or processes) on the same
/// database file coordinate only through SQLite locking and the schema's constraints.
pub struct Records {
    conn: Mutex<Connection>,
}

impl Records {
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> CoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::prepare(conn, busy_timeout)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Self::prepare(Connection::open_in_memory()?, Duration::from_millis(0))
    }

    fn prepare(conn: Connection, busy_timeout: Duration) -> CoreResult<Self> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::StoreUnavailable("connection mutex poisoned".to_string()))
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Runs `f` inside `BEGIN IMMEDIATE`; any error rolls the whole unit back.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, ulid::Ulid::new().to_string().to_ascii_lowercase())
}

fn conv<T>(idx: usize, r: CoreResult<T>) -> rusqlite::Result<T> {
    r.map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    conv(idx, serde_json::from_str(&raw).map_err(CoreError::from))
}

pub fn item_from_row(row: &Row<'_>) -> rusqlite::Result<EvidenceItem> {
    let evidence_type: String = row.get(5)?;
    let source: String = row.get(6)?;
    let status: String = row.get(7)?;
    Ok(EvidenceItem {
        id: row.get(0)?,
        org_id: row.get(1)?,
        control_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        evidence_type: conv(5, EvidenceType::parse(&evidence_type))?,
        source: EvidenceSource::from(source),
        status: conv(7, EvidenceStatus::parse(&status))?,
        current_version: row.get(8)?,
        tags: json_col(row, 9)?,
        retention_until_ms: row.get(10)?,
        framework_mappings: json_col(row, 11)?,
        created_at_ms: row.get(12)?,
        updated_at_ms: row.get(13)?,
    })
}

/// Files are attached separately; the returned version has an empty file list.
pub fn version_from_row(row: &Row<'_>) -> rusqlite::Result<EvidenceVersion> {
    let status: String = row.get(4)?;
    Ok(EvidenceVersion {
        id: row.get(0)?,
        evidence_id: row.get(1)?,
        version_number: row.get(2)?,
        notes: row.get(3)?,
        status: conv(4, VersionStatus::parse(&status))?,
        created_by: row.get(5)?,
        created_at_ms: row.get(6)?,
        approved_by: row.get(7)?,
        approved_at_ms: row.get(8)?,
        files: Vec::new(),
    })
}

pub fn file_from_row(row: &Row<'_>) -> rusqlite::Result<EvidenceFile> {
    let size: i64 = row.get(6)?;
    Ok(EvidenceFile {
        id: row.get(0)?,
        version_id: row.get(1)?,
        evidence_id: row.get(2)?,
        storage_key: row.get(3)?,
        file_name: row.get(4)?,
        mime_type: row.get(5)?,
        size_bytes: size.max(0) as u64,
        url: row.get(7)?,
        content_digest: row.get(8)?,
        uploaded_by: row.get(9)?,
        uploaded_at_ms: row.get(10)?,
    })
}

pub fn policy_from_row(row: &Row<'_>) -> rusqlite::Result<RetentionPolicy> {
    Ok(RetentionPolicy {
        id: row.get(0)?,
        name: row.get(1)?,
        retention_days: row.get(2)?,
        auto_delete: row.get(3)?,
        frameworks: json_col(row, 4)?,
        evidence_types: json_col(row, 5)?,
        is_default: row.get(6)?,
    })
}
