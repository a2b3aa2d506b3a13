use crate::error::CoreResult;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

pub const SCHEMA_VERSION: &str = "1";

const ITEMS: &str = "CREATE TABLE IF NOT EXISTS evidence_items (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    control_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    evidence_type TEXT NOT NULL,
    source TEXT NOT NULL,
    status TEXT NOT NULL,
    current_version INTEGER NOT NULL CHECK (current_version >= 1),
    tags TEXT NOT NULL DEFAULT '[]',
    retention_until_ms INTEGER,
    framework_mappings TEXT NOT NULL DEFAULT '[]',
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
)";

const VERSIONS: &str = "CREATE TABLE IF NOT EXISTS evidence_versions (
    id TEXT PRIMARY KEY,
    evidence_id TEXT NOT NULL REFERENCES evidence_items(id) ON DELETE CASCADE,
    version_number INTEGER NOT NULL CHECK (version_number >= 1),
    notes TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    approved_by TEXT,
    approved_at_ms INTEGER
)";

const FILES: &str = "CREATE TABLE IF NOT EXISTS evidence_files (
    id TEXT PRIMARY KEY,
    version_id TEXT NOT NULL REFERENCES evidence_versions(id) ON DELETE CASCADE,
    evidence_id TEXT NOT NULL REFERENCES evidence_items(id) ON DELETE CASCADE,
    storage_key TEXT NOT NULL UNIQUE,
    file_name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    url TEXT NOT NULL,
    content_digest TEXT NOT NULL,
    uploaded_by TEXT NOT NULL,
    uploaded_at_ms INTEGER NOT NULL
)";

const POLICIES: &str = "CREATE TABLE IF NOT EXISTS retention_policies (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    retention_days INTEGER NOT NULL,
    auto_delete INTEGER NOT NULL,
    frameworks TEXT NOT NULL DEFAULT '[]',
    evidence_types TEXT NOT NULL DEFAULT '[]',
    is_default INTEGER NOT NULL DEFAULT 0,
    UNIQUE (org_id, name)
)";

const META: &str =
    "CREATE TABLE IF NOT EXISTS schema_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)";

const INDEXES: [&str; 6] = [
    "CREATE INDEX IF NOT EXISTS idx_items_org_control ON evidence_items(org_id, control_id)",
    "CREATE INDEX IF NOT EXISTS idx_items_org_updated ON evidence_items(org_id, updated_at_ms)",
    // Serializes racing version creators: only one insert per (item, number) can win.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_versions_item_number \
     ON evidence_versions(evidence_id, version_number)",
    "CREATE INDEX IF NOT EXISTS idx_files_version ON evidence_files(version_id)",
    "CREATE INDEX IF NOT EXISTS idx_files_evidence ON evidence_files(evidence_id)",
    "CREATE INDEX IF NOT EXISTS idx_policies_org ON retention_policies(org_id)",
];

pub fn initialize(conn: &Connection) -> CoreResult<()> {
    conn.execute(META, [])?;
    conn.execute(ITEMS, [])?;
    migrate_version_column(conn)?;
    conn.execute(VERSIONS, [])?;
    conn.execute(FILES, [])?;
    conn.execute(POLICIES, [])?;
    for ddl in INDEXES {
        conn.execute(ddl, [])?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta(key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION],
    )?;
    Ok(())
}

fn column_names(conn: &Connection, table: &str) -> CoreResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

// Older databases stored the version number under `version`. Rename it once to the
// canonical `version_number` so no read path ever has to consult two column names.
fn migrate_version_column(conn: &Connection) -> CoreResult<()> {
    let done: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'version_column_migrated'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if done.is_some() {
        return Ok(());
    }
    let cols = column_names(conn, "evidence_versions")?;
    let has_legacy = cols.iter().any(|c| c == "version");
    let has_canonical = cols.iter().any(|c| c == "version_number");
    if has_legacy && !has_canonical {
        conn.execute(
            "ALTER TABLE evidence_versions RENAME COLUMN version TO version_number",
            [],
        )?;
        info!("migrated evidence_versions.version to version_number");
    } else if has_legacy && has_canonical {
        let n = conn.execute(
            "UPDATE evidence_versions SET version_number = version WHERE version_number IS NULL",
            [],
        )?;
        info!(rows = n, "backfilled version_number from legacy column");
    }
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta(key, value) VALUES ('version_column_migrated', '1')",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        let cols = column_names(&conn, "evidence_versions").unwrap();
        assert!(cols.contains(&"version_number".to_string()));
    }

    #[test]
    fn legacy_version_column_is_renamed_once() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(META, []).unwrap();
        conn.execute(ITEMS, []).unwrap();
        conn.execute(
            "CREATE TABLE evidence_versions (
                id TEXT PRIMARY KEY, evidence_id TEXT NOT NULL, version INTEGER NOT NULL,
                notes TEXT NOT NULL DEFAULT '', status TEXT NOT NULL, created_by TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL, approved_by TEXT, approved_at_ms INTEGER)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO evidence_versions(id, evidence_id, version, status, created_by, created_at_ms)
             VALUES ('evv_1', 'ev_1', 3, 'draft', 'alice', 0)",
            [],
        )
        .unwrap();

        initialize(&conn).unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT version_number FROM evidence_versions WHERE id = 'evv_1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 3);
        assert!(!column_names(&conn, "evidence_versions")
            .unwrap()
            .contains(&"version".to_string()));
    }
}
