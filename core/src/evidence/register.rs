use crate::error::{CoreError, CoreResult};
use crate::evidence::model::EvidenceRecord;
use crate::session::Session;
use crate::storage::object_store::ObjectStore;

use super::retention::load_scope_items;
use super::store::EvidenceStore;
use super::versions::load_history;

pub const REGISTER_HEADER: [&str; 8] = [
    "control_id",
    "evidence_id",
    "title",
    "status",
    "current_version",
    "file_name",
    "content_digest",
    "size_bytes",
];

impl<O: ObjectStore> EvidenceStore<O> {
    /// Auditor-facing register of live evidence: one row per file of each item's current
    /// version, or a single row with empty file columns when nothing is attached yet.
    pub fn export_register_csv(&self, session: &Session) -> CoreResult<String> {
        let scope = session.scope()?;
        let records = self.records.with_conn(|conn| {
            load_scope_items(conn, &scope.org_id, false)?
                .into_iter()
                .map(|item| {
                    let versions = load_history(conn, &item.id)?;
                    Ok(EvidenceRecord { item, versions })
                })
                .collect::<CoreResult<Vec<_>>>()
        })?;
        render_register_csv(&records)
    }
}

pub fn render_register_csv(records: &[EvidenceRecord]) -> CoreResult<String> {
    let mut rows: Vec<[String; 8]> = Vec::new();
    for record in records {
        let item = &record.item;
        let base = |file_name: String, digest: String, size: String| {
            [
                item.control_id.clone(),
                item.id.clone(),
                item.title.clone(),
                item.status.as_str().to_string(),
                item.current_version.to_string(),
                file_name,
                digest,
                size,
            ]
        };
        match record.current_version().filter(|v| !v.files.is_empty()) {
            Some(version) => {
                for f in &version.files {
                    rows.push(base(
                        f.file_name.clone(),
                        f.content_digest.clone(),
                        f.size_bytes.to_string(),
                    ));
                }
            }
            None => rows.push(base(String::new(), String::new(), String::new())),
        }
    }
    rows.sort();

    let mut wtr = csv::WriterBuilder::new().from_writer(vec![]);
    wtr.write_record(REGISTER_HEADER)?;
    for row in rows {
        wtr.write_record(&row)?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| CoreError::Persistence(e.into_error().to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).replace("\r\n", "\n"))
}
