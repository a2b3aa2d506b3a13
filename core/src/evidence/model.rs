use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    Document,
    Screenshot,
    Log,
    Configuration,
    Report,
    Policy,
    Certificate,
    Assessment,
    Automated,
}

impl EvidenceType {
    pub const ALL: [EvidenceType; 9] = [
        EvidenceType::Document,
        EvidenceType::Screenshot,
        EvidenceType::Log,
        EvidenceType::Configuration,
        EvidenceType::Report,
        EvidenceType::Policy,
        EvidenceType::Certificate,
        EvidenceType::Assessment,
        EvidenceType::Automated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceType::Document => "document",
            EvidenceType::Screenshot => "screenshot",
            EvidenceType::Log => "log",
            EvidenceType::Configuration => "configuration",
            EvidenceType::Report => "report",
            EvidenceType::Policy => "policy",
            EvidenceType::Certificate => "certificate",
            EvidenceType::Assessment => "assessment",
            EvidenceType::Automated => "automated",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("unknown evidence type {}", s)))
    }
}

/// Where the proof came from: typed in by a person, or pushed by a named integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(from = "String", into = "String")]
pub enum EvidenceSource {
    Manual,
    External(String),
}

impl EvidenceSource {
    pub fn as_str(&self) -> &str {
        match self {
            EvidenceSource::Manual => "manual",
            EvidenceSource::External(name) => name.as_str(),
        }
    }
}

impl From<String> for EvidenceSource {
    fn from(s: String) -> Self {
        if s.is_empty() || s == "manual" {
            EvidenceSource::Manual
        } else {
            EvidenceSource::External(s)
        }
    }
}

impl From<EvidenceSource> for String {
    fn from(s: EvidenceSource) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for EvidenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Review,
    Final,
}

impl VersionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VersionStatus::Draft => "draft",
            VersionStatus::Review => "review",
            VersionStatus::Final => "final",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "draft" => Ok(VersionStatus::Draft),
            "review" => Ok(VersionStatus::Review),
            "final" => Ok(VersionStatus::Final),
            other => Err(CoreError::Persistence(format!(
                "unknown version status {}",
                other
            ))),
        }
    }
}

/// Item-level status. Mirrors the current version, except `Archived`, which only items carry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStatus {
    Draft,
    Review,
    Final,
    Archived,
}

impl EvidenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceStatus::Draft => "draft",
            EvidenceStatus::Review => "review",
            EvidenceStatus::Final => "final",
            EvidenceStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "archived" => Ok(EvidenceStatus::Archived),
            other => VersionStatus::parse(other).map(EvidenceStatus::from),
        }
    }
}

impl From<VersionStatus> for EvidenceStatus {
    fn from(v: VersionStatus) -> Self {
        match v {
            VersionStatus::Draft => EvidenceStatus::Draft,
            VersionStatus::Review => EvidenceStatus::Review,
            VersionStatus::Final => EvidenceStatus::Final,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameworkMapping {
    pub framework: String,
    pub requirement_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceFile {
    pub id: String,
    pub version_id: String,
    pub evidence_id: String,
    pub storage_key: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub url: String,
    pub content_digest: String,
    pub uploaded_by: String,
    pub uploaded_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceVersion {
    pub id: String,
    pub evidence_id: String,
    pub version_number: u32,
    pub notes: String,
    pub status: VersionStatus,
    pub created_by: String,
    pub created_at_ms: i64,
    pub approved_by: Option<String>,
    pub approved_at_ms: Option<i64>,
    pub files: Vec<EvidenceFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceItem {
    pub id: String,
    pub org_id: String,
    pub control_id: String,
    pub title: String,
    pub description: String,
    pub evidence_type: EvidenceType,
    pub source: EvidenceSource,
    pub status: EvidenceStatus,
    pub current_version: u32,
    pub tags: Vec<String>,
    pub retention_until_ms: Option<i64>,
    pub framework_mappings: Vec<FrameworkMapping>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// An item with its full history, newest version first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceRecord {
    pub item: EvidenceItem,
    pub versions: Vec<EvidenceVersion>,
}

impl EvidenceRecord {
    pub fn current_version(&self) -> Option<&EvidenceVersion> {
        self.versions
            .iter()
            .find(|v| v.version_number == self.item.current_version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewEvidence {
    pub control_id: String,
    pub title: String,
    pub description: String,
    pub evidence_type: EvidenceType,
    pub source: Option<EvidenceSource>,
    pub tags: Vec<String>,
    pub framework_mappings: Vec<FrameworkMapping>,
    pub retention_until_ms: Option<i64>,
}

impl NewEvidence {
    pub fn new(control_id: &str, title: &str, evidence_type: EvidenceType) -> Self {
        Self {
            control_id: control_id.to_string(),
            title: title.to_string(),
            description: String::new(),
            evidence_type,
            source: None,
            tags: Vec::new(),
            framework_mappings: Vec::new(),
            retention_until_ms: None,
        }
    }
}

/// Metadata-only patch. Status and version are deliberately absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidencePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub framework_mappings: Option<Vec<FrameworkMapping>>,
}

impl EvidencePatch {
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.title.is_some() {
            out.push("title");
        }
        if self.description.is_some() {
            out.push("description");
        }
        if self.tags.is_some() {
            out.push("tags");
        }
        if self.framework_mappings.is_some() {
            out.push("framework_mappings");
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchFilter {
    pub control_ids: Vec<String>,
    pub evidence_type: Option<EvidenceType>,
    pub source: Option<EvidenceSource>,
    pub status: Option<EvidenceStatus>,
    /// Match items carrying at least one of these tags.
    pub tags_any: Vec<String>,
    pub framework: Option<String>,
    pub text: Option<String>,
    pub created_from_ms: Option<i64>,
    pub created_to_ms: Option<i64>,
    pub include_archived: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileUpload {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadResult {
    pub evidence_id: String,
    pub version_number: u32,
    pub file: EvidenceFile,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomatedCheck {
    pub title: String,
    pub details: String,
    pub payload: serde_json::Value,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub id: String,
    pub name: String,
    pub retention_days: u32,
    pub auto_delete: bool,
    pub frameworks: Vec<String>,
    pub evidence_types: Vec<EvidenceType>,
    pub is_default: bool,
}

impl RetentionPolicy {
    /// Empty framework/type lists mean "no restriction on that axis".
    pub fn applies_to(&self, item: &EvidenceItem) -> bool {
        let type_ok =
            self.evidence_types.is_empty() || self.evidence_types.contains(&item.evidence_type);
        let framework_ok = self.frameworks.is_empty()
            || item
                .framework_mappings
                .iter()
                .any(|m| self.frameworks.contains(&m.framework));
        type_ok && framework_ok
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceStats {
    pub total: u64,
    pub by_status: Vec<(EvidenceStatus, u64)>,
    pub by_type: Vec<(EvidenceType, u64)>,
    pub by_source: Vec<(String, u64)>,
    pub files: u64,
    pub total_bytes: u64,
    pub expiring_soon: u64,
}

pub fn normalize_labels(labels: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = labels
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn normalize_mappings(mappings: Vec<FrameworkMapping>) -> Vec<FrameworkMapping> {
    let mut out: Vec<FrameworkMapping> = mappings
        .into_iter()
        .map(|m| FrameworkMapping {
            framework: m.framework.trim().to_string(),
            requirement_id: m.requirement_id.trim().to_string(),
        })
        .filter(|m| !m.framework.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
