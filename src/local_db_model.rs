//! Data model definitions for database storage.
//!
//! The store holds a small graph per APD: the [`Document`] itself, its immutable
//! [`Version`] chain, exactly one mutable [`WorkingCopy`], and an append-only log of
//! [`FieldChange`]s. [`Project`]s group documents. [`VersionTombstone`]s mark versions
//! removed by the retention policy.
//!
//! All records serialize as camelCase JSON; the same representation is used for LMDB
//! values, FFI responses and backup bundles.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::ids::{DocumentId, FieldChangeId, ProjectId, VersionId};
use crate::local_db_state::{Index, IndexEntry, Record, Table};

/// Section id to section content. Content is normally a mapping of field ids to values.
///
/// `serde_json::Map` keeps keys in canonical (sorted) order, which makes every traversal
/// of a snapshot deterministic.
pub type Sections = Map<String, Value>;

/// Free-form descriptive fields of a document (author, state, fiscal year, ...).
pub type Metadata = Map<String, Value>;

/// The closed set of APD kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKind {
    #[serde(rename = "PAPD")]
    Papd,
    #[serde(rename = "PAPDU")]
    PapdUpdate,
    #[serde(rename = "IAPD")]
    Iapd,
    #[serde(rename = "IAPDU")]
    IapdUpdate,
    #[serde(rename = "OAPD")]
    Oapd,
    #[serde(rename = "AoA")]
    AnalysisOfAlternatives,
    #[serde(rename = "AcquisitionChecklist")]
    AcquisitionChecklist,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Papd => "PAPD",
            Self::PapdUpdate => "PAPDU",
            Self::Iapd => "IAPD",
            Self::IapdUpdate => "IAPDU",
            Self::Oapd => "OAPD",
            Self::AnalysisOfAlternatives => "AoA",
            Self::AcquisitionChecklist => "AcquisitionChecklist",
        };
        f.write_str(name)
    }
}

/// The top-level versioned entity a user edits.
///
/// `sections` is the materialized snapshot of the head version so reads never have to
/// touch the version table. `current_version_id` always names an existing version of
/// this document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: DocumentId,
    pub kind: DocumentKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub metadata: Metadata,
    pub sections: Sections,
    pub current_version_id: VersionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable, fully materialized snapshot of a document's sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub id: VersionId,
    pub document_id: DocumentId,
    #[serde(default)]
    pub parent_version_id: Option<VersionId>,
    /// Root is 0, every commit is `parent + 1`. Authoritative ordering.
    pub sequence: u64,
    pub sections: Sections,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Version {
    pub fn is_root(&self) -> bool {
        self.parent_version_id.is_none()
    }
}

/// The single mutable draft of a document, bound to a base version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingCopy {
    pub document_id: DocumentId,
    pub base_version_id: VersionId,
    pub sections: Sections,
    /// Oldest first.
    #[serde(default)]
    pub pending_changes: Vec<FieldChange>,
    pub has_uncommitted_changes: bool,
    pub last_modified: DateTime<Utc>,
}

impl WorkingCopy {
    /// A clean working copy holding `version`'s snapshot.
    pub fn create_for(version: &Version, now: DateTime<Utc>) -> Self {
        Self {
            document_id: version.document_id.clone(),
            base_version_id: version.id.clone(),
            sections: version.sections.clone(),
            pending_changes: Vec::new(),
            has_uncommitted_changes: false,
            last_modified: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => f.write_str("added"),
            Self::Modified => f.write_str("modified"),
            Self::Removed => f.write_str("removed"),
        }
    }
}

/// One leaf-level difference between two section snapshots.
///
/// `field_path` is relative to `section`; an empty path stands for the whole section.
/// A missing `old_value`/`new_value` means the key was absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub id: FieldChangeId,
    pub document_id: DocumentId,
    pub section: String,
    pub field_path: String,
    pub field_label: String,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub old_value: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub new_value: Option<Value>,
    pub change_type: ChangeType,
    pub timestamp: DateTime<Utc>,
    /// Set when the change is committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<VersionId>,
}

/// A present key, `null` included, is `Some`; only a missing key falls back to `None`.
fn present_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Left behind when the retention policy prunes a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionTombstone {
    pub version_id: VersionId,
    pub document_id: DocumentId,
    pub sequence: u64,
    pub pruned_at: DateTime<Utc>,
}

/// Zero-padded so lexicographic index order equals numeric order.
pub(crate) fn sequence_key(sequence: u64) -> String {
    format!("{sequence:020}")
}

pub(crate) fn timestamp_key(at: &DateTime<Utc>) -> String {
    // Offset keeps pre-epoch timestamps sortable as unsigned.
    let micros = i128::from(at.timestamp_micros()) + i128::from(i64::MAX);
    format!("{micros:040}")
}

impl Record for Document {
    const TABLE: Table = Table::Documents;

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        let mut entries = vec![IndexEntry::new(
            Index::DocumentsByUpdatedAt,
            "",
            timestamp_key(&self.updated_at),
        )];
        if let Some(project_id) = &self.project_id {
            entries.push(IndexEntry::new(
                Index::DocumentsByProject,
                project_id.as_str(),
                timestamp_key(&self.updated_at),
            ));
        }
        entries
    }
}

impl Record for Version {
    const TABLE: Table = Table::Versions;

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![IndexEntry::new(
            Index::VersionsByDocument,
            self.document_id.as_str(),
            sequence_key(self.sequence),
        )]
    }
}

impl Record for WorkingCopy {
    const TABLE: Table = Table::WorkingCopies;

    fn key(&self) -> String {
        self.document_id.to_string()
    }
}

impl Record for FieldChange {
    const TABLE: Table = Table::FieldChanges;

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![IndexEntry::new(
            Index::FieldChangesByDocument,
            self.document_id.as_str(),
            timestamp_key(&self.timestamp),
        )]
    }
}

impl Record for Project {
    const TABLE: Table = Table::Projects;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Record for VersionTombstone {
    const TABLE: Table = Table::VersionTombstones;

    fn key(&self) -> String {
        self.version_id.to_string()
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![IndexEntry::new(
            Index::TombstonesByDocument,
            self.document_id.as_str(),
            sequence_key(self.sequence),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn document_kind_uses_apd_names() {
        let json = serde_json::to_string(&DocumentKind::Papd).expect("serialize");
        assert_eq!(json, "\"PAPD\"");
        let kind: DocumentKind = serde_json::from_str("\"AoA\"").expect("deserialize");
        assert_eq!(kind, DocumentKind::AnalysisOfAlternatives);
    }

    #[test]
    fn version_serializes_camel_case() {
        let version = Version {
            id: VersionId::new("v0").expect("id"),
            document_id: DocumentId::new("apd-1").expect("id"),
            parent_version_id: None,
            sequence: 0,
            sections: Sections::new(),
            message: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
        };
        let value = serde_json::to_value(&version).expect("serialize");
        assert_eq!(value["documentId"], json!("apd-1"));
        assert_eq!(value["parentVersionId"], Value::Null);
        assert!(version.is_root());
    }

    #[test]
    fn field_change_keeps_null_apart_from_absent() {
        let change = FieldChange {
            id: FieldChangeId::new("fc-1").expect("id"),
            document_id: DocumentId::new("apd-1").expect("id"),
            section: "budget".to_owned(),
            field_path: "total".to_owned(),
            field_label: "Total".to_owned(),
            old_value: None,
            new_value: Some(Value::Null),
            change_type: ChangeType::Added,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
            version_id: None,
        };
        let json = serde_json::to_value(&change).expect("serialize");
        assert!(json.get("oldValue").is_none());
        assert_eq!(json["newValue"], Value::Null);

        let back: FieldChange = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, change);
    }

    #[test]
    fn timestamp_keys_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(1969, 12, 31, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(timestamp_key(&earlier) < timestamp_key(&later));
        assert!(sequence_key(9) < sequence_key(10));
    }
}
