//! The single mutable draft of each document.
//!
//! Every manager operation loads the stored [`WorkingCopy`], changes it and writes it back
//! inside one LMDB write transaction, so edits, discards and commits of one document are
//! serialized by the store's single writer.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde_json::Value;

use crate::autosave::{ConflictResolution, DocumentSaver};
use crate::change_tracker;
use crate::error::{ApdError, ApdResult, ErrorContext, Operation, StorageResultExt};
use crate::field_path::{FieldPath, FieldPathError};
use crate::ids::DocumentId;
use crate::local_db_model::{Document, FieldChange, Version, WorkingCopy};
use crate::local_db_state::AppDbState;
use crate::version_repository::{commit_in, CommitOutcome, VersionRepository};

const AUTO_SAVE_MESSAGE: &str = "Auto-save";

impl WorkingCopy {
    /// Writes `value` at `section`/`path` and records the change.
    ///
    /// Returns `None`, leaving the draft untouched, when the stored value is already
    /// structurally equal to `value`.
    pub fn apply_edit(
        &mut self,
        section: &str,
        path: &FieldPath,
        value: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<FieldChange>, FieldPathError> {
        let current = self
            .sections
            .get(section)
            .and_then(|root| path.get(root));
        let Some(delta) = change_tracker::diff_field(section, path, current, Some(&value)) else {
            return Ok(None);
        };
        let mut sections = self.sections.clone();
        change_tracker::apply_one(&mut sections, section, path, Some(value))?;
        self.sections = sections;

        // The change log is indexed at microsecond resolution; keep it strictly ordered
        // even when two edits share a clock tick.
        let timestamp = match self.pending_changes.last() {
            Some(last) if now < last.timestamp + Duration::microseconds(1) => {
                last.timestamp + Duration::microseconds(1)
            }
            _ => now,
        };
        let change = delta.into_change(&self.document_id, timestamp);
        self.pending_changes.push(change.clone());
        self.has_uncommitted_changes = true;
        self.last_modified = now;
        Ok(Some(change))
    }

    /// Back to `base`'s snapshot with nothing pending.
    pub fn reset_to(&mut self, base: &Version, now: DateTime<Utc>) {
        *self = WorkingCopy::create_for(base, now);
    }
}

#[derive(Clone)]
pub struct WorkingCopyManager {
    repository: VersionRepository,
}

impl WorkingCopyManager {
    pub fn new(repository: VersionRepository) -> Self {
        Self { repository }
    }

    fn store(&self) -> &AppDbState {
        self.repository.store()
    }

    /// Replaces the document's working copy with a clean one bound to `version`.
    pub fn create_for(&self, document: &Document, version: &Version) -> ApdResult<WorkingCopy> {
        let ctx = ErrorContext::for_document(Operation::Reload, &document.id);
        if version.document_id != document.id {
            return Err(ApdError::validation(
                ctx,
                format!("version {} belongs to another document", version.id),
            ));
        }
        let working_copy = WorkingCopy::create_for(version, Utc::now());
        self.store().put(&working_copy).within(&ctx)?;
        Ok(working_copy)
    }

    pub fn get_working_copy(&self, document_id: &DocumentId) -> ApdResult<WorkingCopy> {
        let ctx = ErrorContext::for_document(Operation::GetWorkingCopy, document_id);
        self.store().get(document_id.as_str()).within(&ctx)
    }

    /// Applies one field edit to the stored draft.
    ///
    /// Returns the recorded change, or `None` when the value was already in place.
    pub fn apply_field_edit(
        &self,
        document_id: &DocumentId,
        section: &str,
        field_path: &str,
        value: Value,
    ) -> ApdResult<Option<FieldChange>> {
        let ctx = ErrorContext::for_document(Operation::ApplyFieldEdit, document_id);
        if section.is_empty() {
            return Err(ApdError::validation(ctx, "section id must not be empty"));
        }
        let path = FieldPath::parse(field_path)
            .map_err(|e| ApdError::validation(ctx.clone(), e.to_string()))?;
        let now = Utc::now();

        let change = self.store().transact(&ctx, |txn| {
            let mut working_copy: WorkingCopy = txn.get(document_id.as_str()).within(&ctx)?;
            let change = working_copy
                .apply_edit(section, &path, value, now)
                .map_err(|e| ApdError::validation(ctx.clone(), e.to_string()))?;
            if change.is_some() {
                txn.put(&working_copy).within(&ctx)?;
            }
            Ok(change)
        })?;

        match &change {
            Some(change) => debug!(
                "Recorded {} of {}/{} on document {document_id}",
                change.change_type, section, change.field_path
            ),
            None => debug!("Edit of {section}/{field_path} on document {document_id} is a no-op"),
        }
        Ok(change)
    }

    /// Drops every uncommitted edit.
    pub fn discard(&self, document_id: &DocumentId) -> ApdResult<WorkingCopy> {
        let ctx = ErrorContext::for_document(Operation::Discard, document_id);
        let now = Utc::now();
        let working_copy = self.store().transact(&ctx, |txn| {
            let mut working_copy: WorkingCopy = txn.get(document_id.as_str()).within(&ctx)?;
            let base: Version = txn
                .get(working_copy.base_version_id.as_str())
                .within(&ctx)?;
            working_copy.reset_to(&base, now);
            txn.put(&working_copy).within(&ctx)?;
            Ok(working_copy)
        })?;
        info!("Discarded uncommitted changes of document {document_id}");
        Ok(working_copy)
    }

    /// Commits the stored draft. A conflict leaves it exactly as it was.
    pub fn commit(
        &self,
        document_id: &DocumentId,
        message: Option<String>,
    ) -> ApdResult<CommitOutcome> {
        let ctx = ErrorContext::for_document(Operation::Commit, document_id);
        let now = Utc::now();
        self.store().transact(&ctx, |txn| {
            let working_copy: WorkingCopy = txn.get(document_id.as_str()).within(&ctx)?;
            commit_in(txn, &ctx, &working_copy, message, now)
        })
    }

    /// Conflict resolution: throw the draft away and continue from the current head.
    pub fn reload(&self, document_id: &DocumentId) -> ApdResult<WorkingCopy> {
        let ctx = ErrorContext::for_document(Operation::Reload, document_id);
        let now = Utc::now();
        let working_copy = self.store().transact(&ctx, |txn| {
            let document: Document = txn.get(document_id.as_str()).within(&ctx)?;
            let head: Version = txn.get(document.current_version_id.as_str()).within(&ctx)?;
            let working_copy = WorkingCopy::create_for(&head, now);
            txn.put(&working_copy).within(&ctx)?;
            Ok(working_copy)
        })?;
        info!(
            "Reloaded document {document_id} at version {}",
            working_copy.base_version_id
        );
        Ok(working_copy)
    }

    /// Conflict resolution: keep the draft and rebase it onto the current head, so the
    /// next commit replaces the head's content with the draft's.
    pub fn overwrite(&self, document_id: &DocumentId) -> ApdResult<WorkingCopy> {
        let ctx = ErrorContext::for_document(Operation::Overwrite, document_id);
        let now = Utc::now();
        let working_copy = self.store().transact(&ctx, |txn| {
            let document: Document = txn.get(document_id.as_str()).within(&ctx)?;
            let mut working_copy: WorkingCopy = txn.get(document_id.as_str()).within(&ctx)?;
            if working_copy.base_version_id == document.current_version_id {
                return Ok(working_copy);
            }
            let head: Version = txn.get(document.current_version_id.as_str()).within(&ctx)?;
            working_copy.pending_changes =
                change_tracker::diff_at(document_id, &head.sections, &working_copy.sections, now);
            working_copy.has_uncommitted_changes = !working_copy.pending_changes.is_empty();
            working_copy.base_version_id = head.id;
            working_copy.last_modified = now;
            txn.put(&working_copy).within(&ctx)?;
            Ok(working_copy)
        })?;
        info!(
            "Rebased draft of document {document_id} onto version {} ({} pending change(s))",
            working_copy.base_version_id,
            working_copy.pending_changes.len()
        );
        Ok(working_copy)
    }
}

impl DocumentSaver for WorkingCopyManager {
    fn save(&self, document_id: &DocumentId) -> ApdResult<CommitOutcome> {
        self.commit(document_id, Some(AUTO_SAVE_MESSAGE.to_owned()))
    }

    fn resolve_conflict(
        &self,
        document_id: &DocumentId,
        resolution: ConflictResolution,
    ) -> ApdResult<()> {
        match resolution {
            ConflictResolution::Reload => self.reload(document_id).map(drop),
            ConflictResolution::Overwrite => self.overwrite(document_id).map(drop),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_db_model::{ChangeType, Sections};
    use serde_json::json;

    fn draft() -> WorkingCopy {
        let version = Version {
            id: "v0".parse().expect("id"),
            document_id: "apd-1".parse().expect("id"),
            parent_version_id: None,
            sequence: 0,
            sections: match json!({"executive-summary": {"summary": ""}}) {
                Value::Object(map) => map,
                _ => Sections::new(),
            },
            message: None,
            created_at: Utc::now(),
        };
        WorkingCopy::create_for(&version, Utc::now())
    }

    #[test]
    fn apply_edit_records_one_change_and_skips_equal_values() {
        let mut working_copy = draft();
        let path = FieldPath::parse("summary").expect("path");
        let now = Utc::now();

        let change = working_copy
            .apply_edit("executive-summary", &path, json!("Draft Summary"), now)
            .expect("edit")
            .expect("a change");
        assert_eq!(change.change_type, ChangeType::Added);
        assert!(working_copy.has_uncommitted_changes);

        let again = working_copy
            .apply_edit("executive-summary", &path, json!("Draft Summary"), now)
            .expect("edit");
        assert!(again.is_none());
        assert_eq!(working_copy.pending_changes.len(), 1);
    }

    #[test]
    fn edits_in_one_tick_get_increasing_timestamps() {
        let mut working_copy = draft();
        let now = Utc::now();
        for (field, value) in [("a", 1), ("b", 2), ("c", 3)] {
            let path = FieldPath::parse(field).expect("path");
            working_copy
                .apply_edit("budget", &path, json!(value), now)
                .expect("edit");
        }
        let stamps: Vec<_> = working_copy.pending_changes.iter().map(|c| c.timestamp).collect();
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(working_copy.sections["budget"], json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn bad_paths_leave_the_draft_untouched() {
        let mut working_copy = draft();
        let before = working_copy.clone();
        let path = FieldPath::parse("summary.deeper").expect("path");
        let result = working_copy.apply_edit("executive-summary", &path, json!(1), Utc::now());
        assert!(result.is_err());
        assert_eq!(working_copy, before);
    }
}
