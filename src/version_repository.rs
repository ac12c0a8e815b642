//! The immutable commit graph of each document.
//!
//! A commit compares the document's stored head against the working copy's base version
//! inside the same LMDB write transaction that writes the new version. A mismatch is a
//! [`ApdError::Conflict`] and nothing is written.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::change_tracker;
use crate::error::{ApdError, ApdResult, ErrorContext, Operation, StorageResultExt};
use crate::ids::{DocumentId, ProjectId, VersionId};
use crate::local_db_model::{
    Document, DocumentKind, FieldChange, Metadata, Project, Sections, Version, VersionTombstone,
    WorkingCopy,
};
use crate::local_db_state::{AppDbState, Index, StoreTxn};

/// Input of [`VersionRepository::create_document`]. A missing `id` is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDocument {
    #[serde(default)]
    pub id: Option<DocumentId>,
    pub kind: DocumentKind,
    pub name: String,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub sections: Sections,
}

impl NewDocument {
    pub fn new(kind: DocumentKind, name: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            name: name.into(),
            project_id: None,
            metadata: Metadata::new(),
            sections: Sections::new(),
        }
    }

    pub fn with_id(mut self, id: DocumentId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_sections(mut self, sections: Sections) -> Self {
        self.sections = sections;
        self
    }

    pub fn in_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum CommitOutcome {
    Committed { version: Version },
    /// Nothing to commit; the head stays where it was.
    #[serde(rename_all = "camelCase")]
    Unchanged { head_version_id: VersionId },
}

impl CommitOutcome {
    pub fn head_version_id(&self) -> &VersionId {
        match self {
            Self::Committed { version } => &version.id,
            Self::Unchanged { head_version_id } => head_version_id,
        }
    }

    pub fn version(&self) -> Option<&Version> {
        match self {
            Self::Committed { version } => Some(version),
            Self::Unchanged { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct VersionRepository {
    store: Arc<AppDbState>,
}

impl VersionRepository {
    pub fn new(store: Arc<AppDbState>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<AppDbState> {
        &self.store
    }

    /// The sequence-0 version every document starts from.
    pub fn create_root(document: &Document, now: DateTime<Utc>) -> Version {
        Version {
            id: document.current_version_id.clone(),
            document_id: document.id.clone(),
            parent_version_id: None,
            sequence: 0,
            sections: document.sections.clone(),
            message: None,
            created_at: now,
        }
    }

    /// Writes the document, its root version and a clean working copy in one transaction.
    pub fn create_document(&self, new: NewDocument) -> ApdResult<Document> {
        let id = new.id.unwrap_or_else(DocumentId::generate);
        let ctx = ErrorContext::for_document(Operation::CreateDocument, &id);
        if new.name.trim().is_empty() {
            return Err(ApdError::validation(ctx, "document name must not be empty"));
        }

        let now = Utc::now();
        let document = Document {
            id,
            kind: new.kind,
            name: new.name,
            project_id: new.project_id,
            metadata: new.metadata,
            sections: new.sections,
            current_version_id: VersionId::generate(),
            created_at: now,
            updated_at: now,
        };
        let root = Self::create_root(&document, now);
        let working_copy = WorkingCopy::create_for(&root, now);

        self.store.transact(&ctx, |txn| {
            if txn.contains::<Document>(document.id.as_str()).within(&ctx)? {
                return Err(ApdError::validation(
                    ctx.clone(),
                    format!("document '{}' already exists", document.id),
                ));
            }
            if let Some(project_id) = &document.project_id {
                if !txn.contains::<Project>(project_id.as_str()).within(&ctx)? {
                    return Err(ApdError::not_found(ctx.clone(), format!("project '{project_id}'")));
                }
            }
            txn.put(&document).within(&ctx)?;
            txn.put(&root).within(&ctx)?;
            txn.put(&working_copy).within(&ctx)?;
            Ok(())
        })?;

        info!("Created {} document {} at version {}", document.kind, document.id, root.id);
        Ok(document)
    }

    pub fn get_document(&self, document_id: &DocumentId) -> ApdResult<Document> {
        let ctx = ErrorContext::for_document(Operation::GetDocument, document_id);
        self.store.get(document_id.as_str()).within(&ctx)
    }

    /// Most recently updated first, optionally restricted to one project.
    pub fn list_documents(&self, project_id: Option<&ProjectId>) -> ApdResult<Vec<Document>> {
        let ctx = ErrorContext::new(Operation::ListDocuments);
        let mut documents: Vec<Document> = match project_id {
            Some(project_id) => self
                .store
                .query_by_index::<Document>(Index::DocumentsByProject, project_id.as_str()),
            None => self.store.scan_index::<Document>(Index::DocumentsByUpdatedAt),
        }
        .within(&ctx)?;
        documents.reverse();
        Ok(documents)
    }

    /// Turns the working copy's pending changes into the next version.
    ///
    /// Returns [`CommitOutcome::Unchanged`] without writing when there is nothing
    /// pending. Fails with [`ApdError::Conflict`] when the document moved past the
    /// working copy's base version.
    pub fn commit(
        &self,
        working_copy: &WorkingCopy,
        message: Option<String>,
    ) -> ApdResult<CommitOutcome> {
        let ctx = ErrorContext::for_document(Operation::Commit, &working_copy.document_id);
        let now = Utc::now();
        self.store
            .transact(&ctx, |txn| commit_in(txn, &ctx, working_copy, message, now))
    }

    pub fn get_version(&self, version_id: &VersionId) -> ApdResult<Version> {
        let ctx = ErrorContext::new(Operation::GetVersion);
        self.store.get(version_id.as_str()).within(&ctx)
    }

    /// Every surviving version of the document, newest first by sequence.
    pub fn get_history(&self, document_id: &DocumentId) -> ApdResult<Vec<Version>> {
        let ctx = ErrorContext::for_document(Operation::GetHistory, document_id);
        self.require_document(&ctx, document_id)?;
        let mut versions: Vec<Version> = self
            .store
            .query_by_index(Index::VersionsByDocument, document_id.as_str())
            .within(&ctx)?;
        versions.reverse();
        Ok(versions)
    }

    /// Commits the target version's content on top of the current head.
    ///
    /// History is only ever extended. The revert is refused while the working copy holds
    /// uncommitted edits, and is a no-op when the head already has the target's content.
    pub fn revert(
        &self,
        document_id: &DocumentId,
        target_version_id: &VersionId,
    ) -> ApdResult<CommitOutcome> {
        let ctx = ErrorContext::for_document(Operation::Revert, document_id);
        let now = Utc::now();
        let outcome = self.store.transact(&ctx, |txn| {
            let document: Document = txn.get(document_id.as_str()).within(&ctx)?;
            let target: Version = txn.get(target_version_id.as_str()).within(&ctx)?;
            if target.document_id != document.id {
                return Err(ApdError::validation(
                    ctx.clone(),
                    format!("version {target_version_id} belongs to another document"),
                ));
            }
            let working_copy: WorkingCopy = txn.get(document_id.as_str()).within(&ctx)?;
            if working_copy.has_uncommitted_changes {
                return Err(ApdError::validation(
                    ctx.clone(),
                    "working copy has uncommitted changes; commit or discard them first",
                ));
            }

            let draft = WorkingCopy {
                document_id: document.id.clone(),
                base_version_id: document.current_version_id.clone(),
                sections: target.sections.clone(),
                pending_changes: change_tracker::diff_at(
                    &document.id,
                    &document.sections,
                    &target.sections,
                    now,
                ),
                has_uncommitted_changes: true,
                last_modified: now,
            };
            let message = format!("Revert to version {}", target.sequence);
            commit_in(txn, &ctx, &draft, Some(message), now)
        })?;

        if let CommitOutcome::Committed { version } = &outcome {
            info!(
                "Reverted document {document_id} to the content of {target_version_id} as {}",
                version.id
            );
        }
        Ok(outcome)
    }

    /// The document's change log, oldest first.
    pub fn field_changes(&self, document_id: &DocumentId) -> ApdResult<Vec<FieldChange>> {
        let ctx = ErrorContext::for_document(Operation::FieldChanges, document_id);
        self.require_document(&ctx, document_id)?;
        self.store
            .query_by_index(Index::FieldChangesByDocument, document_id.as_str())
            .within(&ctx)
    }

    /// The changes that produced `version_id`.
    pub fn field_changes_for_version(&self, version_id: &VersionId) -> ApdResult<Vec<FieldChange>> {
        let version = self.get_version(version_id)?;
        let mut changes = self.field_changes(&version.document_id)?;
        changes.retain(|change| change.version_id.as_ref() == Some(version_id));
        Ok(changes)
    }

    pub fn tombstones(&self, document_id: &DocumentId) -> ApdResult<Vec<VersionTombstone>> {
        let ctx = ErrorContext::for_document(Operation::GetHistory, document_id);
        self.store
            .query_by_index(Index::TombstonesByDocument, document_id.as_str())
            .within(&ctx)
    }

    fn require_document(&self, ctx: &ErrorContext, document_id: &DocumentId) -> ApdResult<()> {
        match self.store.find::<Document>(document_id.as_str()).within(ctx)? {
            Some(_) => Ok(()),
            None => Err(ApdError::not_found(ctx.clone(), format!("document '{document_id}'"))),
        }
    }
}

/// Commit body shared by [`VersionRepository::commit`] and [`VersionRepository::revert`].
pub(crate) fn commit_in(
    txn: &mut StoreTxn<'_>,
    ctx: &ErrorContext,
    working_copy: &WorkingCopy,
    message: Option<String>,
    now: DateTime<Utc>,
) -> ApdResult<CommitOutcome> {
    let mut document: Document = txn.get(working_copy.document_id.as_str()).within(ctx)?;
    if document.current_version_id != working_copy.base_version_id {
        warn!(
            "Commit conflict on document {}: base {} but head {}",
            document.id, working_copy.base_version_id, document.current_version_id
        );
        return Err(ApdError::Conflict {
            context: ctx.clone(),
            base_version_id: working_copy.base_version_id.clone(),
            current_version_id: document.current_version_id,
        });
    }
    if working_copy.pending_changes.is_empty() {
        debug!("Nothing to commit for document {}", document.id);
        return Ok(CommitOutcome::Unchanged {
            head_version_id: document.current_version_id,
        });
    }

    let parent: Version = txn.get(document.current_version_id.as_str()).within(ctx)?;
    if working_copy.sections == parent.sections {
        // Edits cancelled out: no new version, but the draft is settled.
        rebind_settled_working_copy(txn, ctx, &parent, now)?;
        return Ok(CommitOutcome::Unchanged {
            head_version_id: parent.id,
        });
    }

    let version = Version {
        id: VersionId::generate(),
        document_id: document.id.clone(),
        parent_version_id: Some(parent.id.clone()),
        sequence: parent.sequence + 1,
        sections: working_copy.sections.clone(),
        message,
        created_at: now,
    };
    txn.put(&version).within(ctx)?;

    document.current_version_id = version.id.clone();
    document.sections = version.sections.clone();
    document.updated_at = now;
    txn.put(&document).within(ctx)?;

    for change in &working_copy.pending_changes {
        let mut logged = change.clone();
        logged.version_id = Some(version.id.clone());
        txn.put(&logged).within(ctx)?;
    }
    rebind_settled_working_copy(txn, ctx, &version, now)?;

    info!(
        "Committed version {} (sequence {}) of document {} with {} change(s)",
        version.id,
        version.sequence,
        document.id,
        working_copy.pending_changes.len()
    );
    Ok(CommitOutcome::Committed { version })
}

/// Rebinds the stored working copy to `version` unless it holds edits `version` lacks.
/// Such a draft keeps its old base, and its own commit then conflicts.
fn rebind_settled_working_copy(
    txn: &mut StoreTxn<'_>,
    ctx: &ErrorContext,
    version: &Version,
    now: DateTime<Utc>,
) -> ApdResult<()> {
    let settled = match txn.find::<WorkingCopy>(version.document_id.as_str()).within(ctx)? {
        Some(stored) => !stored.has_uncommitted_changes || stored.sections == version.sections,
        None => true,
    };
    if settled {
        txn.put(&WorkingCopy::create_for(version, now)).within(ctx)?;
    }
    Ok(())
}
