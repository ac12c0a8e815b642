//! Export and import of the whole document graph.
//!
//! A [`Bundle`] carries documents with their full version chains, working copies, change
//! logs, tombstones and referenced projects. Import validates the bundle completely
//! before opening the write transaction, then writes everything in that one
//! transaction. Existing records are never overwritten.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ApdError, ApdResult, ErrorContext, Operation, StorageError, StorageResultExt};
use crate::ids::{DocumentId, Id, ProjectId, VersionId};
use crate::local_db_model::{Document, FieldChange, Project, Version, VersionTombstone, WorkingCopy};
use crate::local_db_state::{AppDbState, Index, Record, StoreTxn};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    pub documents: Vec<Document>,
    pub versions: Vec<Version>,
    pub working_copies: Vec<WorkingCopy>,
    pub projects: Vec<Project>,
    #[serde(default)]
    pub field_changes: Vec<FieldChange>,
    #[serde(default)]
    pub tombstones: Vec<VersionTombstone>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollisionPolicy {
    /// Fail the whole import when any incoming id already exists.
    #[default]
    Reject,
    /// Give the whole incoming graph fresh ids when any incoming id already exists.
    Rename,
}

impl FromStr for CollisionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "rename" => Ok(Self::Rename),
            other => Err(format!("unknown collision policy '{other}'")),
        }
    }
}

impl fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject => f.write_str("reject"),
            Self::Rename => f.write_str("rename"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub documents: usize,
    pub versions: usize,
    pub working_copies: usize,
    pub projects: usize,
    pub field_changes: usize,
    pub tombstones: usize,
    /// Incoming id to stored id; empty unless the graph was renamed.
    pub renamed: BTreeMap<String, String>,
}

pub struct BackupService {
    store: Arc<AppDbState>,
}

impl BackupService {
    pub fn new(store: Arc<AppDbState>) -> Self {
        Self { store }
    }

    /// Everything when `document_ids` is `None`; otherwise those documents and the
    /// projects they reference.
    pub fn export(&self, document_ids: Option<&[DocumentId]>) -> ApdResult<Bundle> {
        let ctx = ErrorContext::new(Operation::ExportBackup);
        // A write transaction gives one consistent snapshot across every table.
        let bundle = self.store.transact(&ctx, |txn| {
            let documents: Vec<Document> = match document_ids {
                Some(ids) => ids
                    .iter()
                    .map(|id| {
                        txn.get(id.as_str())
                            .within(&ErrorContext::for_document(Operation::ExportBackup, id))
                    })
                    .collect::<ApdResult<_>>()?,
                None => txn.all().within(&ctx)?,
            };

            let mut bundle = Bundle {
                format_version: FORMAT_VERSION,
                exported_at: Utc::now(),
                documents: Vec::new(),
                versions: Vec::new(),
                working_copies: Vec::new(),
                projects: Vec::new(),
                field_changes: Vec::new(),
                tombstones: Vec::new(),
            };
            for document in &documents {
                let key = document.id.as_str();
                bundle.versions.extend(
                    txn.query_by_index::<Version>(Index::VersionsByDocument, key)
                        .within(&ctx)?,
                );
                bundle
                    .working_copies
                    .extend(txn.find::<WorkingCopy>(key).within(&ctx)?);
                bundle.field_changes.extend(
                    txn.query_by_index::<FieldChange>(Index::FieldChangesByDocument, key)
                        .within(&ctx)?,
                );
                bundle.tombstones.extend(
                    txn.query_by_index::<VersionTombstone>(Index::TombstonesByDocument, key)
                        .within(&ctx)?,
                );
            }

            bundle.projects = match document_ids {
                Some(_) => {
                    let mut seen = HashSet::new();
                    let mut projects = Vec::new();
                    for project_id in documents.iter().filter_map(|d| d.project_id.as_ref()) {
                        if seen.insert(project_id.clone()) {
                            projects.extend(txn.find::<Project>(project_id.as_str()).within(&ctx)?);
                        }
                    }
                    projects
                }
                None => txn.all().within(&ctx)?,
            };
            bundle.documents = documents;
            Ok(bundle)
        })?;

        info!(
            "Exported backup: {} document(s), {} version(s), {} project(s)",
            bundle.documents.len(),
            bundle.versions.len(),
            bundle.projects.len()
        );
        Ok(bundle)
    }

    pub fn import(&self, bundle: Bundle, policy: CollisionPolicy) -> ApdResult<ImportReport> {
        let ctx = ErrorContext::new(Operation::ImportBackup);
        validate(&bundle).map_err(|reason| {
            warn!("Rejected backup bundle: {reason}");
            ApdError::validation(ctx.clone(), reason)
        })?;

        let report = self.store.transact(&ctx, |txn| {
            for project_id in bundle.documents.iter().filter_map(|d| d.project_id.as_ref()) {
                let bundled = bundle.projects.iter().any(|p| &p.id == project_id);
                if !bundled && !txn.contains::<Project>(project_id.as_str()).within(&ctx)? {
                    return Err(ApdError::validation(
                        ctx.clone(),
                        format!("project '{project_id}' is neither bundled nor stored"),
                    ));
                }
            }

            let (bundle, renamed) = match first_collision(txn, &bundle).within(&ctx)? {
                None => (bundle, BTreeMap::new()),
                Some(collision) => match policy {
                    CollisionPolicy::Reject => {
                        return Err(ApdError::validation(
                            ctx.clone(),
                            format!("{collision} already exists in the store"),
                        ))
                    }
                    CollisionPolicy::Rename => {
                        info!("Import collides on {collision}; renaming the incoming graph");
                        let renamer = Renamer::for_bundle(&bundle);
                        (renamer.rename(bundle), renamer.report())
                    }
                },
            };
            let mut report = write_bundle(txn, &ctx, bundle)?;
            report.renamed = renamed;
            Ok(report)
        })?;

        info!(
            "Imported backup: {} document(s), {} version(s), {} renamed id(s)",
            report.documents,
            report.versions,
            report.renamed.len()
        );
        Ok(report)
    }
}

/// Format and referential checks that need nothing but the bundle.
pub fn validate(bundle: &Bundle) -> Result<(), String> {
    if bundle.format_version != FORMAT_VERSION {
        return Err(format!(
            "unsupported format version {} (expected {FORMAT_VERSION})",
            bundle.format_version
        ));
    }

    let documents = unique("document", bundle.documents.iter().map(|d| (&d.id, d)))?;
    let versions = unique("version", bundle.versions.iter().map(|v| (&v.id, v)))?;
    let tombstones = unique(
        "tombstone",
        bundle.tombstones.iter().map(|t| (&t.version_id, t)),
    )?;
    unique("project", bundle.projects.iter().map(|p| (&p.id, p)))?;
    unique("field change", bundle.field_changes.iter().map(|c| (&c.id, c)))?;
    unique(
        "working copy",
        bundle.working_copies.iter().map(|w| (&w.document_id, w)),
    )?;

    for document in &bundle.documents {
        match versions.get(&document.current_version_id) {
            Some(head) if head.document_id == document.id => {}
            Some(_) => {
                return Err(format!(
                    "document '{}' points at a version of another document",
                    document.id
                ))
            }
            None => {
                return Err(format!(
                    "document '{}' points at missing version '{}'",
                    document.id, document.current_version_id
                ))
            }
        }
    }

    // Each link must stay in the document and strictly lower the sequence, so every
    // chain ends at a root or a tombstone without cycles.
    for version in &bundle.versions {
        if !documents.contains_key(&version.document_id) {
            return Err(format!("version '{}' belongs to no bundled document", version.id));
        }
        if tombstones.contains_key(&version.id) {
            return Err(format!("version '{}' is both present and pruned", version.id));
        }
        let (parent_document, parent_sequence) = match &version.parent_version_id {
            None if version.sequence == 0 => continue,
            None => {
                return Err(format!(
                    "root version '{}' has sequence {}",
                    version.id, version.sequence
                ))
            }
            Some(parent_id) => match (versions.get(parent_id), tombstones.get(parent_id)) {
                (Some(parent), _) => (&parent.document_id, parent.sequence),
                (None, Some(pruned)) => (&pruned.document_id, pruned.sequence),
                (None, None) => {
                    return Err(format!(
                        "version '{}' has missing parent '{parent_id}'",
                        version.id
                    ))
                }
            },
        };
        if parent_document != &version.document_id {
            return Err(format!(
                "version '{}' has a parent in another document",
                version.id
            ));
        }
        if parent_sequence >= version.sequence {
            return Err(format!(
                "version '{}' does not follow its parent's sequence",
                version.id
            ));
        }
    }

    for working_copy in &bundle.working_copies {
        match versions.get(&working_copy.base_version_id) {
            Some(base) if base.document_id == working_copy.document_id => {}
            _ => {
                return Err(format!(
                    "working copy of '{}' is bound to an unknown version '{}'",
                    working_copy.document_id, working_copy.base_version_id
                ))
            }
        }
        if !documents.contains_key(&working_copy.document_id) {
            return Err(format!(
                "working copy of '{}' has no bundled document",
                working_copy.document_id
            ));
        }
    }

    for change in &bundle.field_changes {
        if !documents.contains_key(&change.document_id) {
            return Err(format!("field change '{}' has no bundled document", change.id));
        }
        if let Some(version_id) = &change.version_id {
            if !versions.contains_key(version_id) && !tombstones.contains_key(version_id) {
                return Err(format!(
                    "field change '{}' refers to unknown version '{version_id}'",
                    change.id
                ));
            }
        }
    }

    for tombstone in &bundle.tombstones {
        if !documents.contains_key(&tombstone.document_id) {
            return Err(format!(
                "tombstone '{}' has no bundled document",
                tombstone.version_id
            ));
        }
    }
    Ok(())
}

fn unique<'a, K, V>(
    what: &str,
    entries: impl Iterator<Item = (&'a K, &'a V)>,
) -> Result<HashMap<&'a K, &'a V>, String>
where
    K: Eq + Hash + fmt::Display + 'a,
    V: 'a,
{
    let mut map = HashMap::new();
    for (key, value) in entries {
        if map.insert(key, value).is_some() {
            return Err(format!("duplicate {what} id '{key}'"));
        }
    }
    Ok(map)
}

fn first_collision(
    txn: &StoreTxn<'_>,
    bundle: &Bundle,
) -> Result<Option<String>, StorageError> {
    fn check<R: Record>(
        txn: &StoreTxn<'_>,
        what: &str,
        keys: impl IntoIterator<Item = String>,
    ) -> Result<Option<String>, StorageError> {
        for key in keys {
            if txn.contains::<R>(&key)? {
                return Ok(Some(format!("{what} '{key}'")));
            }
        }
        Ok(None)
    }

    let found = check::<Document>(txn, "document", bundle.documents.iter().map(|d| d.key()))?
        .or(check::<Version>(txn, "version", bundle.versions.iter().map(|v| v.key()))?)
        .or(check::<WorkingCopy>(
            txn,
            "working copy",
            bundle.documents.iter().map(|d| d.key()),
        )?)
        .or(check::<Project>(txn, "project", bundle.projects.iter().map(|p| p.key()))?)
        .or(check::<FieldChange>(
            txn,
            "field change",
            bundle.field_changes.iter().map(|c| c.key()),
        )?)
        .or(check::<VersionTombstone>(
            txn,
            "tombstone",
            bundle.tombstones.iter().map(|t| t.key()),
        )?);
    Ok(found)
}

/// Fresh ids for one incoming graph, applied consistently to every reference.
struct Renamer {
    documents: HashMap<DocumentId, DocumentId>,
    versions: HashMap<VersionId, VersionId>,
    projects: HashMap<ProjectId, ProjectId>,
}

impl Renamer {
    fn for_bundle(bundle: &Bundle) -> Self {
        fn fresh<T>(ids: impl Iterator<Item = Id<T>>) -> HashMap<Id<T>, Id<T>>
        where
            Id<T>: Eq + Hash,
        {
            ids.map(|id| (id, Id::generate())).collect()
        }

        Self {
            documents: fresh(bundle.documents.iter().map(|d| d.id.clone())),
            versions: fresh(
                bundle
                    .versions
                    .iter()
                    .map(|v| v.id.clone())
                    .chain(bundle.tombstones.iter().map(|t| t.version_id.clone())),
            ),
            projects: fresh(bundle.projects.iter().map(|p| p.id.clone())),
        }
    }

    fn rename(&self, mut bundle: Bundle) -> Bundle {
        fn map<T>(table: &HashMap<Id<T>, Id<T>>, id: &mut Id<T>)
        where
            Id<T>: Eq + Hash + Clone,
        {
            if let Some(fresh) = table.get(id) {
                *id = fresh.clone();
            }
        }

        for document in &mut bundle.documents {
            map(&self.documents, &mut document.id);
            map(&self.versions, &mut document.current_version_id);
            if let Some(project_id) = &mut document.project_id {
                map(&self.projects, project_id);
            }
        }
        for version in &mut bundle.versions {
            map(&self.versions, &mut version.id);
            map(&self.documents, &mut version.document_id);
            if let Some(parent) = &mut version.parent_version_id {
                map(&self.versions, parent);
            }
        }
        for working_copy in &mut bundle.working_copies {
            map(&self.documents, &mut working_copy.document_id);
            map(&self.versions, &mut working_copy.base_version_id);
            for change in &mut working_copy.pending_changes {
                change.id = Id::generate();
                map(&self.documents, &mut change.document_id);
            }
        }
        for project in &mut bundle.projects {
            map(&self.projects, &mut project.id);
        }
        for change in &mut bundle.field_changes {
            change.id = Id::generate();
            map(&self.documents, &mut change.document_id);
            if let Some(version_id) = &mut change.version_id {
                map(&self.versions, version_id);
            }
        }
        for tombstone in &mut bundle.tombstones {
            map(&self.versions, &mut tombstone.version_id);
            map(&self.documents, &mut tombstone.document_id);
        }
        bundle
    }

    fn report(&self) -> BTreeMap<String, String> {
        let documents = self.documents.iter().map(|(a, b)| (a.to_string(), b.to_string()));
        let versions = self.versions.iter().map(|(a, b)| (a.to_string(), b.to_string()));
        let projects = self.projects.iter().map(|(a, b)| (a.to_string(), b.to_string()));
        documents.chain(versions).chain(projects).collect()
    }
}

fn write_bundle(
    txn: &mut StoreTxn<'_>,
    ctx: &ErrorContext,
    bundle: Bundle,
) -> ApdResult<ImportReport> {
    let mut report = ImportReport {
        documents: bundle.documents.len(),
        versions: bundle.versions.len(),
        working_copies: bundle.working_copies.len(),
        projects: bundle.projects.len(),
        field_changes: bundle.field_changes.len(),
        tombstones: bundle.tombstones.len(),
        renamed: BTreeMap::new(),
    };

    for project in &bundle.projects {
        txn.put(project).within(ctx)?;
    }
    for version in &bundle.versions {
        txn.put(version).within(ctx)?;
    }
    for document in &bundle.documents {
        txn.put(document).within(ctx)?;
    }
    for working_copy in &bundle.working_copies {
        txn.put(working_copy).within(ctx)?;
    }
    // Every document needs a working copy; give the ones without a clean draft at head.
    let now = Utc::now();
    for document in &bundle.documents {
        if !bundle.working_copies.iter().any(|w| w.document_id == document.id) {
            let head: Version = txn.get(document.current_version_id.as_str()).within(ctx)?;
            txn.put(&WorkingCopy::create_for(&head, now)).within(ctx)?;
            report.working_copies += 1;
        }
    }
    for change in &bundle.field_changes {
        txn.put(change).within(ctx)?;
    }
    for tombstone in &bundle.tombstones {
        txn.put(tombstone).within(ctx)?;
    }
    Ok(report)
}
