//! One explicit entry point over an open store.
//!
//! Construct a [`DocumentService`] at startup and pass it where it is needed; tests build
//! one per temporary directory. Edits made through the service notify the attached
//! auto-save scheduler, if any.

use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use serde_json::Value;

use crate::autosave::{AutoSaveHandle, AutoSaveScheduler, SaveStatusEvent, Unsubscribe};
use crate::backup::{BackupService, Bundle, CollisionPolicy, ImportReport};
use crate::config::{AutoSaveConfig, RetentionPolicy, StoreConfig};
use crate::error::{ApdError, ApdResult, ErrorContext, Operation, StorageResultExt};
use crate::ids::{DocumentId, ProjectId, VersionId};
use crate::local_db_model::{Document, FieldChange, Project, Version, WorkingCopy};
use crate::local_db_state::AppDbState;
use crate::quota::QuotaMonitor;
use crate::version_repository::{CommitOutcome, NewDocument, VersionRepository};
use crate::working_copy::WorkingCopyManager;

pub struct DocumentService {
    store: Arc<AppDbState>,
    repository: VersionRepository,
    working_copies: Arc<WorkingCopyManager>,
    backup: BackupService,
    quota: Arc<QuotaMonitor>,
    autosave: Option<AutoSaveHandle>,
}

impl DocumentService {
    pub fn open(config: &StoreConfig) -> ApdResult<Self> {
        let store = AppDbState::open(config).within(&ErrorContext::new(Operation::OpenStore))?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn new(store: Arc<AppDbState>) -> Self {
        let repository = VersionRepository::new(Arc::clone(&store));
        Self {
            working_copies: Arc::new(WorkingCopyManager::new(repository.clone())),
            backup: BackupService::new(Arc::clone(&store)),
            quota: Arc::new(QuotaMonitor::new(
                Arc::clone(&store),
                RetentionPolicy::default(),
            )),
            repository,
            store,
            autosave: None,
        }
    }

    pub fn with_retention(mut self, policy: RetentionPolicy) -> Self {
        self.quota = Arc::new(QuotaMonitor::new(Arc::clone(&self.store), policy));
        self
    }

    /// Starts an auto-save scheduler for this store. Must be called inside a Tokio runtime.
    pub fn enable_autosave(&mut self, config: AutoSaveConfig) -> AutoSaveHandle {
        let handle = AutoSaveScheduler::spawn(Arc::clone(&self.working_copies), config);
        self.autosave = Some(handle.clone());
        handle
    }

    pub fn autosave(&self) -> Option<&AutoSaveHandle> {
        self.autosave.as_ref()
    }

    pub fn store(&self) -> &Arc<AppDbState> {
        &self.store
    }

    pub fn quota(&self) -> &Arc<QuotaMonitor> {
        &self.quota
    }

    pub fn working_copies(&self) -> &WorkingCopyManager {
        &self.working_copies
    }

    pub fn repository(&self) -> &VersionRepository {
        &self.repository
    }

    pub fn create_document(&self, new: NewDocument) -> ApdResult<Document> {
        self.repository.create_document(new)
    }

    pub fn get_document(&self, document_id: &DocumentId) -> ApdResult<Document> {
        self.repository.get_document(document_id)
    }

    pub fn list_documents(&self, project_id: Option<&ProjectId>) -> ApdResult<Vec<Document>> {
        self.repository.list_documents(project_id)
    }

    pub fn create_project(&self, name: &str, description: Option<String>) -> ApdResult<Project> {
        let ctx = ErrorContext::new(Operation::CreateProject);
        if name.trim().is_empty() {
            return Err(ApdError::validation(ctx, "project name must not be empty"));
        }
        let now = Utc::now();
        let project = Project {
            id: ProjectId::generate(),
            name: name.to_owned(),
            description,
            created_at: now,
            updated_at: now,
        };
        self.store.put(&project).within(&ctx)?;
        info!("Created project {} ({})", project.id, project.name);
        Ok(project)
    }

    /// Oldest first.
    pub fn list_projects(&self) -> ApdResult<Vec<Project>> {
        let ctx = ErrorContext::new(Operation::ListProjects);
        let mut projects: Vec<Project> = self.store.all().within(&ctx)?;
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }

    pub fn get_working_copy(&self, document_id: &DocumentId) -> ApdResult<WorkingCopy> {
        self.working_copies.get_working_copy(document_id)
    }

    pub fn apply_field_edit(
        &self,
        document_id: &DocumentId,
        section: &str,
        field_path: &str,
        value: Value,
    ) -> ApdResult<Option<FieldChange>> {
        let change = self
            .working_copies
            .apply_field_edit(document_id, section, field_path, value)?;
        if let (Some(_), Some(autosave)) = (&change, &self.autosave) {
            autosave.notify_mutation(document_id);
        }
        Ok(change)
    }

    pub fn commit(
        &self,
        document_id: &DocumentId,
        message: Option<String>,
    ) -> ApdResult<CommitOutcome> {
        self.working_copies.commit(document_id, message)
    }

    pub fn discard(&self, document_id: &DocumentId) -> ApdResult<WorkingCopy> {
        self.working_copies.discard(document_id)
    }

    pub fn reload(&self, document_id: &DocumentId) -> ApdResult<WorkingCopy> {
        self.working_copies.reload(document_id)
    }

    pub fn overwrite(&self, document_id: &DocumentId) -> ApdResult<WorkingCopy> {
        self.working_copies.overwrite(document_id)
    }

    pub fn get_version(&self, version_id: &VersionId) -> ApdResult<Version> {
        self.repository.get_version(version_id)
    }

    pub fn get_history(&self, document_id: &DocumentId) -> ApdResult<Vec<Version>> {
        self.repository.get_history(document_id)
    }

    pub fn revert(
        &self,
        document_id: &DocumentId,
        target_version_id: &VersionId,
    ) -> ApdResult<CommitOutcome> {
        self.repository.revert(document_id, target_version_id)
    }

    pub fn field_changes(&self, document_id: &DocumentId) -> ApdResult<Vec<FieldChange>> {
        self.repository.field_changes(document_id)
    }

    pub fn export_backup(&self, document_ids: Option<&[DocumentId]>) -> ApdResult<Bundle> {
        self.backup.export(document_ids)
    }

    pub fn import_backup(
        &self,
        bundle: Bundle,
        policy: CollisionPolicy,
    ) -> ApdResult<ImportReport> {
        self.backup.import(bundle, policy)
    }

    /// Save-status updates for one document. Needs [`DocumentService::enable_autosave`].
    pub fn subscribe(
        &self,
        document_id: &DocumentId,
        callback: impl Fn(&SaveStatusEvent) + Send + Sync + 'static,
    ) -> ApdResult<Unsubscribe> {
        match &self.autosave {
            Some(autosave) => Ok(autosave.subscribe(document_id, callback)),
            None => Err(ApdError::validation(
                ErrorContext::for_document(Operation::AutoSave, document_id),
                "auto-save is not enabled",
            )),
        }
    }

    /// Saves pending drafts through the scheduler, then flushes and closes the store.
    pub async fn shutdown(self) -> ApdResult<()> {
        if let Some(autosave) = &self.autosave {
            autosave.shutdown().await;
        }
        self.close()
    }

    /// Flushes and closes the store. Pending auto-saves are not waited for.
    pub fn close(self) -> ApdResult<()> {
        let ctx = ErrorContext::new(Operation::OpenStore);
        let Self {
            store,
            repository,
            working_copies,
            backup,
            quota,
            autosave,
        } = self;
        drop((repository, working_copies, backup, quota, autosave));
        match Arc::try_unwrap(store) {
            Ok(store) => store.close_database().within(&ctx),
            Err(shared) => {
                warn!("Store is still shared; flushing instead of closing");
                shared.flush().within(&ctx)
            }
        }
    }
}
