//! # Offline APD Core
//!
//! A versioned local document store for authoring Advance Planning Documents (APDs)
//! offline. Built on LMDB and designed for FFI integration with Flutter and other
//! cross-platform hosts, with a plain Rust API for everything else.
//!
//! ## Features
//!
//! - **Immutable version history**: every commit is a full snapshot with a parent link
//! - **Working copies**: one mutable draft per document, committed with optimistic
//!   concurrency against the head version
//! - **Field-level change tracking**: structural diffs between snapshots with readable
//!   labels, logged per commit
//! - **Auto-save**: debounced, retried background commits with per-document status
//!   subscriptions (Rust API only)
//! - **Backups**: self-contained JSON bundles with referential validation on import
//! - **Quota monitoring**: usage estimates and retention cleanup that never touches a
//!   head or a working copy's base
//!
//! ## Quick Start
//!
//! ```no_run
//! use offline_apd_core::{DocumentKind, DocumentService, NewDocument, StoreConfig};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), offline_apd_core::ApdError> {
//! let service = DocumentService::open(&StoreConfig::at("drafts.lmdb"))?;
//! let document = service.create_document(NewDocument::new(DocumentKind::Papd, "FY25 PAPD"))?;
//!
//! service.apply_field_edit(&document.id, "executive-summary", "summary", json!("Draft"))?;
//! let outcome = service.commit(&document.id, Some("First draft".to_owned()))?;
//! println!("head is now {}", outcome.head_version_id());
//! # Ok(())
//! # }
//! ```
//!
//! ## FFI Functions
//!
//! Every function except [`create_store`], [`create_store_with_config`] and
//! [`free_response`] returns a JSON-encoded [`AppResponse`] C string that must be released
//! with [`free_response`].
//!
//! - [`create_store`] / [`create_store_with_config`] - Open a store
//! - [`create_project`] / [`list_projects`]
//! - [`create_document`] / [`get_document`] / [`list_documents`]
//! - [`get_working_copy`] / [`apply_field_edit`] / [`discard_changes`]
//! - [`commit_document`] / [`reload_document`] / [`overwrite_document`]
//! - [`get_history`] / [`get_version`] / [`revert_document`] / [`get_field_changes`]
//! - [`export_backup`] / [`import_backup`]
//! - [`check_quota`] / [`run_cleanup`]
//! - [`close_store`] - Flush and release the store

pub mod autosave;
pub mod backup;
pub mod change_tracker;
pub mod config;
pub mod error;
pub mod field_path;
pub mod ids;
pub mod local_db_model;
pub mod local_db_state;
pub mod quota;
pub mod service;
pub mod version_repository;
pub mod working_copy;
mod app_response;

pub use crate::app_response::AppResponse;
pub use crate::autosave::{
    AutoSaveHandle, AutoSaveScheduler, ConflictResolution, DocumentSaver, SaveState,
    SaveStatusEvent, Unsubscribe,
};
pub use crate::backup::{Bundle, CollisionPolicy, ImportReport};
pub use crate::config::{AutoSaveConfig, RetentionPolicy, StoreConfig};
pub use crate::error::{ApdError, ApdResult, ErrorKind};
pub use crate::field_path::FieldPath;
pub use crate::ids::{DocumentId, FieldChangeId, ProjectId, VersionId};
pub use crate::local_db_model::{
    ChangeType, Document, DocumentKind, FieldChange, Project, Sections, Version,
    VersionTombstone, WorkingCopy,
};
pub use crate::quota::{CleanupReport, QuotaReport};
pub use crate::service::DocumentService;
pub use crate::version_repository::{CommitOutcome, NewDocument};

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::Id;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldEditRequest {
    document_id: DocumentId,
    section_id: String,
    field_path: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitRequest {
    document_id: DocumentId,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevertRequest {
    document_id: DocumentId,
    target_version_id: VersionId,
}

/// Opens (or creates) the store `<name>.lmdb` in the current directory.
///
/// # Parameters
///
/// * `name` - A null-terminated C string containing the store name
///
/// # Returns
///
/// Returns a pointer to the [`DocumentService`] on success, or a null pointer on failure.
/// The pointer must eventually be passed to [`close_store`].
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use offline_apd_core::create_store;
///
/// let name = CString::new("apd_drafts").unwrap();
/// let store = create_store(name.as_ptr());
///
/// if !store.is_null() {
///     // Store opened successfully
/// }
/// ```
///
/// # Errors
///
/// Returns null pointer if:
/// - Input name pointer is null
/// - Input string contains invalid UTF-8
/// - The LMDB environment cannot be opened
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_store(name: *const c_char) -> *mut DocumentService {
    if name.is_null() {
        warn!("Null name pointer passed to create_store");
        return std::ptr::null_mut();
    }

    let name_str = match unsafe { CStr::from_ptr(name).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in name parameter: {e}");
            return std::ptr::null_mut();
        }
    };

    open_service(&StoreConfig::named(name_str))
}

/// Opens a store from a JSON [`StoreConfig`], e.g. `{"path": "/data/apd.lmdb"}`.
///
/// Omitted fields take their defaults. Returns a null pointer on any failure.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_store_with_config(config_json: *const c_char) -> *mut DocumentService {
    if config_json.is_null() {
        warn!("Null config pointer passed to create_store_with_config");
        return std::ptr::null_mut();
    }

    let config_str = match unsafe { CStr::from_ptr(config_json).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in config parameter: {e}");
            return std::ptr::null_mut();
        }
    };

    match serde_json::from_str::<StoreConfig>(config_str) {
        Ok(config) => open_service(&config),
        Err(e) => {
            warn!("Invalid store config: {e}");
            std::ptr::null_mut()
        }
    }
}

fn open_service(config: &StoreConfig) -> *mut DocumentService {
    info!("Attempting to open store at: {}", config.path.display());
    match DocumentService::open(config) {
        Ok(service) => {
            info!("Store initialized successfully");
            Box::into_raw(Box::new(service))
        }
        Err(e) => {
            warn!("Failed to initialize store: {e}");
            warn!("Attempted path: {}", config.path.display());
            std::ptr::null_mut()
        }
    }
}

/// Creates a project from `{"name": "...", "description": "..."}`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_project(
    state: *mut DocumentService,
    json_ptr: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "create_project") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let request: ProjectRequest = match parse_json(json_ptr, "project JSON") {
        Ok(request) => request,
        Err(err) => return err,
    };
    respond(service.create_project(&request.name, request.description))
}

/// Returns every project, oldest first.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn list_projects(state: *mut DocumentService) -> *const c_char {
    let service = match service_ref(state, "list_projects") {
        Ok(service) => service,
        Err(err) => return err,
    };
    respond(service.list_projects())
}

/// Creates a document with its root version and a clean working copy.
///
/// # JSON Format
///
/// ```json
/// {
///   "id": "optional-id",
///   "kind": "PAPD",
///   "name": "FY25 PAPD",
///   "projectId": "optional-project-id",
///   "metadata": {},
///   "sections": { "executive-summary": { "summary": "" } }
/// }
/// ```
///
/// Returns the created [`Document`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_document(
    state: *mut DocumentService,
    json_ptr: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "create_document") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let new: NewDocument = match parse_json(json_ptr, "document JSON") {
        Ok(new) => new,
        Err(err) => return err,
    };
    respond(service.create_document(new))
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_document(
    state: *mut DocumentService,
    document_id: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "get_document") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let document_id: DocumentId = match parse_id(document_id, "document id") {
        Ok(id) => id,
        Err(err) => return err,
    };
    respond(service.get_document(&document_id))
}

/// Lists documents, most recently updated first.
///
/// `project_id` may be null to list every document.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn list_documents(
    state: *mut DocumentService,
    project_id: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "list_documents") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let project_id: Option<ProjectId> = if project_id.is_null() {
        None
    } else {
        match parse_id(project_id, "project id") {
            Ok(id) => Some(id),
            Err(err) => return err,
        }
    };
    respond(service.list_documents(project_id.as_ref()))
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_working_copy(
    state: *mut DocumentService,
    document_id: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "get_working_copy") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let document_id: DocumentId = match parse_id(document_id, "document id") {
        Ok(id) => id,
        Err(err) => return err,
    };
    respond(service.get_working_copy(&document_id))
}

/// Writes one field of a document's working copy.
///
/// # JSON Format
///
/// ```json
/// {
///   "documentId": "apd-1",
///   "sectionId": "executive-summary",
///   "fieldPath": "summary",
///   "value": "Draft Summary"
/// }
/// ```
///
/// Returns the recorded [`FieldChange`], or `null` when the value was already in place.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn apply_field_edit(
    state: *mut DocumentService,
    json_ptr: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "apply_field_edit") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let request: FieldEditRequest = match parse_json(json_ptr, "edit JSON") {
        Ok(request) => request,
        Err(err) => return err,
    };
    respond(service.apply_field_edit(
        &request.document_id,
        &request.section_id,
        &request.field_path,
        request.value,
    ))
}

/// Commits the working copy: `{"documentId": "apd-1", "message": "optional"}`.
///
/// Returns a [`CommitOutcome`]. A stale working copy yields a `Conflict` response and
/// is left untouched.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn commit_document(
    state: *mut DocumentService,
    json_ptr: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "commit_document") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let request: CommitRequest = match parse_json(json_ptr, "commit JSON") {
        Ok(request) => request,
        Err(err) => return err,
    };
    respond(service.commit(&request.document_id, request.message))
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn discard_changes(
    state: *mut DocumentService,
    document_id: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "discard_changes") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let document_id: DocumentId = match parse_id(document_id, "document id") {
        Ok(id) => id,
        Err(err) => return err,
    };
    respond(service.discard(&document_id))
}

/// Resolves a conflict by dropping the draft and continuing from the head version.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn reload_document(
    state: *mut DocumentService,
    document_id: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "reload_document") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let document_id: DocumentId = match parse_id(document_id, "document id") {
        Ok(id) => id,
        Err(err) => return err,
    };
    respond(service.reload(&document_id))
}

/// Resolves a conflict by rebasing the draft onto the head version.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn overwrite_document(
    state: *mut DocumentService,
    document_id: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "overwrite_document") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let document_id: DocumentId = match parse_id(document_id, "document id") {
        Ok(id) => id,
        Err(err) => return err,
    };
    respond(service.overwrite(&document_id))
}

/// Returns the document's versions, newest first.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_history(
    state: *mut DocumentService,
    document_id: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "get_history") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let document_id: DocumentId = match parse_id(document_id, "document id") {
        Ok(id) => id,
        Err(err) => return err,
    };
    respond(service.get_history(&document_id))
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_version(
    state: *mut DocumentService,
    version_id: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "get_version") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let version_id: VersionId = match parse_id(version_id, "version id") {
        Ok(id) => id,
        Err(err) => return err,
    };
    respond(service.get_version(&version_id))
}

/// Restores an earlier version as a new commit:
/// `{"documentId": "apd-1", "targetVersionId": "..."}`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn revert_document(
    state: *mut DocumentService,
    json_ptr: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "revert_document") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let request: RevertRequest = match parse_json(json_ptr, "revert JSON") {
        Ok(request) => request,
        Err(err) => return err,
    };
    respond(service.revert(&request.document_id, &request.target_version_id))
}

/// Returns the committed field change log of a document, oldest first.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_field_changes(
    state: *mut DocumentService,
    document_id: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "get_field_changes") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let document_id: DocumentId = match parse_id(document_id, "document id") {
        Ok(id) => id,
        Err(err) => return err,
    };
    respond(service.field_changes(&document_id))
}

/// Exports a backup [`Bundle`].
///
/// `ids_json` is a JSON array of document ids, or null to export everything.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn export_backup(
    state: *mut DocumentService,
    ids_json: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "export_backup") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let ids: Option<Vec<DocumentId>> = if ids_json.is_null() {
        None
    } else {
        match parse_json(ids_json, "document ids JSON") {
            Ok(ids) => Some(ids),
            Err(err) => return err,
        }
    };
    respond(service.export_backup(ids.as_deref()))
}

/// Imports a backup [`Bundle`].
///
/// `policy` is `"reject"` or `"rename"`; null means `"reject"`. Returns an
/// [`ImportReport`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn import_backup(
    state: *mut DocumentService,
    bundle_json: *const c_char,
    policy: *const c_char,
) -> *const c_char {
    let service = match service_ref(state, "import_backup") {
        Ok(service) => service,
        Err(err) => return err,
    };
    let bundle: Bundle = match parse_json(bundle_json, "bundle JSON") {
        Ok(bundle) => bundle,
        Err(err) => return err,
    };
    let policy = if policy.is_null() {
        CollisionPolicy::default()
    } else {
        let policy_str = match c_ptr_to_string(policy, "policy") {
            Ok(s) => s,
            Err(err) => return err,
        };
        match policy_str.parse::<CollisionPolicy>() {
            Ok(policy) => policy,
            Err(e) => return response_to_c_string(&AppResponse::BadRequest(e)),
        }
    };
    respond(service.import_backup(bundle, policy))
}

/// Reports estimated storage usage against the retention threshold.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn check_quota(state: *mut DocumentService) -> *const c_char {
    let service = match service_ref(state, "check_quota") {
        Ok(service) => service,
        Err(err) => return err,
    };
    respond(service.quota().check())
}

/// Runs retention cleanup now, regardless of usage.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn run_cleanup(state: *mut DocumentService) -> *const c_char {
    let service = match service_ref(state, "run_cleanup") {
        Ok(service) => service,
        Err(err) => return err,
    };
    respond(service.quota().cleanup())
}

/// Flushes and closes the store, releasing the pointer returned by [`create_store`].
///
/// # Safety
///
/// `state` must come from [`create_store`] or [`create_store_with_config`] and must not
/// be used again after this call.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_store(state: *mut DocumentService) -> *const c_char {
    if state.is_null() {
        let error = AppResponse::BadRequest("Null state pointer passed to close_store".to_string());
        return response_to_c_string(&error);
    }

    let service = unsafe { Box::from_raw(state) };

    match service.close() {
        Ok(()) => response_to_c_string(&AppResponse::success("Store closed successfully")),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Releases a response string returned by any other function of this library.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_response(ptr: *const c_char) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(ptr as *mut c_char));
    }
}

fn service_ref<'a>(
    state: *mut DocumentService,
    function: &str,
) -> Result<&'a DocumentService, *const c_char> {
    match unsafe { state.as_ref() } {
        Some(service) => Ok(service),
        None => {
            let error = AppResponse::BadRequest(format!("Null state pointer passed to {function}"));
            Err(response_to_c_string(&error))
        }
    }
}

fn respond<T: Serialize>(result: ApdResult<T>) -> *const c_char {
    match result {
        Ok(value) => response_to_c_string(&AppResponse::json(&value)),
        Err(e) => {
            warn!("{e}");
            response_to_c_string(&AppResponse::from(e))
        }
    }
}

fn parse_json<T: DeserializeOwned>(
    ptr: *const c_char,
    field_name: &str,
) -> Result<T, *const c_char> {
    let json_str = c_ptr_to_string(ptr, field_name)?;
    serde_json::from_str(&json_str).map_err(|e| {
        let error = AppResponse::SerializationError(format!("Invalid {field_name}: {e}"));
        response_to_c_string(&error)
    })
}

fn parse_id<T>(ptr: *const c_char, field_name: &str) -> Result<Id<T>, *const c_char> {
    let id_str = c_ptr_to_string(ptr, field_name)?;
    Id::new(id_str).map_err(|e| {
        let error = AppResponse::BadRequest(format!("Invalid {field_name}: {e}"));
        response_to_c_string(&error)
    })
}

/// Converts an [`AppResponse`] to a C-compatible string.
///
/// The returned pointer must be released with [`free_response`]. Null when the response
/// cannot be represented as a C string.
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

/// Converts a C string pointer to a Rust String, answering null pointers and invalid UTF-8
/// with a ready-made `BadRequest` response.
fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, *const c_char> {
    if ptr.is_null() {
        let error = AppResponse::BadRequest(format!("Null {field_name} pointer"));
        return Err(response_to_c_string(&error));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => {
            let error = AppResponse::BadRequest(format!("Invalid UTF-8 in {field_name}: {e}"));
            Err(response_to_c_string(&error))
        }
    }
}
