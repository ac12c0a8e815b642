//! Error taxonomy.
//!
//! [`StorageError`] is what the persistent store reports; [`ApdError`] is what every
//! domain operation returns. The conversion attaches an [`ErrorContext`] (operation and
//! document) so callers can render a message and offer retry or dismiss.

use std::fmt;

use thiserror::Error;

use crate::ids::{DocumentId, VersionId};
use crate::local_db_state::Table;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no record with key '{key}' in {table}")]
    NotFound { table: Table, key: String },
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
    #[error("corrupt data at {location}: {reason}")]
    Corrupt { location: String, reason: String },
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn in_context(self, context: ErrorContext) -> ApdError {
        match self {
            Self::NotFound { table, key } => ApdError::NotFound {
                context,
                what: format!("{table} '{key}'"),
            },
            Self::QuotaExceeded(detail) => ApdError::QuotaExceeded { context, detail },
            Self::TransactionAborted(detail) => ApdError::TransientStorage { context, detail },
            Self::Io(err) => ApdError::TransientStorage {
                context,
                detail: err.to_string(),
            },
            corrupt @ Self::Corrupt { .. } => ApdError::CorruptData {
                context,
                detail: corrupt.to_string(),
            },
        }
    }
}

impl From<lmdb::Error> for StorageError {
    fn from(err: lmdb::Error) -> Self {
        use lmdb::Error as E;
        match err {
            E::MapFull | E::TxnFull | E::PageFull | E::DbsFull => {
                Self::QuotaExceeded(err.to_string())
            }
            E::Corrupted | E::PageNotFound | E::Panic | E::VersionMismatch | E::Invalid => {
                Self::Corrupt {
                    location: "environment".to_owned(),
                    reason: err.to_string(),
                }
            }
            _ => Self::TransactionAborted(err.to_string()),
        }
    }
}

/// What was being attempted when an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    OpenStore,
    CreateDocument,
    GetDocument,
    ListDocuments,
    CreateProject,
    ListProjects,
    GetWorkingCopy,
    ApplyFieldEdit,
    Commit,
    Discard,
    Reload,
    Overwrite,
    GetVersion,
    GetHistory,
    Revert,
    FieldChanges,
    ExportBackup,
    ImportBackup,
    QuotaCheck,
    Cleanup,
    AutoSave,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenStore => "open store",
            Self::CreateDocument => "create document",
            Self::GetDocument => "get document",
            Self::ListDocuments => "list documents",
            Self::CreateProject => "create project",
            Self::ListProjects => "list projects",
            Self::GetWorkingCopy => "get working copy",
            Self::ApplyFieldEdit => "apply field edit",
            Self::Commit => "commit",
            Self::Discard => "discard",
            Self::Reload => "reload",
            Self::Overwrite => "overwrite",
            Self::GetVersion => "get version",
            Self::GetHistory => "get history",
            Self::Revert => "revert",
            Self::FieldChanges => "field changes",
            Self::ExportBackup => "export backup",
            Self::ImportBackup => "import backup",
            Self::QuotaCheck => "quota check",
            Self::Cleanup => "cleanup",
            Self::AutoSave => "auto-save",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: Operation,
    pub document_id: Option<DocumentId>,
}

impl ErrorContext {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            document_id: None,
        }
    }

    pub fn for_document(operation: Operation, document_id: &DocumentId) -> Self {
        Self {
            operation,
            document_id: Some(document_id.clone()),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.document_id {
            Some(document_id) => write!(f, "{} (document {document_id})", self.operation),
            None => write!(f, "{}", self.operation),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    QuotaExceeded,
    TransientStorage,
    CorruptData,
}

#[derive(Debug, Error)]
pub enum ApdError {
    #[error("{context}: not found: {what}")]
    NotFound { context: ErrorContext, what: String },
    #[error("{context}: invalid data: {reason}")]
    Validation { context: ErrorContext, reason: String },
    #[error("{context}: working copy is based on version {base_version_id} but the document is at {current_version_id}")]
    Conflict {
        context: ErrorContext,
        base_version_id: VersionId,
        current_version_id: VersionId,
    },
    #[error("{context}: storage quota exceeded: {detail}")]
    QuotaExceeded { context: ErrorContext, detail: String },
    #[error("{context}: transient storage failure: {detail}")]
    TransientStorage { context: ErrorContext, detail: String },
    #[error("{context}: stored data is corrupt: {detail}")]
    CorruptData { context: ErrorContext, detail: String },
}

impl ApdError {
    pub fn validation(context: ErrorContext, reason: impl Into<String>) -> Self {
        Self::Validation {
            context,
            reason: reason.into(),
        }
    }

    pub fn not_found(context: ErrorContext, what: impl Into<String>) -> Self {
        Self::NotFound {
            context,
            what: what.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::TransientStorage { .. } => ErrorKind::TransientStorage,
            Self::CorruptData { .. } => ErrorKind::CorruptData,
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::NotFound { context, .. }
            | Self::Validation { context, .. }
            | Self::Conflict { context, .. }
            | Self::QuotaExceeded { context, .. }
            | Self::TransientStorage { context, .. }
            | Self::CorruptData { context, .. } => context,
        }
    }

    /// Only transient storage failures are worth retrying automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStorage { .. })
    }
}

pub type ApdResult<T> = Result<T, ApdError>;

/// Attaches an [`ErrorContext`] to storage results: `store.get(..).within(&ctx)?`.
pub trait StorageResultExt<T> {
    fn within(self, context: &ErrorContext) -> ApdResult<T>;
}

impl<T> StorageResultExt<T> for Result<T, StorageError> {
    fn within(self, context: &ErrorContext) -> ApdResult<T> {
        self.map_err(|err| err.in_context(context.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lmdb_map_full_is_quota() {
        let err = StorageError::from(lmdb::Error::MapFull);
        assert!(matches!(err, StorageError::QuotaExceeded(_)));
    }

    #[test]
    fn lmdb_corruption_is_fatal_and_bad_txn_is_retryable() {
        let corrupt = StorageError::from(lmdb::Error::Corrupted)
            .in_context(ErrorContext::new(Operation::GetDocument));
        assert_eq!(corrupt.kind(), ErrorKind::CorruptData);
        assert!(!corrupt.is_retryable());

        let aborted = StorageError::from(lmdb::Error::BadTxn)
            .in_context(ErrorContext::new(Operation::Commit));
        assert_eq!(aborted.kind(), ErrorKind::TransientStorage);
        assert!(aborted.is_retryable());
    }

    #[test]
    fn context_names_document_and_operation() {
        let document_id = DocumentId::new("apd-1").expect("id");
        let err = ApdError::validation(
            ErrorContext::for_document(Operation::ApplyFieldEdit, &document_id),
            "bad path",
        );
        assert_eq!(
            err.to_string(),
            "apply field edit (document apd-1): invalid data: bad path"
        );
    }
}
