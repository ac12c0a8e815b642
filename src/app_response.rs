use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeError;

use crate::error::{ApdError, StorageError};

/// Envelope of every FFI response, serialized as `{"Variant": "payload"}`.
///
/// `Ok` carries the JSON of the result; every other variant carries a human-readable
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppResponse {
    DatabaseError(String),
    SerializationError(String),
    NotFound(String),
    ValidationError(String),
    BadRequest(String),
    Conflict(String),
    QuotaExceeded(String),
    TransientStorageError(String),
    CorruptData(String),
    Ok(String),
}

impl Display for AppResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AppResponse::DatabaseError(msg) => write!(f, "Database error: {msg}"),
            AppResponse::SerializationError(msg) => write!(f, "Serialization error: {msg}"),
            AppResponse::NotFound(msg) => write!(f, "Not found: {msg}"),
            AppResponse::ValidationError(msg) => write!(f, "Validation error: {msg}"),
            AppResponse::BadRequest(msg) => write!(f, "Bad Request: {msg}"),
            AppResponse::Conflict(msg) => write!(f, "Conflict: {msg}"),
            AppResponse::QuotaExceeded(msg) => write!(f, "Quota exceeded: {msg}"),
            AppResponse::TransientStorageError(msg) => write!(f, "Transient storage error: {msg}"),
            AppResponse::CorruptData(msg) => write!(f, "Corrupt data: {msg}"),
            AppResponse::Ok(msg) => write!(f, "Ok: {msg}"),
        }
    }
}

impl From<ApdError> for AppResponse {
    fn from(err: ApdError) -> Self {
        let msg = err.to_string();
        match err {
            ApdError::NotFound { .. } => AppResponse::NotFound(msg),
            ApdError::Validation { .. } => AppResponse::ValidationError(msg),
            ApdError::Conflict { .. } => AppResponse::Conflict(msg),
            ApdError::QuotaExceeded { .. } => AppResponse::QuotaExceeded(msg),
            ApdError::TransientStorage { .. } => AppResponse::TransientStorageError(msg),
            ApdError::CorruptData { .. } => AppResponse::CorruptData(msg),
        }
    }
}

impl From<StorageError> for AppResponse {
    fn from(err: StorageError) -> Self {
        AppResponse::DatabaseError(err.to_string())
    }
}

impl From<SerdeError> for AppResponse {
    fn from(err: SerdeError) -> Self {
        AppResponse::SerializationError(format!("JSON serialization error: {err}"))
    }
}

impl AppResponse {
    pub fn success(msg: impl Into<String>) -> Self {
        AppResponse::Ok(msg.into())
    }

    /// `Ok` with `value` serialized as JSON.
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(json) => AppResponse::Ok(json),
            Err(e) => AppResponse::from(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorContext, Operation};
    use crate::ids::{DocumentId, VersionId};

    #[test]
    fn conflict_maps_to_conflict_variant() {
        let document_id = DocumentId::new("apd-1").expect("id");
        let err = ApdError::Conflict {
            context: ErrorContext::for_document(Operation::Commit, &document_id),
            base_version_id: VersionId::new("v1").expect("id"),
            current_version_id: VersionId::new("v2").expect("id"),
        };
        let response = AppResponse::from(err);
        assert!(matches!(&response, AppResponse::Conflict(msg) if msg.contains("v2")));
    }

    #[test]
    fn serializes_as_externally_tagged_enum() {
        let json = serde_json::to_string(&AppResponse::success("done")).expect("serialize");
        assert_eq!(json, r#"{"Ok":"done"}"#);
    }
}
