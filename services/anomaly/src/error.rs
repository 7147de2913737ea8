//! Error taxonomy for the record lifecycle.

use crate::record::RecordId;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// Errors raised by a record store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record {0} not found")]
    NotFound(RecordId),

    #[error("Field {field} of record {id} is immutable")]
    ImmutableFieldViolation { id: RecordId, field: &'static str },

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Update of record {0} kept losing to concurrent writes")]
    Conflict(RecordId),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Errors raised by the asset store gateway
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Refusing to upload an empty buffer")]
    EmptyBody,

    #[error("Asset host rejected upload: {0}")]
    Remote(String),

    #[error("Asset upload timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised when notifying the analyzer
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Analyzer unreachable: {0}")]
    Unreachable(String),

    #[error("Analyzer returned status {0}")]
    Rejected(u16),
}

/// Errors surfaced by controller operations
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("{0}")]
    Validation(String),

    #[error("Upload failed: {0}")]
    UploadFailed(#[from] UploadError),

    #[error("Record store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Record {0} not found")]
    NotFound(String),

    #[error("Field {field} of record {id} cannot be changed")]
    ImmutableFieldViolation { id: RecordId, field: &'static str },
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => LifecycleError::NotFound(id.to_string()),
            StoreError::ImmutableFieldViolation { id, field } => {
                LifecycleError::ImmutableFieldViolation { id, field }
            }
            StoreError::InvalidPatch(msg) => LifecycleError::Validation(msg),
            StoreError::Unavailable(msg) => LifecycleError::StoreUnavailable(msg),
            conflict @ StoreError::Conflict(_) => {
                LifecycleError::StoreUnavailable(conflict.to_string())
            }
        }
    }
}

impl LifecycleError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::Validation(_) => "VALIDATION_ERROR",
            LifecycleError::UploadFailed(_) => "UPLOAD_FAILED",
            LifecycleError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            LifecycleError::NotFound(_) => "NOT_FOUND",
            LifecycleError::ImmutableFieldViolation { .. } => "IMMUTABLE_FIELD",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            LifecycleError::Validation(_) | LifecycleError::UploadFailed(_) => {
                StatusCode::BAD_REQUEST
            }
            LifecycleError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
            LifecycleError::ImmutableFieldViolation { .. } => StatusCode::CONFLICT,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
    pub code: String,
}

impl IntoResponse for LifecycleError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            LifecycleError::StoreUnavailable(msg) => {
                error!(error = %msg, "Record store unavailable");
                "Record store unavailable, try again later".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            message,
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let id = RecordId::new(3);

        assert!(matches!(
            LifecycleError::from(StoreError::NotFound(id)),
            LifecycleError::NotFound(got) if got == "3"
        ));
        assert!(matches!(
            LifecycleError::from(StoreError::InvalidPatch("bad".to_string())),
            LifecycleError::Validation(_)
        ));
        assert!(matches!(
            LifecycleError::from(StoreError::Unavailable("down".to_string())),
            LifecycleError::StoreUnavailable(_)
        ));

        let conflict = LifecycleError::from(StoreError::Conflict(id));
        assert!(matches!(conflict, LifecycleError::StoreUnavailable(_)));
        assert_eq!(conflict.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            LifecycleError::Validation("x".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            LifecycleError::UploadFailed(UploadError::EmptyBody).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            LifecycleError::NotFound("1".to_string()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            LifecycleError::ImmutableFieldViolation {
                id: RecordId::new(1),
                field: "assetUrl"
            }
            .code(),
            "IMMUTABLE_FIELD"
        );
    }
}
