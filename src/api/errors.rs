//! API error surface: stable JSON error codes with their HTTP mapping.

use crate::archive::restore::RestoreError;
use crate::archive::ArchiveError;
use crate::store::StoreError;
use crate::types::error_codes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to HTTP clients as `{"error": "<code>"}`.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("quota_exceeded")]
    QuotaExceeded,

    #[error("disk_full")]
    DiskFull,

    #[error("not_ready")]
    NotReady,

    #[error("not_found")]
    NotFound,

    #[error("file_not_found")]
    FileNotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("missing_file")]
    MissingFile,

    #[error("bad_index")]
    BadIndex,

    #[error("range_not_supported")]
    RangeNotSupported,

    /// 416 with `Content-Range: bytes */size`.
    #[error("range_not_satisfiable")]
    RangeNotSatisfiable { size: u64 },

    #[error("restore_failed")]
    RestoreFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::QuotaExceeded => error_codes::QUOTA_EXCEEDED,
            ApiError::DiskFull => error_codes::DISK_FULL,
            ApiError::NotReady => error_codes::NOT_READY,
            ApiError::NotFound => error_codes::NOT_FOUND,
            ApiError::FileNotFound => error_codes::FILE_NOT_FOUND,
            ApiError::Forbidden => error_codes::FORBIDDEN,
            ApiError::MissingFile => error_codes::MISSING_FILE,
            ApiError::BadIndex => error_codes::BAD_INDEX,
            ApiError::RangeNotSupported | ApiError::RangeNotSatisfiable { .. } => {
                error_codes::RANGE_NOT_SUPPORTED
            }
            ApiError::RestoreFailed(_) => error_codes::RESTORE_FAILED,
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::QuotaExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::DiskFull => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::NotReady => StatusCode::CONFLICT,
            ApiError::NotFound | ApiError::FileNotFound => StatusCode::NOT_FOUND,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::MissingFile | ApiError::BadIndex => StatusCode::BAD_REQUEST,
            ApiError::RangeNotSupported | ApiError::RangeNotSatisfiable { .. } => {
                StatusCode::RANGE_NOT_SATISFIABLE
            }
            ApiError::RestoreFailed(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "error": self.code() }));

        if let ApiError::RangeNotSatisfiable { size } = self {
            return (
                status,
                [("Content-Range", format!("bytes */{size}"))],
                body,
            )
                .into_response();
        }
        (status, body).into_response()
    }
}

impl From<ArchiveError> for ApiError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::QuotaExceeded => ApiError::QuotaExceeded,
            ArchiveError::DiskFull => ApiError::DiskFull,
            ArchiveError::NotFound => ApiError::NotFound,
            ArchiveError::Forbidden => ApiError::Forbidden,
            ArchiveError::NotReady => ApiError::NotReady,
            ArchiveError::MissingFile => ApiError::MissingFile,
            ArchiveError::BadIndex => ApiError::BadIndex,
            ArchiveError::Store(e) => e.into(),
            ArchiveError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<RestoreError> for ApiError {
    fn from(err: RestoreError) -> Self {
        match err {
            RestoreError::NotFound => ApiError::NotFound,
            RestoreError::Forbidden => ApiError::Forbidden,
            RestoreError::NotReady => ApiError::NotReady,
            RestoreError::FileNotFound => ApiError::FileNotFound,
            RestoreError::RangeNotSupported => ApiError::RangeNotSupported,
            RestoreError::RangeNotSatisfiable { size } => ApiError::RangeNotSatisfiable { size },
            RestoreError::Failed(msg) => ApiError::RestoreFailed(msg),
            RestoreError::Store(e) => e.into(),
            RestoreError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::QuotaExceeded => ApiError::QuotaExceeded,
            StoreError::NotFound(_) => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}
