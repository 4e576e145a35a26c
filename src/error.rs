use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;
use tracing::error;

use crate::ingest::IngestError;
use crate::repository::RepositoryError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "unauthorized")
    }

    pub fn forbidden() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "forbidden",
            "you are not allowed to perform this operation",
        )
    }

    /// No attachment matches the id (and token, on the public path).
    pub fn attachment_not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "attachment_not_found",
            "attachment not found",
        )
    }

    /// The attachment exists but its file cannot be located.
    pub fn content_unavailable() -> Self {
        Self::new(
            StatusCode::GONE,
            "content_unavailable",
            "the attachment content is currently unavailable",
        )
    }

    /// Logs the cause and answers with a generic message.
    pub fn internal<E: Display>(error: E) -> Self {
        error!(error = %error, "internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal server error",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            code: self.code,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl From<IngestError> for AppError {
    fn from(value: IngestError) -> Self {
        match value {
            IngestError::MissingFile => {
                AppError::bad_request("file_missing", "no file was uploaded in the file field")
            }
            IngestError::EmptyFile => {
                AppError::bad_request("file_empty", "the uploaded file is empty")
            }
            IngestError::Interrupted(reason) => AppError::bad_request(
                "upload_interrupted",
                format!("the upload did not complete: {reason}"),
            ),
            err @ IngestError::TooLarge { .. } => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "file_too_large", err.to_string())
            }
            err @ IngestError::UnsupportedType { .. } => {
                AppError::bad_request("unsupported_file_type", err.to_string())
            }
            IngestError::InsufficientSpace { .. } => AppError::new(
                StatusCode::INSUFFICIENT_STORAGE,
                "insufficient_storage",
                "not enough storage space is available; try again later or contact an operator",
            ),
            err @ IngestError::OwnerNotFound(_) => {
                AppError::new(StatusCode::NOT_FOUND, "owner_not_found", err.to_string())
            }
            err @ (IngestError::Unverified(_)
            | IngestError::Io(_)
            | IngestError::Repository(_)) => AppError::internal(err),
        }
    }
}

impl From<RepositoryError> for AppError {
    fn from(value: RepositoryError) -> Self {
        AppError::internal(value)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        AppError::internal(value)
    }
}
