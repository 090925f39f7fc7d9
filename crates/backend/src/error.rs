//! The error type returned by generated route handlers. Each variant maps
//! onto one HTTP status; `IntoResponse` renders the mapping, so handlers
//! simply return `Result<Response, Error>`.

use axum::http::StatusCode;
use axum::response::IntoResponse;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed JSON, bad UUID in path, invalid filter property.
    #[error("{0}")]
    Validation(String),

    /// Policy denial.
    #[error("unauthorized")]
    Unauthorized,

    #[error("resource not found")]
    NotFound,

    /// Revision mismatch. Carries the current row so the caller can
    /// rebase.
    #[error("revision conflict")]
    RevisionConflict { current: serde_json::Value },

    /// Raising an event type with no registered handler.
    #[error("no event handler registered for {0:?}")]
    NoEventHandler(String),

    /// Duplicate value on a unique external index.
    #[error("conflict on unique index: {0}")]
    ExternalIndexConflict(String),

    /// Request body rejected by the resource's JSON schema.
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    /// An interceptor aborted the request. Write, delete and clear
    /// interceptors map to 400 with the message preserved verbatim;
    /// read and list interceptors map to 500.
    #[error("{message}")]
    Interceptor { message: String, read: bool },

    /// Unexpected database or storage fault. Logged in full, reported
    /// generically.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::RevisionConflict { .. } | Error::NoEventHandler(_) => StatusCode::CONFLICT,
            Error::ExternalIndexConflict(_) | Error::SchemaValidation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::Interceptor { read, .. } => {
                if *read {
                    StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    StatusCode::BAD_REQUEST
                }
            }
            Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Storage(anyhow::Error::from(error).context("database error"))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        match self {
            Error::RevisionConflict { current } => {
                (status, axum::Json(current)).into_response()
            }
            Error::Storage(error) => {
                tracing::error!(?error, "request failed with storage error");
                (status, "internal error, please retry the request").into_response()
            }
            other => (status, other.to_string()).into_response(),
        }
    }
}
