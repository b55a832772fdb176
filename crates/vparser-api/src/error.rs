//! API error types.

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

use vparser_models::{ApiEnvelope, ModelError};
use vparser_queue::QueueError;
use vparser_store::StoreError;

pub type ApiResult<T> = Result<T, ApiError>;

pub const MSG_NOT_FOUND: &str = "Request doesn't exist";
pub const MSG_BAD_JSON: &str = "Can't parse json";
pub const MSG_BAD_NAME: &str = "Invalid request name";
const MSG_INTERNAL: &str = "Internal server error";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown or archived request name. Reported as 400 for client compatibility.
    #[error("Request doesn't exist")]
    RequestNotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("Request body too large")]
    PayloadTooLarge,

    #[error("Rate limited")]
    RateLimited,

    #[error("{0}")]
    Validation(#[from] ModelError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::RequestNotFound | ApiError::BadRequest(_) | ApiError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Store(StoreError::AlreadyExists(_)) => StatusCode::CONFLICT,
            ApiError::Store(_) | ApiError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller. Dependency failures never leak driver details.
    fn public_message(&self) -> String {
        match self {
            ApiError::Unauthorized(_) => "Unauthorized".to_string(),
            ApiError::Store(StoreError::AlreadyExists(name)) => {
                format!("Request with name {name} already exists")
            }
            ApiError::Store(_) | ApiError::Queue(_) => MSG_INTERNAL.to_string(),
            other => other.to_string(),
        }
    }
}

/// Body extraction failures are reported in the envelope like any other error.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::bad_request(MSG_BAD_JSON)
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(_: PathRejection) -> Self {
        ApiError::bad_request(MSG_BAD_NAME)
    }
}

/// `Path` whose rejection is reported in the envelope.
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = ApiEnvelope::empty(status.as_u16(), self.public_message());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_bad_request() {
        let err = ApiError::RequestNotFound;
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.public_message(), MSG_NOT_FOUND);
    }

    #[test]
    fn test_dependency_errors_are_opaque() {
        let err = ApiError::Store(StoreError::Unavailable("pq: connection refused".into()));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "Internal server error");
    }

    #[test]
    fn test_missing_name_message() {
        let err = ApiError::from(ModelError::MissingField("name"));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.public_message(), "name can't be null");
    }

    #[test]
    fn test_duplicate_name_is_conflict() {
        let err = ApiError::Store(StoreError::AlreadyExists("vid1".into()));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }
}
