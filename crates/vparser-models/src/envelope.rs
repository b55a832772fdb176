//! JSON response envelope shared by every API route.

use serde::{Deserialize, Serialize};

/// `{success, message, data}`; `success` is false iff the HTTP status is >= 400.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// Build an envelope for the given HTTP status code.
    pub fn for_status(status: u16, message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            success: status < 400,
            message: message.into(),
            data,
        }
    }

    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self::for_status(200, message, Some(data))
    }
}

impl ApiEnvelope<()> {
    /// Envelope with `data: null`.
    pub fn empty(status: u16, message: impl Into<String>) -> Self {
        Self::for_status(status, message, None)
    }
}
