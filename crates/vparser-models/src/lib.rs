//! Shared data models for the VideoParser request service.
//!
//! This crate provides Serde-serializable types for:
//! - Persisted video processing requests (the job record)
//! - Submission and partial-update payloads accepted by the API
//! - The message body published to the broker
//! - The JSON response envelope

pub mod envelope;
pub mod error;
pub mod payload;
pub mod request;

// Re-export common types
pub use envelope::ApiEnvelope;
pub use error::{ModelError, ModelResult};
pub use payload::JobPayload;
pub use request::{
    FieldUpdate, NewVideoRequest, RequestPatch, RequestSubmission, VideoRequest, MAX_NAME_LENGTH,
    MAX_TEXT_LENGTH, MAX_URL_LENGTH,
};
