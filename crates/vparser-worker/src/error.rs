//! Worker error types.

use std::time::Duration;

use thiserror::Error;

use vparser_queue::ProcessingOutcome;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    /// The message body is not a job payload.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The payload decoded but can never be processed.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store error: {0}")]
    Store(#[from] vparser_store::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] vparser_queue::QueueError),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn invalid_job(msg: impl Into<String>) -> Self {
        Self::InvalidJob(msg.into())
    }

    /// Check if this is a permanent failure that should NOT be retried.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(self, WorkerError::InvalidPayload(_) | WorkerError::InvalidJob(_))
    }

    /// Classify for the retry policy. Anything not known to be permanent is
    /// retried; the retry ceiling bounds the cost of guessing wrong.
    pub fn outcome(&self) -> ProcessingOutcome {
        if self.is_permanent_failure() {
            ProcessingOutcome::Permanent(self.to_string())
        } else {
            ProcessingOutcome::Retryable(self.to_string())
        }
    }
}
