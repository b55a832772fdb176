//! Structured job logging utilities.
//!
//! Provides consistent, structured logging for job processing with
//! tracing spans and contextual information.

use tracing::{error, info, warn, Span};

/// Job logger for structured logging with consistent formatting.
///
/// Every line carries the request name, the broker message id and the
/// processor that handled it, so one delivery can be followed across
/// retries.
#[derive(Debug, Clone)]
pub struct JobLogger {
    name: String,
    message_id: String,
    operation: String,
}

impl JobLogger {
    /// Create a new job logger for a delivery.
    ///
    /// # Arguments
    /// * `name` - The request name carried in the payload
    /// * `message_id` - Broker message id, stable across retries
    /// * `operation` - The processor handling the job
    pub fn new(name: &str, message_id: Option<&str>, operation: &str) -> Self {
        Self {
            name: name.to_string(),
            message_id: message_id.unwrap_or("-").to_string(),
            operation: operation.to_string(),
        }
    }

    /// Log the start of a job operation.
    pub fn log_start(&self, attempt: u64) {
        info!(
            name = %self.name,
            message_id = %self.message_id,
            operation = %self.operation,
            attempt,
            "Job started"
        );
    }

    /// Log a warning during job execution.
    pub fn log_warning(&self, message: &str) {
        warn!(
            name = %self.name,
            message_id = %self.message_id,
            operation = %self.operation,
            "Job warning: {}", message
        );
    }

    /// Log an error during job execution.
    pub fn log_error(&self, message: &str) {
        error!(
            name = %self.name,
            message_id = %self.message_id,
            operation = %self.operation,
            "Job error: {}", message
        );
    }

    /// Log the completion of a job operation.
    pub fn log_completion(&self, message: &str) {
        info!(
            name = %self.name,
            message_id = %self.message_id,
            operation = %self.operation,
            "Job completed: {}", message
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Create a tracing span for this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            name = %self.name,
            message_id = %self.message_id,
            operation = %self.operation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_defaults_missing_message_id() {
        let logger = JobLogger::new("vid1", None, "mark_processed");

        assert_eq!(logger.name(), "vid1");
        assert_eq!(logger.message_id(), "-");
    }
}
