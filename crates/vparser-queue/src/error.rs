//! Queue error types.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A declaration disagrees with what the broker already holds.
    /// Never retried; the process must not start against a mismatched topology.
    #[error("Topology conflict: {0}")]
    TopologyConflict(String),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Publish not confirmed by broker on exchange {exchange}")]
    PublishNacked { exchange: String },

    #[error("Publisher is shut down")]
    PublisherClosed,

    #[error("Consume failed: {0}")]
    ConsumeFailed(String),

    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),

    #[error("Invalid delivery transition: {event} in state {state}")]
    InvalidTransition {
        state: &'static str,
        event: &'static str,
    },

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn topology_conflict(msg: impl Into<String>) -> Self {
        Self::TopologyConflict(msg.into())
    }

    pub fn publish_failed(msg: impl Into<String>) -> Self {
        Self::PublishFailed(msg.into())
    }
}
