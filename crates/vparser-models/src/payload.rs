//! Message body published to the broker for each accepted request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::{NewVideoRequest, VideoRequest};

/// Snapshot of a job submission at publish time.
///
/// The field set is what existing workers expect on `VideoParserWorkerQueue`;
/// do not rename fields. `created_at` carries the stored row's creation time
/// so a worker can tell the row apart from a later one that reused the name.
/// `updated_at` is always null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub video_url: String,
    #[serde(default)]
    pub text_url: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobPayload {
    /// Serialize to the JSON bytes carried in the message body.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a message body.
    pub fn from_bytes(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}

impl From<&NewVideoRequest> for JobPayload {
    fn from(request: &NewVideoRequest) -> Self {
        Self {
            name: request.name.clone(),
            description: request.description.clone(),
            video_url: request.video_url.clone(),
            text_url: request.text_url.clone(),
            archived: false,
            processed: request.processed,
            created_at: None,
            updated_at: None,
        }
    }
}

impl From<&VideoRequest> for JobPayload {
    fn from(request: &VideoRequest) -> Self {
        Self {
            name: request.name.clone(),
            description: request.description.clone(),
            video_url: request.video_url.clone(),
            text_url: request.text_url.clone(),
            archived: request.archived,
            processed: request.processed,
            created_at: Some(request.created_at),
            updated_at: None,
        }
    }
}
