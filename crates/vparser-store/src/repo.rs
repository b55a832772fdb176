//! The job store contract shared by the Postgres and in-memory backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vparser_models::{FieldUpdate, JobPayload, NewVideoRequest, VideoRequest};

use crate::error::StoreResult;

/// A request row together with the outbox entry written in the same transaction.
#[derive(Debug, Clone)]
pub struct CreatedRequest {
    pub request: VideoRequest,
    pub outbox_id: i64,
    /// Message body recorded in the outbox entry.
    pub payload: JobPayload,
}

/// Intent to publish a request's message, recorded alongside the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub request_id: i64,
    pub payload: JobPayload,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}

/// Durable record of every request's identity and lifecycle flags.
///
/// All lookups by name only consider non-archived rows.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Whether a non-archived request with this name exists.
    async fn exists(&self, name: &str) -> StoreResult<bool>;

    /// Load the non-archived request with this name.
    async fn load(&self, name: &str) -> StoreResult<Option<VideoRequest>>;

    /// All non-archived requests, ordered by id.
    async fn list_active(&self) -> StoreResult<Vec<VideoRequest>>;

    /// Insert the request row and its outbox entry atomically.
    ///
    /// The outbox payload is built from the inserted row, so it carries the
    /// row's `created_at`. Fails with `AlreadyExists` if a non-archived
    /// request holds the name.
    async fn create_with_outbox(&self, request: &NewVideoRequest) -> StoreResult<CreatedRequest>;

    /// Write a single column and refresh `updated_at`.
    async fn apply_update(&self, id: i64, update: &FieldUpdate) -> StoreResult<()>;

    /// Soft-delete the non-archived request with this name.
    ///
    /// Returns false if there was nothing to archive.
    async fn archive(&self, name: &str) -> StoreResult<bool>;

    /// Claim up to `limit` unpublished outbox entries created before `older_than`
    /// whose last attempt (if any) is also older than `older_than`.
    async fn claim_pending_outbox(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<OutboxEntry>>;

    /// Record the broker's confirmation for an outbox entry.
    async fn mark_published(&self, outbox_id: i64) -> StoreResult<()>;

    /// Record a failed publish attempt for an outbox entry.
    async fn record_publish_failure(&self, outbox_id: i64, error: &str) -> StoreResult<()>;

    /// Number of outbox entries still waiting to be published.
    async fn unpublished_count(&self) -> StoreResult<i64>;

    /// Connectivity check for readiness probes.
    async fn ping(&self) -> StoreResult<()>;
}
