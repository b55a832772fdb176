//! In-memory job store for tests and local development.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use vparser_models::{FieldUpdate, JobPayload, NewVideoRequest, VideoRequest};

use crate::error::{StoreError, StoreResult};
use crate::repo::{CreatedRequest, JobStore, OutboxEntry};

#[derive(Default)]
struct MemoryState {
    requests: Vec<VideoRequest>,
    outbox: Vec<OutboxEntry>,
    next_request_id: i64,
    next_outbox_id: i64,
}

/// Job store backed by process memory.
///
/// Mirrors the Postgres semantics: names are unique among non-archived rows,
/// `updated_at` strictly advances on every write, and request + outbox
/// inserts are atomic.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every row, archived ones included, in insertion order.
    pub fn all_rows(&self) -> Vec<VideoRequest> {
        self.state.lock().requests.clone()
    }

    /// Every outbox entry, in insertion order.
    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.state.lock().outbox.clone()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous + Duration::microseconds(1))
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn exists(&self, name: &str) -> StoreResult<bool> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state.requests.iter().any(|r| r.name == name && !r.archived))
    }

    async fn load(&self, name: &str) -> StoreResult<Option<VideoRequest>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .requests
            .iter()
            .find(|r| r.name == name && !r.archived)
            .cloned())
    }

    async fn list_active(&self) -> StoreResult<Vec<VideoRequest>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state.requests.iter().filter(|r| !r.archived).cloned().collect())
    }

    async fn create_with_outbox(&self, request: &NewVideoRequest) -> StoreResult<CreatedRequest> {
        self.check_available()?;
        let mut state = self.state.lock();

        if state
            .requests
            .iter()
            .any(|r| r.name == request.name && !r.archived)
        {
            return Err(StoreError::AlreadyExists(request.name.clone()));
        }

        state.next_request_id += 1;
        state.next_outbox_id += 1;
        let now = Utc::now();

        let row = VideoRequest {
            id: state.next_request_id,
            name: request.name.clone(),
            description: request.description.clone(),
            video_url: request.video_url.clone(),
            text_url: request.text_url.clone(),
            archived: false,
            processed: request.processed,
            created_at: now,
            updated_at: now,
        };
        let payload = JobPayload::from(&row);
        let entry = OutboxEntry {
            id: state.next_outbox_id,
            request_id: row.id,
            payload: payload.clone(),
            attempts: 0,
            last_error: None,
            created_at: now,
            last_attempt_at: None,
            published_at: None,
        };

        let outbox_id = entry.id;
        state.requests.push(row.clone());
        state.outbox.push(entry);

        Ok(CreatedRequest {
            request: row,
            outbox_id,
            payload,
        })
    }

    async fn apply_update(&self, id: i64, update: &FieldUpdate) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let row = state
            .requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::not_found(format!("request id {id}")))?;

        update.apply_to(row);
        row.updated_at = next_timestamp(row.updated_at);
        Ok(())
    }

    async fn archive(&self, name: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        match state
            .requests
            .iter_mut()
            .find(|r| r.name == name && !r.archived)
        {
            Some(row) => {
                row.archived = true;
                row.updated_at = next_timestamp(row.updated_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn claim_pending_outbox(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<OutboxEntry>> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Utc::now();
        let limit = usize::try_from(limit).unwrap_or(0);

        let mut claimed = Vec::new();
        for entry in state.outbox.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            let eligible = entry.published_at.is_none()
                && entry.created_at < older_than
                && entry.last_attempt_at.map_or(true, |t| t < older_than);
            if eligible {
                entry.last_attempt_at = Some(now);
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_published(&self, outbox_id: i64) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        if let Some(entry) = state
            .outbox
            .iter_mut()
            .find(|e| e.id == outbox_id && e.published_at.is_none())
        {
            entry.published_at = Some(Utc::now());
            entry.last_error = None;
        }
        Ok(())
    }

    async fn record_publish_failure(&self, outbox_id: i64, error: &str) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        if let Some(entry) = state.outbox.iter_mut().find(|e| e.id == outbox_id) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
            entry.last_attempt_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn unpublished_count(&self) -> StoreResult<i64> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state.outbox.iter().filter(|e| !e.is_published()).count() as i64)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}
