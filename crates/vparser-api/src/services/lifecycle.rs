//! Request lifecycle: create, read, update and soft-delete.

use std::sync::Arc;

use metrics::counter;
use tracing::{info, warn};

use vparser_models::{RequestPatch, RequestSubmission, VideoRequest};
use vparser_queue::Publisher;
use vparser_store::JobStore;

use crate::error::{ApiError, ApiResult};

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Stored and confirmed by the broker.
    Queued(VideoRequest),
    /// Stored; the publish failed and is left to the outbox relay.
    Deferred(VideoRequest),
}

impl CreateOutcome {
    pub fn request(&self) -> &VideoRequest {
        match self {
            Self::Queued(r) | Self::Deferred(r) => r,
        }
    }
}

/// Coordinates the job store and the publisher for each API operation.
#[derive(Clone)]
pub struct RequestLifecycle {
    store: Arc<dyn JobStore>,
    publisher: Publisher,
}

impl RequestLifecycle {
    pub fn new(store: Arc<dyn JobStore>, publisher: Publisher) -> Self {
        Self { store, publisher }
    }

    /// Persist the request and its outbox entry in one transaction, then publish.
    ///
    /// A publish failure does not fail the call: the row and the outbox entry
    /// exist, and the relay publishes it later.
    pub async fn create(&self, submission: RequestSubmission) -> ApiResult<CreateOutcome> {
        let request = submission.into_new_request()?;

        let created = self.store.create_with_outbox(&request).await?;
        counter!("vparser_requests_created_total").increment(1);

        match self.publisher.publish_job(&created.payload).await {
            Ok(message_id) => {
                // A failure here only means the relay may publish a duplicate.
                if let Err(e) = self.store.mark_published(created.outbox_id).await {
                    warn!(outbox_id = created.outbox_id, "Failed to mark outbox entry published: {}", e);
                }
                info!(name = %created.request.name, message_id = %message_id, "Request queued");
                Ok(CreateOutcome::Queued(created.request))
            }
            Err(e) => {
                warn!(name = %created.request.name, "Publish failed, deferring to outbox relay: {}", e);
                counter!("vparser_requests_deferred_total").increment(1);
                if let Err(e) = self
                    .store
                    .record_publish_failure(created.outbox_id, &e.to_string())
                    .await
                {
                    warn!(outbox_id = created.outbox_id, "Failed to record publish failure: {}", e);
                }
                Ok(CreateOutcome::Deferred(created.request))
            }
        }
    }

    pub async fn get(&self, name: &str) -> ApiResult<VideoRequest> {
        if !self.store.exists(name).await? {
            return Err(ApiError::RequestNotFound);
        }
        self.store
            .load(name)
            .await?
            .ok_or(ApiError::RequestNotFound)
    }

    pub async fn list(&self) -> ApiResult<Vec<VideoRequest>> {
        Ok(self.store.list_active().await?)
    }

    /// Apply each present field of `patch` to a row returned by [`Self::get`]
    /// as its own write, then return the fresh row.
    pub async fn apply_patch(
        &self,
        current: VideoRequest,
        patch: RequestPatch,
    ) -> ApiResult<VideoRequest> {
        let updates = patch.field_updates()?;
        if updates.is_empty() {
            return Ok(current);
        }
        let name = current.name.as_str();

        for update in &updates {
            self.store.apply_update(current.id, update).await?;
        }
        info!(name, fields = updates.len(), "Request updated");

        self.store
            .load(name)
            .await?
            .ok_or(ApiError::RequestNotFound)
    }

    /// Soft-delete. Messages already in flight for this request are untouched.
    pub async fn delete(&self, name: &str) -> ApiResult<()> {
        if !self.store.exists(name).await? {
            return Err(ApiError::RequestNotFound);
        }
        if !self.store.archive(name).await? {
            // Archived concurrently between the check and the write.
            return Err(ApiError::RequestNotFound);
        }
        info!(name, "Request archived");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vparser_queue::{
        MemoryBroker, Topology, TopologyManager, ARCHIVE_QUEUE, DEFAULT_RETRY_DELAY, WORKER_QUEUE,
    };
    use vparser_store::MemoryJobStore;

    use super::*;

    async fn lifecycle() -> (RequestLifecycle, Arc<MemoryJobStore>, Arc<MemoryBroker>) {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new());
        TopologyManager::new(broker.clone(), Topology::video_parser(DEFAULT_RETRY_DELAY))
            .declare()
            .await
            .unwrap();
        let publisher = Publisher::spawn(broker.clone(), 8);
        (RequestLifecycle::new(store.clone(), publisher), store, broker)
    }

    fn submission(name: &str) -> RequestSubmission {
        RequestSubmission {
            name: Some(name.to_string()),
            video_url: Some("http://x/1.mp4".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_publishes_and_marks_outbox() {
        let (lifecycle, store, broker) = lifecycle().await;

        let outcome = lifecycle.create(submission("vid1")).await.unwrap();
        assert!(matches!(outcome, CreateOutcome::Queued(_)));
        assert_eq!(broker.queue_len(WORKER_QUEUE), 1);
        assert_eq!(broker.queue_len(ARCHIVE_QUEUE), 1);
        assert_eq!(store.unpublished_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_defers_when_broker_is_down() {
        let (lifecycle, store, broker) = lifecycle().await;
        broker.set_offline(true);

        let outcome = lifecycle.create(submission("vid1")).await.unwrap();
        assert!(matches!(outcome, CreateOutcome::Deferred(_)));
        assert!(store.exists("vid1").await.unwrap());

        let entries = store.outbox_entries();
        assert_eq!(entries[0].attempts, 1);
        assert!(entries[0].last_error.is_some());
        assert!(!entries[0].is_published());
    }

    #[tokio::test]
    async fn test_store_failure_publishes_nothing() {
        let (lifecycle, store, broker) = lifecycle().await;
        store.set_unavailable(true);

        let err = lifecycle.create(submission("vid1")).await.unwrap_err();
        assert!(matches!(err, ApiError::Store(_)));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_update_without_fields_is_a_no_op() {
        let (lifecycle, _store, _broker) = lifecycle().await;
        let created = lifecycle.create(submission("vid1")).await.unwrap();

        let current = lifecycle.get("vid1").await.unwrap();
        let row = lifecycle
            .apply_patch(current, RequestPatch::default())
            .await
            .unwrap();
        assert_eq!(row.updated_at, created.request().updated_at);
    }

    #[tokio::test]
    async fn test_delete_twice_reports_missing() {
        let (lifecycle, _store, _broker) = lifecycle().await;
        lifecycle.create(submission("vid1")).await.unwrap();

        lifecycle.delete("vid1").await.unwrap();
        assert!(matches!(
            lifecycle.delete("vid1").await,
            Err(ApiError::RequestNotFound)
        ));
    }
}
