//! Job processors.
//!
//! The executor owns delivery, retries and acknowledgement; a processor
//! only does the work for one decoded payload and says how it went.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use vparser_models::{FieldUpdate, JobPayload};
use vparser_store::JobStore;

use crate::error::{WorkerError, WorkerResult};

/// How a successfully handled job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReport {
    Completed,
    /// Nothing to do; the message is still acknowledged.
    Skipped(&'static str),
}

/// Work performed for each job taken off the worker queue.
///
/// Deliveries are at-least-once, so implementations must be idempotent.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn process(&self, job: &JobPayload) -> WorkerResult<JobReport>;
}

/// Default processor: checks the video URL, if any, and marks the request processed.
pub struct MarkProcessedProcessor {
    store: Arc<dyn JobStore>,
}

impl MarkProcessedProcessor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

/// `video_url` is optional on a request; when present it must be http(s).
fn check_video_url(raw: &str) -> WorkerResult<Option<Url>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let url = Url::parse(raw)
        .map_err(|e| WorkerError::invalid_job(format!("video_url is not a URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(Some(url)),
        other => Err(WorkerError::invalid_job(format!(
            "unsupported video_url scheme: {other}"
        ))),
    }
}

#[async_trait]
impl JobProcessor for MarkProcessedProcessor {
    fn name(&self) -> &'static str {
        "mark_processed"
    }

    async fn process(&self, job: &JobPayload) -> WorkerResult<JobReport> {
        check_video_url(&job.video_url)?;

        // Archived or unknown requests are dropped; the caller deleted them.
        let Some(request) = self.store.load(&job.name).await? else {
            return Ok(JobReport::Skipped("request missing or archived"));
        };
        // The name was archived and reused since this job was queued.
        if job.created_at.is_some_and(|created| created != request.created_at) {
            return Ok(JobReport::Skipped("request replaced"));
        }
        if request.processed {
            return Ok(JobReport::Skipped("already processed"));
        }

        self.store
            .apply_update(request.id, &FieldUpdate::Processed(true))
            .await?;
        Ok(JobReport::Completed)
    }
}

#[cfg(test)]
mod tests {
    use vparser_models::NewVideoRequest;
    use vparser_store::MemoryJobStore;

    use super::*;

    async fn store_with(name: &str) -> Arc<MemoryJobStore> {
        let store = Arc::new(MemoryJobStore::new());
        let request = NewVideoRequest::new(name, "https://cdn.example.com/v.mp4");
        store.create_with_outbox(&request).await.unwrap();
        store
    }

    fn job(name: &str, url: &str) -> JobPayload {
        JobPayload::from(&NewVideoRequest::new(name, url))
    }

    #[tokio::test]
    async fn test_marks_request_processed_once() {
        let store = store_with("vid1").await;
        let processor = MarkProcessedProcessor::new(store.clone());
        let payload = job("vid1", "https://cdn.example.com/v.mp4");

        assert_eq!(processor.process(&payload).await.unwrap(), JobReport::Completed);
        assert!(store.load("vid1").await.unwrap().unwrap().processed);
        assert_eq!(
            processor.process(&payload).await.unwrap(),
            JobReport::Skipped("already processed")
        );
    }

    #[tokio::test]
    async fn test_archived_request_is_skipped() {
        let store = store_with("vid1").await;
        store.archive("vid1").await.unwrap();
        let processor = MarkProcessedProcessor::new(store);

        let report = processor
            .process(&job("vid1", "https://cdn.example.com/v.mp4"))
            .await
            .unwrap();
        assert!(matches!(report, JobReport::Skipped(_)));
    }

    #[tokio::test]
    async fn test_bad_url_is_permanent() {
        let processor = MarkProcessedProcessor::new(store_with("vid1").await);

        for url in ["not a url", "ftp://cdn.example.com/v.mp4"] {
            let err = processor.process(&job("vid1", url)).await.unwrap_err();
            assert!(err.is_permanent_failure(), "{url}: {err}");
        }
    }

    #[tokio::test]
    async fn test_request_without_video_url_is_processed() {
        let store = Arc::new(MemoryJobStore::new());
        let created = store
            .create_with_outbox(&NewVideoRequest::new("vid1", ""))
            .await
            .unwrap();
        let processor = MarkProcessedProcessor::new(store.clone());

        assert_eq!(
            processor.process(&created.payload).await.unwrap(),
            JobReport::Completed
        );
        assert!(store.load("vid1").await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn test_job_for_replaced_request_is_skipped() {
        let store = Arc::new(MemoryJobStore::new());
        let request = NewVideoRequest::new("vid1", "https://cdn.example.com/v.mp4");
        let old = store.create_with_outbox(&request).await.unwrap();
        store.archive("vid1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.create_with_outbox(&request).await.unwrap();
        let processor = MarkProcessedProcessor::new(store.clone());

        assert_eq!(
            processor.process(&old.payload).await.unwrap(),
            JobReport::Skipped("request replaced")
        );
        assert!(!store.load("vid1").await.unwrap().unwrap().processed);
    }
}
