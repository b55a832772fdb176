//! Background service that publishes outbox entries the inline publish missed.
//!
//! Each tick it claims unpublished entries older than the grace period,
//! publishes them through the shared publisher and records the result.
//! Entries whose inline publish is still in flight are left alone by the
//! grace period; a message published twice is tolerated downstream.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use vparser_queue::Publisher;
use vparser_store::JobStore;

use crate::config::ApiConfig;

/// Counts from a single relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
}

/// Outbox relay service.
pub struct OutboxRelay {
    store: Arc<dyn JobStore>,
    publisher: Publisher,
    interval: Duration,
    grace: Duration,
    batch_size: i64,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn JobStore>, publisher: Publisher, config: &ApiConfig) -> Self {
        Self {
            store,
            publisher,
            interval: config.outbox_relay_interval,
            grace: config.outbox_grace,
            batch_size: config.outbox_batch_size,
        }
    }

    /// Override the grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run until `shutdown` flips to true. Spawn as a background task.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting outbox relay (interval: {:?}, grace: {:?})",
            self.interval, self.grace
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.relay_once().await {
                error!("Outbox relay error: {}", e);
            }
        }

        info!("Outbox relay stopped");
    }

    /// Run a single relay pass.
    pub async fn relay_once(&self) -> anyhow::Result<RelayReport> {
        let grace = chrono::Duration::from_std(self.grace)?;
        let entries = self
            .store
            .claim_pending_outbox(Utc::now() - grace, self.batch_size)
            .await?;

        let mut report = RelayReport {
            claimed: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            match self.publisher.publish_job(&entry.payload).await {
                Ok(message_id) => {
                    self.store.mark_published(entry.id).await?;
                    report.published += 1;
                    debug!(
                        outbox_id = entry.id,
                        name = %entry.payload.name,
                        message_id = %message_id,
                        "Relayed outbox entry"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        outbox_id = entry.id,
                        attempts = entry.attempts + 1,
                        "Outbox publish failed: {}", e
                    );
                    self.store
                        .record_publish_failure(entry.id, &e.to_string())
                        .await?;
                }
            }
        }

        counter!("vparser_outbox_relayed_total", "result" => "ok")
            .increment(report.published as u64);
        counter!("vparser_outbox_relayed_total", "result" => "error")
            .increment(report.failed as u64);
        let backlog = self.store.unpublished_count().await?;
        gauge!("vparser_outbox_backlog").set(backlog as f64);

        if report.claimed > 0 {
            info!(
                "Outbox relay pass complete: {} claimed, {} published, {} failed",
                report.claimed, report.published, report.failed
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use vparser_models::NewVideoRequest;
    use vparser_queue::{
        MemoryBroker, Topology, TopologyManager, DEFAULT_RETRY_DELAY, WORKER_QUEUE,
    };
    use vparser_store::MemoryJobStore;

    use super::*;

    async fn setup() -> (Arc<MemoryJobStore>, Arc<MemoryBroker>, Publisher) {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new());
        TopologyManager::new(broker.clone(), Topology::video_parser(DEFAULT_RETRY_DELAY))
            .declare()
            .await
            .unwrap();
        let publisher = Publisher::spawn(broker.clone(), 8);
        (store, broker, publisher)
    }

    async fn stored(store: &MemoryJobStore, name: &str) -> i64 {
        let request = NewVideoRequest::new(name, "http://x/1.mp4");
        store
            .create_with_outbox(&request)
            .await
            .unwrap()
            .outbox_id
    }

    fn relay(store: Arc<MemoryJobStore>, publisher: Publisher) -> OutboxRelay {
        OutboxRelay::new(store, publisher, &ApiConfig::default()).with_grace(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_relay_publishes_pending_entries() {
        let (store, broker, publisher) = setup().await;
        stored(&store, "vid1").await;
        stored(&store, "vid2").await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = relay(store.clone(), publisher).relay_once().await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(broker.queue_len(WORKER_QUEUE), 2);
        assert_eq!(store.unpublished_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relay_records_failures_and_keeps_entry() {
        let (store, broker, publisher) = setup().await;
        let outbox_id = stored(&store, "vid1").await;
        broker.set_offline(true);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = relay(store.clone(), publisher).relay_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let entry = store
            .outbox_entries()
            .into_iter()
            .find(|e| e.id == outbox_id)
            .unwrap();
        assert_eq!(entry.attempts, 1);
        assert!(!entry.is_published());
    }

    #[tokio::test]
    async fn test_relay_leaves_recent_entries_to_inline_publish() {
        let (store, broker, publisher) = setup().await;
        stored(&store, "vid1").await;

        let relay = OutboxRelay::new(store.clone(), publisher, &ApiConfig::default())
            .with_grace(Duration::from_secs(3600));
        let report = relay.relay_once().await.unwrap();
        assert_eq!(report, RelayReport::default());
        assert_eq!(broker.queue_len(WORKER_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (store, _broker, publisher) = setup().await;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(relay(store, publisher).run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
