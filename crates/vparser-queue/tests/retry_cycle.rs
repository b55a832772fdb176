//! End-to-end retry/dead-letter behaviour against the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use vparser_models::{JobPayload, NewVideoRequest};
use vparser_queue::{
    settle, Broker, DeliveryState, Disposition, MemoryBroker, ProcessingOutcome, Publisher,
    RetryPolicy, Topology, TopologyManager, ARCHIVE_QUEUE, DEFAULT_RETRY_DELAY, FAILED_QUEUE,
    HEADER_ATTEMPTS, RETRY_QUEUE, WORKER_QUEUE,
};

async fn setup() -> (Arc<MemoryBroker>, Publisher) {
    let broker = Arc::new(MemoryBroker::new());
    TopologyManager::new(broker.clone(), Topology::video_parser(DEFAULT_RETRY_DELAY))
        .declare()
        .await
        .unwrap();
    let publisher = Publisher::spawn(broker.clone(), 8);
    (broker, publisher)
}

fn payload(name: &str) -> JobPayload {
    JobPayload::from(&NewVideoRequest::new(name, "http://x/1.mp4"))
}

async fn run_timers() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_publish_fans_out_to_worker_and_archive() {
    let (broker, publisher) = setup().await;

    publisher.publish_job(&payload("vid1")).await.unwrap();

    assert_eq!(broker.queue_len(WORKER_QUEUE), 1);
    assert_eq!(broker.queue_len(ARCHIVE_QUEUE), 1);
    assert_eq!(broker.queue_len(RETRY_QUEUE), 0);

    let archived = broker.drain(ARCHIVE_QUEUE);
    let decoded = JobPayload::from_bytes(&archived[0].body).unwrap();
    assert_eq!(decoded, payload("vid1"));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_message_waits_out_retry_delay() {
    let (broker, publisher) = setup().await;
    publisher.publish_job(&payload("vid1")).await.unwrap();

    let mut deliveries = broker.consume(WORKER_QUEUE, "test", 1).await.unwrap();
    let first = deliveries.next().await.unwrap().unwrap();
    let body = first.message.body.clone();
    assert_eq!(RetryPolicy::prior_rejections(&first.message), 0);

    let state = settle(first, &Disposition::Retry, &publisher).await.unwrap();
    assert_eq!(state, DeliveryState::RetryCooldown);
    assert_eq!(broker.queue_len(RETRY_QUEUE), 1);

    tokio::time::advance(Duration::from_secs(59)).await;
    run_timers().await;
    assert_eq!(broker.queue_len(WORKER_QUEUE), 0);
    assert_eq!(broker.queue_len(RETRY_QUEUE), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    run_timers().await;
    assert_eq!(broker.queue_len(RETRY_QUEUE), 0);

    let second = deliveries.next().await.unwrap().unwrap();
    assert_eq!(second.message.body, body);
    assert_eq!(RetryPolicy::prior_rejections(&second.message), 1);

    // Re-entering the primary exchange fans out again.
    assert_eq!(broker.queue_len(ARCHIVE_QUEUE), 2);

    let state = settle(second, &Disposition::Ack, &publisher).await.unwrap();
    assert_eq!(state, DeliveryState::Completed);
    assert_eq!(broker.unacked_len(WORKER_QUEUE), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_ceiling_parks_message_in_failed_queue() {
    let (broker, publisher) = setup().await;
    let policy = RetryPolicy {
        max_retries: Some(2),
    };
    publisher.publish_job(&payload("vid1")).await.unwrap();

    let mut deliveries = broker.consume(WORKER_QUEUE, "test", 1).await.unwrap();
    let mut dispositions = Vec::new();
    loop {
        // Paused time auto-advances through each retry cooldown.
        let delivery = deliveries.next().await.unwrap().unwrap();
        let prior = RetryPolicy::prior_rejections(&delivery.message);
        let disposition =
            policy.decide(&ProcessingOutcome::Retryable("database unavailable".into()), prior);
        dispositions.push(disposition.clone());

        let state = settle(delivery, &disposition, &publisher).await.unwrap();
        if state == DeliveryState::Failed {
            break;
        }
    }

    assert_eq!(dispositions.len(), 3);
    assert_eq!(dispositions[0], Disposition::Retry);
    assert_eq!(dispositions[1], Disposition::Retry);
    assert!(matches!(dispositions[2], Disposition::Fail { .. }));

    let failed = broker.drain(FAILED_QUEUE);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].headers[HEADER_ATTEMPTS], "3");
    assert_eq!(broker.queue_len(WORKER_QUEUE), 0);
    assert_eq!(broker.queue_len(RETRY_QUEUE), 0);
    assert_eq!(broker.unacked_len(WORKER_QUEUE), 0);
    // Original publish plus two trips back through the primary exchange.
    assert_eq!(broker.queue_len(ARCHIVE_QUEUE), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_park_falls_back_to_reject_when_broker_refuses() {
    let (broker, publisher) = setup().await;
    publisher.publish_job(&payload("vid1")).await.unwrap();

    let mut deliveries = broker.consume(WORKER_QUEUE, "test", 1).await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();

    broker.set_offline(true);
    let state = settle(
        delivery,
        &Disposition::Fail {
            reason: "bad payload".into(),
        },
        &publisher,
    )
    .await
    .unwrap();

    assert_eq!(state, DeliveryState::RetryCooldown);
    assert_eq!(broker.queue_len(FAILED_QUEUE), 0);
    assert_eq!(broker.queue_len(RETRY_QUEUE), 1);
}
