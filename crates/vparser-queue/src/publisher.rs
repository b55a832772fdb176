//! Single-writer publisher.
//!
//! AMQP channels are not safe to publish on concurrently, so every publish
//! in the process goes through one task that owns the broker handle.
//! Callers talk to it over a bounded channel and wait for the broker's
//! confirmation on a oneshot.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vparser_models::JobPayload;

use crate::broker::{Broker, IncomingMessage, OutgoingMessage};
use crate::error::{QueueError, QueueResult};
use crate::topology::{FAILED_EXCHANGE, PRIMARY_EXCHANGE, WORKER_QUEUE};

pub const HEADER_FAILURE_REASON: &str = "x-failure-reason";
pub const HEADER_ATTEMPTS: &str = "x-attempts";
pub const HEADER_ORIGINAL_QUEUE: &str = "x-original-queue";

enum PublishCommand {
    Publish {
        exchange: &'static str,
        message: OutgoingMessage,
        reply: oneshot::Sender<QueueResult<()>>,
    },
    Shutdown,
}

/// Cloneable handle to the publishing task.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<PublishCommand>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Publisher {
    /// Spawn the publishing task. Must be called inside a tokio runtime.
    pub fn spawn(broker: Arc<dyn Broker>, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(run(broker, rx));
        Self {
            tx,
            task: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Publish a job to the primary exchange. Returns the message id.
    pub async fn publish_job(&self, payload: &JobPayload) -> QueueResult<String> {
        let message = OutgoingMessage::json(payload.to_bytes()?);
        let message_id = message.message_id.clone();
        self.send(PRIMARY_EXCHANGE, message).await?;
        Ok(message_id)
    }

    /// Park a worker message in the failed queue, annotated with why and how often it failed.
    pub async fn publish_failed(
        &self,
        original: &IncomingMessage,
        reason: &str,
        attempts: u64,
    ) -> QueueResult<()> {
        let mut message = OutgoingMessage::json(original.body.clone())
            .with_header(HEADER_FAILURE_REASON, reason)
            .with_header(HEADER_ATTEMPTS, attempts.to_string())
            .with_header(HEADER_ORIGINAL_QUEUE, WORKER_QUEUE);
        if let Some(id) = &original.message_id {
            message = message.with_message_id(id.clone());
        }
        self.send(FAILED_EXCHANGE, message).await
    }

    async fn send(&self, exchange: &'static str, message: OutgoingMessage) -> QueueResult<()> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(PublishCommand::Publish {
                exchange,
                message,
                reply,
            })
            .await
            .map_err(|_| QueueError::PublisherClosed)?;

        response.await.map_err(|_| QueueError::PublisherClosed)?
    }

    /// Stop accepting new publishes, finish the queued ones, and wait for the task to exit.
    pub async fn shutdown(&self) {
        // A full channel still drains; the task exits once it sees Shutdown.
        let _ = self.tx.send(PublishCommand::Shutdown).await;
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Publisher task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run(broker: Arc<dyn Broker>, mut rx: mpsc::Receiver<PublishCommand>) {
    info!("Publisher started");

    while let Some(command) = rx.recv().await {
        match command {
            PublishCommand::Publish {
                exchange,
                message,
                reply,
            } => {
                let message_id = message.message_id.clone();
                let started = Instant::now();
                let result = broker.publish(exchange, "", message).await;

                histogram!("vparser_publish_duration_seconds", "exchange" => exchange)
                    .record(started.elapsed().as_secs_f64());
                match &result {
                    Ok(()) => {
                        counter!("vparser_publish_total", "exchange" => exchange, "result" => "ok")
                            .increment(1);
                        debug!(exchange, message_id = %message_id, "Published");
                    }
                    Err(e) => {
                        counter!("vparser_publish_total", "exchange" => exchange, "result" => "error")
                            .increment(1);
                        warn!(exchange, message_id = %message_id, "Publish failed: {}", e);
                    }
                }

                // Caller may have given up; the outcome is already logged.
                let _ = reply.send(result);
            }
            PublishCommand::Shutdown => {
                rx.close();
            }
        }
    }

    info!("Publisher stopped");
}
