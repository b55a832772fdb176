//! Job executor.

use std::sync::Arc;

use futures_util::StreamExt;
use metrics::counter;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use vparser_models::JobPayload;
use vparser_queue::{
    settle, Broker, Delivery, Disposition, ProcessingOutcome, Publisher, QueueError, RetryPolicy,
    WORKER_QUEUE,
};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::processor::{JobProcessor, JobReport};

/// Everything a spawned job needs.
#[derive(Clone)]
struct JobContext {
    processor: Arc<dyn JobProcessor>,
    publisher: Publisher,
    policy: RetryPolicy,
    config: WorkerConfig,
}

/// Consumes the worker queue and settles each delivery per the retry policy.
pub struct JobExecutor {
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    ctx: JobContext,
    job_semaphore: Arc<Semaphore>,
    consumer_tag: String,
}

impl JobExecutor {
    /// Create a new job executor.
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        publisher: Publisher,
        processor: Arc<dyn JobProcessor>,
        policy: RetryPolicy,
    ) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let consumer_tag = format!("vparser-worker-{}", Uuid::new_v4());

        Self {
            ctx: JobContext {
                processor,
                publisher,
                policy,
                config: config.clone(),
            },
            config,
            broker,
            job_semaphore,
            consumer_tag,
        }
    }

    /// Consume until `shutdown` flips to true, then wait for in-flight jobs.
    ///
    /// Returns an error if the delivery stream ends on its own (the broker
    /// connection is gone); the process is expected to be restarted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.consumer_tag, self.config.max_concurrent_jobs
        );

        let mut deliveries = self
            .broker
            .consume(WORKER_QUEUE, &self.consumer_tag, self.config.prefetch())
            .await?;

        let mut stream_error = None;
        loop {
            // Take a slot first so prefetched messages are not pulled while all slots are busy.
            let permit = tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                permit = Arc::clone(&self.job_semaphore).acquire_owned() => permit
                    .map_err(|_| WorkerError::job_failed("Semaphore closed"))?,
            };

            let delivery = tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!("Error consuming jobs: {}", e);
                        stream_error = Some(e);
                        break;
                    }
                    None => {
                        stream_error = Some(QueueError::ConsumeFailed(
                            "delivery stream ended".to_string(),
                        ));
                        break;
                    }
                },
            };

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                execute_job(ctx, delivery).await;
            });
        }

        info!("Shutdown signal received, stopping executor");
        // Unconsumed prefetched messages go back to the queue when the channel closes.
        drop(deliveries);

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!(
                "In-flight jobs still running after {:?}; they will be redelivered",
                self.config.shutdown_timeout
            );
        }

        info!("Job executor stopped");
        match stream_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Wait for all in-flight jobs to complete.
    async fn wait_for_jobs(&self) {
        let all = u32::try_from(self.config.max_concurrent_jobs).unwrap_or(u32::MAX);
        // Holding every permit means no job is running.
        if let Ok(permits) = self.job_semaphore.acquire_many(all).await {
            drop(permits);
        }
    }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Decode, process and settle one delivery.
async fn execute_job(ctx: JobContext, delivery: Delivery) {
    let prior_rejections = RetryPolicy::prior_rejections(&delivery.message);
    let message_id = delivery.message.message_id.clone();

    let outcome = match JobPayload::from_bytes(&delivery.message.body) {
        Err(e) => {
            warn!(message_id = ?message_id, "Undecodable job payload: {}", e);
            WorkerError::InvalidPayload(e.to_string()).outcome()
        }
        Ok(job) => {
            let logger = JobLogger::new(&job.name, message_id.as_deref(), ctx.processor.name());
            let span = logger.create_span();
            run_processor(&ctx, &job, &logger, prior_rejections + 1)
                .instrument(span)
                .await
        }
    };

    let disposition = ctx.policy.decide(&outcome, prior_rejections);
    let label = match &disposition {
        Disposition::Ack => "ack",
        Disposition::Retry => "retry",
        Disposition::Fail { .. } => "failed",
    };

    match settle(delivery, &disposition, &ctx.publisher).await {
        Ok(state) => {
            counter!("vparser_worker_jobs_total", "disposition" => label).increment(1);
            debug!(message_id = ?message_id, state = %state, "Delivery settled");
        }
        Err(e) => {
            // Unsettled deliveries are redelivered when the channel closes.
            counter!("vparser_worker_settle_errors_total").increment(1);
            error!(message_id = ?message_id, "Failed to settle delivery: {}", e);
        }
    }
}

async fn run_processor(
    ctx: &JobContext,
    job: &JobPayload,
    logger: &JobLogger,
    attempt: u64,
) -> ProcessingOutcome {
    logger.log_start(attempt);

    let result = tokio::time::timeout(ctx.config.job_timeout, ctx.processor.process(job))
        .await
        .unwrap_or_else(|_| Err(WorkerError::Timeout(ctx.config.job_timeout)));

    match result {
        Ok(JobReport::Completed) => {
            logger.log_completion("processed");
            ProcessingOutcome::Succeeded
        }
        Ok(JobReport::Skipped(reason)) => {
            logger.log_completion(reason);
            ProcessingOutcome::Succeeded
        }
        Err(e) => {
            if e.is_permanent_failure() {
                logger.log_error(&e.to_string());
            } else {
                logger.log_warning(&e.to_string());
            }
            e.outcome()
        }
    }
}
