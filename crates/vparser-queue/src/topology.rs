//! Exchange/queue topology for the video parser pipeline.
//!
//! ```text
//! VideoParserExchange (fanout) ──┬──> VideoParserWorkerQueue ──reject──> VideoParserRetryExchange
//!                                └──> VideoParserArchiveQueue                   │
//!                                                                               v
//! VideoParserExchange <──ttl expiry── VideoParserWorkerRetryQueue <─────────────┘
//!
//! VideoParserFailedExchange (fanout) ──> VideoParserFailedQueue
//! ```
//!
//! Names and arguments are wire-visible: other services declare the same
//! entities, and any mismatch makes the broker refuse the declaration.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::broker::{BindingSpec, Broker, ExchangeSpec, QueueSpec};
use crate::error::{QueueError, QueueResult};

pub const PRIMARY_EXCHANGE: &str = "VideoParserExchange";
pub const RETRY_EXCHANGE: &str = "VideoParserRetryExchange";
pub const FAILED_EXCHANGE: &str = "VideoParserFailedExchange";

pub const WORKER_QUEUE: &str = "VideoParserWorkerQueue";
pub const RETRY_QUEUE: &str = "VideoParserWorkerRetryQueue";
pub const ARCHIVE_QUEUE: &str = "VideoParserArchiveQueue";
pub const FAILED_QUEUE: &str = "VideoParserFailedQueue";

/// Placeholder routing key; fanout exchanges ignore it.
pub const BINDING_KEY: &str = "*";

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(60_000);

/// The full set of entities to declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    /// The video parser topology with the given retry cooldown.
    pub fn video_parser(retry_delay: Duration) -> Self {
        let bind = |queue: &str, exchange: &str| BindingSpec {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: BINDING_KEY.to_string(),
        };

        Self {
            exchanges: vec![
                ExchangeSpec::fanout(PRIMARY_EXCHANGE),
                ExchangeSpec::fanout(RETRY_EXCHANGE),
                ExchangeSpec::fanout(FAILED_EXCHANGE),
            ],
            queues: vec![
                QueueSpec::durable(WORKER_QUEUE).dead_letter_to(RETRY_EXCHANGE),
                QueueSpec::durable(RETRY_QUEUE)
                    .dead_letter_to(PRIMARY_EXCHANGE)
                    .with_ttl(retry_delay),
                QueueSpec::durable(ARCHIVE_QUEUE),
                QueueSpec::durable(FAILED_QUEUE),
            ],
            bindings: vec![
                bind(WORKER_QUEUE, PRIMARY_EXCHANGE),
                bind(ARCHIVE_QUEUE, PRIMARY_EXCHANGE),
                bind(RETRY_QUEUE, RETRY_EXCHANGE),
                bind(FAILED_QUEUE, FAILED_EXCHANGE),
            ],
        }
    }

    /// Check that every binding and dead-letter target refers to a declared entity.
    pub fn validate(&self) -> QueueResult<()> {
        let exchanges: HashSet<&str> = self.exchanges.iter().map(|e| e.name.as_str()).collect();
        let queues: HashSet<&str> = self.queues.iter().map(|q| q.name.as_str()).collect();

        for queue in &self.queues {
            if let Some(dlx) = &queue.dead_letter_exchange {
                if !exchanges.contains(dlx.as_str()) {
                    return Err(QueueError::UnknownExchange(format!(
                        "{dlx} (dead-letter target of {})",
                        queue.name
                    )));
                }
            }
        }
        for binding in &self.bindings {
            if !exchanges.contains(binding.exchange.as_str()) {
                return Err(QueueError::UnknownExchange(binding.exchange.clone()));
            }
            if !queues.contains(binding.queue.as_str()) {
                return Err(QueueError::UnknownQueue(binding.queue.clone()));
            }
        }
        Ok(())
    }
}

/// Declares a [`Topology`] against a broker.
pub struct TopologyManager {
    broker: Arc<dyn Broker>,
    topology: Topology,
}

impl TopologyManager {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology) -> Self {
        Self { broker, topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declare exchanges, then queues, then bindings.
    ///
    /// Safe to run from every process on every start. Stops at the first
    /// failure; a `TopologyConflict` must abort startup.
    pub async fn declare(&self) -> QueueResult<()> {
        self.topology.validate()?;

        for exchange in &self.topology.exchanges {
            self.broker.declare_exchange(exchange).await?;
            debug!(exchange = %exchange.name, "Declared exchange");
        }
        for queue in &self.topology.queues {
            self.broker.declare_queue(queue).await?;
            debug!(queue = %queue.name, dlx = ?queue.dead_letter_exchange, ttl = ?queue.message_ttl, "Declared queue");
        }
        for binding in &self.topology.bindings {
            self.broker.bind_queue(binding).await?;
            debug!(queue = %binding.queue, exchange = %binding.exchange, "Bound queue");
        }

        info!(
            exchanges = self.topology.exchanges.len(),
            queues = self.topology.queues.len(),
            bindings = self.topology.bindings.len(),
            "Broker topology declared"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    #[test]
    fn test_video_parser_topology_wiring() {
        let topology = Topology::video_parser(DEFAULT_RETRY_DELAY);
        topology.validate().unwrap();

        let worker = topology.queues.iter().find(|q| q.name == WORKER_QUEUE).unwrap();
        assert_eq!(worker.dead_letter_exchange.as_deref(), Some(RETRY_EXCHANGE));
        assert_eq!(worker.message_ttl, None);

        let retry = topology.queues.iter().find(|q| q.name == RETRY_QUEUE).unwrap();
        assert_eq!(retry.dead_letter_exchange.as_deref(), Some(PRIMARY_EXCHANGE));
        assert_eq!(retry.message_ttl, Some(Duration::from_millis(60_000)));

        let archive = topology.queues.iter().find(|q| q.name == ARCHIVE_QUEUE).unwrap();
        assert_eq!(archive.dead_letter_exchange, None);

        assert!(topology.exchanges.iter().all(|e| e.durable));
        assert!(topology.bindings.iter().all(|b| b.routing_key == "*"));
    }

    #[test]
    fn test_validate_rejects_dangling_binding() {
        let mut topology = Topology::video_parser(DEFAULT_RETRY_DELAY);
        topology.bindings.push(BindingSpec {
            queue: "Nowhere".into(),
            exchange: PRIMARY_EXCHANGE.into(),
            routing_key: BINDING_KEY.into(),
        });
        assert!(matches!(topology.validate(), Err(QueueError::UnknownQueue(_))));
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = Arc::new(MemoryBroker::new());
        let manager = TopologyManager::new(broker.clone(), Topology::video_parser(DEFAULT_RETRY_DELAY));

        manager.declare().await.unwrap();
        manager.declare().await.unwrap();

        assert_eq!(broker.bindings_of(PRIMARY_EXCHANGE), vec![WORKER_QUEUE, ARCHIVE_QUEUE]);
    }

    #[tokio::test]
    async fn test_declare_conflicting_ttl_is_fatal() {
        let broker = Arc::new(MemoryBroker::new());
        TopologyManager::new(broker.clone(), Topology::video_parser(DEFAULT_RETRY_DELAY))
            .declare()
            .await
            .unwrap();

        let err = TopologyManager::new(broker, Topology::video_parser(Duration::from_secs(5)))
            .declare()
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::TopologyConflict(_)));
    }
}
