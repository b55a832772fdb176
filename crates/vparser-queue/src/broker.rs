//! Broker abstraction.
//!
//! Everything above this module talks to a [`Broker`]; the AMQP client and
//! the in-memory emulation both implement it.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::QueueResult;

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Copy every message to every bound queue, ignoring routing keys.
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-message-ttl`
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter_exchange: None,
            message_ttl: None,
        }
    }

    pub fn dead_letter_to(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Message handed to the broker for publishing.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    /// Delivery mode 2; survives broker restarts on durable queues.
    pub persistent: bool,
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
}

impl OutgoingMessage {
    /// Persistent JSON message with a fresh message id.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: "application/json".to_string(),
            persistent: true,
            message_id: uuid::Uuid::new_v4().to_string(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Why the broker dead-lettered a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeathReason {
    Rejected,
    Expired,
    MaxLen,
    Other(String),
}

impl DeathReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::MaxLen => "maxlen",
            Self::Other(reason) => reason,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "rejected" => Self::Rejected,
            "expired" => Self::Expired,
            "maxlen" => Self::MaxLen,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the broker-maintained `x-death` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub queue: String,
    pub exchange: String,
    pub reason: DeathReason,
    pub count: u64,
}

/// A message as seen by a consumer.
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Most recent first, as the broker orders `x-death`.
    pub deaths: Vec<DeathRecord>,
    pub redelivered: bool,
}

impl IncomingMessage {
    /// How many times this message died in `queue` for `reason`.
    pub fn death_count(&self, queue: &str, reason: &DeathReason) -> u64 {
        self.deaths
            .iter()
            .filter(|d| d.queue == queue && &d.reason == reason)
            .map(|d| d.count)
            .sum()
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> QueueResult<()>;

    /// Negative acknowledgement without requeue; the broker dead-letters it.
    async fn reject(&self) -> QueueResult<()>;
}

/// A consumed message plus the handle needed to settle it.
pub struct Delivery {
    pub message: IncomingMessage,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(message: IncomingMessage, acker: Box<dyn DeliveryAcker>) -> Self {
        Self { message, acker }
    }

    pub async fn ack(self) -> QueueResult<()> {
        self.acker.ack().await
    }

    pub async fn reject(self) -> QueueResult<()> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

pub type DeliveryStream = BoxStream<'static, QueueResult<Delivery>>;

/// Operations the service needs from a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotent; fails with `TopologyConflict` if the exchange exists with other settings.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> QueueResult<()>;

    /// Idempotent; fails with `TopologyConflict` if the queue exists with other arguments.
    async fn declare_queue(&self, spec: &QueueSpec) -> QueueResult<()>;

    async fn bind_queue(&self, binding: &BindingSpec) -> QueueResult<()>;

    /// Publish and wait for the broker's confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> QueueResult<()>;

    /// Start consuming with at most `prefetch` unsettled deliveries.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> QueueResult<DeliveryStream>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> QueueResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_death_count_filters_by_queue_and_reason() {
        let message = IncomingMessage {
            deaths: vec![
                DeathRecord {
                    queue: "VideoParserWorkerRetryQueue".into(),
                    exchange: "VideoParserRetryExchange".into(),
                    reason: DeathReason::Expired,
                    count: 2,
                },
                DeathRecord {
                    queue: "VideoParserWorkerQueue".into(),
                    exchange: "VideoParserExchange".into(),
                    reason: DeathReason::Rejected,
                    count: 2,
                },
            ],
            ..Default::default()
        };

        assert_eq!(
            message.death_count("VideoParserWorkerQueue", &DeathReason::Rejected),
            2
        );
        assert_eq!(
            message.death_count("VideoParserWorkerQueue", &DeathReason::Expired),
            0
        );
    }

    #[test]
    fn test_death_reason_round_trips_unknown_values() {
        assert_eq!(DeathReason::parse("rejected"), DeathReason::Rejected);
        assert_eq!(DeathReason::parse("delivery_limit").as_str(), "delivery_limit");
    }
}
