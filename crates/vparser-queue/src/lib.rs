//! AMQP messaging for the video parser pipeline.
//!
//! This crate provides:
//! - The fanout/retry/archive/failed exchange and queue topology
//! - A broker abstraction with a lapin implementation and an in-memory one
//! - A single-writer publisher with publisher confirms
//! - The delivery state machine and retry ceiling used by workers

pub mod amqp;
pub mod broker;
pub mod config;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod publisher;
pub mod topology;

pub use amqp::AmqpBroker;
pub use broker::{
    BindingSpec, Broker, DeathReason, DeathRecord, Delivery, DeliveryAcker, DeliveryStream,
    ExchangeKind, ExchangeSpec, IncomingMessage, OutgoingMessage, QueueSpec,
};
pub use config::QueueConfig;
pub use error::{QueueError, QueueResult};
pub use memory::MemoryBroker;
pub use protocol::{
    settle, DeliveryEvent, DeliveryState, Disposition, ProcessingOutcome, RetryPolicy,
};
pub use publisher::{Publisher, HEADER_ATTEMPTS, HEADER_FAILURE_REASON, HEADER_ORIGINAL_QUEUE};
pub use topology::{
    Topology, TopologyManager, ARCHIVE_QUEUE, BINDING_KEY, DEFAULT_RETRY_DELAY, FAILED_EXCHANGE,
    FAILED_QUEUE, PRIMARY_EXCHANGE, RETRY_EXCHANGE, RETRY_QUEUE, WORKER_QUEUE,
};
