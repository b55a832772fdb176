//! Job store for video processing requests.
//!
//! This crate provides:
//! - The `JobStore` contract used by the API and workers
//! - A Postgres implementation (sqlx) with ordered migrations
//! - A transactional outbox for publish intents
//! - An in-memory implementation for tests and local runs

pub mod config;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod repo;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryJobStore;
pub use postgres::{PgJobStore, MIGRATOR};
pub use repo::{CreatedRequest, JobStore, OutboxEntry};
