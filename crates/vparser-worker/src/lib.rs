//! Video parser worker.
//!
//! This crate provides:
//! - Job executor consuming the worker queue with bounded concurrency
//! - Ack / retry / fail settlement per the retry policy
//! - The `JobProcessor` seam and the default processor
//! - Graceful shutdown

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod processor;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::JobLogger;
pub use processor::{JobProcessor, JobReport, MarkProcessedProcessor};
