//! Axum HTTP API server for video parser requests.
//!
//! This crate provides:
//! - CRUD over `/requests`, keyed by request name
//! - API key authentication
//! - Transactional outbox with a background relay to the broker
//! - Rate limiting, security headers and Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod state;

pub use auth::{ApiClient, ApiKeyRegistry};
pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use services::{CreateOutcome, OutboxRelay, RequestLifecycle};
pub use state::AppState;
