//! Business logic services.

pub mod lifecycle;
pub mod outbox_relay;

pub use lifecycle::{CreateOutcome, RequestLifecycle};
pub use outbox_relay::{OutboxRelay, RelayReport};
