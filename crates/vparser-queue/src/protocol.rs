//! Delivery lifecycle and retry decisions.
//!
//! A message published to the primary exchange fans out into a worker copy
//! and an archive copy. The worker copy cycles through the retry queue on
//! every rejection until it is acknowledged, or until the retry ceiling
//! sends it to the failed queue.

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::broker::{DeathReason, Delivery, IncomingMessage};
use crate::error::{QueueError, QueueResult};
use crate::publisher::Publisher;
use crate::topology::WORKER_QUEUE;

/// Where a single message copy is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    PendingDelivery,
    InProcessing,
    RetryCooldown,
    Requeued,
    ArchivedCopy,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEvent {
    Delivered,
    Acked,
    Rejected,
    Exhausted,
    TtlExpired,
    FannedOut,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingDelivery => "pending_delivery",
            Self::InProcessing => "in_processing",
            Self::RetryCooldown => "retry_cooldown",
            Self::Requeued => "requeued",
            Self::ArchivedCopy => "archived_copy",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ArchivedCopy | Self::Completed | Self::Failed)
    }

    /// Apply an event; any pair not listed here is a protocol violation.
    pub fn on(self, event: DeliveryEvent) -> QueueResult<DeliveryState> {
        use DeliveryEvent as E;
        use DeliveryState as S;

        match (self, event) {
            (S::PendingDelivery, E::Delivered) => Ok(S::InProcessing),
            (S::InProcessing, E::Acked) => Ok(S::Completed),
            (S::InProcessing, E::Rejected) => Ok(S::RetryCooldown),
            (S::InProcessing, E::Exhausted) => Ok(S::Failed),
            (S::RetryCooldown, E::TtlExpired) => Ok(S::Requeued),
            (S::Requeued, E::FannedOut) => Ok(S::PendingDelivery),
            (state, event) => Err(QueueError::InvalidTransition {
                state: state.as_str(),
                event: event.as_str(),
            }),
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DeliveryEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Acked => "acked",
            Self::Rejected => "rejected",
            Self::Exhausted => "exhausted",
            Self::TtlExpired => "ttl_expired",
            Self::FannedOut => "fanned_out",
        }
    }
}

/// Result of handing a message to a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Succeeded,
    /// Transient failure; worth another attempt after the cooldown.
    Retryable(String),
    /// The message can never succeed (bad payload, invalid data).
    Permanent(String),
}

/// What to tell the broker about a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject without requeue; the broker routes it through the retry queue.
    Retry,
    /// Park in the failed queue, then acknowledge.
    Fail { reason: String },
}

impl Disposition {
    pub fn event(&self) -> DeliveryEvent {
        match self {
            Self::Ack => DeliveryEvent::Acked,
            Self::Retry => DeliveryEvent::Rejected,
            Self::Fail { .. } => DeliveryEvent::Exhausted,
        }
    }
}

/// Retry ceiling for worker deliveries.
///
/// The cooldown between attempts is the retry queue's `x-message-ttl`
/// (see [`crate::topology::Topology::video_parser`]), not part of the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Rejections allowed before the message is parked. `None` is unbounded.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(5),
        }
    }
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self { max_retries: None }
    }

    /// Rejections the broker has recorded for this message on the worker queue.
    pub fn prior_rejections(message: &IncomingMessage) -> u64 {
        message.death_count(WORKER_QUEUE, &DeathReason::Rejected)
    }

    pub fn decide(&self, outcome: &ProcessingOutcome, prior_rejections: u64) -> Disposition {
        match outcome {
            ProcessingOutcome::Succeeded => Disposition::Ack,
            ProcessingOutcome::Permanent(reason) => Disposition::Fail {
                reason: reason.clone(),
            },
            ProcessingOutcome::Retryable(reason) => match self.max_retries {
                Some(max) if prior_rejections >= u64::from(max) => Disposition::Fail {
                    reason: format!("retries exhausted after {prior_rejections} attempts: {reason}"),
                },
                _ => Disposition::Retry,
            },
        }
    }
}

/// Settle a delivery according to its disposition.
///
/// `Fail` publishes a copy to the failed exchange before acknowledging; if
/// that publish fails the delivery is rejected instead, so the message is
/// never lost.
pub async fn settle(
    delivery: Delivery,
    disposition: &Disposition,
    publisher: &Publisher,
) -> QueueResult<DeliveryState> {
    let state = DeliveryState::InProcessing;
    match disposition {
        Disposition::Ack => {
            delivery.ack().await?;
        }
        Disposition::Retry => {
            delivery.reject().await?;
        }
        Disposition::Fail { reason } => {
            let attempts = RetryPolicy::prior_rejections(&delivery.message) + 1;
            if let Err(e) = publisher
                .publish_failed(&delivery.message, reason, attempts)
                .await
            {
                warn!("Could not park message in failed queue, rejecting instead: {}", e);
                delivery.reject().await?;
                return state.on(DeliveryEvent::Rejected);
            }
            delivery.ack().await?;
        }
    }

    let next = state.on(disposition.event())?;
    debug!(state = %next, "Delivery settled");
    Ok(next)
}
