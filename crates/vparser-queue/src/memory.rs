//! In-memory broker for tests and local development.
//!
//! Emulates the parts of AMQP the pipeline relies on: fanout exchanges,
//! dead-letter exchanges with `x-death` bookkeeping, and per-queue message
//! TTL. TTL timers run on tokio time, so tests can drive them with a
//! paused clock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::broker::{
    BindingSpec, Broker, DeathReason, DeathRecord, Delivery, DeliveryAcker, DeliveryStream,
    ExchangeSpec, IncomingMessage, OutgoingMessage, QueueSpec,
};
use crate::error::{QueueError, QueueResult};

#[derive(Debug, Clone)]
struct Envelope {
    seq: u64,
    body: Vec<u8>,
    message_id: Option<String>,
    headers: BTreeMap<String, String>,
    deaths: Vec<DeathRecord>,
    /// Exchange the message was last routed through.
    exchange: String,
}

impl Envelope {
    fn to_incoming(&self) -> IncomingMessage {
        IncomingMessage {
            body: self.body.clone(),
            message_id: self.message_id.clone(),
            headers: self.headers.clone(),
            deaths: self.deaths.clone(),
            redelivered: false,
        }
    }
}

struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<Envelope>,
    unacked: usize,
    notify: Arc<Notify>,
}

struct MemoryExchange {
    spec: ExchangeSpec,
    bound: Vec<String>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, MemoryExchange>,
    queues: HashMap<String, MemoryQueue>,
    next_seq: u64,
    published: u64,
    offline: bool,
    closed: bool,
}

type SharedState = Arc<Mutex<BrokerState>>;

/// Broker held entirely in process memory.
///
/// `prefetch` is accepted but not enforced; a consumer may hold any number
/// of unsettled deliveries.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: SharedState,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline, publishes fail and `is_connected` reports false.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Messages waiting in a queue, not counting unsettled deliveries.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed to consumers and not yet settled.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.unacked)
    }

    /// Remove and return every waiting message in a queue.
    pub fn drain(&self, queue: &str) -> Vec<IncomingMessage> {
        let mut state = self.state.lock();
        match state.queues.get_mut(queue) {
            Some(q) => q.ready.drain(..).map(|e| e.to_incoming()).collect(),
            None => Vec::new(),
        }
    }

    /// Queues bound to an exchange, in binding order.
    pub fn bindings_of(&self, exchange: &str) -> Vec<String> {
        self.state
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bound.clone())
            .unwrap_or_default()
    }

    /// Successful publishes since creation.
    pub fn published_count(&self) -> u64 {
        self.state.lock().published
    }
}

fn next_seq(state: &mut BrokerState) -> u64 {
    state.next_seq += 1;
    state.next_seq
}

/// Copy a message into every queue bound to `exchange`.
fn route(
    state: &mut BrokerState,
    shared: &Weak<Mutex<BrokerState>>,
    exchange: &str,
    mut envelope: Envelope,
) -> QueueResult<usize> {
    let targets = state
        .exchanges
        .get(exchange)
        .map(|e| e.bound.clone())
        .ok_or_else(|| QueueError::UnknownExchange(exchange.to_string()))?;

    envelope.exchange = exchange.to_string();
    let mut delivered = 0;
    for name in targets {
        let mut copy = envelope.clone();
        copy.seq = next_seq(state);
        if let Some(queue) = state.queues.get_mut(&name) {
            if let Some(ttl) = queue.spec.message_ttl {
                schedule_expiry(shared.clone(), name.clone(), copy.seq, ttl);
            }
            queue.ready.push_back(copy);
            queue.notify.notify_one();
            delivered += 1;
        }
    }
    Ok(delivered)
}

fn schedule_expiry(shared: Weak<Mutex<BrokerState>>, queue: String, seq: u64, ttl: Duration) {
    let deadline = tokio::time::Instant::now() + ttl;
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        let Some(state) = shared.upgrade() else {
            return;
        };
        let weak = Arc::downgrade(&state);
        let mut state = state.lock();
        expire(&mut state, &weak, &queue, seq);
    });
}

fn expire(state: &mut BrokerState, shared: &Weak<Mutex<BrokerState>>, queue_name: &str, seq: u64) {
    let Some(queue) = state.queues.get_mut(queue_name) else {
        return;
    };
    // Already consumed or drained.
    let Some(pos) = queue.ready.iter().position(|e| e.seq == seq) else {
        return;
    };
    let envelope = queue.ready.remove(pos);
    if let Some(envelope) = envelope {
        dead_letter(state, shared, queue_name, envelope, DeathReason::Expired);
    }
}

fn dead_letter(
    state: &mut BrokerState,
    shared: &Weak<Mutex<BrokerState>>,
    from_queue: &str,
    mut envelope: Envelope,
    reason: DeathReason,
) {
    let dlx = state
        .queues
        .get(from_queue)
        .and_then(|q| q.spec.dead_letter_exchange.clone());
    let Some(dlx) = dlx else {
        debug!(queue = from_queue, %reason, "Dropping message, queue has no dead-letter exchange");
        return;
    };

    let exchange = envelope.exchange.clone();
    record_death(&mut envelope.deaths, from_queue, &exchange, reason);
    if let Err(e) = route(state, shared, &dlx, envelope) {
        warn!(queue = from_queue, dlx = %dlx, "Dead-letter routing failed: {}", e);
    }
}

/// Same rules as the broker's `x-death` header: an existing (queue, reason)
/// entry is incremented and moved to the front, otherwise a new entry is
/// prepended.
fn record_death(deaths: &mut Vec<DeathRecord>, queue: &str, exchange: &str, reason: DeathReason) {
    match deaths
        .iter()
        .position(|d| d.queue == queue && d.reason == reason)
    {
        Some(pos) => {
            let mut record = deaths.remove(pos);
            record.count += 1;
            deaths.insert(0, record);
        }
        None => deaths.insert(
            0,
            DeathRecord {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                reason,
                count: 1,
            },
        ),
    }
}

fn settle(state: &mut BrokerState, queue: &str) -> QueueResult<()> {
    let queue = state
        .queues
        .get_mut(queue)
        .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
    queue.unacked = queue.unacked.saturating_sub(1);
    Ok(())
}

struct MemoryAcker {
    shared: Weak<Mutex<BrokerState>>,
    queue: String,
    envelope: Envelope,
}

impl MemoryAcker {
    fn state(&self) -> QueueResult<SharedState> {
        self.shared
            .upgrade()
            .ok_or_else(|| QueueError::AckFailed("broker dropped".into()))
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> QueueResult<()> {
        let state = self.state()?;
        let mut state = state.lock();
        settle(&mut state, &self.queue)
    }

    async fn reject(&self) -> QueueResult<()> {
        let shared = self.state()?;
        let mut state = shared.lock();
        settle(&mut state, &self.queue)?;
        dead_letter(
            &mut state,
            &self.shared,
            &self.queue,
            self.envelope.clone(),
            DeathReason::Rejected,
        );
        Ok(())
    }
}

struct MemoryConsumer {
    shared: SharedState,
    queue: String,
    notify: Arc<Notify>,
}

impl MemoryConsumer {
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.closed {
                    return None;
                }
                let queue = state.queues.get_mut(&self.queue)?;
                if let Some(envelope) = queue.ready.pop_front() {
                    queue.unacked += 1;
                    let message = envelope.to_incoming();
                    let acker = MemoryAcker {
                        shared: Arc::downgrade(&self.shared),
                        queue: self.queue.clone(),
                        envelope,
                    };
                    return Some(Delivery::new(message, Box::new(acker)));
                }
            }

            notified.await;
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> QueueResult<()> {
        let mut state = self.state.lock();
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(QueueError::topology_conflict(format!(
                "exchange {} already declared as {:?}",
                spec.name, existing.spec
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    spec.name.clone(),
                    MemoryExchange {
                        spec: spec.clone(),
                        bound: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> QueueResult<()> {
        let mut state = self.state.lock();
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(QueueError::topology_conflict(format!(
                "queue {} already declared as {:?}",
                spec.name, existing.spec
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    MemoryQueue {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        unacked: 0,
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> QueueResult<()> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(&binding.queue) {
            return Err(QueueError::UnknownQueue(binding.queue.clone()));
        }
        let exchange = state
            .exchanges
            .get_mut(&binding.exchange)
            .ok_or_else(|| QueueError::UnknownExchange(binding.exchange.clone()))?;
        if !exchange.bound.contains(&binding.queue) {
            exchange.bound.push(binding.queue.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        _routing_key: &str,
        message: OutgoingMessage,
    ) -> QueueResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::connection_failed("broker closed"));
        }
        if state.offline {
            return Err(QueueError::publish_failed("broker offline"));
        }

        let envelope = Envelope {
            seq: 0,
            body: message.body,
            message_id: Some(message.message_id),
            headers: message.headers,
            deaths: Vec::new(),
            exchange: exchange.to_string(),
        };
        let weak = Arc::downgrade(&self.state);
        let delivered = route(&mut state, &weak, exchange, envelope)?;
        state.published += 1;
        debug!(exchange, queues = delivered, "Published message");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _prefetch: u16,
    ) -> QueueResult<DeliveryStream> {
        let notify = {
            let state = self.state.lock();
            if state.closed {
                return Err(QueueError::ConsumeFailed("broker closed".into()));
            }
            state
                .queues
                .get(queue)
                .map(|q| q.notify.clone())
                .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?
        };

        let consumer = MemoryConsumer {
            shared: self.state.clone(),
            queue: queue.to_string(),
            notify,
        };
        Ok(Box::pin(futures_util::stream::unfold(
            consumer,
            |consumer| async move {
                let delivery = consumer.next_delivery().await?;
                Some((Ok(delivery), consumer))
            },
        )))
    }

    fn is_connected(&self) -> bool {
        let state = self.state.lock();
        !state.closed && !state.offline
    }

    async fn close(&self) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.closed = true;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
        Ok(())
    }
}
