//! RabbitMQ broker over lapin.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use crate::broker::{
    BindingSpec, Broker, DeathReason, DeathRecord, Delivery, DeliveryAcker, DeliveryStream,
    ExchangeKind, ExchangeSpec, IncomingMessage, OutgoingMessage, QueueSpec,
};
use crate::error::{QueueError, QueueResult};

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Broker backed by one AMQP connection.
///
/// Declarations and publishes share a confirm-mode channel; each consumer
/// gets its own channel so its prefetch does not affect the others.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(uri: &str) -> QueueResult<Self> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect(uri, properties)
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!("Connected to AMQP broker");
        Ok(Self {
            connection,
            channel,
        })
    }
}

/// The broker answers a mismatched redeclaration with PRECONDITION_FAILED
/// and closes the channel.
fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    )
}

fn declaration_error(entity: &str, err: lapin::Error) -> QueueError {
    if is_precondition_failed(&err) {
        QueueError::topology_conflict(format!("{entity}: {err}"))
    } else {
        QueueError::Amqp(err)
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(dlx) = &spec.dead_letter_exchange {
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(dlx.as_str())),
        );
    }
    if let Some(ttl) = spec.message_ttl {
        let millis = i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX);
        arguments.insert(ShortString::from("x-message-ttl"), AMQPValue::LongInt(millis));
    }
    arguments
}

fn value_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn value_count(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::LongLongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(u64::from(*n)),
        _ => None,
    }
}

fn field<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(k, _)| k.as_str() == key)
        .map(|(_, v)| v)
}

fn parse_deaths(value: &AMQPValue) -> Vec<DeathRecord> {
    let AMQPValue::FieldArray(entries) = value else {
        return Vec::new();
    };
    entries
        .as_slice()
        .iter()
        .filter_map(|entry| match entry {
            AMQPValue::FieldTable(table) => Some(DeathRecord {
                queue: field(table, "queue").and_then(value_text).unwrap_or_default(),
                exchange: field(table, "exchange").and_then(value_text).unwrap_or_default(),
                reason: DeathReason::parse(
                    &field(table, "reason").and_then(value_text).unwrap_or_default(),
                ),
                count: field(table, "count").and_then(value_count).unwrap_or(1),
            }),
            _ => None,
        })
        .collect()
}

fn into_incoming(delivery: &AmqpDelivery) -> IncomingMessage {
    let mut headers = BTreeMap::new();
    let mut deaths = Vec::new();

    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            if key.as_str() == "x-death" {
                deaths = parse_deaths(value);
            } else if let Some(text) = value_text(value) {
                headers.insert(key.as_str().to_string(), text);
            }
        }
    }

    IncomingMessage {
        body: delivery.data.clone(),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        headers,
        deaths,
        redelivered: delivery.redelivered,
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> QueueResult<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| QueueError::AckFailed(e.to_string()))
    }

    async fn reject(&self) -> QueueResult<()> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
            .map_err(|e| QueueError::AckFailed(e.to_string()))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> QueueResult<()> {
        let kind = match spec.kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            ..Default::default()
        };
        self.channel
            .exchange_declare(&spec.name, kind, options, FieldTable::default())
            .await
            .map_err(|e| declaration_error(&spec.name, e))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> QueueResult<()> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            ..Default::default()
        };
        let queue = self
            .channel
            .queue_declare(&spec.name, options, queue_arguments(spec))
            .await
            .map_err(|e| declaration_error(&spec.name, e))?;
        debug!(queue = %spec.name, messages = queue.message_count(), "Queue ready");
        Ok(())
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> QueueResult<()> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declaration_error(&binding.queue, e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> QueueResult<()> {
        let mut headers = FieldTable::default();
        for (key, value) in &message.headers {
            headers.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            );
        }

        let delivery_mode = if message.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };
        let timestamp = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type.as_str()))
            .with_delivery_mode(delivery_mode)
            .with_message_id(ShortString::from(message.message_id.as_str()))
            .with_timestamp(timestamp)
            .with_headers(headers);

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| QueueError::publish_failed(e.to_string()))?
            .await
            .map_err(|e| QueueError::publish_failed(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(QueueError::PublishNacked {
                exchange: exchange.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> QueueResult<DeliveryStream> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::ConsumeFailed(e.to_string()))?;

        info!(queue, consumer_tag, prefetch, "Consuming");

        // The stream owns the consumer channel for as long as it is polled.
        let stream = consumer.map(move |item| {
            let _channel = &channel;
            item.map(|delivery| {
                let message = into_incoming(&delivery);
                Delivery::new(message, Box::new(AmqpAcker(delivery.acker)))
            })
            .map_err(|e| QueueError::ConsumeFailed(e.to_string()))
        });
        Ok(Box::pin(stream))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> QueueResult<()> {
        if self.connection.status().connected() {
            self.connection.close(200, "Normal shutdown").await?;
        }
        info!("AMQP connection closed");
        Ok(())
    }
}
