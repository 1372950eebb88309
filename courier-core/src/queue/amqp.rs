//! AMQP binding using [`lapin`].
//!
//! Messages are published to a durable direct exchange with a routing key and
//! consumed from a durable queue bound to it. The exchange, queue and binding
//! are declared on connect.
//!
//! Publishing uses publisher confirms and `mandatory` routing: a batch only
//! succeeds if the broker acknowledged every message and routed it to at
//! least one queue. User properties travel as AMQP headers.
//!
//! AMQP has neither a dead-letter operation nor lock renewal;
//! [`Receiver::dead_letter`](crate::receiver::Receiver::dead_letter) and
//! [`Receiver::keep_alive`](crate::receiver::Receiver::keep_alive) fail with
//! [`MessagingError::Unsupported`].
//!
//! # Example
//!
//! ```no_run
//! use courier::{
//!     message::Message,
//!     queue::{amqp::{AMQPOptions, AMQPPublisher, AMQPReceiverBackend}, Dispatch, Publisher},
//!     receiver::{QueueReceiver, Receiver, ReceiverExt},
//!     CancellationToken,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = AMQPOptions {
//!         uri: "amqp://localhost:5672",
//!         exchange: "orders",
//!         queue: "orders",
//!         routing_key: "orders",
//!         prefetch: 10,
//!         auto_ack: false,
//!         dispatch: Dispatch::Sequential,
//!     };
//!
//!     let publisher = AMQPPublisher::connect(&options).await?;
//!     publisher.send(vec![Message::new("hello world")]).await?;
//!     publisher.close().await?;
//!
//!     let receiver = Arc::new(QueueReceiver::new(AMQPReceiverBackend::new(&options)));
//!     let handler = {
//!         let receiver = receiver.clone();
//!         move |messages: Vec<Message>, _: CancellationToken| {
//!             let receiver = receiver.clone();
//!             async move {
//!                 receiver.confirm(&messages).await?;
//!                 anyhow::Ok(())
//!             }
//!         }
//!     };
//!     receiver.listen_with(handler, CancellationToken::new()).await?;
//!
//!     Ok(())
//! }
//! ```
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, ByteArray, FieldTable, LongString, ShortString},
    BasicProperties, ExchangeKind,
};
use tracing::{debug, instrument};

use super::{
    publisher::prepare_batch, BackendChannel, Capabilities, Dispatch, Publisher, RawDelivery,
    ReceiverBackend, Subscription,
};
use crate::{
    acker::DeliveryToken,
    common::consumer_tag,
    error::{MessagingError, Result},
    message::{system, Message, Properties, PropertyValue},
};

const BACKEND: &str = "amqp";

/// Options for connecting to an AMQP broker.
#[derive(Clone, Copy, Debug)]
pub struct AMQPOptions<'a> {
    /// The AMQP URI to connect to.
    pub uri: &'a str,
    /// The exchange messages are published to. The empty string selects the
    /// broker's default exchange, which routes by queue name.
    pub exchange: &'a str,
    pub queue: &'a str,
    pub routing_key: &'a str,
    /// The Quality of Service to use for the queue.
    /// This determines how many unacknowledged messages the broker will deliver
    /// to the consumer before requiring acknowledgements. By setting this,
    /// you can control the rate at which messages are delivered to a consumer,
    /// thus affecting throughput and ensuring that a single consumer
    /// doesn't get overwhelmed. See <https://www.rabbitmq.com/consumer-prefetch.html>
    pub prefetch: u16,
    /// Let the broker consider deliveries acknowledged as soon as they are
    /// sent. Confirming or rejecting such deliveries does nothing.
    pub auto_ack: bool,
    /// Dispatch policy, capped at `prefetch` concurrent handlers.
    pub dispatch: Dispatch,
}

/// Owned exchange, queue and routing key.
#[derive(Clone, Debug)]
struct Destination {
    exchange: String,
    queue: String,
    routing_key: String,
}

impl Destination {
    fn new(options: &AMQPOptions<'_>) -> Self {
        Self {
            exchange: options.exchange.to_string(),
            queue: options.queue.to_string(),
            routing_key: options.routing_key.to_string(),
        }
    }

    /// The default exchange routes by queue name.
    fn publish_routing_key(&self) -> &str {
        if self.exchange.is_empty() {
            &self.queue
        } else {
            &self.routing_key
        }
    }

    #[instrument(skip(channel), level = "debug")]
    async fn declare(&self, channel: &lapin::Channel) -> Result<()> {
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        if self.exchange.is_empty() {
            return Ok(());
        }

        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                &self.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }
}

async fn connect(uri: &str) -> Result<lapin::Connection> {
    let options = lapin::ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio);

    Ok(lapin::Connection::connect(uri, options).await?)
}

fn tag_of(token: &DeliveryToken) -> Result<u64> {
    match token {
        DeliveryToken::Tag(tag) => Ok(*tag),
        DeliveryToken::Lock(_) => Err(MessagingError::invalid_state(format!(
            "{token} is not a delivery tag"
        ))),
    }
}

/// Convert user properties into AMQP headers.
///
/// AMQP timestamps have a resolution of one second; sub-second precision is
/// dropped.
fn to_field_table(properties: &Properties) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in properties {
        let value = match value {
            PropertyValue::Null => AMQPValue::Void,
            PropertyValue::Bool(value) => AMQPValue::Boolean(*value),
            PropertyValue::Int(value) => AMQPValue::LongLongInt(*value),
            PropertyValue::Float(value) => AMQPValue::Double(*value),
            PropertyValue::String(value) => AMQPValue::LongString(LongString::from(value.clone())),
            PropertyValue::Bytes(value) => AMQPValue::ByteArray(ByteArray::from(value.to_vec())),
            PropertyValue::Timestamp(value) => {
                AMQPValue::Timestamp(u64::try_from(value.timestamp()).unwrap_or_default())
            }
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

fn from_amqp_value(value: &AMQPValue) -> Option<PropertyValue> {
    let value = match value {
        AMQPValue::Void => PropertyValue::Null,
        AMQPValue::Boolean(value) => PropertyValue::Bool(*value),
        AMQPValue::ShortShortInt(value) => PropertyValue::Int((*value).into()),
        AMQPValue::ShortShortUInt(value) => PropertyValue::Int((*value).into()),
        AMQPValue::ShortInt(value) => PropertyValue::Int((*value).into()),
        AMQPValue::ShortUInt(value) => PropertyValue::Int((*value).into()),
        AMQPValue::LongInt(value) => PropertyValue::Int((*value).into()),
        AMQPValue::LongUInt(value) => PropertyValue::Int((*value).into()),
        AMQPValue::LongLongInt(value) => PropertyValue::Int(*value),
        AMQPValue::Float(value) => PropertyValue::Float((*value).into()),
        AMQPValue::Double(value) => PropertyValue::Float(*value),
        AMQPValue::ShortString(value) => PropertyValue::String(value.as_str().to_string()),
        AMQPValue::LongString(value) => {
            PropertyValue::String(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        AMQPValue::ByteArray(value) => PropertyValue::Bytes(Bytes::copy_from_slice(value.as_slice())),
        AMQPValue::Timestamp(value) => {
            PropertyValue::Timestamp(DateTime::from_timestamp(i64::try_from(*value).ok()?, 0)?)
        }
        _ => return None,
    };
    Some(value)
}

/// Convert AMQP headers into user properties, skipping nested tables, arrays
/// and decimals.
fn from_field_table(table: &FieldTable) -> Properties {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let converted = from_amqp_value(value);
            if converted.is_none() {
                debug!(header = key.as_str(), "skipping unsupported header");
            }
            converted.map(|value| (key.as_str().to_string(), value))
        })
        .collect()
}

fn raw_delivery(delivery: Delivery, auto_ack: bool) -> RawDelivery {
    let id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    let properties = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    let mut system_properties = Properties::new();
    system_properties.insert(
        system::DELIVERY_TAG.to_string(),
        PropertyValue::Int(i64::try_from(delivery.delivery_tag).unwrap_or(i64::MAX)),
    );
    system_properties.insert(
        system::REDELIVERED.to_string(),
        delivery.redelivered.into(),
    );
    let enqueued = (*delivery.properties.timestamp())
        .and_then(|secs| DateTime::from_timestamp(i64::try_from(secs).ok()?, 0));
    if let Some(enqueued) = enqueued {
        system_properties.insert(system::ENQUEUED_TIME.to_string(), enqueued.into());
    }

    RawDelivery {
        id,
        content: Bytes::from(delivery.data),
        properties,
        system_properties,
        token: DeliveryToken::Tag(delivery.delivery_tag),
        settled: auto_ack,
    }
}

/// Publisher over a confirm-mode AMQP channel.
///
/// Batches are sent message by message, in order, each awaiting its
/// confirmation.
pub struct AMQPPublisher {
    connection: lapin::Connection,
    channel: lapin::Channel,
    destination: Destination,
}

impl AMQPPublisher {
    /// Connect, enable publisher confirms and declare the topology.
    pub async fn connect(options: &AMQPOptions<'_>) -> Result<Self> {
        let connection = connect(options.uri).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let destination = Destination::new(options);
        destination.declare(&channel).await?;

        Ok(Self {
            connection,
            channel,
            destination,
        })
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        let id = message.log_id();
        let properties = BasicProperties::default()
            .with_message_id(ShortString::from(id))
            .with_delivery_mode(2)
            .with_headers(to_field_table(message.properties()));

        let confirmation = self
            .channel
            .basic_publish(
                &self.destination.exchange,
                self.destination.publish_routing_key(),
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                message.content(),
                properties,
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Nack(_) => Err(MessagingError::transport(anyhow!(
                "broker refused message {id}"
            ))),
            Confirmation::Ack(Some(_)) => Err(MessagingError::transport(anyhow!(
                "message {id} could not be routed to any queue"
            ))),
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        }
    }
}

#[async_trait]
impl Publisher for AMQPPublisher {
    #[instrument(skip_all, fields(exchange = %self.destination.exchange, count = messages.len()), level = "trace")]
    async fn send(&self, messages: Vec<Message>) -> Result<()> {
        for message in prepare_batch(messages)? {
            self.publish(&message).await?;
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        _ = self.channel.close(200, "Goodbye").await;
        _ = self.connection.close(200, "Goodbye").await;

        Ok(())
    }
}

/// Receive side of an AMQP queue. Each subscription opens its own connection.
pub struct AMQPReceiverBackend {
    uri: String,
    destination: Destination,
    prefetch: u16,
    auto_ack: bool,
    dispatch: Dispatch,
}

impl AMQPReceiverBackend {
    pub fn new(options: &AMQPOptions<'_>) -> Self {
        let prefetch = options.prefetch.max(1);
        let dispatch = match options.dispatch {
            Dispatch::Concurrent(limit) => {
                Dispatch::with_limit(Some(limit.get().min(usize::from(prefetch))))
            }
            Dispatch::Sequential => Dispatch::Sequential,
        };

        Self {
            uri: options.uri.to_string(),
            destination: Destination::new(options),
            prefetch,
            auto_ack: options.auto_ack,
            dispatch,
        }
    }
}

#[async_trait]
impl ReceiverBackend for AMQPReceiverBackend {
    type Channel = AMQPChannel;

    fn name(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    #[instrument(skip(self), fields(queue = %self.destination.queue), level = "debug")]
    async fn subscribe(&self) -> Result<Subscription<Self::Channel>> {
        let connection = connect(&self.uri).await?;
        let channel = connection.create_channel().await?;
        channel.basic_qos(self.prefetch, Default::default()).await?;
        self.destination.declare(&channel).await?;

        let consumer_tag = consumer_tag(&self.destination.queue);
        let consumer = channel
            .basic_consume(
                &self.destination.queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: self.auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let auto_ack = self.auto_ack;
        let deliveries = consumer
            .map(move |delivery| {
                delivery
                    .map(|delivery| raw_delivery(delivery, auto_ack))
                    .map_err(MessagingError::from)
            })
            .boxed();

        Ok(Subscription {
            channel: AMQPChannel {
                connection,
                channel,
                queue: self.destination.queue.clone(),
                consumer_tag,
            },
            deliveries,
        })
    }
}

/// Channel of an open AMQP subscription.
pub struct AMQPChannel {
    connection: lapin::Connection,
    channel: lapin::Channel,
    queue: String,
    consumer_tag: String,
}

#[async_trait]
impl BackendChannel for AMQPChannel {
    #[instrument(skip(self), level = "trace")]
    async fn confirm(&self, token: &DeliveryToken) -> Result<()> {
        Ok(self
            .channel
            .basic_ack(tag_of(token)?, BasicAckOptions { multiple: false })
            .await?)
    }

    #[instrument(skip(self), level = "trace")]
    async fn reject(&self, token: &DeliveryToken) -> Result<()> {
        Ok(self
            .channel
            .basic_reject(tag_of(token)?, BasicRejectOptions { requeue: true })
            .await?)
    }

    async fn dead_letter(&self, _: &DeliveryToken, _: &str, _: &str) -> Result<()> {
        Err(MessagingError::unsupported("dead-letter", BACKEND))
    }

    async fn keep_alive(&self, _: &DeliveryToken, _: Option<Duration>) -> Result<()> {
        Err(MessagingError::unsupported("keep-alive", BACKEND))
    }

    async fn message_count(&self) -> Result<u64> {
        let queue = self
            .channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(queue.message_count().into())
    }

    /// Cancel the consumer and close the connection. The broker requeues
    /// every delivery that was not acknowledged.
    async fn close(&self) -> Result<()> {
        _ = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await;
        _ = self.channel.close(200, "Goodbye").await;
        _ = self.connection.close(200, "Goodbye").await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use chrono::Utc;

    use super::*;
    use crate::receiver::{QueueReceiver, Receiver, ReceiverState};

    fn options(prefetch: u16, dispatch: Dispatch) -> AMQPOptions<'static> {
        AMQPOptions {
            uri: "amqp://localhost:5672",
            exchange: "orders",
            queue: "orders",
            routing_key: "orders",
            prefetch,
            auto_ack: false,
            dispatch,
        }
    }

    #[test]
    fn headers_carry_user_properties() {
        let now = DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap();
        let properties: Properties = [
            ("tenant".to_string(), PropertyValue::from("acme")),
            ("attempt".to_string(), PropertyValue::from(2i64)),
            ("urgent".to_string(), PropertyValue::from(true)),
            ("ratio".to_string(), PropertyValue::from(0.5)),
            ("blob".to_string(), PropertyValue::from(vec![1u8, 2, 3])),
            ("at".to_string(), PropertyValue::from(now)),
            ("nothing".to_string(), PropertyValue::Null),
        ]
        .into_iter()
        .collect();

        assert_eq!(from_field_table(&to_field_table(&properties)), properties);
    }

    #[test]
    fn narrow_integers_widen() {
        let mut table = FieldTable::default();
        table.insert("small".into(), AMQPValue::ShortInt(-3));
        table.insert("nested".into(), AMQPValue::FieldTable(FieldTable::default()));

        let properties = from_field_table(&table);
        assert_eq!(properties.get("small"), Some(&PropertyValue::Int(-3)));
        assert!(!properties.contains_key("nested"));
    }

    #[test]
    fn concurrency_is_capped_by_prefetch() {
        let wide = Dispatch::Concurrent(NonZeroUsize::new(16).unwrap());
        assert_eq!(
            AMQPReceiverBackend::new(&options(4, wide)).dispatch(),
            Dispatch::with_limit(Some(4))
        );
        assert_eq!(
            AMQPReceiverBackend::new(&options(1, wide)).dispatch(),
            Dispatch::Sequential
        );
    }

    #[test]
    fn default_exchange_routes_by_queue() {
        let destination = Destination::new(&AMQPOptions {
            exchange: "",
            ..options(1, Dispatch::Sequential)
        });
        assert_eq!(destination.publish_routing_key(), "orders");
    }

    #[tokio::test]
    async fn capability_gaps_are_reported_without_a_connection() {
        let receiver = QueueReceiver::new(AMQPReceiverBackend::new(&options(
            1,
            Dispatch::Sequential,
        )));
        let message = Message::new("x");

        assert_eq!(receiver.capabilities(), Capabilities::default());
        assert_eq!(receiver.state(), ReceiverState::Idle);
        assert!(matches!(
            receiver.dead_letter(&message, "reason", "description").await,
            Err(MessagingError::Unsupported {
                operation: "dead-letter",
                backend: "amqp"
            })
        ));
        assert!(matches!(
            receiver.keep_alive(&message, None).await,
            Err(MessagingError::Unsupported {
                operation: "keep-alive",
                backend: "amqp"
            })
        ));
        assert!(matches!(
            receiver.message_count().await,
            Err(MessagingError::InvalidState(_))
        ));
        assert!(matches!(
            receiver.confirm(&[message]).await,
            Err(MessagingError::ForeignMessage { .. })
        ));
    }
}
