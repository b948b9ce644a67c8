use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use lapin::{
    BasicProperties, Connection, ConnectionProperties,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, ShortString},
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_stream::StreamExt as _;

use crate::{
    Envelope,
    channel::{
        Acknowledge, AutoAcked, ChannelError, ConsumeOptions, Delivery, DeliveryStream, Queue,
        QueueChannel, QueueOptions,
    },
    envelope::Headers,
    telemetry::DEFAULT_EXCHANGE,
};

/// `messaging.system` value reported by RabbitMQ channels.
pub const SYSTEM: &str = "rabbitmq";

const AMQP_ADDR: &str = "AMQP_ADDR";
const DEFAULT_URI: &str = "amqp://127.0.0.1:5672/%2f";

/// Connection settings for a RabbitMQ broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RabbitMqConfig {
    /// AMQP URI, including the virtual host.
    pub uri: String,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_owned(),
        }
    }
}

impl RabbitMqConfig {
    /// Read the URI from `AMQP_ADDR`, falling back to a local broker.
    pub fn from_env() -> Self {
        Self {
            uri: std::env::var(AMQP_ADDR).unwrap_or_else(|_| DEFAULT_URI.to_owned()),
        }
    }

    /// Open a connection. Senders and receivers then open their own channel
    /// on it with [`RabbitMq::open`].
    #[tracing::instrument(skip_all)]
    pub async fn connect(&self) -> Result<Connection, lapin::Error> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        tracing::info!("Connected to RabbitMQ");
        Ok(connection)
    }
}

/// RabbitMQ channel.
///
/// Envelopes are published to the default exchange with the queue name as
/// routing key. Envelope headers travel as AMQP long-string headers.
///
/// The channel is wrapped in `Arc<Mutex<_>>` so declarations, publishes and
/// consumer registrations issued through `&self` are serialized.
pub struct RabbitMq {
    channel: Arc<Mutex<lapin::Channel>>,
    declared: Mutex<HashMap<Queue, QueueOptions>>,
    consumers: AtomicUsize,
    persistent: bool,
}

impl RabbitMq {
    /// Open a new channel on the connection.
    pub async fn open(connection: &Connection) -> Result<Self, lapin::Error> {
        Ok(Self::new(connection.create_channel().await?))
    }

    /// Wrap an already open channel.
    pub fn new(channel: lapin::Channel) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
            declared: Mutex::new(HashMap::new()),
            consumers: AtomicUsize::new(0),
            persistent: false,
        }
    }

    /// Publish with delivery mode 2, so messages on durable queues survive a
    /// broker restart. Off by default.
    pub fn with_persistent_messages(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Put the channel in confirm mode, so every publish waits for the
    /// broker's confirmation and a broker nack fails the publish.
    ///
    /// Without confirms, [`QueueChannel::publish`] resolves once the frame is
    /// written to the connection.
    pub async fn with_publisher_confirms(self, enabled: bool) -> Result<Self, lapin::Error> {
        if enabled {
            self.channel
                .lock()
                .await
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }
        Ok(self)
    }

    fn consumer_tag(&self, queue: &Queue) -> String {
        let n = self.consumers.fetch_add(1, Ordering::Relaxed);
        format!("{}-{queue}-{n}", env!("CARGO_PKG_NAME"))
    }
}

#[async_trait]
impl QueueChannel for RabbitMq {
    fn system(&self) -> &'static str {
        SYSTEM
    }

    /// Declare the queue, unless this channel already declared it with the
    /// same flags.
    ///
    /// A `PRECONDITION_FAILED` reply means the queue exists with other flags.
    /// The broker closes the channel in that case.
    #[tracing::instrument(skip(self), fields(queue = %queue))]
    async fn ensure_queue(&self, queue: &Queue, options: QueueOptions) -> Result<(), ChannelError> {
        let mut declared = self.declared.lock().await;
        match declared.get(queue) {
            Some(existing) if *existing == options => return Ok(()),
            Some(_) => return Err(ChannelError::queue_conflict(queue)),
            None => {}
        }

        let declare = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..QueueDeclareOptions::default()
        };

        let result = self
            .channel
            .lock()
            .await
            .queue_declare(queue.as_str(), declare, FieldTable::default())
            .await;

        match result {
            Ok(_) => {
                declared.insert(queue.clone(), options);
                tracing::debug!("Queue declared");
                Ok(())
            }
            Err(err) if is_precondition_failed(&err) => {
                tracing::warn!(error = %err, "Queue declared with conflicting flags");
                Err(ChannelError::queue_conflict(queue))
            }
            Err(err) => Err(ChannelError::subscription(Box::new(err))),
        }
    }

    /// Publish an envelope to the default exchange.
    ///
    /// ## Mapping
    ///
    /// - queue name → routing key
    /// - `Envelope.headers` → AMQP long-string headers
    /// - `Envelope.body` → message body
    /// - `Envelope.content_type` → `content_type` property
    #[tracing::instrument(skip_all, fields(queue = %queue))]
    async fn publish(&self, queue: &Queue, envelope: Envelope) -> Result<(), ChannelError> {
        let properties = publish_properties(&envelope, self.persistent);

        let channel = self.channel.lock().await;
        let confirmation = channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue.as_str(),
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| ChannelError::publish(Box::new(e)))?
            .await
            .map_err(|e| ChannelError::publish(Box::new(e)))?;

        if confirmation.is_nack() {
            return Err(ChannelError::publish(
                format!("broker rejected the message for {queue}").into(),
            ));
        }
        Ok(())
    }

    /// Register a consumer.
    ///
    /// `prefetch` is applied with `basic.qos` before consuming; `auto_ack`
    /// consumes in no-ack mode.
    #[tracing::instrument(skip(self), fields(queue = %queue))]
    async fn consume(
        &self,
        queue: &Queue,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, ChannelError> {
        let channel = self.channel.lock().await;

        if let Some(prefetch) = options.prefetch {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| ChannelError::subscription(Box::new(e)))?;
        }

        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| self.consumer_tag(queue));
        let consumer = channel
            .basic_consume(
                queue.as_str(),
                &tag,
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ChannelError::subscription(Box::new(e)))?;
        tracing::debug!(consumer_tag = %tag, "Consumer registered");

        let auto_ack = options.auto_ack;
        let deliveries = consumer.map(move |delivery| -> Result<Delivery, ChannelError> {
            let delivery = delivery.map_err(|e| ChannelError::subscription(Box::new(e)))?;
            let envelope = Envelope {
                headers: delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(from_field_table)
                    .unwrap_or_default(),
                content_type: delivery
                    .properties
                    .content_type()
                    .as_ref()
                    .map(|value| value.as_str().to_owned()),
                body: delivery.data,
            };
            let routing_key = delivery.routing_key.to_string();

            Ok(if auto_ack {
                Delivery::new(envelope, routing_key, delivery.redelivered, AutoAcked)
            } else {
                Delivery::new(
                    envelope,
                    routing_key,
                    delivery.redelivered,
                    RabbitMqAcker(delivery.acker),
                )
            })
        });

        Ok(Box::pin(deliveries))
    }
}

struct RabbitMqAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledge for RabbitMqAcker {
    async fn ack(&self) -> Result<(), ChannelError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| ChannelError::settle(Box::new(e)))
    }

    async fn nack(&self, requeue: bool) -> Result<(), ChannelError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| ChannelError::settle(Box::new(e)))
    }
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if *amqp.kind() == AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
    )
}

const TRANSIENT: u8 = 1;
const PERSISTENT: u8 = 2;

fn publish_properties(envelope: &Envelope, persistent: bool) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_headers(to_field_table(&envelope.headers))
        .with_delivery_mode(if persistent { PERSISTENT } else { TRANSIENT });

    match &envelope.content_type {
        Some(content_type) => properties.with_content_type(ShortString::from(content_type.clone())),
        None => properties,
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

/// String-valued AMQP headers.
///
/// Values that are not valid UTF-8 are dropped rather than lossily decoded.
/// Non-string values are skipped.
fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let bytes = match value {
                AMQPValue::ShortString(value) => {
                    return Some((key.as_str().to_owned(), value.as_str().to_owned()));
                }
                AMQPValue::LongString(value) => value.as_bytes(),
                AMQPValue::ByteArray(value) => value.as_slice(),
                _ => {
                    tracing::debug!(header = key.as_str(), "Skipping non-string AMQP header");
                    return None;
                }
            };

            match String::from_utf8(bytes.to_vec()) {
                Ok(value) => Some((key.as_str().to_owned(), value)),
                Err(_) => {
                    tracing::warn!(header = key.as_str(), "Dropping AMQP header that is not valid UTF-8");
                    None
                }
            }
        })
        .collect()
}
