//! Queue channel abstractions and broker backends.
//!
//! A [`QueueChannel`] is one role's logical channel to the broker. It declares
//! durable queues, publishes [`Envelope`]s and registers consumers. A
//! [`MessageSender`](crate::MessageSender) and a
//! [`MessageReceiver`](crate::MessageReceiver) each own their own channel,
//! even when both are opened on the same connection. This keeps flow control
//! and error state separate between the two roles.
//!
//! ## Key components
//!
//! - [`QueueChannel`]: Trait implemented by concrete broker backends
//! - [`ChannelService`]: Adapter from a channel's publish path to a Tower service
//! - [`Delivery`]: An inbound envelope together with its acknowledgement handle
//! - [`ChannelError`]: Unified error type with tracing context

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tower::Service;
use tracing_error::SpanTrace;

use crate::Envelope;

pub use inmemory::{InMemory, InMemoryBroker, QueueStats};

/// Name of a durable work queue.
///
/// Names are plain strings; this layer applies no namespacing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Queue(String);

impl Queue {
    /// Create a queue name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The queue name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Queue {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for Queue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&Queue> for Queue {
    fn from(value: &Queue) -> Self {
        value.clone()
    }
}

impl AsRef<str> for Queue {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Declaration flags of a queue.
///
/// Every party declaring the same queue must agree on these flags; a
/// mismatch is reported as [`ChannelErrorKind::QueueConflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Restricted to the declaring connection.
    pub exclusive: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    /// Durable, non-exclusive, non-auto-delete.
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Options for registering a consumer.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Let the broker consider every delivery acknowledged on receipt.
    pub auto_ack: bool,
    /// Maximum number of unacknowledged deliveries in flight.
    pub prefetch: Option<u16>,
    /// Consumer tag, generated by the backend when absent.
    pub consumer_tag: Option<String>,
}

/// Stream of deliveries for one consumer.
///
/// The stream ends when the consumer is cancelled or the channel is torn down.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, ChannelError>>;

/// Trait implemented by concrete broker backends.
///
/// A channel is not meant to be shared between roles: each sender or
/// receiver owns its own instance.
#[async_trait::async_trait]
pub trait QueueChannel: Send + Sync {
    /// Value of the `messaging.system` span attribute.
    fn system(&self) -> &'static str;

    /// Declare a queue. Repeating an identical declaration is a no-op.
    async fn ensure_queue(&self, queue: &Queue, options: QueueOptions) -> Result<(), ChannelError>;

    /// Hand an envelope to the broker for the given queue.
    ///
    /// Resolves once the broker client accepts the write. Whether the broker
    /// has persisted it depends on the backend configuration.
    async fn publish(&self, queue: &Queue, envelope: Envelope) -> Result<(), ChannelError>;

    /// Register a consumer on a queue.
    async fn consume(
        &self,
        queue: &Queue,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, ChannelError>;
}

/// Settles a single delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    /// Confirm successful processing.
    async fn ack(&self) -> Result<(), ChannelError>;

    /// Reject the delivery, optionally putting it back on the queue.
    async fn nack(&self, requeue: bool) -> Result<(), ChannelError>;
}

/// Acknowledgement handle for deliveries consumed in auto-ack mode.
///
/// The broker already considers them settled, so both operations are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoAcked;

#[async_trait::async_trait]
impl Acknowledge for AutoAcked {
    async fn ack(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// An envelope delivered to a consumer.
pub struct Delivery {
    /// The received envelope.
    pub envelope: Envelope,
    /// Routing key the envelope was published with.
    pub routing_key: String,
    /// Whether the broker delivered this envelope before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Create a delivery settled through the given handle.
    pub fn new(
        envelope: Envelope,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: impl Acknowledge + 'static,
    ) -> Self {
        Self {
            envelope,
            routing_key: routing_key.into(),
            redelivered,
            acker: Box::new(acker),
        }
    }

    /// Acknowledge the delivery.
    pub async fn ack(&self) -> Result<(), ChannelError> {
        self.acker.ack().await
    }

    /// Reject the delivery.
    pub async fn nack(&self, requeue: bool) -> Result<(), ChannelError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Publish request handled by a [`ChannelService`].
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    /// Destination queue.
    pub queue: Queue,
    /// Envelope to publish.
    pub envelope: Envelope,
}

/// Tower service adapter for a channel's publish path.
///
/// This type bridges [`QueueChannel::publish`] with Tower's `Service`
/// abstraction so that middleware (timeouts, retries, header mapping) can be
/// layered in front of the broker.
pub struct ChannelService<C> {
    channel: Arc<C>,
}

impl<C> ChannelService<C> {
    /// Create a new publish service over a shared channel.
    pub fn new(channel: Arc<C>) -> Self {
        Self { channel }
    }
}

impl<C> Clone for ChannelService<C> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}

/// `tower::Service` implementation delegating to [`QueueChannel::publish`].
impl<C> Service<Publish> for ChannelService<C>
where
    C: QueueChannel + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Publish) -> Self::Future {
        let channel = Arc::clone(&self.channel);
        Box::pin(async move {
            channel.publish(&req.queue, req.envelope).await?;
            Ok::<(), tower::BoxError>(())
        })
    }
}

/// Error returned by channel operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct ChannelError {
    context: SpanTrace,
    kind: ChannelErrorKind,
}

/// Channel error kinds.
#[derive(Debug)]
pub enum ChannelErrorKind {
    /// A queue with the same name exists with different flags.
    QueueConflict {
        /// The conflicting queue.
        queue: String,
    },
    /// The broker rejected a publish or the connection failed during it.
    Publish(tower::BoxError),
    /// Consumer registration or the delivery stream failed.
    Subscription(tower::BoxError),
    /// Acknowledging or rejecting a delivery failed.
    Settle(tower::BoxError),
    /// The channel has been closed.
    Closed,
}

impl ChannelError {
    /// Create a queue declaration conflict error.
    pub fn queue_conflict(queue: &Queue) -> Self {
        Self::with_kind(ChannelErrorKind::QueueConflict {
            queue: queue.to_string(),
        })
    }

    /// Create a publish-related error.
    pub fn publish(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::with_kind(ChannelErrorKind::Publish(err))
    }

    /// Create a subscription-related error.
    pub fn subscription(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::with_kind(ChannelErrorKind::Subscription(err))
    }

    /// Create a settlement-related error.
    pub fn settle(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::with_kind(ChannelErrorKind::Settle(err))
    }

    /// Create a closed-channel error.
    pub fn closed() -> Self {
        Self::with_kind(ChannelErrorKind::Closed)
    }

    fn with_kind(kind: ChannelErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// The kind of failure.
    pub fn kind(&self) -> &ChannelErrorKind {
        &self.kind
    }

    /// Whether this error is a queue declaration conflict.
    pub fn is_queue_conflict(&self) -> bool {
        matches!(self.kind, ChannelErrorKind::QueueConflict { .. })
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ChannelErrorKind::QueueConflict { queue } => writeln!(
                f,
                "Queue conflict: {queue} already exists with different flags"
            ),
            ChannelErrorKind::Publish(err) => writeln!(f, "Publish error: {err}"),
            ChannelErrorKind::Subscription(err) => writeln!(f, "Subscription error: {err}"),
            ChannelErrorKind::Settle(err) => writeln!(f, "Settle error: {err}"),
            ChannelErrorKind::Closed => writeln!(f, "Channel closed"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ChannelErrorKind::Publish(err)
            | ChannelErrorKind::Subscription(err)
            | ChannelErrorKind::Settle(err) => Some(err.as_ref()),
            ChannelErrorKind::QueueConflict { .. } | ChannelErrorKind::Closed => None,
        }
    }
}
