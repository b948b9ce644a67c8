//! Publishing typed messages with trace context.
//!
//! A [`MessageSender`] turns a typed message into an [`Envelope`], starts a
//! producer span for the send, writes the trace context into the envelope
//! headers and publishes the envelope through a Tower service wrapping its
//! [`QueueChannel`].

use std::sync::Arc;

use opentelemetry::{Context, trace::SpanKind};
use serde::Serialize;
use tower::{Service, ServiceExt as _};
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    channel::{ChannelError, ChannelService, Publish, Queue, QueueChannel, QueueOptions},
    codec::{Codec, CodecError, Json},
    propagation::PropagationContext,
    telemetry::{Telemetry, messaging_attributes},
};

/// Publishes typed messages to named queues.
///
/// Generic parameters:
/// - `C`: Channel owned by this sender
/// - `S`: Publish service, [`ChannelService<C>`] unless layered
/// - `K`: Payload codec
pub struct MessageSender<C, S = ChannelService<C>, K = Json> {
    channel: Arc<C>,
    service: S,
    codec: K,
    telemetry: Telemetry,
    queue_options: QueueOptions,
}

impl<C> MessageSender<C>
where
    C: QueueChannel + 'static,
{
    /// Create a sender owning the given channel.
    ///
    /// The sender uses the JSON codec, the global tracer provider and
    /// durable queue declarations until configured otherwise.
    pub fn new(channel: C) -> Self {
        let channel = Arc::new(channel);
        Self {
            service: ChannelService::new(Arc::clone(&channel)),
            channel,
            codec: Json,
            telemetry: Telemetry::global(),
            queue_options: QueueOptions::default(),
        }
    }
}

impl<C, S, K> MessageSender<C, S, K> {
    /// Replace the tracer and propagator.
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Flags used when declaring destination queues.
    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    /// Replace the payload codec.
    pub fn with_codec<K2: Codec>(self, codec: K2) -> MessageSender<C, S, K2> {
        MessageSender {
            channel: self.channel,
            service: self.service,
            codec,
            telemetry: self.telemetry,
            queue_options: self.queue_options,
        }
    }

    /// Apply a Tower layer to the publish path.
    ///
    /// This enables composition with middleware such as retries, timeouts or
    /// header mapping in front of the broker.
    pub fn layer<L>(self, layer: L) -> MessageSender<C, L::Service, K>
    where
        L: tower::Layer<S>,
    {
        MessageSender {
            service: layer.layer(self.service),
            channel: self.channel,
            codec: self.codec,
            telemetry: self.telemetry,
            queue_options: self.queue_options,
        }
    }

    /// The channel this sender owns.
    pub fn channel(&self) -> &C {
        &self.channel
    }
}

impl<C, S, K> MessageSender<C, S, K>
where
    C: QueueChannel + 'static,
    S: Service<Publish, Response = ()> + Clone + Send + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send,
    K: Codec,
{
    /// Send a message, continuing the caller's current trace context.
    pub async fn send<T>(&self, queue: impl Into<Queue>, message: &T) -> Result<(), SendError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let cx = Context::current();
        self.send_with_context(&cx, queue, message).await
    }

    /// Send a message as part of the trace and baggage carried by `cx`.
    ///
    /// The call:
    /// - Declares the queue
    /// - Starts a producer span named `"<queue> send"`, parented to `cx`
    /// - Injects the span's context and `cx`'s baggage into the headers
    /// - Encodes the message and publishes the envelope
    ///
    /// It resolves once the broker client accepts the write. The producer
    /// span is closed on every path.
    #[tracing::instrument(skip_all, fields(queue = tracing::field::Empty))]
    pub async fn send_with_context<T>(
        &self,
        cx: &Context,
        queue: impl Into<Queue>,
        message: &T,
    ) -> Result<(), SendError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let queue = queue.into();
        tracing::Span::current().record("queue", queue.as_str());

        self.channel
            .ensure_queue(&queue, self.queue_options)
            .await
            .map_err(SendError::declare)?;

        let mut envelope = Envelope {
            content_type: Some(self.codec.content_type().to_owned()),
            ..Envelope::new()
        };

        let span = self.telemetry.start_span(
            format!("{queue} send"),
            SpanKind::Producer,
            cx,
            messaging_attributes(self.channel.system(), queue.as_str()),
        );

        // Without a live producer span, keep propagating the caller's context.
        let source = if span.span_context().is_valid() {
            span.context()
        } else {
            cx
        };
        self.telemetry.propagator().inject(
            &PropagationContext::from_context(source),
            &mut envelope.headers,
        );

        envelope.body = match self.codec.encode(message) {
            Ok(body) => body,
            Err(err) => {
                span.record_error(&err);
                tracing::error!(error = %err, "Failed to encode message");
                return Err(SendError::encoding(err));
            }
        };

        let mut service = self.service.clone();
        match publish(&mut service, Publish { queue, envelope }).await {
            Ok(()) => {
                tracing::debug!("Message published");
                Ok(())
            }
            Err(err) => {
                span.record_error(err.as_ref());
                tracing::error!(error = %err, "Failed to publish message");
                Err(SendError::publish(err))
            }
        }
    }
}

async fn publish<S>(service: &mut S, request: Publish) -> Result<(), tower::BoxError>
where
    S: Service<Publish, Response = ()>,
    S::Error: Into<tower::BoxError>,
{
    let ready = service
        .ready()
        .await
        .map_err(Into::<tower::BoxError>::into)?;
    ready.call(request).await.map_err(Into::into)
}

/// Error returned by [`MessageSender::send`].
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct SendError {
    context: SpanTrace,
    kind: SendErrorKind,
}

/// Send error kinds.
#[derive(Debug)]
pub enum SendErrorKind {
    /// The message could not be serialized.
    Encoding(CodecError),
    /// The broker rejected the publish or could not be reached.
    Publish(tower::BoxError),
    /// The destination queue exists with different flags.
    QueueConflict(ChannelError),
}

impl SendError {
    fn encoding(err: CodecError) -> Self {
        Self::with_kind(SendErrorKind::Encoding(err))
    }

    fn publish(err: tower::BoxError) -> Self {
        Self::with_kind(SendErrorKind::Publish(err))
    }

    fn declare(err: ChannelError) -> Self {
        if err.is_queue_conflict() {
            Self::with_kind(SendErrorKind::QueueConflict(err))
        } else {
            Self::with_kind(SendErrorKind::Publish(Box::new(err)))
        }
    }

    fn with_kind(kind: SendErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// The kind of failure.
    pub fn kind(&self) -> &SendErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SendErrorKind::Encoding(err) => writeln!(f, "Send failed: {err}"),
            SendErrorKind::Publish(err) => writeln!(f, "Send failed, publish error: {err}"),
            SendErrorKind::QueueConflict(err) => writeln!(f, "Send failed: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SendErrorKind::Encoding(err) => Some(err),
            SendErrorKind::Publish(err) => Some(err.as_ref()),
            SendErrorKind::QueueConflict(err) => Some(err),
        }
    }
}
