//! Consuming typed messages with trace context.
//!
//! A [`MessageReceiver`] registers consumers on named queues. Each
//! registration yields a [`Subscription`] whose delivery loop:
//!
//! - Extracts the producer's trace context from the envelope headers
//! - Starts a consumer span parented to it
//! - Decodes the body and invokes the [`Handler`] with an explicit
//!   [`Context`] carrying the consumer span and the producer's baggage
//! - Settles the delivery according to the [`AckMode`]
//!
//! Handlers run on a bounded pool of tasks per subscription, sized by
//! [`ReceiverOptions::concurrency`].

mod hook;
mod subscription;

use std::{future::Future, marker::PhantomData, sync::Arc};

use opentelemetry::Context;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    channel::{ChannelError, ConsumeOptions, Queue, QueueChannel, QueueOptions},
    codec::{Codec, Json},
    telemetry::Telemetry,
};

pub use hook::{DefaultReceiverHook, ReceiverHook};
pub use subscription::{Subscription, SubscriptionState};

use subscription::Worker;

/// When a delivery is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acknowledge once the handler succeeds, reject when decoding or the
    /// handler fails. At-least-once.
    #[default]
    AfterHandler,
    /// Let the broker acknowledge on receipt, before the handler runs.
    /// At-most-once.
    Immediate,
}

/// Receiver configuration.
///
/// Every field has a default, so partial configuration documents
/// deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverOptions {
    /// When deliveries are acknowledged.
    pub ack_mode: AckMode,
    /// Maximum number of handlers running at once per subscription. A bound
    /// of one processes deliveries in broker order.
    pub concurrency: usize,
    /// Put deliveries whose handler failed back on the queue.
    pub requeue_on_failure: bool,
    /// Record the body text as the `message` attribute of consumer spans.
    pub record_payload: bool,
    /// Consumer tag sent to the broker. Generated per subscription when unset.
    pub consumer_tag: Option<String>,
    /// Flags used when declaring subscribed queues.
    pub queue: QueueOptions,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::AfterHandler,
            concurrency: 1,
            requeue_on_failure: false,
            record_payload: false,
            consumer_tag: None,
            queue: QueueOptions::default(),
        }
    }
}

impl ReceiverOptions {
    /// Set [`ack_mode`](Self::ack_mode).
    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    /// Set the per-subscription handler bound.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Requeue deliveries whose handler failed or panicked.
    pub fn with_requeue_on_failure(mut self, requeue: bool) -> Self {
        self.requeue_on_failure = requeue;
        self
    }

    /// Record body text on consumer spans.
    pub fn with_record_payload(mut self, record: bool) -> Self {
        self.record_payload = record;
        self
    }

    /// Use a fixed consumer tag.
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    /// Set the flags used to declare subscribed queues.
    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue = options;
        self
    }

    fn consume_options(&self) -> ConsumeOptions {
        let concurrency = self.concurrency.max(1);
        ConsumeOptions {
            auto_ack: self.ack_mode == AckMode::Immediate,
            prefetch: match self.ack_mode {
                AckMode::AfterHandler => Some(u16::try_from(concurrency).unwrap_or(u16::MAX)),
                AckMode::Immediate => None,
            },
            consumer_tag: self.consumer_tag.clone(),
        }
    }
}

/// Processes decoded messages of type `T`.
///
/// Implemented for every `Fn(T, Context) -> impl Future<Output = Result<(),
/// BoxError>>`. The context carries the consumer span and the producer's
/// baggage.
#[async_trait::async_trait]
pub trait Handler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle(&self, message: T, cx: Context) -> Result<(), tower::BoxError>;
}

#[async_trait::async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send,
{
    async fn handle(&self, message: T, cx: Context) -> Result<(), tower::BoxError> {
        (self)(message, cx).await
    }
}

/// Registers typed consumers on named queues.
///
/// Generic parameters:
/// - `C`: Channel owned by this receiver
/// - `K`: Payload codec
/// - `HK`: Hook implementation for lifecycle events
pub struct MessageReceiver<C, K = Json, HK = DefaultReceiverHook> {
    channel: Arc<C>,
    codec: K,
    telemetry: Telemetry,
    hook: Arc<HK>,
    options: ReceiverOptions,
    shutdown: CancellationToken,
}

impl<C> MessageReceiver<C>
where
    C: QueueChannel + 'static,
{
    /// Create a receiver owning the given channel, with default options.
    pub fn new(channel: C) -> Self {
        Self {
            channel: Arc::new(channel),
            codec: Json,
            telemetry: Telemetry::global(),
            hook: Arc::new(DefaultReceiverHook),
            options: ReceiverOptions::default(),
            shutdown: CancellationToken::new(),
        }
    }
}

impl<C, K, HK> MessageReceiver<C, K, HK> {
    /// Replace the options applied to later subscriptions.
    pub fn with_options(mut self, options: ReceiverOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the tracer and propagator.
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Tie every subscription to a service-wide shutdown token.
    ///
    /// Subscriptions observe a child of `token`, so cancelling one
    /// subscription never cancels the token.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Replace the payload codec.
    pub fn with_codec<K2: Codec>(self, codec: K2) -> MessageReceiver<C, K2, HK> {
        MessageReceiver {
            channel: self.channel,
            codec,
            telemetry: self.telemetry,
            hook: self.hook,
            options: self.options,
            shutdown: self.shutdown,
        }
    }

    /// Replace the receiver hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: ReceiverHook>(self, hook: HK2) -> MessageReceiver<C, K, HK2> {
        MessageReceiver {
            channel: self.channel,
            codec: self.codec,
            telemetry: self.telemetry,
            hook: Arc::new(hook),
            options: self.options,
            shutdown: self.shutdown,
        }
    }

    /// Options applied to new subscriptions.
    pub fn options(&self) -> &ReceiverOptions {
        &self.options
    }

    /// The channel this receiver owns.
    pub fn channel(&self) -> &C {
        &self.channel
    }
}

impl<C, K, HK> MessageReceiver<C, K, HK>
where
    C: QueueChannel + 'static,
    K: Codec,
    HK: ReceiverHook,
{
    /// Subscribe `handler` to messages of type `T` on `queue`.
    ///
    /// The queue is declared first. The call returns once the consumer is
    /// registered; deliveries are then processed in the background until
    /// the returned [`Subscription`] is cancelled.
    #[tracing::instrument(skip_all, fields(queue = tracing::field::Empty))]
    pub async fn receive<T, H>(
        &self,
        queue: impl Into<Queue>,
        handler: H,
    ) -> Result<Subscription, SubscribeError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        let queue = queue.into();
        tracing::Span::current().record("queue", queue.as_str());

        self.channel
            .ensure_queue(&queue, self.options.queue)
            .await
            .map_err(SubscribeError::declare)?;

        let deliveries = self
            .channel
            .consume(&queue, self.options.consume_options())
            .await
            .map_err(SubscribeError::subscription)?;

        self.hook.on_subscribed(&queue);

        let worker = Worker {
            queue: queue.clone(),
            system: self.channel.system(),
            codec: self.codec.clone(),
            telemetry: self.telemetry.clone(),
            hook: Arc::clone(&self.hook),
            handler: Arc::new(handler),
            ack_mode: self.options.ack_mode,
            concurrency: self.options.concurrency,
            requeue_on_failure: self.options.requeue_on_failure,
            record_payload: self.options.record_payload,
            message: PhantomData,
        };

        Ok(Subscription::spawn(
            queue,
            deliveries,
            self.shutdown.child_token(),
            worker,
        ))
    }
}

/// Error returned by [`MessageReceiver::receive`].
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct SubscribeError {
    context: SpanTrace,
    kind: SubscribeErrorKind,
}

/// Subscribe error kinds.
#[derive(Debug)]
pub enum SubscribeErrorKind {
    /// The queue exists with different flags.
    QueueConflict(ChannelError),
    /// The queue could not be declared or the consumer registered.
    Subscription(ChannelError),
}

impl SubscribeError {
    fn declare(err: ChannelError) -> Self {
        if err.is_queue_conflict() {
            Self::with_kind(SubscribeErrorKind::QueueConflict(err))
        } else {
            Self::subscription(err)
        }
    }

    fn subscription(err: ChannelError) -> Self {
        Self::with_kind(SubscribeErrorKind::Subscription(err))
    }

    fn with_kind(kind: SubscribeErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// The kind of failure.
    pub fn kind(&self) -> &SubscribeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SubscribeErrorKind::QueueConflict(err) => writeln!(f, "Subscribe failed: {err}"),
            SubscribeErrorKind::Subscription(err) => writeln!(f, "Subscribe failed: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SubscribeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SubscribeErrorKind::QueueConflict(err) | SubscribeErrorKind::Subscription(err) => {
                Some(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use opentelemetry::{
        KeyValue,
        baggage::BaggageExt,
        trace::{SpanId, SpanKind, Status, TraceContextExt},
    };
    use tokio::sync::{Barrier, mpsc};

    use super::*;
    use crate::{
        Envelope, MessageSender,
        channel::{Delivery, InMemory, InMemoryBroker},
        codec::CodecError,
        envelope::Headers,
        telemetry::{
            MESSAGE_PAYLOAD, MESSAGING_ROUTING_KEY,
            testing::{Recording, attribute, recording},
        },
    };

    const WEATHER: &str = "weather-forecast";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct WeatherForecast {
        location: String,
        date: String,
        temperature_c: i32,
        summary: String,
    }

    fn forecast() -> WeatherForecast {
        WeatherForecast {
            location: "NYC".to_owned(),
            date: "2024-01-01".to_owned(),
            temperature_c: 20,
            summary: "Mild".to_owned(),
        }
    }

    fn receiver(broker: &InMemoryBroker, recording: &Recording) -> MessageReceiver<InMemory> {
        MessageReceiver::new(broker.channel()).with_telemetry(recording.telemetry.clone())
    }

    fn sender(broker: &InMemoryBroker, recording: &Recording) -> MessageSender<InMemory> {
        MessageSender::new(broker.channel()).with_telemetry(recording.telemetry.clone())
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for the handler")
            .expect("handler channel closed")
    }

    /// Handler forwarding every message and its context to a channel.
    fn forwarding<T: Send + 'static>() -> (
        impl Handler<T>,
        mpsc::UnboundedReceiver<(T, Context)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |message: T, cx: Context| {
            let _ = tx.send((message, cx));
            async { Ok::<(), tower::BoxError>(()) }
        };
        (handler, rx)
    }

    async fn publish_raw(broker: &InMemoryBroker, queue: &str, body: &str) {
        let channel = broker.channel();
        let queue = Queue::from(queue);
        channel
            .ensure_queue(&queue, QueueOptions::default())
            .await
            .unwrap();
        channel
            .publish(&queue, Envelope::from((Headers::new(), body.as_bytes().to_vec())))
            .await
            .unwrap();
    }

    #[derive(Default)]
    struct RecordingHook {
        decode_errors: Mutex<Vec<String>>,
        handler_errors: AtomicUsize,
    }

    impl ReceiverHook for Arc<RecordingHook> {
        fn on_subscribed(&self, _queue: &Queue) {}
        fn on_cancelled(&self, _queue: &Queue) {}
        fn on_delivery(&self, _delivery: &Delivery) {}

        fn on_decode_error(&self, delivery: &Delivery, _error: &CodecError) {
            let body = delivery.envelope.body_str().unwrap_or_default().to_owned();
            self.decode_errors.lock().unwrap().push(body);
        }

        fn on_handler_error(&self, _delivery: &Delivery, _error: &(dyn std::error::Error + 'static)) {
            self.handler_errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_settle_error(&self, _delivery: &Delivery, _error: &crate::channel::ChannelError) {}
        fn on_stream_error(&self, _queue: &Queue, _error: &crate::channel::ChannelError) {}
    }

    #[tokio::test]
    async fn weather_forecast_travels_end_to_end() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let (handler, mut rx) = forwarding::<WeatherForecast>();

        let subscription = receiver(&broker, &recording)
            .receive(WEATHER, handler)
            .await
            .unwrap();
        sender(&broker, &recording)
            .send_with_context(&Context::new(), WEATHER, &forecast())
            .await
            .unwrap();

        let (received, _) = next(&mut rx).await;
        assert_eq!(received, forecast());
        subscription.shutdown().await;
        assert!(rx.try_recv().is_err());

        let producer = recording.span_named("weather-forecast send");
        let consumer = recording.span_named("weather-forecast receive");
        assert_eq!(consumer.span_kind, SpanKind::Consumer);
        assert_eq!(
            attribute(&consumer, MESSAGING_ROUTING_KEY).as_deref(),
            Some(WEATHER)
        );
        assert_eq!(
            consumer.span_context.trace_id(),
            producer.span_context.trace_id()
        );
        assert_eq!(consumer.parent_span_id, producer.span_context.span_id());
        assert_eq!(attribute(&consumer, MESSAGE_PAYLOAD), None);

        let stats = broker.stats(&Queue::from(WEATHER)).await.unwrap();
        assert_eq!((stats.ready, stats.acked, stats.rejected), (0, 1, 0));
    }

    #[tokio::test]
    async fn handler_context_carries_the_consumer_span_and_baggage() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let (handler, mut rx) = forwarding::<WeatherForecast>();
        let cx = Context::new().with_baggage([KeyValue::new("tenant", "acme")]);

        let subscription = receiver(&broker, &recording)
            .receive(WEATHER, handler)
            .await
            .unwrap();
        sender(&broker, &recording)
            .send_with_context(&cx, WEATHER, &forecast())
            .await
            .unwrap();

        let (_, handler_cx) = next(&mut rx).await;
        assert_eq!(
            handler_cx.baggage().get("tenant").map(|v| v.to_string()),
            Some("acme".to_owned())
        );
        let active = handler_cx.span().span_context().clone();
        subscription.shutdown().await;

        let consumer = recording.span_named("weather-forecast receive");
        assert_eq!(active.span_id(), consumer.span_context.span_id());
    }

    #[tokio::test]
    async fn messages_without_trace_headers_get_a_root_span() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let (handler, mut rx) = forwarding::<WeatherForecast>();
        publish_raw(&broker, WEATHER, &serde_json::to_string(&forecast()).unwrap()).await;

        let subscription = receiver(&broker, &recording)
            .with_options(ReceiverOptions::default().with_record_payload(true))
            .receive(WEATHER, handler)
            .await
            .unwrap();

        let (received, _) = next(&mut rx).await;
        assert_eq!(received, forecast());
        subscription.shutdown().await;

        let consumer = recording.span_named("weather-forecast receive");
        assert_eq!(consumer.parent_span_id, SpanId::INVALID);
        assert!(
            attribute(&consumer, MESSAGE_PAYLOAD)
                .unwrap()
                .contains("\"temperatureC\":20")
        );
    }

    #[tokio::test]
    async fn malformed_bodies_do_not_block_later_messages() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let hook = Arc::new(RecordingHook::default());
        let (handler, mut rx) = forwarding::<WeatherForecast>();
        publish_raw(&broker, WEATHER, "{not json").await;

        let subscription = receiver(&broker, &recording)
            .with_hook(Arc::clone(&hook))
            .receive(WEATHER, handler)
            .await
            .unwrap();
        sender(&broker, &recording)
            .send(WEATHER, &forecast())
            .await
            .unwrap();

        let (received, _) = next(&mut rx).await;
        assert_eq!(received, forecast());
        subscription.shutdown().await;

        assert_eq!(*hook.decode_errors.lock().unwrap(), vec!["{not json"]);
        let stats = broker.stats(&Queue::from(WEATHER)).await.unwrap();
        assert_eq!((stats.acked, stats.rejected), (1, 1));

        let failed = recording
            .spans_named("weather-forecast receive")
            .into_iter()
            .filter(|span| matches!(span.status, Status::Error { .. }))
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn handler_failures_reject_the_delivery() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let hook = Arc::new(RecordingHook::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |_: WeatherForecast, _cx: Context| {
            let _ = tx.send(());
            async { Err::<(), tower::BoxError>("forecast rejected".into()) }
        };

        let subscription = receiver(&broker, &recording)
            .with_hook(Arc::clone(&hook))
            .receive(WEATHER, handler)
            .await
            .unwrap();
        sender(&broker, &recording)
            .send(WEATHER, &forecast())
            .await
            .unwrap();

        next(&mut rx).await;
        subscription.shutdown().await;

        assert_eq!(hook.handler_errors.load(Ordering::SeqCst), 1);
        let stats = broker.stats(&Queue::from(WEATHER)).await.unwrap();
        assert_eq!((stats.ready, stats.acked, stats.rejected), (0, 0, 1));
        let consumer = recording.span_named("weather-forecast receive");
        assert!(matches!(consumer.status, Status::Error { .. }));
    }

    #[tokio::test]
    async fn panicking_handlers_reject_the_delivery_once() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let hook = Arc::new(RecordingHook::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = {
            let attempts = Arc::clone(&attempts);
            move |_: WeatherForecast, _cx: Context| {
                attempts.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
                let online = false;
                async move {
                    assert!(online, "station offline");
                    Ok::<(), tower::BoxError>(())
                }
            }
        };

        let subscription = receiver(&broker, &recording)
            .with_hook(Arc::clone(&hook))
            .receive(WEATHER, handler)
            .await
            .unwrap();
        sender(&broker, &recording)
            .send(WEATHER, &forecast())
            .await
            .unwrap();

        next(&mut rx).await;
        subscription.shutdown().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(hook.handler_errors.load(Ordering::SeqCst), 1);
        let stats = broker.stats(&Queue::from(WEATHER)).await.unwrap();
        assert_eq!((stats.ready, stats.acked, stats.rejected), (0, 0, 1));
        let consumer = recording.span_named("weather-forecast receive");
        assert!(matches!(consumer.status, Status::Error { .. }));
    }

    #[tokio::test]
    async fn failed_deliveries_are_retried_when_requeue_is_enabled() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = {
            let attempts = Arc::clone(&attempts);
            move |message: WeatherForecast, _cx: Context| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                async move {
                    if attempt == 0 {
                        return Err::<(), tower::BoxError>("transient".into());
                    }
                    let _ = tx.send(message);
                    Ok(())
                }
            }
        };

        let subscription = receiver(&broker, &recording)
            .with_options(ReceiverOptions::default().with_requeue_on_failure(true))
            .receive(WEATHER, handler)
            .await
            .unwrap();
        sender(&broker, &recording)
            .send(WEATHER, &forecast())
            .await
            .unwrap();

        assert_eq!(next(&mut rx).await, forecast());
        subscription.shutdown().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let stats = broker.stats(&Queue::from(WEATHER)).await.unwrap();
        assert_eq!((stats.ready, stats.acked, stats.rejected), (0, 1, 0));
    }

    #[tokio::test]
    async fn immediate_mode_acknowledges_before_the_handler() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |_: WeatherForecast, _cx: Context| {
            let _ = tx.send(());
            async { Err::<(), tower::BoxError>("lost on purpose".into()) }
        };

        let subscription = receiver(&broker, &recording)
            .with_options(ReceiverOptions::default().with_ack_mode(AckMode::Immediate))
            .receive(WEATHER, handler)
            .await
            .unwrap();
        sender(&broker, &recording)
            .send(WEATHER, &forecast())
            .await
            .unwrap();

        next(&mut rx).await;
        subscription.shutdown().await;

        let stats = broker.stats(&Queue::from(WEATHER)).await.unwrap();
        assert_eq!((stats.ready, stats.acked, stats.rejected), (0, 1, 0));
    }

    #[tokio::test]
    async fn single_worker_preserves_queue_order() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let sender = sender(&broker, &recording);
        for n in 1..=5u32 {
            sender.send("numbers", &n).await.unwrap();
        }
        let (handler, mut rx) = forwarding::<u32>();

        let subscription = receiver(&broker, &recording)
            .receive("numbers", handler)
            .await
            .unwrap();

        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(next(&mut rx).await.0);
        }
        subscription.shutdown().await;

        assert_eq!(received, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn concurrency_bounds_the_worker_pool() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let sender = sender(&broker, &recording);
        for n in 0..2u32 {
            sender.send("numbers", &n).await.unwrap();
        }

        // Both handlers must be in flight together for the barrier to open.
        let barrier = Arc::new(Barrier::new(2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |n: u32, _cx: Context| {
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            async move {
                barrier.wait().await;
                let _ = tx.send(n);
                Ok::<(), tower::BoxError>(())
            }
        };

        let subscription = receiver(&broker, &recording)
            .with_options(ReceiverOptions::default().with_concurrency(2))
            .receive("numbers", handler)
            .await
            .unwrap();

        let mut received = vec![next(&mut rx).await, next(&mut rx).await];
        received.sort();
        subscription.shutdown().await;

        assert_eq!(received, vec![0, 1]);
    }

    #[tokio::test]
    async fn cancelled_subscriptions_stop_consuming() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let (handler, _rx) = forwarding::<WeatherForecast>();

        let subscription = receiver(&broker, &recording)
            .receive(WEATHER, handler)
            .await
            .unwrap();
        assert_ne!(subscription.state(), SubscriptionState::Cancelled);
        assert_eq!(subscription.queue().as_str(), WEATHER);

        subscription.cancel();
        assert_eq!(subscription.state(), SubscriptionState::Cancelled);
        subscription.shutdown().await;

        sender(&broker, &recording)
            .send(WEATHER, &forecast())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = broker.stats(&Queue::from(WEATHER)).await.unwrap();
        assert_eq!((stats.ready, stats.acked), (1, 0));
    }

    #[tokio::test]
    async fn shutdown_token_cancels_every_subscription() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let shutdown = CancellationToken::new();
        let receiver = receiver(&broker, &recording).with_shutdown(shutdown.clone());

        let (forecasts, _) = forwarding::<WeatherForecast>();
        let (numbers, _) = forwarding::<u32>();
        let first = receiver.receive(WEATHER, forecasts).await.unwrap();
        let second = receiver.receive("numbers", numbers).await.unwrap();

        shutdown.cancel();
        first.cancelled().await;
        second.cancelled().await;

        assert_eq!(first.state(), SubscriptionState::Cancelled);
        assert_eq!(second.state(), SubscriptionState::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_one_subscription_leaves_the_receiver_running() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let shutdown = CancellationToken::new();
        let receiver = receiver(&broker, &recording).with_shutdown(shutdown.clone());
        let (handler, _rx) = forwarding::<u32>();

        receiver
            .receive("numbers", handler)
            .await
            .unwrap()
            .shutdown()
            .await;

        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn channel_teardown_cancels_the_subscription() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let receiver = receiver(&broker, &recording);
        let (handler, _rx) = forwarding::<WeatherForecast>();
        let subscription = receiver.receive(WEATHER, handler).await.unwrap();

        receiver.channel().close();

        tokio::time::timeout(Duration::from_secs(5), subscription.cancelled())
            .await
            .unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Cancelled);
    }

    #[tokio::test]
    async fn conflicting_queue_flags_fail_the_subscription() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let (first, _) = forwarding::<u32>();
        let (second, _) = forwarding::<u32>();

        let _subscription = receiver(&broker, &recording)
            .receive("numbers", first)
            .await
            .unwrap();
        let err = receiver(&broker, &recording)
            .with_options(ReceiverOptions::default().with_queue_options(QueueOptions {
                durable: false,
                ..QueueOptions::default()
            }))
            .receive("numbers", second)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), SubscribeErrorKind::QueueConflict(_)));
    }

    #[tokio::test]
    async fn closed_channel_fails_the_subscription() {
        let recording = recording();
        let broker = InMemoryBroker::new();
        let receiver = receiver(&broker, &recording);
        receiver.channel().close();
        let (handler, _) = forwarding::<u32>();

        let err = receiver.receive("numbers", handler).await.unwrap_err();

        assert!(matches!(err.kind(), SubscribeErrorKind::Subscription(_)));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: ReceiverOptions =
            serde_json::from_str(r#"{"ack_mode":"immediate","concurrency":4}"#).unwrap();

        assert_eq!(options.ack_mode, AckMode::Immediate);
        assert_eq!(options.concurrency, 4);
        assert!(!options.requeue_on_failure);
        assert_eq!(options.queue, QueueOptions::default());
        assert_eq!(ReceiverOptions::default().ack_mode, AckMode::AfterHandler);
    }

    #[test]
    fn consume_options_follow_the_ack_mode() {
        let after_handler = ReceiverOptions::default()
            .with_concurrency(8)
            .with_consumer_tag("billing")
            .consume_options();
        assert!(!after_handler.auto_ack);
        assert_eq!(after_handler.prefetch, Some(8));
        assert_eq!(after_handler.consumer_tag.as_deref(), Some("billing"));

        let immediate = ReceiverOptions::default()
            .with_ack_mode(AckMode::Immediate)
            .consume_options();
        assert!(immediate.auto_ack);
        assert_eq!(immediate.prefetch, None);
    }
}
