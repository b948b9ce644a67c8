//! Subscription handle and the delivery loop behind it.

use std::{marker::PhantomData, sync::Arc};

use opentelemetry::{KeyValue, trace::SpanKind};
use serde::de::DeserializeOwned;
use tokio::{
    sync::{Semaphore, watch},
    task::JoinHandle,
};
use tokio_stream::StreamExt as _;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{AckMode, Handler, ReceiverHook};
use crate::{
    channel::{Delivery, DeliveryStream, Queue},
    codec::Codec,
    telemetry::{MESSAGE_PAYLOAD, Telemetry, messaging_attributes},
};

/// Lifecycle state of a [`Subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// The consumer is registered with the broker; the delivery loop has not
    /// started yet.
    Registered,
    /// Deliveries are being dispatched to the handler.
    Active,
    /// No further deliveries are accepted. Terminal.
    Cancelled,
}

/// Handle to a running consumer on one queue.
///
/// Dropping the handle detaches the subscription: it keeps running until
/// the receiver's shutdown token fires or the channel is torn down.
#[must_use = "dropping a Subscription detaches it, call `shutdown` to stop it"]
#[derive(Debug)]
pub struct Subscription {
    queue: Queue,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SubscriptionState>>,
    tracker: TaskTracker,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(super) fn spawn<T, K, HK, H>(
        queue: Queue,
        deliveries: DeliveryStream,
        cancel: CancellationToken,
        worker: Worker<T, K, HK, H>,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        K: Codec,
        HK: ReceiverHook,
        H: Handler<T>,
    {
        let (state, _) = watch::channel(SubscriptionState::Registered);
        let state = Arc::new(state);
        let tracker = TaskTracker::new();

        let task = tokio::spawn(worker.run(
            deliveries,
            cancel.clone(),
            tracker.clone(),
            Arc::clone(&state),
        ));

        Self {
            queue,
            cancel,
            state,
            tracker,
            task,
        }
    }

    /// The subscribed queue.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Stop accepting deliveries.
    ///
    /// Returns immediately. Handlers already running finish in the
    /// background and still settle their deliveries.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.state.send_replace(SubscriptionState::Cancelled);
    }

    /// Wait until the subscription reaches [`SubscriptionState::Cancelled`],
    /// whatever the cause.
    pub async fn cancelled(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = state
            .wait_for(|state| *state == SubscriptionState::Cancelled)
            .await;
    }

    /// Cancel the subscription and wait for in-flight handlers to finish.
    #[tracing::instrument(skip_all, fields(queue = %self.queue))]
    pub async fn shutdown(self) {
        self.cancel();

        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "Subscription task failed");
        }
        self.tracker.wait().await;
    }
}

/// Per-subscription state shared by the delivery loop and its workers.
pub(super) struct Worker<T, K, HK, H> {
    pub(super) queue: Queue,
    pub(super) system: &'static str,
    pub(super) codec: K,
    pub(super) telemetry: Telemetry,
    pub(super) hook: Arc<HK>,
    pub(super) handler: Arc<H>,
    pub(super) ack_mode: AckMode,
    pub(super) concurrency: usize,
    pub(super) requeue_on_failure: bool,
    pub(super) record_payload: bool,
    pub(super) message: PhantomData<fn() -> T>,
}

/// How a processed delivery is settled in after-handler mode.
enum Outcome {
    Ack,
    Reject { requeue: bool },
}

impl<T, K, HK, H> Worker<T, K, HK, H>
where
    T: DeserializeOwned + Send + 'static,
    K: Codec,
    HK: ReceiverHook,
    H: Handler<T>,
{
    /// Dispatch deliveries until cancellation or the end of the stream.
    ///
    /// A permit is taken before pulling the next delivery, so at most
    /// `concurrency` handlers run at once and a bound of one keeps the
    /// broker's order.
    async fn run(
        self,
        mut deliveries: DeliveryStream,
        cancel: CancellationToken,
        tracker: TaskTracker,
        state: Arc<watch::Sender<SubscriptionState>>,
    ) {
        let worker = Arc::new(self);
        let permits = Arc::new(Semaphore::new(worker.concurrency.max(1)));

        state.send_if_modified(|state| {
            if *state == SubscriptionState::Registered {
                *state = SubscriptionState::Active;
                true
            } else {
                false
            }
        });

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let worker = Arc::clone(&worker);
                    tracker.spawn(async move {
                        worker.process(delivery).await;
                        drop(permit);
                    });
                }
                Some(Err(err)) => worker.hook.on_stream_error(&worker.queue, &err),
                None => break,
            }
        }

        cancel.cancel();
        tracker.close();
        state.send_replace(SubscriptionState::Cancelled);
        worker.hook.on_cancelled(&worker.queue);
    }

    #[tracing::instrument(
        skip_all,
        fields(routing_key = %delivery.routing_key, redelivered = delivery.redelivered)
    )]
    async fn process(&self, delivery: Delivery) {
        let extracted = self
            .telemetry
            .propagator()
            .extract(&delivery.envelope.headers);

        let span = self.telemetry.start_span(
            format!("{} receive", delivery.routing_key),
            SpanKind::Consumer,
            &extracted.to_context(),
            messaging_attributes(self.system, &delivery.routing_key),
        );
        if self.record_payload
            && let Some(text) = delivery.envelope.body_str()
        {
            span.set_attribute(KeyValue::new(MESSAGE_PAYLOAD, text.to_owned()));
        }

        self.hook.on_delivery(&delivery);

        let message = match self.codec.decode::<T>(&delivery.envelope.body) {
            Ok(message) => message,
            Err(err) => {
                span.record_error(&err);
                self.hook.on_decode_error(&delivery, &err);
                self.settle(&delivery, Outcome::Reject { requeue: false })
                    .await;
                return;
            }
        };

        // A panicking handler surfaces as a `JoinError` and is settled like
        // any other failure.
        let handler = Arc::clone(&self.handler);
        let cx = span.context().clone();
        let outcome = match tokio::spawn(async move { handler.handle(message, cx).await }).await {
            Ok(Ok(())) => Outcome::Ack,
            Ok(Err(err)) => {
                span.record_error(err.as_ref());
                self.hook.on_handler_error(&delivery, err.as_ref());
                Outcome::Reject {
                    requeue: self.requeue_on_failure,
                }
            }
            Err(join) => {
                span.record_error(&join);
                self.hook.on_handler_error(&delivery, &join);
                Outcome::Reject {
                    requeue: self.requeue_on_failure,
                }
            }
        };
        self.settle(&delivery, outcome).await;
    }

    async fn settle(&self, delivery: &Delivery, outcome: Outcome) {
        // Immediate mode deliveries were settled by the broker on receipt.
        if self.ack_mode == AckMode::Immediate {
            return;
        }

        let settled = match outcome {
            Outcome::Ack => delivery.ack().await,
            Outcome::Reject { requeue } => delivery.nack(requeue).await,
        };
        if let Err(err) = settled {
            self.hook.on_settle_error(delivery, &err);
        }
    }
}
