use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    Envelope,
    channel::{
        Acknowledge, AutoAcked, ChannelError, ConsumeOptions, Delivery, DeliveryStream, Queue,
        QueueChannel, QueueOptions,
    },
};

/// `messaging.system` value reported by in-memory channels.
pub const SYSTEM: &str = "in-memory";

/// In-process broker for testing or single-process pipelines.
///
/// The broker owns every declared queue. Channels opened with
/// [`InMemoryBroker::channel`] share those queues, the same way several AMQP
/// channels share the queues of one broker. It is useful for:
/// - Unit and integration testing
/// - Simulating delivery without a real broker
/// - Debugging message flows
///
/// Consumers on the same queue compete for deliveries. Envelopes published
/// before any consumer is registered wait in the queue.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    queues: Arc<Mutex<HashMap<Queue, Arc<QueueState>>>>,
}

/// Counters of an in-memory queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Envelopes waiting for a consumer.
    pub ready: usize,
    /// Deliveries acknowledged, including auto-acknowledged ones.
    pub acked: usize,
    /// Deliveries rejected without requeue.
    pub rejected: usize,
}

impl InMemoryBroker {
    /// Create a broker with no queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new channel on this broker.
    pub fn channel(&self) -> InMemory {
        InMemory {
            broker: self.clone(),
            closed: CancellationToken::new(),
        }
    }

    /// Names of all declared queues, sorted.
    pub async fn queue_names(&self) -> Vec<Queue> {
        let mut names: Vec<_> = self.queues.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Counters of a queue, if it was declared.
    pub async fn stats(&self, queue: &Queue) -> Option<QueueStats> {
        self.queue(queue).await.map(|state| state.stats())
    }

    async fn queue(&self, queue: &Queue) -> Option<Arc<QueueState>> {
        self.queues.lock().await.get(queue).cloned()
    }
}

struct QueueState {
    options: QueueOptions,
    sender: mpsc::UnboundedSender<Pending>,
    receiver: Mutex<mpsc::UnboundedReceiver<Pending>>,
    ready: AtomicUsize,
    acked: AtomicUsize,
    rejected: AtomicUsize,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            options,
            sender,
            receiver: Mutex::new(receiver),
            ready: AtomicUsize::new(0),
            acked: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    fn push(&self, pending: Pending) {
        self.ready.fetch_add(1, Ordering::SeqCst);
        // The receiver lives as long as the queue, so sending cannot fail.
        let _ = self.sender.send(pending);
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            ready: self.ready.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
        }
    }
}

#[derive(Clone)]
struct Pending {
    envelope: Envelope,
    routing_key: String,
    redelivered: bool,
}

/// Channel on an [`InMemoryBroker`].
///
/// Closing the channel fails later operations with
/// [`ChannelErrorKind::Closed`](crate::channel::ChannelErrorKind::Closed) and
/// ends every delivery stream it opened.
pub struct InMemory {
    broker: InMemoryBroker,
    closed: CancellationToken,
}

impl InMemory {
    /// Tear the channel down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::closed());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl QueueChannel for InMemory {
    fn system(&self) -> &'static str {
        SYSTEM
    }

    #[tracing::instrument(skip(self), fields(queue = %queue))]
    async fn ensure_queue(&self, queue: &Queue, options: QueueOptions) -> Result<(), ChannelError> {
        self.ensure_open()?;

        let mut queues = self.broker.queues.lock().await;
        match queues.get(queue) {
            Some(existing) if existing.options == options => Ok(()),
            Some(existing) => {
                tracing::warn!(existing = ?existing.options, "Queue declared with conflicting flags");
                Err(ChannelError::queue_conflict(queue))
            }
            None => {
                queues.insert(queue.clone(), Arc::new(QueueState::new(options)));
                tracing::debug!("Queue declared");
                Ok(())
            }
        }
    }

    /// "Publish" an envelope by appending it to the in-memory queue.
    #[tracing::instrument(skip_all, fields(queue = %queue))]
    async fn publish(&self, queue: &Queue, envelope: Envelope) -> Result<(), ChannelError> {
        self.ensure_open()?;

        let state = self
            .broker
            .queue(queue)
            .await
            .ok_or_else(|| ChannelError::publish(format!("no queue named {queue}").into()))?;

        tracing::debug!(headers = ?envelope.headers, "Envelope published to in-memory queue");
        state.push(Pending {
            envelope,
            routing_key: queue.to_string(),
            redelivered: false,
        });
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(queue = %queue))]
    async fn consume(
        &self,
        queue: &Queue,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, ChannelError> {
        self.ensure_open()?;

        let state = self
            .broker
            .queue(queue)
            .await
            .ok_or_else(|| ChannelError::subscription(format!("no queue named {queue}").into()))?;
        let closed = self.closed.clone();
        let auto_ack = options.auto_ack;

        let stream = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    _ = closed.cancelled() => None,
                    pending = async { state.receiver.lock().await.recv().await } => pending,
                };
                let Some(pending) = next else {
                    break;
                };
                state.ready.fetch_sub(1, Ordering::SeqCst);

                let delivery = if auto_ack {
                    state.acked.fetch_add(1, Ordering::SeqCst);
                    Delivery::new(pending.envelope, pending.routing_key, pending.redelivered, AutoAcked)
                } else {
                    let acker = InMemoryAcker {
                        state: Arc::clone(&state),
                        pending: Mutex::new(Some(pending.clone())),
                    };
                    Delivery::new(pending.envelope, pending.routing_key, pending.redelivered, acker)
                };
                yield Ok(delivery);
            }
            tracing::debug!("In-memory delivery stream ended");
        };

        Ok(Box::pin(stream))
    }
}

/// Settles one delivery of an in-memory queue.
///
/// A delivery dropped without being settled goes back on the queue, like an
/// unacknowledged AMQP delivery when its consumer goes away.
struct InMemoryAcker {
    state: Arc<QueueState>,
    pending: Mutex<Option<Pending>>,
}

#[async_trait::async_trait]
impl Acknowledge for InMemoryAcker {
    async fn ack(&self) -> Result<(), ChannelError> {
        self.pending
            .lock()
            .await
            .take()
            .ok_or_else(|| ChannelError::settle("delivery already settled".into()))?;
        self.state.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), ChannelError> {
        let pending = self
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| ChannelError::settle("delivery already settled".into()))?;

        if requeue {
            self.state.push(Pending {
                redelivered: true,
                ..pending
            });
        } else {
            self.state.rejected.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.get_mut().take() {
            self.state.push(Pending {
                redelivered: true,
                ..pending
            });
        }
    }
}
