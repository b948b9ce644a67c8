use crate::{
    channel::{ChannelError, Delivery, Queue},
    codec::CodecError,
};

/// Hook trait for observing subscription lifecycle events.
///
/// Hooks are invoked synchronously from the subscription's worker tasks and
/// should avoid heavy or blocking work. Typical use cases include logging,
/// metrics, and alerting on poison messages.
pub trait ReceiverHook: Send + Sync + 'static {
    fn on_subscribed(&self, queue: &Queue);
    fn on_cancelled(&self, queue: &Queue);
    fn on_delivery(&self, delivery: &Delivery);
    fn on_decode_error(&self, delivery: &Delivery, error: &CodecError);
    fn on_handler_error(&self, delivery: &Delivery, error: &(dyn std::error::Error + 'static));
    fn on_settle_error(&self, delivery: &Delivery, error: &ChannelError);
    fn on_stream_error(&self, queue: &Queue, error: &ChannelError);
}

/// Default receiver hook implementation.
///
/// Logs lifecycle events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultReceiverHook;

impl ReceiverHook for DefaultReceiverHook {
    fn on_subscribed(&self, queue: &Queue) {
        tracing::info!(%queue, "Subscription registered");
    }

    fn on_cancelled(&self, queue: &Queue) {
        tracing::info!(%queue, "Subscription cancelled");
    }

    fn on_delivery(&self, delivery: &Delivery) {
        tracing::debug!(
            routing_key = %delivery.routing_key,
            redelivered = delivery.redelivered,
            "Message received"
        );
    }

    fn on_decode_error(&self, delivery: &Delivery, error: &CodecError) {
        tracing::error!(
            routing_key = %delivery.routing_key,
            %error,
            "Failed to decode message, rejecting it"
        );
    }

    fn on_handler_error(&self, delivery: &Delivery, error: &(dyn std::error::Error + 'static)) {
        tracing::error!(
            routing_key = %delivery.routing_key,
            %error,
            "Message handler failed"
        );
    }

    fn on_settle_error(&self, delivery: &Delivery, error: &ChannelError) {
        tracing::error!(
            routing_key = %delivery.routing_key,
            %error,
            "Failed to settle message"
        );
    }

    fn on_stream_error(&self, queue: &Queue, error: &ChannelError) {
        tracing::error!(%queue, %error, "Error receiving message");
    }
}
