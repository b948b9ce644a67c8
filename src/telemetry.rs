//! Span creation and messaging metadata shared by senders and receivers.

use std::sync::Arc;

use opentelemetry::{
    Context, KeyValue,
    global::{self, BoxedTracer},
    trace::{SpanContext, SpanKind, Status, TraceContextExt, Tracer, TracerProvider},
};

use crate::propagation::Propagator;

/// Messaging system identifier attribute.
pub const MESSAGING_SYSTEM: &str = "messaging.system";
/// Destination kind attribute, always `"queue"`.
pub const MESSAGING_DESTINATION_KIND: &str = "messaging.destination_kind";
/// Destination (exchange) attribute.
pub const MESSAGING_DESTINATION: &str = "messaging.destination";
/// Routing key attribute, the queue name.
pub const MESSAGING_ROUTING_KEY: &str = "messaging.routing_key";
/// Optional attribute holding the received body text.
pub const MESSAGE_PAYLOAD: &str = "message";

/// Publishing goes through the broker's default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

const INSTRUMENTATION_NAME: &str = env!("CARGO_PKG_NAME");

/// The fixed attribute set recorded on both producer and consumer spans.
pub fn messaging_attributes(system: &'static str, queue: &str) -> Vec<KeyValue> {
    vec![
        KeyValue::new(MESSAGING_SYSTEM, system),
        KeyValue::new(MESSAGING_DESTINATION_KIND, "queue"),
        KeyValue::new(MESSAGING_DESTINATION, DEFAULT_EXCHANGE),
        KeyValue::new(MESSAGING_ROUTING_KEY, queue.to_owned()),
    ]
}

/// Tracer and propagator used to instrument sends and deliveries.
///
/// Cloning is cheap; clones share the same tracer.
#[derive(Clone)]
pub struct Telemetry {
    tracer: Arc<BoxedTracer>,
    propagator: Propagator,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::global()
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("propagator", &self.propagator)
            .finish_non_exhaustive()
    }
}

impl Telemetry {
    /// Use the globally installed tracer provider.
    ///
    /// Without an installed provider spans are no-ops and senders fall back
    /// to propagating the caller's context.
    pub fn global() -> Self {
        Self::from_tracer(global::tracer(INSTRUMENTATION_NAME))
    }

    /// Use a tracer obtained from the given provider.
    pub fn from_provider<P>(provider: &P) -> Self
    where
        P: TracerProvider,
        P::Tracer: Send + Sync + 'static,
        <P::Tracer as Tracer>::Span: Send + Sync + 'static,
    {
        Self::from_tracer(BoxedTracer::new(Box::new(
            provider.tracer(INSTRUMENTATION_NAME),
        )))
    }

    /// Use an already boxed tracer.
    pub fn from_tracer(tracer: BoxedTracer) -> Self {
        Self {
            tracer: Arc::new(tracer),
            propagator: Propagator::new(),
        }
    }

    /// Replace the header propagator.
    pub fn with_propagator(mut self, propagator: Propagator) -> Self {
        self.propagator = propagator;
        self
    }

    /// The header propagator.
    pub fn propagator(&self) -> &Propagator {
        &self.propagator
    }

    pub(crate) fn start_span(
        &self,
        name: String,
        kind: SpanKind,
        parent: &Context,
        attributes: Vec<KeyValue>,
    ) -> SpanGuard {
        let span = self
            .tracer
            .span_builder(name)
            .with_kind(kind)
            .with_attributes(attributes)
            .start_with_context(self.tracer.as_ref(), parent);

        SpanGuard {
            cx: parent.with_span(span),
        }
    }
}

/// Owns a started span and ends it when dropped.
pub(crate) struct SpanGuard {
    cx: Context,
}

impl SpanGuard {
    /// Context with the guarded span active.
    pub(crate) fn context(&self) -> &Context {
        &self.cx
    }

    pub(crate) fn span_context(&self) -> SpanContext {
        self.cx.span().span_context().clone()
    }

    pub(crate) fn set_attribute(&self, attribute: KeyValue) {
        self.cx.span().set_attribute(attribute);
    }

    pub(crate) fn record_error(&self, err: &(dyn std::error::Error + 'static)) {
        let span = self.cx.span();
        span.record_error(err);
        span.set_status(Status::error(err.to_string()));
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.cx.span().end();
    }
}
