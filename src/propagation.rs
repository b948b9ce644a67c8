//! Trace context propagation over string-keyed headers.
//!
//! The [`Propagator`] writes and reads the W3C `traceparent` / `tracestate`
//! headers and the W3C `baggage` header. It only ever sees a generic
//! [`Headers`] carrier and never touches a broker type. Adapters in
//! [`channel`](crate::channel) convert broker-native header values to plain
//! strings before extraction and after injection.
//!
//! Extraction is best-effort: a missing or malformed header resolves to an
//! empty [`PropagationContext`], never to an error.

use std::{collections::BTreeMap, sync::Arc};

use opentelemetry::{
    Context, KeyValue,
    baggage::BaggageExt,
    propagation::{TextMapCompositePropagator, TextMapPropagator},
    trace::{SpanContext, TraceContextExt, TraceId},
};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};

use crate::envelope::Headers;

/// Header holding the W3C trace parent.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// Header holding the W3C trace state.
pub const TRACESTATE_HEADER: &str = "tracestate";
/// Header holding the W3C baggage list.
pub const BAGGAGE_HEADER: &str = "baggage";

/// State needed to continue a trace across a process boundary.
///
/// Built fresh for every message and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationContext {
    span_context: SpanContext,
    baggage: BTreeMap<String, String>,
}

impl Default for PropagationContext {
    fn default() -> Self {
        Self::empty()
    }
}

impl PropagationContext {
    /// A context carrying neither trace identifiers nor baggage.
    pub fn empty() -> Self {
        Self {
            span_context: SpanContext::empty_context(),
            baggage: BTreeMap::new(),
        }
    }

    /// Context continuing the given span.
    pub fn with_span_context(span_context: SpanContext) -> Self {
        Self {
            span_context,
            baggage: BTreeMap::new(),
        }
    }

    /// Capture the active span and baggage of an OpenTelemetry context.
    pub fn from_context(cx: &Context) -> Self {
        let baggage = cx
            .baggage()
            .iter()
            .map(|(key, (value, _))| (key.as_str().to_owned(), value.to_string()))
            .collect();

        Self {
            span_context: cx.span().span_context().clone(),
            baggage,
        }
    }

    /// Add a baggage entry.
    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.insert(key.into(), value.into());
        self
    }

    /// Trace identifiers and sampling flag.
    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    /// Trace id, if the context carries a valid span.
    pub fn trace_id(&self) -> Option<TraceId> {
        self.span_context
            .is_valid()
            .then(|| self.span_context.trace_id())
    }

    /// Baggage entries.
    pub fn baggage(&self) -> &BTreeMap<String, String> {
        &self.baggage
    }

    /// Whether this is the "no context" value.
    pub fn is_empty(&self) -> bool {
        !self.span_context.is_valid() && self.baggage.is_empty()
    }

    /// Rebuild an OpenTelemetry context: the span context as a remote parent,
    /// plus the baggage.
    pub fn to_context(&self) -> Context {
        let mut cx = Context::new();
        if self.span_context.is_valid() {
            cx = cx.with_remote_span_context(self.span_context.clone());
        }
        if !self.baggage.is_empty() {
            cx = cx.with_baggage(
                self.baggage
                    .iter()
                    .map(|(key, value)| KeyValue::new(key.clone(), value.clone())),
            );
        }
        cx
    }
}

/// W3C trace-context and baggage propagator over [`Headers`].
#[derive(Clone)]
pub struct Propagator {
    inner: Arc<TextMapCompositePropagator>,
}

impl Default for Propagator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Propagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Propagator").finish_non_exhaustive()
    }
}

impl Propagator {
    /// Create a propagator for `traceparent`, `tracestate` and `baggage`.
    pub fn new() -> Self {
        let propagators: Vec<Box<dyn TextMapPropagator + Send + Sync>> = vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ];

        Self {
            inner: Arc::new(TextMapCompositePropagator::new(propagators)),
        }
    }

    /// Write the context into the carrier.
    ///
    /// An invalid span context writes no trace headers; empty baggage writes
    /// no baggage header. Existing unrelated keys are left untouched.
    pub fn inject(&self, context: &PropagationContext, carrier: &mut Headers) {
        self.inner.inject_context(&context.to_context(), carrier);
    }

    /// Read a context from the carrier.
    ///
    /// Missing or malformed headers yield the corresponding empty field.
    pub fn extract(&self, carrier: &Headers) -> PropagationContext {
        let cx = self.inner.extract_with_context(&Context::new(), carrier);
        let extracted = PropagationContext::from_context(&cx);

        if let Some(value) = carrier.get(TRACEPARENT_HEADER)
            && !extracted.span_context.is_valid()
        {
            tracing::warn!(
                header = TRACEPARENT_HEADER,
                %value,
                "Malformed trace context header, continuing without a parent",
            );
        }

        extracted
    }
}
