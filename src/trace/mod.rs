//! Distributed-tracing adapter.
//!
//! Every evaluation runs under an `open-policy-agent` span that is a child
//! of the incoming request's span. Outbound HTTP calls the engine makes
//! (bundle fetches, decision-log uploads) are wrapped in
//! `open-policy-agent.http` client spans whose context is injected into the
//! outgoing headers, so traces cross the process boundary.

use std::collections::HashMap;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use opentelemetry::{
    global,
    propagation::Injector,
    trace::{SpanKind, Status, TraceContextExt, Tracer},
    Context, KeyValue,
};

/// Span wrapping one policy evaluation.
pub const EVAL_SPAN_NAME: &str = "open-policy-agent";

/// Span wrapping one outbound engine HTTP call.
pub const HTTP_SPAN_NAME: &str = "open-policy-agent.http";

const TRACER_NAME: &str = "opagate";

/// Start the evaluation span as a child of `parent` (or as a root when the
/// parent context is empty) and return the context carrying it.
pub fn eval_span(parent: &Context, bundle: &str, labels: &HashMap<String, String>) -> Context {
    let tracer = global::tracer(TRACER_NAME);
    let mut attributes = Vec::with_capacity(labels.len() + 1);
    attributes.push(KeyValue::new("opa.bundle_name", bundle.to_string()));
    for (key, value) in labels {
        attributes.push(KeyValue::new(format!("opa.label.{key}"), value.clone()));
    }
    let span = tracer
        .span_builder(EVAL_SPAN_NAME)
        .with_attributes(attributes)
        .start_with_context(&tracer, parent);
    parent.with_span(span)
}

/// Attach the per-evaluation decision id to the active span.
pub fn record_decision_id(cx: &Context, decision_id: &str) {
    cx.span()
        .set_attribute(KeyValue::new("opa.decision_id", decision_id.to_string()));
}

/// Mark the active span as failed.
pub fn record_error(cx: &Context, message: &str) {
    cx.span().set_status(Status::error(message.to_string()));
}

/// End the active span.
pub fn finish(cx: &Context) {
    cx.span().end();
}

/// Wraps the engine's outbound HTTP requests with client spans.
///
/// Handed to the engine at construction time; the engine calls
/// [`OutboundTracer::start`] before each request and ends the returned
/// span context when the response has been consumed.
#[derive(Debug)]
pub struct OutboundTracer {
    bundle: String,
    labels: HashMap<String, String>,
}

impl OutboundTracer {
    pub fn new(bundle: impl Into<String>, labels: HashMap<String, String>) -> Self {
        Self {
            bundle: bundle.into(),
            labels,
        }
    }

    /// Open a client span for one outbound request and inject its context
    /// into `headers` through the global text-map propagator.
    pub fn start(
        &self,
        parent: &Context,
        method: &Method,
        url: &str,
        headers: &mut HeaderMap,
    ) -> Context {
        let (host, path) = split_url(url);
        let mut attributes = vec![
            KeyValue::new("component", EVAL_SPAN_NAME),
            KeyValue::new("http.url", url.to_string()),
            KeyValue::new("http.method", method.as_str().to_string()),
            KeyValue::new("http.host", host),
            KeyValue::new("http.path", path),
            KeyValue::new("opa.bundle_name", self.bundle.clone()),
        ];
        for (key, value) in &self.labels {
            attributes.push(KeyValue::new(format!("opa.label.{key}"), value.clone()));
        }
        let tracer = global::tracer(TRACER_NAME);
        let span = tracer
            .span_builder(HTTP_SPAN_NAME)
            .with_kind(SpanKind::Client)
            .with_attributes(attributes)
            .start_with_context(&tracer, parent);
        let cx = parent.with_span(span);
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut HeaderInjector(headers));
        });
        cx
    }
}

struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            self.0.insert(name, value);
        }
    }
}

fn split_url(url: &str) -> (String, String) {
    match url.parse::<http::Uri>() {
        Ok(uri) => (
            uri.authority().map(ToString::to_string).unwrap_or_default(),
            uri.path().to_string(),
        ),
        Err(_) => (String::new(), url.to_string()),
    }
}
