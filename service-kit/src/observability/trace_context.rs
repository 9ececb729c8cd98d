//! Outgoing header propagation.
//!
//! Every request sent by the HTTP and JSON-RPC clients carries the W3C trace
//! context of the current span and the caller's request id, so calls can be
//! correlated across services.
//!
//! See: https://www.w3.org/TR/trace-context/

use opentelemetry::trace::TraceContextExt;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::context::RequestContext;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Writes `traceparent`/`tracestate` for the current span, if it is sampled
/// into an OpenTelemetry trace.
pub fn inject_trace_context(headers: &mut HeaderMap) {
    let span = Span::current();
    let context = span.context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();

    if !span_context.is_valid() {
        return;
    }

    // version-trace_id-span_id-trace_flags
    let traceparent = format!(
        "00-{}-{}-{:02x}",
        span_context.trace_id(),
        span_context.span_id(),
        span_context.trace_flags().to_u8()
    );
    if let Ok(value) = HeaderValue::from_str(&traceparent) {
        headers.insert(TRACEPARENT_HEADER, value);
    }

    let tracestate = span_context.trace_state().header();
    if !tracestate.is_empty()
        && let Ok(value) = HeaderValue::from_str(&tracestate)
    {
        headers.insert(TRACESTATE_HEADER, value);
    }
}

/// Headers to attach to a request made on behalf of `ctx`.
///
/// The context's request id is used when present, otherwise `fallback_id`
/// is asked for one. Pass `|| None` to skip the header entirely.
pub fn propagation_headers(
    ctx: &RequestContext,
    fallback_id: impl FnOnce() -> Option<String>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    inject_trace_context(&mut headers);

    let request_id = match ctx.request_id() {
        Some(id) => Some(id.to_string()),
        None => fallback_id(),
    };
    if let Some(value) = request_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    headers
}
