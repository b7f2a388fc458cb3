//! Tower layer for structured request/response logging.
//!
//! `tower_http::trace::TraceLayer` does the plumbing. Every request gets a
//! span carrying a `request_id`, so log lines emitted while it is handled
//! (capability header, filtered events, backend failures) can be joined.
//! Header dumps are only produced at DEBUG and never include credentials.

use http::HeaderMap;
use std::fmt;
use std::time::Duration;
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{
    DefaultOnBodyChunk, DefaultOnEos, MakeSpan, OnFailure, OnRequest, OnResponse, TraceLayer,
};
use tracing::{Level, Span, debug, info, warn};

/// Request header used to carry a caller-supplied correlation ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Headers whose values never reach the logs.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
];

const MAX_HEADERS_TO_LOG: usize = 50;
const MAX_VALUE_LEN: usize = 1024;

/// The layer type returned by [`logging_layer`].
pub type GatewayTraceLayer = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    CorrelationMakeSpan,
    OnRequestLogger,
    OnResponseLogger,
    DefaultOnBodyChunk,
    DefaultOnEos,
    OnFailureLogger,
>;

/// Create the logging/tracing layer.
pub fn logging_layer() -> GatewayTraceLayer {
    TraceLayer::new_for_http()
        .make_span_with(CorrelationMakeSpan)
        .on_request(OnRequestLogger)
        .on_response(OnResponseLogger)
        .on_failure(OnFailureLogger)
}

/// Correlation ID for a request: the caller's `x-request-id` if it sent a
/// usable one, otherwise a fresh UUID v4.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Span creator that attaches a correlation ID to every request span.
#[derive(Clone, Debug)]
pub struct CorrelationMakeSpan;

impl<B> MakeSpan<B> for CorrelationMakeSpan {
    fn make_span(&mut self, request: &hyper::Request<B>) -> Span {
        tracing::info_span!(
            "request",
            method = %request.method(),
            path = %request.uri().path(),
            version = ?request.version(),
            request_id = %request_id(request.headers()),
        )
    }
}

#[derive(Clone, Debug)]
pub struct OnRequestLogger;

impl<B> OnRequest<B> for OnRequestLogger {
    fn on_request(&mut self, request: &hyper::Request<B>, _span: &Span) {
        info!(
            method = %request.method(),
            path = %request.uri().path(),
            direction = "inbound",
            "Request received"
        );

        if tracing::enabled!(Level::DEBUG) {
            debug!(headers = ?redact_headers(request.headers()), "Request headers");
        }
    }
}

#[derive(Clone, Debug)]
pub struct OnResponseLogger;

impl<B> OnResponse<B> for OnResponseLogger {
    fn on_response(self, response: &hyper::Response<B>, latency: Duration, _span: &Span) {
        info!(
            status = response.status().as_u16(),
            latency_ms = latency.as_millis(),
            direction = "outbound",
            "Response sent"
        );

        if tracing::enabled!(Level::DEBUG) {
            debug!(headers = ?redact_headers(response.headers()), "Response headers");
        }
    }
}

/// Logs 5xx replies and body stream failures (a truncated event stream
/// shows up here).
#[derive(Clone, Debug)]
pub struct OnFailureLogger;

impl OnFailure<ServerErrorsFailureClass> for OnFailureLogger {
    fn on_failure(&mut self, failure: ServerErrorsFailureClass, latency: Duration, _span: &Span) {
        warn!(
            classification = %failure,
            latency_ms = latency.as_millis(),
            direction = "error",
            "Request failed"
        );
    }
}

/// Debug view of a header map with credentials masked.
pub struct RedactedHeaders<'a>(&'a HeaderMap);

/// Wrap `headers` for logging without allocating.
#[inline]
pub fn redact_headers(headers: &HeaderMap) -> RedactedHeaders<'_> {
    RedactedHeaders(headers)
}

fn is_sensitive(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|&sensitive| name.eq_ignore_ascii_case(sensitive))
}

impl fmt::Debug for RedactedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();

        for (idx, (name, value)) in self.0.iter().enumerate() {
            if idx >= MAX_HEADERS_TO_LOG {
                map.entry(&"...", &format!("({} more headers)", self.0.len() - idx));
                break;
            }

            let name = name.as_str();
            if is_sensitive(name) {
                map.entry(&name, &"[REDACTED]");
                continue;
            }

            match value.to_str() {
                Ok(text) if text.len() <= MAX_VALUE_LEN => {
                    map.entry(&name, &text);
                }
                Ok(text) => {
                    // Header values are visible ASCII, so any index is a char boundary
                    map.entry(
                        &name,
                        &format!("{}... ({} bytes)", &text[..MAX_VALUE_LEN], text.len()),
                    );
                }
                Err(_) => {
                    map.entry(&name, &format!("<binary: {} bytes>", value.len()));
                }
            }
        }

        map.finish()
    }
}
