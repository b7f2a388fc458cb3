//! Route dispatcher.
//!
//! # Overview
//!
//! `GatewayService` is the single handler behind every public route. Each
//! request runs the same pipeline, parameterized only by the route's
//! [`RouteDescriptor`]:
//!
//! ```text
//! Request ──► registry.lookup(method, path) ──► 404 / 405
//!                 │
//!                 ▼
//!           transform()  ── body > cap ──► 400 (backend never contacted)
//!                 │
//!                 ▼
//!           client.execute() ── refused / timed out ──► 502
//!                 │
//!                 ▼
//!           sanitize(headers)
//!                 │
//!      ┌──────────┴───────────┐
//!      │                      │
//! streaming route and    everything else
//! event-stream reply          │
//!      │                      ▼
//!      ▼                 raw body copy
//! FilteredBody
//! ```
//!
//! The response body stays bound to the round-trip deadline in both
//! branches.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{CapabilityRegistry, RouteDescriptor};
use crate::sanitize::{SNIFF_LIMIT, declared_shape, sanitize, sniff_event_stream, strip_length_headers};
use crate::sse_filter::FilteredBody;
use crate::timeout::DeadlineBody;
use crate::transform::transform;
use crate::upstream::BackendClient;
use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream};
use http_body::Body;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, BodyStream, Full, StreamBody};
use hyper::{Request, Response, StatusCode, header};
use std::sync::Arc;
use tower::Service;
use tracing::{debug, info, warn};

/// Boxed error type shared by every response body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Unified response body type.
///
/// Error replies and the health check use `Full<Bytes>`, backend replies
/// stream. Both are boxed for a single return type.
pub type GatewayBody = BoxBody<Bytes, BoxError>;

/// Liveness endpoint answered locally for any method.
pub const HEALTH_PATH: &str = "/healthz";

struct Inner {
    registry: CapabilityRegistry,
    client: BackendClient,
}

/// The gateway's request handler. Cheap to clone; clones share the
/// registry and the backend connection pool.
#[derive(Clone)]
pub struct GatewayService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService")
            .field("routes", &self.inner.registry.len())
            .field("backend", &self.inner.client)
            .finish()
    }
}

impl GatewayService {
    /// Build the registry and backend client from configuration.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Transform` if the backend client cannot be
    /// created.
    pub fn new(config: &GatewayConfig) -> GatewayResult<Self> {
        let client = BackendClient::new(config.backend_base_url(), &config.backend)?;
        Ok(Self::from_parts(
            CapabilityRegistry::from_config(config),
            client,
        ))
    }

    pub fn from_parts(registry: CapabilityRegistry, client: BackendClient) -> Self {
        Self {
            inner: Arc::new(Inner { registry, client }),
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.inner.registry
    }

    pub fn backend(&self) -> &BackendClient {
        &self.inner.client
    }

    /// Handle one request, surfacing failures as `GatewayError`.
    pub async fn handle_request<B>(&self, req: Request<B>) -> GatewayResult<Response<GatewayBody>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        if req.uri().path() == HEALTH_PATH {
            return Ok(health_response());
        }

        let route = self
            .inner
            .registry
            .lookup(req.method(), req.uri().path())?;
        debug!(route = %route.kind, capability = %route.capability_name, "Route matched");

        let target = self.inner.client.target_uri(&route.backend_path)?;
        let outbound = transform(req, route, target).await?;
        let deadline = outbound.deadline;

        let response = self.inner.client.execute(outbound.request, deadline).await?;
        let (parts, body) = response.into_parts();
        let body: GatewayBody = DeadlineBody::new(body, deadline).boxed();

        self.relay(route, parts, body).await
    }

    /// Handle one request, rendering failures as plain-text error replies.
    pub async fn respond<B>(&self, req: Request<B>) -> Response<GatewayBody>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        match self.handle_request(req).await {
            Ok(response) => response,
            Err(e) => error_response(&e),
        }
    }

    /// Sanitize the backend reply and pick the body path.
    async fn relay(
        &self,
        route: &RouteDescriptor,
        parts: http::response::Parts,
        body: GatewayBody,
    ) -> GatewayResult<Response<GatewayBody>> {
        // Mislabelled event streams are only worth detecting where they get filtered
        let (observed, body) = if route.streaming && declared_shape(&parts.headers).is_none() {
            peek_body_head(body).await?
        } else {
            (None, body)
        };

        let sanitized = sanitize(&parts.headers, observed.as_deref());
        let filtered = route.streaming && sanitized.shape.is_event_stream();

        info!(
            route = %route.kind,
            status = parts.status.as_u16(),
            content_type = sanitized.shape.content_type(),
            filtered,
            "Backend responded"
        );

        let mut headers = sanitized.headers;
        let body = if filtered {
            strip_length_headers(&mut headers);
            FilteredBody::new(body).boxed()
        } else {
            body
        };

        let mut response = Response::new(body);
        *response.status_mut() = parts.status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Buffer the start of `body` until it is clear whether it is an event
/// stream, then hand back an equivalent body that replays what was read.
///
/// Reading stops at the first decisive byte, at end of body, or once
/// [`SNIFF_LIMIT`] bytes are held, so a backend that splits its first line
/// (or opens with keep-alive blank lines) is still recognized.
async fn peek_body_head(mut body: GatewayBody) -> GatewayResult<(Option<Bytes>, GatewayBody)> {
    let mut head = BytesMut::new();
    let mut frames = Vec::new();

    while head.len() < SNIFF_LIMIT && sniff_event_stream(&head).is_none() {
        match body.frame().await {
            None => break,
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    head.extend_from_slice(data);
                }
                frames.push(frame);
            }
            Some(Err(e)) => return Err(body_read_error(e)),
        }
    }

    if frames.is_empty() {
        return Ok((None, body));
    }
    let replay = StreamExt::chain(
        stream::iter(frames.into_iter().map(Ok::<_, BoxError>)),
        BodyStream::new(body),
    );
    Ok((Some(head.freeze()), BodyExt::boxed(StreamBody::new(replay))))
}

fn body_read_error(e: BoxError) -> GatewayError {
    let timed_out = e
        .downcast_ref::<std::io::Error>()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::TimedOut);
    if timed_out {
        GatewayError::BackendTimeout(e.to_string())
    } else {
        GatewayError::BackendUnreachable(format!("failed to read response body: {}", e))
    }
}

fn health_response() -> Response<GatewayBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(b"ok"))
            .map_err(|never| match never {})
            .boxed(),
    );
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Log a request failure and render it for the client.
pub fn error_response(err: &GatewayError) -> Response<GatewayBody> {
    let status = err.status();
    if status == StatusCode::BAD_GATEWAY {
        warn!(error = %err, kind = err.kind(), status = status.as_u16(), "Backend exchange failed");
    } else {
        info!(error = %err, kind = err.kind(), status = status.as_u16(), "Request rejected");
    }
    err.to_response()
        .map(|body| body.map_err(|never| match never {}).boxed())
}

impl<B> Service<Request<B>> for GatewayService
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Response = Response<GatewayBody>;
    type Error = GatewayError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.handle_request(req).await })
    }
}
