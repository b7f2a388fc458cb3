//! Turns an inbound public-dialect request into a backend request.
//!
//! The body is forwarded byte-for-byte. Only content negotiation headers
//! survive; everything else the client sent, `Authorization` included, is
//! dropped because authentication happens in front of the gateway. The
//! route's capability descriptor is attached as a single header.

use crate::capability::{CAPABILITY_HEADER, CapabilityHeader};
use crate::error::{GatewayError, GatewayResult};
use crate::registry::RouteDescriptor;
use crate::timeout::Deadline;
use crate::upstream::OutboundBody;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, Request, Uri, header};
use http_body::Body;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use tracing::{info, warn};

/// Inbound headers copied onto the backend request.
pub const FORWARDED_REQUEST_HEADERS: [HeaderName; 2] = [header::CONTENT_TYPE, header::ACCEPT];

/// A backend request ready to send, plus what the dispatcher needs after.
#[derive(Debug)]
pub struct OutboundRequest {
    pub request: Request<OutboundBody>,
    pub header: CapabilityHeader,
    /// Bound on the whole round trip, response draining included
    pub deadline: Deadline,
}

/// Read at most `limit` bytes of `body`.
///
/// # Errors
///
/// - `GatewayError::BodyTooLarge` once the body grows past `limit`; the read
///   stops there without buffering the rest
/// - `GatewayError::BodyRead` if the client stream fails
pub async fn read_body<B>(body: B, limit: usize) -> GatewayResult<Bytes>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(limit, "Request body exceeds size limit");
            Err(GatewayError::BodyTooLarge { limit })
        }
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            Err(GatewayError::BodyRead(e.to_string()))
        }
    }
}

/// Copy the content negotiation headers from `inbound` into `outbound`.
pub fn copy_forwarded_headers(inbound: &HeaderMap, outbound: &mut HeaderMap) {
    for name in FORWARDED_REQUEST_HEADERS.iter() {
        if let Some(value) = inbound.get(name) {
            outbound.insert(name.clone(), value.clone());
        }
    }
}

/// Build the backend request for an already-read body.
pub fn build_outbound(
    inbound_headers: &HeaderMap,
    body: Bytes,
    route: &RouteDescriptor,
    target: Uri,
    deadline: Deadline,
) -> GatewayResult<OutboundRequest> {
    let capability = route
        .capability_header()
        .map_err(|e| GatewayError::Transform(e.to_string()))?;
    let encoded = capability
        .to_header_value()
        .map_err(|e| GatewayError::Transform(e.to_string()))?;

    let content_len = body.len();
    let mut request = Request::builder()
        .method(route.method.clone())
        .uri(target)
        .body(Full::new(body))
        .map_err(|e| GatewayError::Transform(format!("Failed to build request: {}", e)))?;

    let headers = request.headers_mut();
    copy_forwarded_headers(inbound_headers, headers);
    headers.insert(header::CONTENT_LENGTH, content_len.into());
    headers.insert(CAPABILITY_HEADER, encoded);

    info!(
        route = %route.kind,
        target = %request.uri(),
        content_len,
        capability_header = %capability.to_json(),
        "Forwarding request to backend"
    );

    Ok(OutboundRequest {
        request,
        header: capability,
        deadline,
    })
}

/// Transform an inbound request for `route`, addressed to `target`.
///
/// The round-trip deadline starts here, before the body is read.
pub async fn transform<B>(
    inbound: Request<B>,
    route: &RouteDescriptor,
    target: Uri,
) -> GatewayResult<OutboundRequest>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let deadline = Deadline::after(route.round_trip);
    let (parts, body) = inbound.into_parts();
    let body = read_body(body, route.max_body_bytes).await?;
    build_outbound(&parts.headers, body, route, target, deadline)
}
