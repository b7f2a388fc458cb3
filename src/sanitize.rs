//! Response header sanitation.
//!
//! The gateway terminates the backend connection and opens a new one to
//! the client, so connection-scoped headers never cross it. Headers the
//! backend uses for its own bookkeeping are removed as well, and the
//! declared content type is replaced with one of the two types the public
//! dialect uses.
//!
//! # Content Type
//!
//! The backend sometimes labels JSON replies (and occasionally event
//! streams) as `text/plain`. The declared type is trusted only when it says
//! `text/event-stream`; otherwise the start of the body, when available, is
//! inspected for event-stream framing (see [`sniff_event_stream`]).

use http::{HeaderMap, HeaderName, HeaderValue, header};

/// Canonical event-stream content type.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Content type forced onto every non-streaming reply.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Connection-scoped headers that are never forwarded.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Backend bookkeeping headers that are not part of the public dialect.
pub const BACKEND_INTERNAL_HEADERS: [&str; 3] =
    ["livepeer-balance", "x-metadata", "x-orchestrator-url"];

/// Field prefixes that can open an event-stream body.
const EVENT_STREAM_FIELDS: [&[u8]; 5] = [b"data:", b"event:", b"id:", b"retry:", b":"];

/// Check if a header is connection-scoped and must not be forwarded.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Check if a header is backend bookkeeping.
pub fn is_backend_internal_header(name: &str) -> bool {
    BACKEND_INTERNAL_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// How the response body is served to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    EventStream,
    Json,
}

impl PayloadShape {
    /// Content type announced for this shape.
    pub fn content_type(self) -> &'static str {
        match self {
            PayloadShape::EventStream => EVENT_STREAM_CONTENT_TYPE,
            PayloadShape::Json => JSON_CONTENT_TYPE,
        }
    }

    pub fn is_event_stream(self) -> bool {
        self == PayloadShape::EventStream
    }
}

/// Shape the backend declared through its `Content-Type`, if it declared an
/// event stream. Parameters (`; charset=utf-8`) are ignored.
pub fn declared_shape(headers: &HeaderMap) -> Option<PayloadShape> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let mime = value.split(';').next().unwrap_or("").trim();
    mime.eq_ignore_ascii_case(EVENT_STREAM_CONTENT_TYPE)
        .then_some(PayloadShape::EventStream)
}

/// Most body bytes buffered while deciding whether a reply is an event stream.
pub const SNIFF_LIMIT: usize = 1024;

/// Whether a body starting with `head` is framed as an event stream, or
/// `None` while `head` is too short to tell (only whitespace so far, or a
/// cut-off field name such as `da`).
pub fn sniff_event_stream(head: &[u8]) -> Option<bool> {
    let start = head.iter().position(|b| !b.is_ascii_whitespace())?;
    let head = &head[start..];
    if EVENT_STREAM_FIELDS
        .iter()
        .any(|field| head.starts_with(field))
    {
        return Some(true);
    }
    if EVENT_STREAM_FIELDS
        .iter()
        .any(|field| field.starts_with(head))
    {
        return None;
    }
    Some(false)
}

/// Whether a body starting with `head` is framed as an event stream. An
/// undecidable head counts as not an event stream.
pub fn looks_like_event_stream(head: &[u8]) -> bool {
    sniff_event_stream(head).unwrap_or(false)
}

/// Headers to send to the client plus the shape they announce.
#[derive(Debug, Clone)]
pub struct SanitizedHeaders {
    pub headers: HeaderMap,
    pub shape: PayloadShape,
}

/// Sanitize backend response headers.
///
/// `observed` is the start of the body when the caller peeked at it;
/// it only matters when the backend did not declare an event stream.
pub fn sanitize(upstream: &HeaderMap, observed: Option<&[u8]>) -> SanitizedHeaders {
    let shape = declared_shape(upstream).unwrap_or_else(|| match observed {
        Some(chunk) if looks_like_event_stream(chunk) => PayloadShape::EventStream,
        _ => PayloadShape::Json,
    });

    // Headers named by the Connection header are connection-scoped too
    let listed: Vec<String> = upstream
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream.iter() {
        let name_str = name.as_str();
        if is_hop_by_hop_header(name_str)
            || is_backend_internal_header(name_str)
            || listed.iter().any(|l| l == name_str)
            || *name == header::CONTENT_TYPE
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(shape.content_type()),
    );

    SanitizedHeaders { headers, shape }
}

/// Remove headers that are no longer accurate once the body is rewritten.
pub fn strip_length_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(HeaderName::from_static("content-md5"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn test_hop_by_hop_detection_ignores_case() {
        assert!(is_hop_by_hop_header("keep-alive"));
        assert!(is_hop_by_hop_header("Keep-Alive"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(is_hop_by_hop_header("TE"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("x-request-id"));
    }

    #[test]
    fn test_strips_hop_by_hop_and_internal_headers() {
        let upstream = headers(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "h2c"),
            ("trailer", "expires"),
            ("livepeer-balance", "42"),
            ("x-metadata", "{}"),
            ("x-orchestrator-url", "https://orch:8935"),
            ("x-request-id", "abc"),
            ("cache-control", "no-cache"),
            ("content-type", "application/json"),
        ]);

        let sanitized = sanitize(&upstream, None);
        let out = &sanitized.headers;

        for name in HOP_BY_HOP_HEADERS.iter().chain(BACKEND_INTERNAL_HEADERS.iter()) {
            assert!(out.get(*name).is_none(), "{name} leaked");
        }
        assert_eq!(out.get("x-request-id").unwrap(), "abc");
        assert_eq!(out.get("cache-control").unwrap(), "no-cache");
    }

    #[test]
    fn test_strips_headers_listed_in_connection() {
        let upstream = headers(&[
            ("connection", "close, X-Backend-Trace"),
            ("x-backend-trace", "span-1"),
            ("x-other", "kept"),
        ]);

        let out = sanitize(&upstream, None).headers;
        assert!(out.get("x-backend-trace").is_none());
        assert_eq!(out.get("x-other").unwrap(), "kept");
    }

    #[test]
    fn test_keeps_repeated_headers() {
        let upstream = headers(&[("set-cookie", "a=1"), ("set-cookie", "b=2")]);
        let out = sanitize(&upstream, None).headers;
        assert_eq!(out.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_declared_event_stream_is_canonicalized() {
        let upstream = headers(&[("content-type", "Text/Event-Stream; charset=utf-8")]);
        let sanitized = sanitize(&upstream, None);
        assert_eq!(sanitized.shape, PayloadShape::EventStream);
        assert_eq!(
            sanitized.headers.get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
    }

    #[test]
    fn test_mislabelled_json_becomes_json() {
        for declared in ["text/plain", "text/html", "application/octet-stream"] {
            let upstream = headers(&[("content-type", declared)]);
            let sanitized = sanitize(&upstream, Some(br#"{"data":[]}"#));
            assert_eq!(sanitized.shape, PayloadShape::Json, "{declared}");
            assert_eq!(
                sanitized.headers.get(header::CONTENT_TYPE).unwrap(),
                "application/json"
            );
        }
    }

    #[test]
    fn test_missing_content_type_defaults_to_json() {
        let sanitized = sanitize(&HeaderMap::new(), None);
        assert_eq!(sanitized.shape, PayloadShape::Json);
        assert_eq!(
            sanitized.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_plain_text_event_stream_is_sniffed() {
        let upstream = headers(&[("content-type", "text/plain")]);
        let sanitized = sanitize(&upstream, Some(b"data: {\"choices\":[]}\n\n"));
        assert_eq!(sanitized.shape, PayloadShape::EventStream);
        assert_eq!(
            sanitized.headers.get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
    }

    #[test]
    fn test_event_stream_sniffing() {
        assert!(looks_like_event_stream(b"data: {}\n"));
        assert!(looks_like_event_stream(b"data:{}"));
        assert!(looks_like_event_stream(b"event: ping\n"));
        assert!(looks_like_event_stream(b": keep-alive\n"));
        assert!(looks_like_event_stream(b"\n\nid: 7\n"));
        assert!(looks_like_event_stream(b"retry: 1000\n"));

        assert!(!looks_like_event_stream(b""));
        assert!(!looks_like_event_stream(b"   "));
        assert!(!looks_like_event_stream(br#"{"data":1}"#));
        assert!(!looks_like_event_stream(b"[1,2,3]"));
        assert!(!looks_like_event_stream(b"database error"));
    }

    #[test]
    fn test_sniffing_waits_for_enough_bytes() {
        assert_eq!(sniff_event_stream(b""), None);
        assert_eq!(sniff_event_stream(b"\n"), None);
        assert_eq!(sniff_event_stream(b"\r\n  "), None);
        assert_eq!(sniff_event_stream(b"da"), None);
        assert_eq!(sniff_event_stream(b"\nre"), None);

        assert_eq!(sniff_event_stream(b"\ndata"), None);
        assert_eq!(sniff_event_stream(b"\ndatabase"), Some(false));
        assert_eq!(sniff_event_stream(b"\ndata:"), Some(true));
        assert_eq!(sniff_event_stream(b"db"), Some(false));
        assert_eq!(sniff_event_stream(b"{"), Some(false));
    }

    #[test]
    fn test_strip_length_headers() {
        let mut map = headers(&[("content-length", "12"), ("x-keep", "1")]);
        strip_length_headers(&mut map);
        assert!(map.get("content-length").is_none());
        assert!(map.get("x-keep").is_some());
    }
}
