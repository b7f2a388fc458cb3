//! Mock capability backend for integration testing.
//!
//! Answers every path with a configurable reply and records each request
//! it receives (path, headers, body), so tests can check exactly what the
//! gateway put on the wire.

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::Response,
};
use capgate::capability::{CAPABILITY_HEADER, CapabilityHeader};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// A canned backend reply.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: StatusCode,
    pub headers: Vec<(&'static str, &'static str)>,
    pub chunks: Vec<Bytes>,
    /// Pause before each chunk (and before the head, when `head_delay` is set)
    pub chunk_delay: Duration,
    pub head_delay: Duration,
}

impl MockReply {
    /// `200` with a JSON body, declared as `application/json`.
    pub fn json(body: &str) -> Self {
        Self {
            status: StatusCode::OK,
            headers: vec![("content-type", "application/json")],
            chunks: vec![Bytes::from(body.to_owned())],
            chunk_delay: Duration::ZERO,
            head_delay: Duration::ZERO,
        }
    }

    /// `200` event stream delivered one chunk at a time.
    pub fn event_stream(chunks: &[&str]) -> Self {
        Self {
            status: StatusCode::OK,
            headers: vec![("content-type", "text/event-stream")],
            chunks: chunks.iter().map(|c| Bytes::from(c.to_string())).collect(),
            chunk_delay: Duration::from_millis(10),
            head_delay: Duration::ZERO,
        }
    }

    /// Replace the declared content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: &'static str) -> Self {
        self.headers.retain(|(name, _)| *name != "content-type");
        self.headers.push(("content-type", content_type));
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.push((name, value));
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Delay the response head.
    #[must_use]
    pub fn with_head_delay(mut self, delay: Duration) -> Self {
        self.head_delay = delay;
        self
    }
}

/// A request as the backend saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    /// Decode the capability header, panicking if it is missing or malformed.
    pub fn capability(&self) -> CapabilityHeader {
        let raw = self
            .headers
            .get(CAPABILITY_HEADER)
            .expect("capability header missing")
            .to_str()
            .expect("capability header not ASCII");
        CapabilityHeader::decode(raw).expect("capability header does not decode")
    }
}

/// Mock backend builder.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    replies: HashMap<String, MockReply>,
    fallback: Option<MockReply>,
}

#[derive(Debug)]
struct MockState {
    replies: HashMap<String, MockReply>,
    fallback: MockReply,
    requests: RwLock<Vec<RecordedRequest>>,
    /// Reply bodies dropped before their last chunk was sent
    abandoned: AtomicUsize,
}

/// Counts a reply body as abandoned unless it ran to completion.
struct CompletionGuard {
    state: Arc<MockState>,
    done: bool,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.done {
            self.state.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply for one backend path (e.g. `/process/request/v1/rerank`).
    #[must_use]
    pub fn with_reply(mut self, path: &str, reply: MockReply) -> Self {
        self.replies.insert(path.to_string(), reply);
        self
    }

    /// Reply for every path without its own.
    #[must_use]
    pub fn with_fallback(mut self, reply: MockReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// Start the mock server on an ephemeral port.
    pub async fn start(self) -> MockBackendHandle {
        let state = Arc::new(MockState {
            replies: self.replies,
            fallback: self
                .fallback
                .unwrap_or_else(|| MockReply::json(r#"{"object":"list","data":[]}"#)),
            requests: RwLock::new(Vec::new()),
            abandoned: AtomicUsize::new(0),
        });

        // Chat bodies go up to 5 MB, past axum's default extractor limit
        let app = Router::new()
            .fallback(handle_request)
            .layer(DefaultBodyLimit::disable())
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockBackendHandle {
            addr,
            state,
            _handle: handle,
        }
    }
}

/// Handle to the running mock backend.
pub struct MockBackendHandle {
    addr: SocketAddr,
    state: Arc<MockState>,
    _handle: JoinHandle<()>,
}

impl MockBackendHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL to configure the gateway with.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn request_count(&self) -> usize {
        self.state.requests.read().await.len()
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.read().await.clone()
    }

    /// Reply bodies the server stopped streaming because the peer went away.
    pub fn abandoned_replies(&self) -> usize {
        self.state.abandoned.load(Ordering::SeqCst)
    }

    /// The most recent request for `path`.
    pub async fn last_request_for(&self, path: &str) -> Option<RecordedRequest> {
        self.state
            .requests
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.path == path)
            .cloned()
    }
}

async fn handle_request(
    State(state): State<Arc<MockState>>,
    method: axum::http::Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    state.requests.write().await.push(RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        headers,
        body,
    });

    let reply = state
        .replies
        .get(&path)
        .cloned()
        .unwrap_or_else(|| state.fallback.clone());

    if !reply.head_delay.is_zero() {
        tokio::time::sleep(reply.head_delay).await;
    }

    let delay = reply.chunk_delay;
    let guard = CompletionGuard {
        state: state.clone(),
        done: false,
    };
    let stream = futures_util::stream::unfold(
        (reply.chunks.into_iter(), guard),
        move |(mut chunks, mut guard)| async move {
            let Some(chunk) = chunks.next() else {
                guard.done = true;
                return None;
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Some((Ok::<_, Infallible>(chunk), (chunks, guard)))
        },
    );

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = reply.status;
    for (name, value) in reply.headers {
        response.headers_mut().append(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    response
}
