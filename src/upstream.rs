//! Backend client with connection pooling.
//!
//! One client is built at startup and shared by every request. It talks to
//! exactly one configured backend and never retries: a failed attempt is
//! surfaced immediately, because job submission on the backend is not
//! guaranteed to be idempotent.
//!
//! # Error Classification
//!
//! - Deadline elapsed or connect timeout → `GatewayError::BackendTimeout`
//! - Anything else (refused, reset, closed early) → `GatewayError::BackendUnreachable`

use crate::config::BackendClientConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::timeout::Deadline;
use bytes::Bytes;
use http::Uri;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

/// Body type of requests sent to the backend. Bodies are fully read before
/// forwarding, so the client always knows the exact length.
pub type OutboundBody = Full<Bytes>;

/// Pooled HTTP(S) client bound to a single backend.
#[derive(Clone)]
pub struct BackendClient {
    client: Client<HttpsConnector<HttpConnector>, OutboundBody>,
    base_url: String,
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl BackendClient {
    /// Create a new backend client.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Transform` if the TLS crypto provider cannot be
    /// installed.
    pub fn new(base_url: &str, config: &BackendClientConfig) -> GatewayResult<Self> {
        // Install default crypto provider for rustls exactly once per process.
        static RUSTLS_INIT: std::sync::OnceLock<Result<(), ()>> = std::sync::OnceLock::new();
        let init_result = RUSTLS_INIT.get_or_init(|| {
            // Already installed by someone else is fine too
            let _ = rustls::crypto::ring::default_provider().install_default();
            match rustls::crypto::CryptoProvider::get_default() {
                Some(_) => Ok(()),
                None => Err(()),
            }
        });
        if init_result.is_err() {
            return Err(GatewayError::Transform(
                "Failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_nodelay(config.tcp_nodelay);
        http_connector.set_connect_timeout(Some(config.connect_timeout));
        http_connector.set_keepalive(Some(config.tcp_keepalive));

        // Plain-http backends must keep working on hosts without a CA bundle
        let https_connector = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                warn!(error = %e, "No native TLS roots found; https backends will fail verification");
                let tls = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                HttpsConnectorBuilder::new().with_tls_config(tls)
            }
        }
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

        // retry_canceled_requests would silently replay a request on a fresh
        // connection when a pooled one turns out to be dead.
        let client = Client::builder(TokioExecutor::new())
            .retry_canceled_requests(false)
            .http1_title_case_headers(true)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .build(https_connector);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Backend base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute backend URI for a route's backend path.
    pub fn target_uri(&self, backend_path: &str) -> GatewayResult<Uri> {
        let full_uri = format!("{}{}", self.base_url, backend_path);
        full_uri.parse().map_err(|e| {
            GatewayError::Transform(format!("Failed to parse backend URI {}: {}", full_uri, e))
        })
    }

    /// Send one request and wait for the response head.
    ///
    /// The wait is bounded by `deadline`; the response body is returned
    /// unbounded and must be wrapped by the caller (see `DeadlineBody`).
    pub async fn execute(
        &self,
        request: Request<OutboundBody>,
        deadline: Deadline,
    ) -> GatewayResult<Response<Incoming>> {
        let uri = request.uri().clone();
        debug!(target = %uri, "Sending request to backend");

        match tokio::time::timeout_at(deadline.at(), self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(map_client_error(e)),
            Err(_elapsed) => {
                warn!(
                    target = %uri,
                    budget_secs = deadline.budget().as_secs(),
                    "Backend did not respond within the round trip budget"
                );
                Err(GatewayError::BackendTimeout(format!(
                    "no response within {}s",
                    deadline.budget().as_secs()
                )))
            }
        }
    }
}

/// Map hyper_util client errors to gateway errors.
fn map_client_error(e: hyper_util::client::legacy::Error) -> GatewayError {
    let detail = error_chain(&e);
    let lower = detail.to_lowercase();

    if e.is_connect() && (lower.contains("timed out") || lower.contains("timeout")) {
        warn!(error = %detail, "Backend connect timeout");
        return GatewayError::BackendTimeout(detail);
    }

    warn!(error = %detail, connect = e.is_connect(), "Backend request failed");
    GatewayError::BackendUnreachable(detail)
}

/// Flatten an error and its sources into one line.
fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = inner.source();
    }
    out
}
