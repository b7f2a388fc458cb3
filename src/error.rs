//! Error types for the capgate request path.
//!
//! Every failure is scoped to one request. Client-input errors are raised
//! before any backend contact; everything that goes wrong after that point
//! surfaces as `502 Bad Gateway`.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode, header};
use thiserror::Error;

/// Errors that can occur while translating and forwarding a request.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No route is registered for the path (404)
    #[error("not found")]
    NotFound,

    /// The path is known but the method is not (405)
    #[error("method not allowed")]
    MethodNotAllowed,

    /// The inbound body exceeded the route's size ceiling (400)
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// The inbound body could not be read (400)
    #[error("failed to read request body: {0}")]
    BodyRead(String),

    /// The outbound request could not be built (502)
    #[error("failed to create gateway request: {0}")]
    Transform(String),

    /// The backend could not be reached or dropped the exchange (502)
    #[error("gateway request failed: {0}")]
    BackendUnreachable(String),

    /// The round-trip budget elapsed before the backend answered (502)
    #[error("gateway request timed out: {0}")]
    BackendTimeout(String),
}

impl GatewayError {
    /// HTTP status the gateway answers with for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::BodyTooLarge { .. } | GatewayError::BodyRead(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Transform(_)
            | GatewayError::BackendUnreachable(_)
            | GatewayError::BackendTimeout(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short classification used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NotFound | GatewayError::MethodNotAllowed => "route-error",
            GatewayError::BodyTooLarge { .. } | GatewayError::BodyRead(_) => "read-error",
            GatewayError::Transform(_) => "transform-error",
            GatewayError::BackendUnreachable(_) => "backend-unreachable",
            GatewayError::BackendTimeout(_) => "backend-timeout",
        }
    }

    /// Convert error to a plain-text HTTP response.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let status = self.status();
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
            .body(Full::new(Bytes::from(format!("{}\n", self))))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(Full::new(Bytes::from("internal server error\n")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
