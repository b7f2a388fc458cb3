//! Static table of public routes and the capability each one maps to.
//!
//! The registry is built once from [`GatewayConfig`] and never mutated, so
//! lookups are pure functions of `(method, path)` and safe to share across
//! every in-flight request.
//!
//! | Route | Capability | Header budget | Round trip | Body cap | Streams |
//! |-------|------------|---------------|------------|----------|---------|
//! | `POST /v1/chat/completions` | chat | 120s | 120s | 5 MB | yes |
//! | `POST /v1/images/generations` | image | 120s | 120s | 1 MB | no |
//! | `POST /v1/embeddings` | embeddings | 30s | 30s | 1 MB | no |
//! | `POST /v1/rerank` | rerank | 30s | 30s | 1 MB | no |
//! | `POST /v1/video/generations` | video | 900s | 30s | 1 MB | no |
//! | `POST /v1/video/generations/status` | video | 30s | 30s | 1 MB | no |

use crate::capability::{CapabilityHeader, CapabilityHeaderError};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use http::Method;
use std::collections::HashMap;
use std::time::Duration;

/// Prefix the backend expects in front of every public path.
pub const BACKEND_PATH_PREFIX: &str = "/process/request";

/// Body ceiling for chat completions (prompts can carry long histories).
pub const CHAT_BODY_LIMIT: usize = 5_000_000;

/// Body ceiling for every other route.
pub const DEFAULT_BODY_LIMIT: usize = 1_000_000;

/// Fixed budget for async job submission and status polling. The backend
/// acknowledges these immediately; the long-running work happens elsewhere.
pub const JOB_ROUND_TRIP_SECS: u64 = 30;

/// The public operations the gateway exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    ChatCompletions,
    ImageGenerations,
    Embeddings,
    Rerank,
    VideoGenerations,
    VideoGenerationStatus,
}

impl RouteKind {
    /// Every routed operation.
    pub const ALL: [RouteKind; 6] = [
        RouteKind::ChatCompletions,
        RouteKind::ImageGenerations,
        RouteKind::Embeddings,
        RouteKind::Rerank,
        RouteKind::VideoGenerations,
        RouteKind::VideoGenerationStatus,
    ];

    /// Public path clients call.
    pub fn public_path(self) -> &'static str {
        match self {
            RouteKind::ChatCompletions => "/v1/chat/completions",
            RouteKind::ImageGenerations => "/v1/images/generations",
            RouteKind::Embeddings => "/v1/embeddings",
            RouteKind::Rerank => "/v1/rerank",
            RouteKind::VideoGenerations => "/v1/video/generations",
            RouteKind::VideoGenerationStatus => "/v1/video/generations/status",
        }
    }

    /// Short stable name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            RouteKind::ChatCompletions => "chat_completions",
            RouteKind::ImageGenerations => "image_generations",
            RouteKind::Embeddings => "embeddings",
            RouteKind::Rerank => "rerank",
            RouteKind::VideoGenerations => "video_generations",
            RouteKind::VideoGenerationStatus => "video_generation_status",
        }
    }
}

impl std::fmt::Display for RouteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the dispatcher needs to forward one public route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDescriptor {
    pub kind: RouteKind,
    pub method: Method,
    pub inbound_path: &'static str,
    /// Path on the backend, relative to its base URL
    pub backend_path: String,
    pub capability_name: String,
    /// Budget advertised to the backend in the capability header
    pub timeout_seconds: u64,
    /// Deadline for the whole round trip, response draining included
    pub round_trip: Duration,
    pub max_body_bytes: usize,
    /// Whether the reply may be a live event stream
    pub streaming: bool,
}

impl RouteDescriptor {
    fn new(
        kind: RouteKind,
        capability_name: &str,
        timeout_seconds: u64,
        round_trip_secs: u64,
        max_body_bytes: usize,
        streaming: bool,
    ) -> Self {
        Self {
            kind,
            method: Method::POST,
            inbound_path: kind.public_path(),
            backend_path: format!("{}{}", BACKEND_PATH_PREFIX, kind.public_path()),
            capability_name: capability_name.to_string(),
            timeout_seconds,
            round_trip: Duration::from_secs(round_trip_secs),
            max_body_bytes,
            streaming,
        }
    }

    /// Capability descriptor for this route.
    pub fn capability_header(&self) -> Result<CapabilityHeader, CapabilityHeaderError> {
        CapabilityHeader::new(&self.capability_name, self.timeout_seconds)
    }
}

/// Immutable lookup table from public path to [`RouteDescriptor`].
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    routes: HashMap<&'static str, RouteDescriptor>,
}

impl CapabilityRegistry {
    /// Build the route table from configuration.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let names = &config.capabilities;
        let t = &config.timeouts;

        let descriptors = [
            RouteDescriptor::new(
                RouteKind::ChatCompletions,
                &names.chat_completions,
                t.chat_completions,
                t.chat_completions,
                CHAT_BODY_LIMIT,
                true,
            ),
            RouteDescriptor::new(
                RouteKind::ImageGenerations,
                &names.image_generation,
                t.image_generation,
                t.image_generation,
                DEFAULT_BODY_LIMIT,
                false,
            ),
            RouteDescriptor::new(
                RouteKind::Embeddings,
                &names.text_embeddings,
                t.text_embeddings,
                t.text_embeddings,
                DEFAULT_BODY_LIMIT,
                false,
            ),
            RouteDescriptor::new(
                RouteKind::Rerank,
                &names.rerank,
                t.rerank,
                t.rerank,
                DEFAULT_BODY_LIMIT,
                false,
            ),
            RouteDescriptor::new(
                RouteKind::VideoGenerations,
                &names.video_generation,
                t.video_generation,
                JOB_ROUND_TRIP_SECS,
                DEFAULT_BODY_LIMIT,
                false,
            ),
            RouteDescriptor::new(
                RouteKind::VideoGenerationStatus,
                &names.video_generation,
                JOB_ROUND_TRIP_SECS,
                JOB_ROUND_TRIP_SECS,
                DEFAULT_BODY_LIMIT,
                false,
            ),
        ];

        Self {
            routes: descriptors
                .into_iter()
                .map(|d| (d.inbound_path, d))
                .collect(),
        }
    }

    /// Resolve a request to its route.
    ///
    /// # Errors
    ///
    /// - `GatewayError::NotFound` if no route owns `path`
    /// - `GatewayError::MethodNotAllowed` if the route exists under another method
    pub fn lookup(&self, method: &Method, path: &str) -> GatewayResult<&RouteDescriptor> {
        let route = self.routes.get(path).ok_or(GatewayError::NotFound)?;
        if route.method != *method {
            return Err(GatewayError::MethodNotAllowed);
        }
        Ok(route)
    }

    /// Descriptor for a given operation.
    pub fn get(&self, kind: RouteKind) -> Option<&RouteDescriptor> {
        self.routes.get(kind.public_path())
    }

    /// Iterate over all routes in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = &RouteDescriptor> {
        RouteKind::ALL.into_iter().filter_map(|kind| self.get(kind))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
