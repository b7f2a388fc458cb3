//! capgate - protocol-translation gateway for a capability-routed compute
//! backend.
//!
//! Clients speak the public inference dialect (chat completions, images,
//! embeddings, rerank, video jobs). The backend only understands generic
//! job requests tagged with a capability descriptor. capgate sits between
//! the two:
//!
//! - **Inbound:** each public route maps to one capability; the request
//!   body is forwarded unchanged with the descriptor attached
//!   ([`transform`], [`capability`]).
//! - **Outbound:** backend bookkeeping is stripped from replies, content
//!   types are corrected ([`sanitize`]), and backend-internal events are
//!   filtered out of chat completion streams ([`sse_filter`]).
//!
//! [`gateway_service::GatewayService`] ties the stages together for every
//! route in the [`registry`].

pub mod capability;
pub mod config;
pub mod error;
pub mod gateway_service;
pub mod logging_layer;
pub mod registry;
pub mod sanitize;
pub mod sse_filter;
pub mod timeout;
pub mod transform;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use gateway_service::GatewayService;
