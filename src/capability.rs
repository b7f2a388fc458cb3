//! The capability descriptor carried to the backend in a single header.
//!
//! The backend only accepts requests tagged with a base64-encoded JSON
//! object naming the capability to run. All routes build and encode that
//! object through [`CapabilityHeader`], so the wire shape lives in one place.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use http::HeaderValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the transport header carrying the encoded descriptor. Sent on
/// the wire in title case (`Livepeer`).
pub const CAPABILITY_HEADER: &str = "livepeer";

/// Errors raised while encoding or decoding a capability header.
#[derive(Error, Debug)]
pub enum CapabilityHeaderError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid header value: {0}")]
    HeaderValue(#[from] http::header::InvalidHeaderValue),
}

/// Capability descriptor attached to every outbound request.
///
/// `request` and `parameters` are themselves JSON documents serialized to
/// strings; the backend decodes them in a second pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityHeader {
    /// `{"run": <capability>}` as a JSON string
    pub request: String,
    /// Orchestrator selection as a JSON string
    pub parameters: String,
    /// Capability name; always equal to the `run` value inside `request`
    pub capability: String,
    /// Budget the backend may spend on the job
    pub timeout_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunRequest<'a> {
    #[serde(borrow)]
    run: std::borrow::Cow<'a, str>,
}

#[derive(Debug, Default, Serialize)]
struct OrchestratorParameters {
    orchestrators: OrchestratorSelection,
}

#[derive(Debug, Default, Serialize)]
struct OrchestratorSelection {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl CapabilityHeader {
    /// Build the descriptor for `capability` with no orchestrator preference.
    pub fn new(capability: &str, timeout_seconds: u64) -> Result<Self, CapabilityHeaderError> {
        let request = serde_json::to_string(&RunRequest {
            run: capability.into(),
        })?;
        let parameters = serde_json::to_string(&OrchestratorParameters::default())?;

        Ok(Self {
            request,
            parameters,
            capability: capability.to_string(),
            timeout_seconds,
        })
    }

    /// Serialize to JSON and base64-encode.
    pub fn encode(&self) -> Result<String, CapabilityHeaderError> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64.encode(json))
    }

    /// Encode into a value ready to attach under [`CAPABILITY_HEADER`].
    pub fn to_header_value(&self) -> Result<HeaderValue, CapabilityHeaderError> {
        Ok(HeaderValue::from_str(&self.encode()?)?)
    }

    /// Decode a header value produced by [`encode`](Self::encode).
    pub fn decode(encoded: &str) -> Result<Self, CapabilityHeaderError> {
        let json = BASE64.decode(encoded.trim())?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// The capability named inside the nested `request` document.
    pub fn run_target(&self) -> Option<String> {
        serde_json::from_str::<RunRequest<'_>>(&self.request)
            .ok()
            .map(|r| r.run.into_owned())
    }

    /// JSON form of the descriptor, for logging.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
