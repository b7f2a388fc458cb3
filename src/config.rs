//! Centralized configuration for the capgate gateway.
//!
//! The configuration is read once at startup, validated, and then shared
//! read-only with the dispatcher and the backend client. Request-handling
//! code never consults the process environment.
//!
//! # Environment Variables
//!
//! | Variable | Default |
//! |----------|---------|
//! | `PROXY_ADDR` | `:8090` |
//! | `GATEWAY_URL` | `http://gateway:9935` |
//! | `CHAT_COMPLETIONS_CAPABILITY` | `openai-chat-completions` |
//! | `IMAGE_GENERATION_CAPABILITY` | `openai-image-generation` |
//! | `TEXT_EMBEDDINGS_CAPABILITY` | `openai-text-embeddings` |
//! | `RERANK_CAPABILITY` | `cohere-rerank` |
//! | `VIDEO_GENERATION_CAPABILITY` | `video-generation` |
//! | `CHAT_COMPLETIONS_TIMEOUT_SECONDS` | `120` |
//! | `IMAGE_GENERATION_TIMEOUT_SECONDS` | `120` |
//! | `TEXT_EMBEDDINGS_TIMEOUT_SECONDS` | `30` |
//! | `RERANK_TIMEOUT_SECONDS` | `30` |
//! | `VIDEO_GENERATION_TIMEOUT_SECONDS` | `900` |

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The listen address is neither `host:port` nor `:port`.
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidListenAddr { addr: String, reason: String },

    /// The backend URL is not an absolute http(s) URL.
    #[error("invalid backend URL '{url}': {reason}")]
    InvalidBackendUrl { url: String, reason: String },

    /// A capability name is empty.
    #[error("capability name for {route} must not be empty")]
    EmptyCapability { route: &'static str },

    /// A timeout is zero.
    #[error("timeout for {route} must be greater than zero")]
    ZeroTimeout { route: &'static str },

    /// A timeout is beyond what any job could sensibly be given.
    #[error("timeout for {route} must be at most {max} seconds")]
    TimeoutTooLarge { route: &'static str, max: u64 },
}

/// Largest per-capability timeout accepted, in seconds (one day).
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Capability names the backend routes on, one per public operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityNames {
    pub chat_completions: String,
    pub image_generation: String,
    pub text_embeddings: String,
    pub rerank: String,
    /// Shared by video job submission and status polling
    pub video_generation: String,
}

impl Default for CapabilityNames {
    fn default() -> Self {
        Self {
            chat_completions: "openai-chat-completions".to_string(),
            image_generation: "openai-image-generation".to_string(),
            text_embeddings: "openai-text-embeddings".to_string(),
            rerank: "cohere-rerank".to_string(),
            video_generation: "video-generation".to_string(),
        }
    }
}

/// Per-capability timeout budgets, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTimeouts {
    pub chat_completions: u64,
    pub image_generation: u64,
    pub text_embeddings: u64,
    pub rerank: u64,
    /// Budget advertised to the backend for video jobs. The submission
    /// round trip itself is capped separately (see `registry`).
    pub video_generation: u64,
}

impl Default for RouteTimeouts {
    fn default() -> Self {
        Self {
            chat_completions: 120,
            image_generation: 120,
            text_embeddings: 30,
            rerank: 30,
            video_generation: 900,
        }
    }
}

/// Connection pool and socket settings for the backend client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendClientConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// TCP keepalive interval on backend connections
    pub tcp_keepalive: Duration,
    /// Enable TCP_NODELAY on backend connections
    pub tcp_nodelay: bool,
    /// Maximum idle connections kept in the pool
    pub pool_max_idle_per_host: usize,
    /// How long an idle pooled connection is kept
    pub pool_idle_timeout: Duration,
}

impl Default for BackendClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            tcp_keepalive: Duration::from_secs(30),
            tcp_nodelay: true,
            pool_max_idle_per_host: 200,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Runtime configuration for the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    // ─────────────────────────────────────────────────────────────────────────
    // Listener
    // ─────────────────────────────────────────────────────────────────────────
    /// Listen address, `host:port` or `:port`
    pub listen_addr: String,

    /// Time allowed for a client to send the request head
    pub header_read_timeout: Duration,

    /// Enable TCP_NODELAY on accepted connections
    pub tcp_nodelay: bool,

    /// TCP keepalive interval on accepted connections
    pub tcp_keepalive: Duration,

    // ─────────────────────────────────────────────────────────────────────────
    // Backend
    // ─────────────────────────────────────────────────────────────────────────
    /// Base URL of the capability-matching backend
    pub backend_url: String,

    /// Backend client pool settings
    pub backend: BackendClientConfig,

    // ─────────────────────────────────────────────────────────────────────────
    // Routes
    // ─────────────────────────────────────────────────────────────────────────
    pub capabilities: CapabilityNames,

    pub timeouts: RouteTimeouts,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: ":8090".to_string(),
            header_read_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            tcp_keepalive: Duration::from_secs(30),
            backend_url: "http://gateway:9935".to_string(),
            backend: BackendClientConfig::default(),
            capabilities: CapabilityNames::default(),
            timeouts: RouteTimeouts::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// Unset or empty variables fall back to the default silently; numeric
    /// variables that fail to parse log a warning and fall back as well.
    pub fn from_env() -> Self {
        let default = Self::default();
        let names = default.capabilities.clone();
        let timeouts = default.timeouts;

        Self {
            listen_addr: env_string("PROXY_ADDR", default.listen_addr),
            backend_url: env_string("GATEWAY_URL", default.backend_url),

            capabilities: CapabilityNames {
                chat_completions: env_string(
                    "CHAT_COMPLETIONS_CAPABILITY",
                    names.chat_completions,
                ),
                image_generation: env_string(
                    "IMAGE_GENERATION_CAPABILITY",
                    names.image_generation,
                ),
                text_embeddings: env_string("TEXT_EMBEDDINGS_CAPABILITY", names.text_embeddings),
                rerank: env_string("RERANK_CAPABILITY", names.rerank),
                video_generation: env_string(
                    "VIDEO_GENERATION_CAPABILITY",
                    names.video_generation,
                ),
            },

            timeouts: RouteTimeouts {
                chat_completions: parse_env_warn(
                    "CHAT_COMPLETIONS_TIMEOUT_SECONDS",
                    timeouts.chat_completions,
                ),
                image_generation: parse_env_warn(
                    "IMAGE_GENERATION_TIMEOUT_SECONDS",
                    timeouts.image_generation,
                ),
                text_embeddings: parse_env_warn(
                    "TEXT_EMBEDDINGS_TIMEOUT_SECONDS",
                    timeouts.text_embeddings,
                ),
                rerank: parse_env_warn("RERANK_TIMEOUT_SECONDS", timeouts.rerank),
                video_generation: parse_env_warn(
                    "VIDEO_GENERATION_TIMEOUT_SECONDS",
                    timeouts.video_generation,
                ),
            },

            ..default
        }
    }

    /// Backend base URL without a trailing slash.
    pub fn backend_base_url(&self) -> &str {
        self.backend_url.trim_end_matches('/')
    }

    /// Resolve the listen address. A bare `:port` binds all interfaces.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = self.listen_addr.trim();
        let candidate = if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        };

        candidate
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidListenAddr {
                addr: self.listen_addr.clone(),
                reason: e.to_string(),
            })
    }

    /// Check the configuration before the gateway starts serving.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_socket_addr()?;

        let url = self.backend_base_url();
        let uri: http::Uri = url.parse().map_err(|e: http::uri::InvalidUri| {
            ConfigError::InvalidBackendUrl {
                url: self.backend_url.clone(),
                reason: e.to_string(),
            }
        })?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => {
                return Err(ConfigError::InvalidBackendUrl {
                    url: self.backend_url.clone(),
                    reason: "scheme must be http or https".to_string(),
                });
            }
        }
        if uri.host().is_none() {
            return Err(ConfigError::InvalidBackendUrl {
                url: self.backend_url.clone(),
                reason: "missing host".to_string(),
            });
        }

        let names = &self.capabilities;
        for (route, name) in [
            ("chat completions", &names.chat_completions),
            ("image generation", &names.image_generation),
            ("embeddings", &names.text_embeddings),
            ("rerank", &names.rerank),
            ("video generation", &names.video_generation),
        ] {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyCapability { route });
            }
        }

        let t = &self.timeouts;
        for (route, secs) in [
            ("chat completions", t.chat_completions),
            ("image generation", t.image_generation),
            ("embeddings", t.text_embeddings),
            ("rerank", t.rerank),
            ("video generation", t.video_generation),
        ] {
            if secs == 0 {
                return Err(ConfigError::ZeroTimeout { route });
            }
            if secs > MAX_TIMEOUT_SECS {
                return Err(ConfigError::TimeoutTooLarge {
                    route,
                    max: MAX_TIMEOUT_SECS,
                });
            }
        }

        Ok(())
    }
}

/// Read a string environment variable, treating empty as unset.
fn env_string(name: &str, default: String) -> String {
    match std::env::var(name) {
        Ok(val) if !val.trim().is_empty() => val,
        _ => default,
    }
}

/// Parse an environment variable with a warning on invalid values.
///
/// If the env var is set but cannot be parsed, logs a warning and returns the default.
/// If the env var is not set, returns the default silently.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) if val.trim().is_empty() => default,
        Ok(val) => match val.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_VARS: &[&str] = &[
        "PROXY_ADDR",
        "GATEWAY_URL",
        "CHAT_COMPLETIONS_CAPABILITY",
        "RERANK_CAPABILITY",
        "CHAT_COMPLETIONS_TIMEOUT_SECONDS",
        "RERANK_TIMEOUT_SECONDS",
        "VIDEO_GENERATION_TIMEOUT_SECONDS",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();

        assert_eq!(config.listen_addr, ":8090");
        assert_eq!(config.backend_url, "http://gateway:9935");
        assert_eq!(config.capabilities.chat_completions, "openai-chat-completions");
        assert_eq!(config.capabilities.rerank, "cohere-rerank");
        assert_eq!(config.timeouts.chat_completions, 120);
        assert_eq!(config.timeouts.text_embeddings, 30);
        assert_eq!(config.timeouts.video_generation, 900);
        assert_eq!(config.backend.pool_max_idle_per_host, 200);
        assert_eq!(config.backend.connect_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial_test::serial]
    fn test_config_env_loading() {
        clear_env();
        unsafe {
            std::env::set_var("PROXY_ADDR", "127.0.0.1:9000");
            std::env::set_var("GATEWAY_URL", "http://backend:1234/");
            std::env::set_var("CHAT_COMPLETIONS_CAPABILITY", "llm-fast");
            std::env::set_var("RERANK_TIMEOUT_SECONDS", "45");
        }

        let config = GatewayConfig::from_env();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.backend_base_url(), "http://backend:1234");
        assert_eq!(config.capabilities.chat_completions, "llm-fast");
        assert_eq!(config.capabilities.rerank, "cohere-rerank");
        assert_eq!(config.timeouts.rerank, 45);
        assert_eq!(config.timeouts.chat_completions, 120);

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_invalid_and_empty_values_fall_back() {
        clear_env();
        unsafe {
            std::env::set_var("CHAT_COMPLETIONS_TIMEOUT_SECONDS", "two minutes");
            std::env::set_var("VIDEO_GENERATION_TIMEOUT_SECONDS", "-5");
            std::env::set_var("RERANK_CAPABILITY", "");
        }

        let config = GatewayConfig::from_env();
        assert_eq!(config.timeouts.chat_completions, 120);
        assert_eq!(config.timeouts.video_generation, 900);
        assert_eq!(config.capabilities.rerank, "cohere-rerank");

        clear_env();
    }

    #[test]
    fn test_listen_addr_forms() {
        let mut config = GatewayConfig::default();
        assert_eq!(
            config.listen_socket_addr().unwrap(),
            "0.0.0.0:8090".parse::<SocketAddr>().unwrap()
        );

        config.listen_addr = "127.0.0.1:7000".to_string();
        assert_eq!(config.listen_socket_addr().unwrap().port(), 7000);

        config.listen_addr = "nowhere".to_string();
        assert!(matches!(
            config.listen_socket_addr(),
            Err(ConfigError::InvalidListenAddr { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = GatewayConfig {
            backend_url: "gateway:9935".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBackendUrl { .. })
        ));

        let mut config = GatewayConfig::default();
        config.capabilities.rerank = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyCapability { route: "rerank" })
        ));

        let mut config = GatewayConfig::default();
        config.timeouts.image_generation = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroTimeout { .. })
        ));

        let mut config = GatewayConfig::default();
        config.timeouts.rerank = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimeoutTooLarge {
                route: "rerank",
                max: MAX_TIMEOUT_SECS
            })
        ));

        let mut config = GatewayConfig::default();
        config.timeouts.video_generation = MAX_TIMEOUT_SECS;
        assert!(config.validate().is_ok());
    }
}
