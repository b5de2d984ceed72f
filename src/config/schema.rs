//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML. Every
//! section is optional; missing fields fall back to their defaults.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Session identity and expiry.
    pub session: SessionConfig,

    /// In-memory cache maintenance.
    pub cache: CacheConfig,

    /// Headers stamped on every envelope.
    pub response: ResponseConfig,

    /// Request size limits.
    pub limits: LimitsConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Seed records for the in-memory user directory.
    pub users: Vec<UserSeed>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Session settings shared by every request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cookie, query parameter and body field carrying the session id.
    pub session_id_name: String,

    /// TTL applied on every save and renewal.
    pub expire_seconds: u64,

    /// Prefix joined to the session id to form the cache key.
    pub key_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id_name: "token".to_string(),
            expire_seconds: 3600,
            key_prefix: "session-".to_string(),
        }
    }
}

/// In-memory cache backend settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds between sweeps of expired entries.
    pub reap_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reap_interval_secs: 60,
        }
    }
}

/// Response settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResponseConfig {
    /// Added to every header block after Content-Type and Date.
    pub default_headers: BTreeMap<String, String>,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        let default_headers = [
            ("Access-Control-Allow-Origin", "*"),
            ("Access-Control-Allow-Headers", "x-requested-with"),
            ("Access-Control-Allow-Methods", "POST,GET,PUT,DELETE"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self { default_headers }
    }
}

/// Request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted request body in bytes.
    pub max_body_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human-readable or JSON log lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// A user known to the in-memory directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserSeed {
    pub id: i64,
    pub username: String,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub regions: Vec<String>,

    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_active() -> bool {
    true
}
