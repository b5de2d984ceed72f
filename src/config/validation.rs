//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (TTLs > 0, addresses parse)
//! - Check header names and values are transmittable
//! - Detect duplicate user seeds
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use axum::http::{HeaderName, HeaderValue};

use crate::config::schema::GatewayConfig;

/// Longest TTL or interval accepted, in seconds (ten years).
pub const MAX_SECONDS: u64 = 86_400 * 365 * 10;

/// One semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    let session = &config.session;
    if session.session_id_name.trim().is_empty() {
        errors.push(ValidationError::new("session.session_id_name", "must not be empty"));
    }
    check_seconds(&mut errors, "session.expire_seconds", session.expire_seconds);
    check_seconds(&mut errors, "cache.reap_interval_secs", config.cache.reap_interval_secs);
    if config.limits.max_body_size == 0 {
        errors.push(ValidationError::new("limits.max_body_size", "must be greater than 0"));
    }
    check_seconds(&mut errors, "timeouts.request_secs", config.timeouts.request_secs);

    for (name, value) in &config.response.default_headers {
        let field = format!("response.default_headers.{name}");
        if HeaderName::try_from(name.as_str()).is_err() {
            errors.push(ValidationError::new(field, "invalid header name"));
        } else if HeaderValue::try_from(value.as_str()).is_err() {
            errors.push(ValidationError::new(field, "invalid header value"));
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for user in &config.users {
        if !ids.insert(user.id) {
            errors.push(ValidationError::new("users", format!("duplicate id {}", user.id)));
        }
        if !names.insert(user.username.as_str()) {
            errors.push(ValidationError::new(
                "users",
                format!("duplicate username '{}'", user.username),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_seconds(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::new(field, "must be greater than 0"));
    } else if value > MAX_SECONDS {
        errors.push(ValidationError::new(field, format!("must be at most {MAX_SECONDS}")));
    }
}
