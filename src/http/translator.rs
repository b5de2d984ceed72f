//! Mapping of handler conditions onto envelope content.
//!
//! # Precedence (first match wins)
//! 1. Early finish: the envelope goes out as it stands
//! 2. Missing session id: code 11000
//! 3. Invalid session id: code 12000
//! 4. HTTP error: status and reason (canonical reason when none given)
//! 5. Anything else: logged in full, generic 500 for the caller
//!
//! Illegal-state violations are handed back untouched.

use axum::http::StatusCode;
use serde_json::Value;

use crate::config::SessionConfig;
use crate::envelope::ResponseEnvelope;
use crate::error::HandlerError;
use crate::observability::metrics;
use crate::session::SessionError;

/// Envelope code for a request that carried no session id.
pub const MISSING_SESSION_ID: i64 = 11000;

/// Envelope code for a session id the backend does not know.
pub const INVALID_SESSION_ID: i64 = 12000;

const GENERIC_REASON: &str = "Internal Server Error";

/// Why the coordinator is not completing the request normally.
#[derive(Debug)]
pub enum Condition {
    EarlyFinish,
    Fault(HandlerError),
}

impl From<HandlerError> for Condition {
    fn from(err: HandlerError) -> Self {
        Condition::Fault(err)
    }
}

/// What [`translate`] did to the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// Envelope left as the handler built it.
    Passthrough,
    /// Session-identity failure written with an application code.
    SessionFailure(i64),
    /// HTTP failure written with this status.
    HttpFailure(u16),
    /// Generic 500 written; the detail only went to the log.
    InternalFailure,
    /// The envelope had already finished; the fault was only logged.
    AlreadyFinished,
    /// The client is gone; nothing can be sent.
    Disconnected,
}

/// Normalize the envelope after a handler did not return `Continue`.
pub fn translate(
    condition: Condition,
    envelope: &mut ResponseEnvelope,
    session: &SessionConfig,
) -> Result<Translation, HandlerError> {
    let err = match condition {
        Condition::EarlyFinish => return Ok(Translation::Passthrough),
        Condition::Fault(err) => err,
    };

    if err.is_illegal_state() {
        return Err(err);
    }
    if err.is_connection_closed() {
        return Ok(Translation::Disconnected);
    }

    metrics::record_envelope_fault(err.kind());

    if envelope.is_finished() {
        tracing::error!(error = %err, "Handler failed after the response finished");
        return Ok(Translation::AlreadyFinished);
    }

    match err {
        HandlerError::Session(SessionError::MissingSessionId { .. }) => {
            let message = format!("missing {}", session.session_id_name);
            begin_error(envelope, StatusCode::OK)?;
            envelope.failure(MISSING_SESSION_ID, message, Value::Null)?;
            Ok(Translation::SessionFailure(MISSING_SESSION_ID))
        }
        HandlerError::Session(SessionError::InvalidSessionId { .. }) => {
            let message = format!("invalid {}", session.session_id_name);
            begin_error(envelope, StatusCode::OK)?;
            envelope.failure(INVALID_SESSION_ID, message, Value::Null)?;
            Ok(Translation::SessionFailure(INVALID_SESSION_ID))
        }
        HandlerError::Http { status, reason } => {
            let known = StatusCode::from_u16(status)
                .ok()
                .filter(|s| reason.is_some() || s.canonical_reason().is_some());
            match known {
                Some(code) => {
                    tracing::debug!(status, reason = ?reason, "Handler raised HTTP error");
                    let message = reason
                        .or_else(|| code.canonical_reason().map(str::to_owned))
                        .unwrap_or_default();
                    begin_error(envelope, code)?;
                    envelope.failure(i64::from(status), message, Value::Null)?;
                    Ok(Translation::HttpFailure(status))
                }
                None => {
                    tracing::error!(status, "Bad HTTP status code");
                    internal_failure(envelope)
                }
            }
        }
        other => {
            tracing::error!(error = %other, detail = ?other, kind = other.kind(), "Uncaught handler fault");
            internal_failure(envelope)
        }
    }
}

fn internal_failure(envelope: &mut ResponseEnvelope) -> Result<Translation, HandlerError> {
    begin_error(envelope, StatusCode::INTERNAL_SERVER_ERROR)?;
    envelope.failure(500, GENERIC_REASON, Value::Null)?;
    Ok(Translation::InternalFailure)
}

/// Discard partial output and adopt the error status, if the head is
/// still ours to change.
fn begin_error(envelope: &mut ResponseEnvelope, status: StatusCode) -> Result<(), HandlerError> {
    if !envelope.headers_written() {
        envelope.clear()?;
        envelope.set_status(status, None)?;
    }
    Ok(())
}
