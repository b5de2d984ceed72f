//! Errors a request handler can raise.

use crate::envelope::EnvelopeError;
use crate::session::SessionError;

/// Anything that can stop a handler from returning normally.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Deliberate HTTP-level refusal, e.g. a 400 for a missing argument.
    #[error("HTTP {status}{}", reason_suffix(.reason))]
    Http { status: u16, reason: Option<String> },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn http(status: u16) -> Self {
        HandlerError::Http {
            status,
            reason: None,
        }
    }

    pub fn http_with_reason(status: u16, reason: impl Into<String>) -> Self {
        HandlerError::Http {
            status,
            reason: Some(reason.into()),
        }
    }

    /// Contract violations of the session or envelope state machines.
    pub fn is_illegal_state(&self) -> bool {
        matches!(
            self,
            HandlerError::Session(SessionError::IllegalState(_))
                | HandlerError::Envelope(EnvelopeError::IllegalState(_))
        )
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, HandlerError::Envelope(EnvelopeError::ConnectionClosed))
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Session(SessionError::MissingSessionId { .. }) => "missing_session_id",
            HandlerError::Session(SessionError::InvalidSessionId { .. }) => "invalid_session_id",
            HandlerError::Session(SessionError::Serialization(_)) => "serialization",
            HandlerError::Session(SessionError::IllegalState(_)) => "illegal_state",
            HandlerError::Session(SessionError::BackendUnavailable(_)) => "backend_unavailable",
            HandlerError::Envelope(EnvelopeError::IllegalState(_)) => "illegal_state",
            HandlerError::Envelope(EnvelopeError::ConnectionClosed) => "connection_closed",
            HandlerError::Envelope(_) => "envelope",
            HandlerError::Http { .. } => "http",
            HandlerError::Internal(_) => "internal",
        }
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}

/// Result type of handler methods.
pub type HandlerResult = Result<crate::http::handler::Outcome, HandlerError>;
