//! Buffered JSON response protocol.
//!
//! # Data Flow
//! ```text
//! handler
//!     → write / success / failure (mutate the pending buffer)
//!     → flush (serialize buffer → head + body once, then body chunks)
//!     → finish (Content-Length, final flush, terminal)
//!     → transport.rs (ChannelTransport → hyper body, MemoryTransport in tests)
//! ```
//!
//! # States
//! `Open → HeadersWritten → Finished`. Finishing an untouched envelope still
//! passes through one header write.
//!
//! # Wire Format
//! `{"code": int, "message": string, "data": object, "token"?: string}`,
//! keys serialized in insertion order.

pub mod response;
pub mod transport;

use serde_json::{Map, Value};

pub use response::ResponseEnvelope;
pub use transport::{ChannelTransport, Frame, MemoryTransport, ResponseHead, ResponseReceiver, Transport};

/// Key under which stray non-mapping writes accumulate.
pub const DIAGNOSTIC_KEY: &str = "detail";

/// Lifecycle position of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    Open,
    HeadersWritten,
    Finished,
}

/// Failures of the response protocol.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The envelope was driven out of its state sequence.
    #[error("illegal envelope state: {0}")]
    IllegalState(&'static str),

    /// The client went away before the response completed.
    #[error("connection closed before the response finished")]
    ConnectionClosed,

    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

/// A piece of output handed to [`ResponseEnvelope::write`].
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Keys merged into the buffer, later writes winning.
    Fields(Map<String, Value>),
    /// Incidental text appended under [`DIAGNOSTIC_KEY`].
    Text(String),
}

impl From<Map<String, Value>> for Fragment {
    fn from(fields: Map<String, Value>) -> Self {
        Fragment::Fields(fields)
    }
}

impl From<Value> for Fragment {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(fields) => Fragment::Fields(fields),
            Value::String(text) => Fragment::Text(text),
            other => Fragment::Text(other.to_string()),
        }
    }
}

impl From<String> for Fragment {
    fn from(text: String) -> Self {
        Fragment::Text(text)
    }
}

impl From<&str> for Fragment {
    fn from(text: &str) -> Self {
        Fragment::Text(text.to_owned())
    }
}
