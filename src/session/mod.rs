//! Server-side sessions.
//!
//! # Data Flow
//! ```text
//! request
//!     → carrier.rs (cookie / query / body → candidate id)
//!     → store.rs (exists? → get → decode)      MissingSessionId / InvalidSessionId
//!     → Session (handler reads and mutates, dirty flag tracks writes)
//!     → store.rs save (set | expire | nothing) at request completion
//!     → backend.rs (CacheBackend: memory.rs or Blocking<B>)
//! ```
//!
//! # Design Decisions
//! - Load is lazy: handlers that never touch the session never hit the cache
//! - Save is deferred to the end of the request so several mutations
//!   collapse into one write
//! - Unmodified sessions slide their expiry instead of being rewritten
//! - The backend is injected; there is no process-wide cache handle

pub mod backend;
pub mod carrier;
pub mod memory;
pub mod store;
pub mod token;

pub use backend::{BackendError, Blocking, BlockingCacheBackend, CacheBackend};
pub use carrier::Carrier;
pub use memory::MemoryBackend;
pub use store::{SaveOutcome, Session, SessionStore};

/// Failures of session resolution and persistence.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The request carried no session id.
    #[error("missing {field}")]
    MissingSessionId { field: String },

    /// The request carried an id the backend does not know.
    #[error("invalid {field}")]
    InvalidSessionId { field: String },

    /// Stored payload could not be decoded, or data could not be encoded.
    #[error("session payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The session was used outside its permitted lifecycle.
    #[error("illegal session state: {0}")]
    IllegalState(&'static str),

    #[error(transparent)]
    BackendUnavailable(#[from] BackendError),
}
