//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, trace, timeout)
//!     → request.rs (request ID, JSON body decode, size limit)
//!     → coordinator.rs (RequestContext: lazy session, envelope)
//!     → handler.rs (ApiHandler method for the request verb)
//!     → translator.rs (early finish / faults → envelope content)
//!     → envelope finish → ChannelTransport → streamed to client
//!     → completion (session save) on the handler task
//! ```

pub mod coordinator;
pub mod handler;
pub mod request;
pub mod server;
pub mod translator;

pub use coordinator::RequestContext;
pub use handler::{ApiHandler, Outcome};
pub use request::{UuidRequestId, X_REQUEST_ID};
pub use server::{dispatch, endpoint, AppState, HttpServer};
pub use translator::{translate, Condition, Translation};
