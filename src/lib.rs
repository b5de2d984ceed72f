//! Session gateway library: server-side sessions and buffered JSON
//! response envelopes on top of axum.

pub mod api;
pub mod auth;
pub mod config;
pub mod envelope;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod session;

pub use config::GatewayConfig;
pub use error::{HandlerError, HandlerResult};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
