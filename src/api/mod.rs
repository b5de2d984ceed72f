//! Demo API mounted on the gateway.
//!
//! # Routes
//! - `/api/session`: POST sign in, GET data, PUT merge, DELETE sign out
//! - `/api/visits`: GET per-session counter
//! - `/api/profile`: GET signed-in user with role, regions and groups
//! - `/api/ping`: GET without a session (`?early=1` for early finish)
//! - `/health`: plain liveness, outside the envelope protocol

pub mod handlers;

use axum::routing::get;
use axum::Router;

use crate::http::{endpoint, AppState};
use handlers::{PingHandler, ProfileHandler, SessionHandler, VisitsHandler};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/session", endpoint(SessionHandler))
        .route("/api/visits", endpoint(VisitsHandler))
        .route("/api/profile", endpoint(ProfileHandler))
        .route("/api/ping", endpoint(PingHandler))
        .route("/health", get(health))
}

async fn health() -> &'static str {
    "OK"
}
