//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the API handlers
//! - Wire up middleware (request ID, tracing, timeout)
//! - Bind server to listener and serve until shutdown
//! - Dispatch each request to its handler on a dedicated task
//! - Swap the shared state snapshot when configuration reloads
//! - Run the memory cache reaper

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, MethodRouter};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{MemoryDirectory, UserDirectory};
use crate::config::GatewayConfig;
use crate::envelope::{ChannelTransport, ResponseEnvelope};
use crate::http::coordinator::RequestContext;
use crate::http::handler::ApiHandler;
use crate::http::request::{self, UuidRequestId};
use crate::session::{CacheBackend, Carrier, MemoryBackend, SessionStore};

/// One consistent view of the configuration and what is derived from it.
pub struct Snapshot {
    pub config: GatewayConfig,
    pub store: SessionStore,
    pub default_headers: HeaderMap,
    pub users: Arc<dyn UserDirectory>,
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    snapshot: Arc<ArcSwap<Snapshot>>,
    backend: Arc<dyn CacheBackend>,
    directory: Option<Arc<dyn UserDirectory>>,
}

impl AppState {
    fn new(
        config: GatewayConfig,
        backend: Arc<dyn CacheBackend>,
        directory: Option<Arc<dyn UserDirectory>>,
    ) -> Self {
        let snapshot = build_snapshot(config, &backend, directory.as_ref());
        Self {
            snapshot: Arc::new(ArcSwap::from_pointee(snapshot)),
            backend,
            directory,
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Replace the snapshot. Requests already running keep the old one.
    pub fn apply(&self, config: GatewayConfig) {
        let current = self.snapshot.load();
        if current.config.listener.bind_address != config.listener.bind_address {
            tracing::warn!(
                bind_address = %config.listener.bind_address,
                "Listener address changes take effect on restart"
            );
        }
        let snapshot = build_snapshot(config, &self.backend, self.directory.as_ref());
        self.snapshot.store(Arc::new(snapshot));
        tracing::info!("Configuration reloaded");
    }
}

fn build_snapshot(
    config: GatewayConfig,
    backend: &Arc<dyn CacheBackend>,
    directory: Option<&Arc<dyn UserDirectory>>,
) -> Snapshot {
    let store = SessionStore::new(backend.clone(), config.session.clone());
    let default_headers = header_map(&config);
    let users = match directory {
        Some(directory) => directory.clone(),
        None => Arc::new(MemoryDirectory::from_seeds(&config.users)),
    };
    Snapshot {
        config,
        store,
        default_headers,
        users,
    }
}

fn header_map(config: &GatewayConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.response.default_headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Skipping invalid default header"),
        }
    }
    headers
}

/// HTTP server for the session gateway.
pub struct HttpServer {
    router: Router,
    state: AppState,
    memory: Option<MemoryBackend>,
}

impl HttpServer {
    /// Create a server backed by the in-memory cache and a directory
    /// seeded from `config.users`.
    pub fn new(config: GatewayConfig) -> Self {
        let memory = MemoryBackend::new();
        let backend: Arc<dyn CacheBackend> = Arc::new(memory.clone());
        let mut server = Self::build(config, backend, None);
        server.memory = Some(memory);
        server
    }

    /// Create a server over an injected cache backend and user directory.
    pub fn with_backend(
        config: GatewayConfig,
        backend: Arc<dyn CacheBackend>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self::build(config, backend, Some(directory))
    }

    fn build(
        config: GatewayConfig,
        backend: Arc<dyn CacheBackend>,
        directory: Option<Arc<dyn UserDirectory>>,
    ) -> Self {
        let timeout = Duration::from_secs(config.timeouts.request_secs);
        let state = AppState::new(config, backend, directory);
        let router = Self::build_router(crate::api::router(), timeout, state.clone());
        Self {
            router,
            state,
            memory: None,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(routes: Router<AppState>, timeout: Duration, state: AppState) -> Router {
        routes
            .with_state(state)
            .layer(TimeoutLayer::new(timeout))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
    }

    /// Shared state, e.g. for applying configuration by hand.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The fully layered router, for driving the server without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let reaper = self.memory.as_ref().map(|memory| {
            let interval = Duration::from_secs(self.state.snapshot().config.cache.reap_interval_secs);
            memory.spawn_reaper(interval, shutdown.resubscribe())
        });

        let state = self.state.clone();
        let mut reload_shutdown = shutdown.resubscribe();
        let reloader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = config_updates.recv() => match update {
                        Some(config) => state.apply(config),
                        None => break,
                    },
                    _ = reload_shutdown.recv() => break,
                }
            }
        });

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received, draining connections");
            })
            .await?;

        reloader.abort();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Route `handler` for every method; the handler answers 405 itself.
pub fn endpoint<H: ApiHandler>(handler: H) -> MethodRouter<AppState> {
    let handler: Arc<dyn ApiHandler> = Arc::new(handler);
    any(move |State(state): State<AppState>, request: Request| {
        let handler = handler.clone();
        async move { dispatch(state, handler, request).await }
    })
}

/// Run one request through a [`RequestContext`] and stream its envelope.
pub async fn dispatch(state: AppState, handler: Arc<dyn ApiHandler>, request: Request) -> Response {
    let snapshot = state.snapshot();
    let request_id = request::request_id(request.headers());
    let (parts, body) = request.into_parts();

    let limit = snapshot.config.limits.max_body_size;
    let (body, body_fault) = match request::read_json_body(&parts.headers, body, limit).await {
        Ok(body) => (body, None),
        Err(fault) => (None, Some(fault)),
    };

    let carrier = Carrier::new(parts.method.clone(), &parts.headers, parts.uri.query(), body);
    let (transport, receiver) = ChannelTransport::pair();
    let envelope = ResponseEnvelope::new(
        &parts.method,
        Box::new(transport),
        snapshot.default_headers.clone(),
    );

    let (done_tx, done_rx) = oneshot::channel();
    let mut ctx = RequestContext::new(request_id.clone(), carrier, snapshot.store.clone(), envelope)
        .with_users(snapshot.users.clone())
        .with_completion(done_tx);
    if let Some(fault) = body_fault {
        ctx = ctx.with_body_fault(fault);
    }

    tracing::debug!(request_id = %request_id, method = %parts.method, path = %parts.uri.path(), "Dispatching request");

    tokio::spawn(async move {
        if let Err(e) = ctx.run(handler.as_ref()).await {
            tracing::error!(request_id = %request_id, error = %e, "Handler broke the response contract");
        }
    });

    match receiver.into_response().await {
        Ok(response) => {
            // A finished (not streamed) response is held until the session
            // is saved, so the client's next request sees it.
            if is_finished(&response) {
                let _ = done_rx.await;
            }
            response
        }
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"code": 500, "message": "Internal Server Error", "data": {}})),
        )
            .into_response(),
    }
}

/// Whether the head came from `finish` rather than a streaming `flush`.
fn is_finished(response: &Response) -> bool {
    response.headers().contains_key(CONTENT_LENGTH)
        || matches!(response.status(), StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED)
}
