//! Request handler contract.

use async_trait::async_trait;

use crate::error::{HandlerError, HandlerResult};
use crate::http::coordinator::RequestContext;

/// How a handler that returned normally wants the request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    /// Keep whatever the handler wrote and finish normally.
    #[default]
    Continue,
    /// Stop here and send the envelope exactly as it stands.
    EarlyFinish,
}

/// An API endpoint. Methods left unimplemented answer 405.
///
/// HEAD requests run `get` with the body suppressed.
#[async_trait]
pub trait ApiHandler: Send + Sync + 'static {
    async fn get(&self, _ctx: &mut RequestContext) -> HandlerResult {
        Err(HandlerError::http(405))
    }

    async fn post(&self, _ctx: &mut RequestContext) -> HandlerResult {
        Err(HandlerError::http(405))
    }

    async fn put(&self, _ctx: &mut RequestContext) -> HandlerResult {
        Err(HandlerError::http(405))
    }

    async fn delete(&self, _ctx: &mut RequestContext) -> HandlerResult {
        Err(HandlerError::http(405))
    }
}
