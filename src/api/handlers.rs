//! Demo endpoints speaking the envelope protocol.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::auth::USER_ID_KEY;
use crate::error::{HandlerError, HandlerResult};
use crate::http::{ApiHandler, Outcome, RequestContext};

/// `/api/session`: sign in, inspect, update and sign out.
pub struct SessionHandler;

#[async_trait]
impl ApiHandler for SessionHandler {
    async fn get(&self, ctx: &mut RequestContext) -> HandlerResult {
        let data = Value::Object(ctx.session().await?.data().clone());
        ctx.success(data)?;
        Ok(Outcome::Continue)
    }

    /// Issue a fresh session for a known, active user.
    async fn post(&self, ctx: &mut RequestContext) -> HandlerResult {
        let username = ctx
            .json_argument("username")?
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| HandlerError::http_with_reason(400, "Invalid argument 'username'"))?;

        let directory = ctx
            .users()
            .cloned()
            .ok_or_else(|| HandlerError::Internal(anyhow::anyhow!("no user directory configured")))?;
        let user = directory
            .find_by_username(&username)
            .await?
            .filter(|user| user.active)
            .ok_or_else(|| HandlerError::http(403))?;

        tracing::info!(request_id = %ctx.request_id(), user_id = user.id, "User signed in");

        ctx.new_session().set(USER_ID_KEY, user.id)?;
        ctx.success_with_token("", json!({ "userId": user.id, "username": user.username }))?;
        Ok(Outcome::Continue)
    }

    /// Merge the body's `data` object into the session.
    async fn put(&self, ctx: &mut RequestContext) -> HandlerResult {
        let Value::Object(values) = ctx.json_argument("data")?.clone() else {
            return Err(HandlerError::http_with_reason(400, "Invalid argument 'data'"));
        };
        let session = ctx.session().await?;
        session.update(values)?;
        let data = Value::Object(session.data().clone());
        ctx.success(data)?;
        Ok(Outcome::Continue)
    }

    async fn delete(&self, ctx: &mut RequestContext) -> HandlerResult {
        ctx.session().await?.flush().await?;
        ctx.success(Value::Null)?;
        Ok(Outcome::Continue)
    }
}

/// `/api/visits`: per-session counter.
pub struct VisitsHandler;

#[async_trait]
impl ApiHandler for VisitsHandler {
    async fn get(&self, ctx: &mut RequestContext) -> HandlerResult {
        let session = ctx.session().await?;
        let visits = session.get_as::<u64>("visits")?.unwrap_or(0) + 1;
        session.set("visits", visits)?;
        ctx.success(json!({ "visits": visits }))?;
        Ok(Outcome::Continue)
    }
}

/// `/api/profile`: the signed-in user and their related records.
pub struct ProfileHandler;

#[async_trait]
impl ApiHandler for ProfileHandler {
    async fn get(&self, ctx: &mut RequestContext) -> HandlerResult {
        let user = ctx.require_user().await?;
        let role = user.role().await?.map(str::to_owned);
        let regions = user.regions().await?.to_vec();
        let groups = user.groups().await?.to_vec();
        ctx.success(json!({
            "id": user.id(),
            "username": user.username(),
            "role": role,
            "regions": regions,
            "groups": groups,
        }))?;
        Ok(Outcome::Continue)
    }
}

/// `/api/ping`: no session involved. `?early=1` stops through the
/// early-finish path.
pub struct PingHandler;

#[async_trait]
impl ApiHandler for PingHandler {
    async fn get(&self, ctx: &mut RequestContext) -> HandlerResult {
        if ctx.query_argument("early") == Some("1") {
            ctx.success(json!({ "early": true }))?;
            return Ok(Outcome::EarlyFinish);
        }
        ctx.success(json!({ "pong": true }))?;
        Ok(Outcome::Continue)
    }
}
