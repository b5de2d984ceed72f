//! Per-request coordination of session, envelope and handler.
//!
//! # Data Flow
//! ```text
//! RequestContext::run
//!     → body fault? (400/413 from decoding) ─────────────┐
//!     → handler.get/post/put/delete                       │
//!         Ok(Continue)                                    │
//!         Ok(EarlyFinish) / Err(..) → translator.rs ◀─────┘
//!     → envelope.finish (exactly once)
//!     → completion: save session, log, record metrics
//! ```
//!
//! # Design Decisions
//! - The session is opened on first use, never eagerly
//! - Completion runs only after the envelope finished successfully; a
//!   closed connection skips it, so nothing is saved for a response the
//!   client never saw
//! - Illegal-state violations escape `run` for the dispatcher to log

use std::sync::Arc;
use std::time::Instant;

use axum::http::Method;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::auth::{CurrentUser, UserDirectory, USER_ID_KEY};
use crate::envelope::{EnvelopeError, Fragment, ResponseEnvelope};
use crate::error::{HandlerError, HandlerResult};
use crate::http::handler::{ApiHandler, Outcome};
use crate::http::translator::{translate, Condition, Translation};
use crate::observability::metrics;
use crate::session::{Carrier, SaveOutcome, Session, SessionError, SessionStore};

/// Everything one request needs while its handler runs.
pub struct RequestContext {
    request_id: String,
    carrier: Carrier,
    store: SessionStore,
    session: Option<Session>,
    envelope: ResponseEnvelope,
    users: Option<Arc<dyn UserDirectory>>,
    current_user: Option<Option<Arc<CurrentUser>>>,
    body_fault: Option<HandlerError>,
    completion: Option<oneshot::Sender<()>>,
    completed: bool,
    started: Instant,
}

impl RequestContext {
    pub fn new(
        request_id: impl Into<String>,
        carrier: Carrier,
        store: SessionStore,
        envelope: ResponseEnvelope,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            carrier,
            store,
            session: None,
            envelope,
            users: None,
            current_user: None,
            body_fault: None,
            completion: None,
            completed: false,
            started: Instant::now(),
        }
    }

    /// Attach the directory `current_user` resolves against.
    pub fn with_users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = Some(users);
        self
    }

    /// Fail the request with `fault` instead of running the handler.
    pub fn with_body_fault(mut self, fault: HandlerError) -> Self {
        self.body_fault = Some(fault);
        self
    }

    /// Signal `done` once completion (session save) has run. Dropped
    /// unsignalled when the client disconnects.
    pub fn with_completion(mut self, done: oneshot::Sender<()>) -> Self {
        self.completion = Some(done);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn method(&self) -> &Method {
        self.carrier.method()
    }

    pub fn carrier(&self) -> &Carrier {
        &self.carrier
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn users(&self) -> Option<&Arc<dyn UserDirectory>> {
        self.users.as_ref()
    }

    /// The request's session, resumed from the backend on first use.
    pub async fn session(&mut self) -> Result<&mut Session, SessionError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => self.store.open(&self.carrier).await?,
        };
        Ok(self.session.insert(session))
    }

    /// Replace the request's session with a brand new one.
    pub fn new_session(&mut self) -> &mut Session {
        self.current_user = None;
        self.session.insert(self.store.create_new())
    }

    /// The session if a handler already loaded or created one.
    pub fn loaded_session(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    pub fn envelope(&mut self) -> &mut ResponseEnvelope {
        &mut self.envelope
    }

    /// Successful envelope with code 0 and no message.
    pub fn success(&mut self, data: Value) -> Result<(), HandlerError> {
        self.envelope.success(0, "", data, None)?;
        Ok(())
    }

    /// Successful envelope carrying the current session id as `token`.
    pub fn success_with_token(&mut self, message: &str, data: Value) -> Result<(), HandlerError> {
        let token = self
            .session
            .as_ref()
            .and_then(|s| s.id())
            .map(str::to_owned);
        self.envelope.success(0, message, data, token)?;
        Ok(())
    }

    pub fn failure(&mut self, code: i64, message: &str, data: Value) -> Result<(), HandlerError> {
        self.envelope.failure(code, message, data)?;
        Ok(())
    }

    /// Field of the JSON body. Missing → 400.
    pub fn json_argument(&self, name: &str) -> Result<&Value, HandlerError> {
        self.carrier
            .body()
            .and_then(|body| body.get(name))
            .ok_or_else(|| HandlerError::http_with_reason(400, format!("Missing argument '{name}'")))
    }

    pub fn json_argument_or(&self, name: &str, default: Value) -> Value {
        self.carrier
            .body()
            .and_then(|body| body.get(name))
            .cloned()
            .unwrap_or(default)
    }

    pub fn query_argument(&self, name: &str) -> Option<&str> {
        self.carrier.query(name)
    }

    /// The active user named by the session's `userId`, resolved once per
    /// request.
    pub async fn current_user(&mut self) -> Result<Option<Arc<CurrentUser>>, HandlerError> {
        if let Some(memo) = &self.current_user {
            return Ok(memo.clone());
        }
        let Some(users) = self.users.clone() else {
            return Ok(None);
        };

        let user_id = self.session().await?.get_as::<i64>(USER_ID_KEY)?;
        let user = match user_id {
            Some(id) => users
                .find_user(id)
                .await?
                .filter(|record| record.active)
                .map(|record| Arc::new(CurrentUser::new(record, users.clone()))),
            None => None,
        };

        self.current_user = Some(user.clone());
        Ok(user)
    }

    /// Like [`current_user`](Self::current_user), but 401 when nobody is
    /// signed in.
    pub async fn require_user(&mut self) -> Result<Arc<CurrentUser>, HandlerError> {
        self.current_user().await?.ok_or_else(|| HandlerError::http(401))
    }

    /// Finish the response now and run completion.
    pub async fn finish(&mut self) -> Result<(), HandlerError> {
        self.finish_with(None).await
    }

    /// Add `fragment`, finish the response and run completion.
    pub async fn finish_with(&mut self, fragment: Option<Fragment>) -> Result<(), HandlerError> {
        self.envelope.finish(fragment)?;
        self.complete().await;
        Ok(())
    }

    /// Drive the handler and complete the request exactly once.
    pub async fn run(mut self, handler: &dyn ApiHandler) -> Result<(), HandlerError> {
        let condition = match self.body_fault.take() {
            Some(fault) => Some(Condition::Fault(fault)),
            None => match self.dispatch(handler).await {
                Ok(Outcome::Continue) => None,
                Ok(Outcome::EarlyFinish) => Some(Condition::EarlyFinish),
                Err(err) => Some(Condition::Fault(err)),
            },
        };

        if let Some(condition) = condition {
            let settings = self.store.settings().clone();
            match translate(condition, &mut self.envelope, &settings)? {
                Translation::Disconnected => {
                    self.abandon();
                    return Ok(());
                }
                Translation::SessionFailure(code) => {
                    tracing::debug!(request_id = %self.request_id, code, "Session identity rejected");
                }
                _ => {}
            }
        }

        if !self.envelope.is_finished() {
            match self.envelope.finish(None) {
                Ok(()) => {}
                Err(EnvelopeError::ConnectionClosed) => {
                    self.abandon();
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.complete().await;
        Ok(())
    }

    async fn dispatch(&mut self, handler: &dyn ApiHandler) -> HandlerResult {
        let method = self.carrier.method().clone();
        match method {
            Method::GET | Method::HEAD => handler.get(self).await,
            Method::POST => handler.post(self).await,
            Method::PUT => handler.put(self).await,
            Method::DELETE => handler.delete(self).await,
            _ => Err(HandlerError::http(405)),
        }
    }

    /// Completion step: persist the session and account for the request.
    async fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;

        if let Some(session) = self.session.as_mut() {
            match session.save().await {
                Ok(SaveOutcome::Skipped) => {}
                Ok(outcome) => {
                    tracing::debug!(request_id = %self.request_id, outcome = outcome.as_str(), "Session saved");
                }
                Err(e) => {
                    metrics::record_session_save("failed");
                    tracing::error!(request_id = %self.request_id, error = %e, "Failed to save session");
                }
            }
        }

        let status = self.envelope.status().as_u16();
        metrics::record_request(self.carrier.method().as_str(), status, self.started);
        tracing::info!(
            request_id = %self.request_id,
            method = %self.carrier.method(),
            status,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Request completed"
        );

        if let Some(done) = self.completion.take() {
            let _ = done.send(());
        }
    }

    fn abandon(&mut self) {
        self.completed = true;
        self.completion = None;
        if self.session.as_ref().is_some_and(|s| s.is_dirty()) {
            metrics::record_session_save("abandoned");
        }
        tracing::info!(
            request_id = %self.request_id,
            method = %self.carrier.method(),
            "Client disconnected before the response finished, session not saved"
        );
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("method", self.carrier.method())
            .field("session", &self.session)
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryDirectory;
    use crate::config::{SessionConfig, UserSeed};
    use crate::envelope::{Frame, MemoryTransport};
    use crate::session::testing::RecordingBackend;
    use async_trait::async_trait;
    use axum::http::header::{CONTENT_LENGTH, COOKIE};
    use axum::http::{HeaderMap, HeaderValue, StatusCode};
    use serde_json::{json, Map};

    struct Harness {
        backend: RecordingBackend,
        log: MemoryTransport,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                backend: RecordingBackend::default(),
                log: MemoryTransport::new(),
            }
        }

        fn store(&self) -> SessionStore {
            SessionStore::new(
                Arc::new(self.backend.clone()),
                SessionConfig {
                    expire_seconds: 300,
                    ..SessionConfig::default()
                },
            )
        }

        fn context(&self, method: Method, cookie: Option<&str>, body: Option<Value>) -> RequestContext {
            let mut headers = HeaderMap::new();
            if let Some(token) = cookie {
                headers.insert(COOKIE, HeaderValue::from_str(&format!("token={token}")).unwrap());
            }
            let body = body.and_then(|b| b.as_object().cloned());
            let carrier = Carrier::new(method.clone(), &headers, None, body);
            let envelope = ResponseEnvelope::new(&method, Box::new(self.log.clone()), HeaderMap::new());
            RequestContext::new("req-1", carrier, self.store(), envelope)
        }

        fn body(&self) -> Value {
            serde_json::from_slice(&self.log.body()).unwrap()
        }

        fn seed(&self, id: &str, data: Value) {
            let payload = serde_json::to_vec(&data).unwrap();
            self.backend.put_raw(&format!("session-{id}"), &payload);
        }
    }

    type Step<'a> = futures_util::future::BoxFuture<'a, HandlerResult>;

    /// Handler whose `get` is a closure over the context.
    struct Get<F>(F);

    fn on_get<F>(f: F) -> Get<F>
    where
        F: for<'a> Fn(&'a mut RequestContext) -> Step<'a> + Send + Sync + 'static,
    {
        Get(f)
    }

    #[async_trait]
    impl<F> ApiHandler for Get<F>
    where
        F: for<'a> Fn(&'a mut RequestContext) -> Step<'a> + Send + Sync + 'static,
    {
        async fn get(&self, ctx: &mut RequestContext) -> HandlerResult {
            (self.0)(ctx).await
        }
    }

    struct Counter;

    #[async_trait]
    impl ApiHandler for Counter {
        async fn get(&self, ctx: &mut RequestContext) -> HandlerResult {
            let session = ctx.session().await?;
            let visits = session.get_as::<i64>("visits")?.unwrap_or(0) + 1;
            session.set("visits", visits)?;
            ctx.success(json!({ "visits": visits }))?;
            Ok(Outcome::Continue)
        }

        async fn post(&self, ctx: &mut RequestContext) -> HandlerResult {
            let name = ctx.json_argument("name")?.clone();
            let session = ctx.new_session();
            session.set("name", name)?;
            ctx.success_with_token("welcome", Value::Null)?;
            Ok(Outcome::Continue)
        }
    }

    #[tokio::test]
    async fn missing_session_id_becomes_11000() {
        let h = Harness::new();
        h.context(Method::GET, None, None).run(&Counter).await.unwrap();

        assert_eq!(&h.log.body()[..], br#"{"code":11000,"message":"missing token","data":{}}"#);
        assert_eq!(h.log.head().unwrap().status, StatusCode::OK);
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_id_becomes_12000() {
        let h = Harness::new();
        h.context(Method::GET, Some("nope"), None).run(&Counter).await.unwrap();

        assert_eq!(h.body()["code"], 12000);
        assert_eq!(h.body()["message"], "invalid token");
    }

    #[tokio::test]
    async fn session_failure_after_no_content_status_is_a_200_envelope() {
        let h = Harness::new();
        let handler = on_get(|ctx: &mut RequestContext| {
            Box::pin(async move {
                ctx.envelope().set_status(StatusCode::NO_CONTENT, None)?;
                ctx.session().await?;
                Ok(Outcome::Continue)
            }) as Step<'_>
        });

        h.context(Method::GET, None, None).run(&handler).await.unwrap();

        assert_eq!(h.log.head().unwrap().status, StatusCode::OK);
        assert_eq!(h.body(), json!({"code": 11000, "message": "missing token", "data": {}}));
    }

    #[tokio::test]
    async fn modified_session_is_saved_after_finish() {
        let h = Harness::new();
        h.seed("abc", json!({"visits": 2}));

        h.context(Method::GET, Some("abc"), None).run(&Counter).await.unwrap();

        assert_eq!(h.body(), json!({"code": 0, "message": "", "data": {"visits": 3}}));
        let set = h.backend.calls().into_iter().find(|c| c.op == "set").unwrap();
        assert_eq!(set.key, "session-abc");
        assert_eq!(set.ttl, Some(300));
        assert_eq!(&h.backend.raw("session-abc").unwrap()[..], br#"{"visits":3}"#);
    }

    #[tokio::test]
    async fn new_session_token_is_returned_and_saved() {
        let h = Harness::new();
        let ctx = h.context(Method::POST, None, Some(json!({"name": "ada"})));
        ctx.run(&Counter).await.unwrap();

        let body = h.body();
        let token = body["token"].as_str().unwrap();
        assert_eq!(token.len(), 43);
        assert_eq!(body["message"], "welcome");
        assert_eq!(
            &h.backend.raw(&format!("session-{token}")).unwrap()[..],
            br#"{"name":"ada"}"#
        );
    }

    #[tokio::test]
    async fn missing_argument_is_400() {
        let h = Harness::new();
        h.context(Method::POST, None, Some(json!({}))).run(&Counter).await.unwrap();

        assert_eq!(h.log.head().unwrap().status, StatusCode::BAD_REQUEST);
        assert_eq!(h.body()["message"], "Missing argument 'name'");
    }

    #[tokio::test]
    async fn unsupported_method_is_405() {
        let h = Harness::new();
        h.context(Method::DELETE, None, None).run(&Counter).await.unwrap();

        assert_eq!(h.log.head().unwrap().status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(h.body()["code"], 405);
    }

    #[tokio::test]
    async fn body_fault_skips_the_handler() {
        let h = Harness::new();
        h.seed("abc", json!({"visits": 2}));
        let ctx = h
            .context(Method::GET, Some("abc"), None)
            .with_body_fault(HandlerError::http_with_reason(400, "Could not decode JSON"));
        ctx.run(&Counter).await.unwrap();

        assert_eq!(h.body()["message"], "Could not decode JSON");
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn head_suppresses_body_but_keeps_length() {
        let h = Harness::new();
        h.seed("abc", json!({"visits": 0}));
        h.context(Method::HEAD, Some("abc"), None).run(&Counter).await.unwrap();

        let head = h.log.head().unwrap();
        let expected = br#"{"code":0,"message":"","data":{"visits":1}}"#.len();
        assert_eq!(head.headers[CONTENT_LENGTH], expected.to_string().as_str());
        assert!(h.log.body().is_empty());
    }

    #[tokio::test]
    async fn early_finish_keeps_envelope_and_saves() {
        let h = Harness::new();
        h.seed("abc", json!({"visits": 0}));
        let handler = on_get(|ctx: &mut RequestContext| {
            Box::pin(async move {
                ctx.session().await?.set("seen", true)?;
                ctx.success(json!({"early": true}))?;
                Ok(Outcome::EarlyFinish)
            }) as Step<'_>
        });

        h.context(Method::GET, Some("abc"), None).run(&handler).await.unwrap();

        assert_eq!(h.body()["data"]["early"], true);
        assert!(h.backend.calls().iter().any(|c| c.op == "set"));
    }

    #[tokio::test]
    async fn handler_finishing_itself_completes_once() {
        let h = Harness::new();
        h.seed("abc", json!({}));
        let handler = on_get(|ctx: &mut RequestContext| {
            Box::pin(async move {
                ctx.session().await?.set("k", 1)?;
                ctx.success(json!({}))?;
                ctx.finish().await?;
                Ok(Outcome::Continue)
            }) as Step<'_>
        });

        h.context(Method::GET, Some("abc"), None).run(&handler).await.unwrap();

        assert_eq!(h.backend.calls_named("set").len(), 1);
        assert_eq!(h.log.head_count(), 1);
        assert!(h.log.is_ended());
    }

    #[tokio::test]
    async fn finishing_twice_is_an_illegal_state() {
        let h = Harness::new();
        let handler = on_get(|ctx: &mut RequestContext| {
            Box::pin(async move {
                ctx.finish().await?;
                ctx.finish().await?;
                Ok(Outcome::Continue)
            }) as Step<'_>
        });

        let err = h.context(Method::GET, None, None).run(&handler).await.unwrap_err();
        assert!(err.is_illegal_state());
        assert_eq!(h.log.head_count(), 1);
    }

    #[tokio::test]
    async fn closed_connection_skips_save() {
        let h = Harness::new();
        h.seed("abc", json!({"visits": 1}));
        h.log.close();

        h.context(Method::GET, Some("abc"), None).run(&Counter).await.unwrap();

        assert!(h.log.frames().is_empty());
        assert!(!h.backend.calls().iter().any(|c| c.op == "set" || c.op == "expire"));
    }

    #[tokio::test]
    async fn flushed_chunks_then_finish() {
        let h = Harness::new();
        let handler = on_get(|ctx: &mut RequestContext| {
            Box::pin(async move {
                for i in 0..3 {
                    ctx.envelope().write(json!({ "part": i }))?;
                    ctx.envelope().flush()?;
                }
                Ok(Outcome::Continue)
            }) as Step<'_>
        });

        h.context(Method::GET, None, None).run(&handler).await.unwrap();

        let frames = h.log.frames();
        assert_eq!(h.log.head_count(), 1);
        assert_eq!(h.log.chunks().len(), 3);
        assert_eq!(frames.last(), Some(&Frame::End));
    }

    #[tokio::test]
    async fn current_user_is_resolved_once_and_requires_active() {
        let h = Harness::new();
        let seeds = vec![
            UserSeed {
                id: 1,
                username: "ada".into(),
                active: true,
                role: Some("admin".into()),
                regions: vec![],
                groups: vec![],
            },
            UserSeed {
                id: 2,
                username: "bob".into(),
                active: false,
                role: None,
                regions: vec![],
                groups: vec![],
            },
        ];
        let dir = Arc::new(MemoryDirectory::from_seeds(&seeds));
        h.seed("ada", json!({"userId": 1}));
        h.seed("bob", json!({"userId": 2}));

        let mut ctx = h.context(Method::GET, Some("ada"), None).with_users(dir.clone());
        let user = ctx.require_user().await.unwrap();
        assert_eq!(user.username(), "ada");
        let lookups = dir.lookups();
        assert!(ctx.current_user().await.unwrap().is_some());
        assert_eq!(dir.lookups(), lookups);

        let mut ctx = h.context(Method::GET, Some("bob"), None).with_users(dir);
        let err = ctx.require_user().await.unwrap_err();
        assert!(matches!(err, HandlerError::Http { status: 401, .. }));
    }

    #[tokio::test]
    async fn completion_is_signalled_after_save() {
        let h = Harness::new();
        h.seed("abc", json!({"visits": 4}));
        let (done, mut signalled) = oneshot::channel();

        let ctx = h.context(Method::GET, Some("abc"), None).with_completion(done);
        ctx.run(&Counter).await.unwrap();

        assert!(signalled.try_recv().is_ok());
        assert_eq!(&h.backend.raw("session-abc").unwrap()[..], br#"{"visits":5}"#);
    }

    #[tokio::test]
    async fn completion_is_dropped_on_disconnect() {
        let h = Harness::new();
        h.log.close();
        let (done, signalled) = oneshot::channel();

        let ctx = h.context(Method::GET, None, None).with_completion(done);
        ctx.run(&Counter).await.unwrap();

        assert!(signalled.await.is_err());
    }

    #[tokio::test]
    async fn arguments_from_body_and_query() {
        let h = Harness::new();
        let ctx = h.context(Method::POST, None, Some(json!({"a": 1})));
        assert_eq!(ctx.json_argument("a").unwrap(), &json!(1));
        assert_eq!(ctx.json_argument_or("b", json!("x")), json!("x"));
        assert!(ctx.query_argument("a").is_none());

        let headers = HeaderMap::new();
        let carrier = Carrier::new(Method::GET, &headers, Some("early=1"), Some(Map::new()));
        let envelope = ResponseEnvelope::new(&Method::GET, Box::new(h.log.clone()), HeaderMap::new());
        let ctx = RequestContext::new("req-2", carrier, h.store(), envelope);
        assert_eq!(ctx.query_argument("early"), Some("1"));
    }
}
