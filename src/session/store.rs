//! Session identity, lazy loading, dirty tracking and persistence.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::SessionConfig;
use crate::observability::metrics;
use crate::session::backend::CacheBackend;
use crate::session::carrier::Carrier;
use crate::session::token::generate_session_id;
use crate::session::SessionError;

/// Which branch a [`Session::save`] call took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Modified data was written back with a fresh TTL.
    Written,
    /// Unmodified, non-empty data had its expiry slid forward.
    Renewed,
    /// Nothing to persist.
    Skipped,
}

impl SaveOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveOutcome::Written => "written",
            SaveOutcome::Renewed => "renewed",
            SaveOutcome::Skipped => "skipped",
        }
    }
}

/// Shared factory for per-request [`Session`]s.
///
/// Cheap to clone; holds the injected backend and the session settings.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn CacheBackend>,
    settings: Arc<SessionConfig>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn CacheBackend>, settings: SessionConfig) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &SessionConfig {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    fn cache_key(&self, id: &str) -> String {
        format!("{}{}", self.settings.key_prefix, id)
    }

    /// Candidate session id carried by the request, if any.
    pub fn resolve_id(&self, carrier: &Carrier) -> Option<String> {
        carrier.session_id(&self.settings.session_id_name)
    }

    /// Resume the session named by the request.
    ///
    /// Fails with [`SessionError::MissingSessionId`] before touching the
    /// backend when the request carries no id.
    pub async fn open(&self, carrier: &Carrier) -> Result<Session, SessionError> {
        let Some(id) = self.resolve_id(carrier) else {
            metrics::record_session_open("missing");
            return Err(SessionError::MissingSessionId {
                field: self.settings.session_id_name.clone(),
            });
        };
        self.resume(&id).await
    }

    /// Start an empty session under a fresh id. Nothing is stored until save.
    pub fn create_new(&self) -> Session {
        metrics::record_session_open("created");
        Session {
            id: Some(generate_session_id()),
            data: Map::new(),
            dirty: false,
            ttl_secs: self.settings.expire_seconds,
            store: self.clone(),
        }
    }

    /// Load an existing session by id.
    pub async fn resume(&self, id: &str) -> Result<Session, SessionError> {
        let key = self.cache_key(id);
        if !self.backend.exists(&key).await? {
            metrics::record_session_open("invalid");
            return Err(SessionError::InvalidSessionId {
                field: self.settings.session_id_name.clone(),
            });
        }

        let data = match self.backend.get(&key).await? {
            Some(payload) => decode(&payload)?,
            // Expired between the two calls.
            None => Map::new(),
        };

        metrics::record_session_open("resumed");
        Ok(Session {
            id: Some(id.to_owned()),
            data,
            dirty: false,
            ttl_secs: self.settings.expire_seconds,
            store: self.clone(),
        })
    }

    /// Delete another session's stored state.
    pub async fn invalidate(&self, id: &str) -> Result<(), SessionError> {
        self.backend.delete(&self.cache_key(id)).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn decode(payload: &[u8]) -> Result<Map<String, Value>, SessionError> {
    serde_json::from_slice(payload).map_err(SessionError::Serialization)
}

/// One request's view of a session.
pub struct Session {
    id: Option<String>,
    data: Map<String, Value>,
    dirty: bool,
    ttl_secs: u64,
    store: SessionStore,
}

impl Session {
    /// The session id, or `None` once flushed.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.data.get(key).cloned().unwrap_or(default)
    }

    /// Typed read. `Ok(None)` when the key is absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SessionError> {
        self.data
            .get(key)
            .map(|v| T::deserialize(v).map_err(SessionError::Serialization))
            .transpose()
    }

    pub fn set<V: Serialize>(&mut self, key: impl Into<String>, value: V) -> Result<(), SessionError> {
        self.ensure_live()?;
        let value = serde_json::to_value(value)?;
        self.data.insert(key.into(), value);
        self.dirty = true;
        Ok(())
    }

    /// Remove `key`, returning its previous value.
    pub fn delete(&mut self, key: &str) -> Result<Option<Value>, SessionError> {
        self.ensure_live()?;
        self.dirty = true;
        Ok(self.data.remove(key))
    }

    /// Remove `key`, falling back to `default` when absent.
    pub fn pop(&mut self, key: &str, default: Value) -> Result<Value, SessionError> {
        Ok(self.delete(key)?.unwrap_or(default))
    }

    pub fn update(&mut self, values: Map<String, Value>) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.data.extend(values);
        self.dirty = true;
        Ok(())
    }

    pub fn clear(&mut self) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.data.clear();
        self.dirty = true;
        Ok(())
    }

    /// Persist this session. Exactly one [`SaveOutcome`] branch runs per call.
    pub async fn save(&mut self) -> Result<SaveOutcome, SessionError> {
        let Some(id) = self.id.as_deref() else {
            return Ok(SaveOutcome::Skipped);
        };
        let key = self.store.cache_key(id);

        let outcome = if self.dirty {
            let payload = serde_json::to_vec(&self.data)?;
            self.store
                .backend
                .set(&key, Bytes::from(payload), self.ttl_secs)
                .await?;
            self.dirty = false;
            SaveOutcome::Written
        } else if !self.data.is_empty() {
            self.store.backend.expire(&key, self.ttl_secs).await?;
            SaveOutcome::Renewed
        } else {
            SaveOutcome::Skipped
        };

        metrics::record_session_save(outcome.as_str());
        Ok(outcome)
    }

    /// Slide this session's expiry explicitly.
    pub async fn renew(&self, ttl_secs: u64) -> Result<(), SessionError> {
        let id = self.live_id()?;
        self.store
            .backend
            .expire(&self.store.cache_key(id), ttl_secs)
            .await?;
        Ok(())
    }

    /// Destroy the session: clear data, delete the stored entry, drop the id.
    pub async fn flush(&mut self) -> Result<(), SessionError> {
        let key = self.store.cache_key(self.live_id()?);
        // A failed delete leaves the session as it was.
        self.store.backend.delete(&key).await?;
        self.data.clear();
        self.dirty = false;
        self.id = None;
        Ok(())
    }

    fn live_id(&self) -> Result<&str, SessionError> {
        self.id
            .as_deref()
            .ok_or(SessionError::IllegalState("session has been flushed"))
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        self.live_id().map(|_| ())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("keys", &self.data.len())
            .field("dirty", &self.dirty)
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}
