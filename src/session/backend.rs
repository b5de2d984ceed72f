//! Cache backend contract.
//!
//! # Responsibilities
//! - Define the key-value operations sessions are persisted through
//! - Adapt blocking client libraries onto the async contract
//!
//! # Design Decisions
//! - Every operation is individually atomic; nothing is transactional
//!   across calls, so concurrent writers of one key are last-write-wins
//! - Blocking clients run on tokio's blocking pool, never on a worker thread

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// Failure talking to the cache.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Async key-value store with per-key expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Fetch a live value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError>;

    /// Store a value that expires after `ttl_secs`.
    async fn set(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<(), BackendError>;

    /// Remove a key. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Whether a live value exists for `key`.
    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    /// Reset the expiry of an existing key without touching its value.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), BackendError>;
}

/// Synchronous flavour of [`CacheBackend`], for clients that block the thread.
pub trait BlockingCacheBackend: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError>;
    fn set(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<(), BackendError>;
    fn delete(&self, key: &str) -> Result<(), BackendError>;
    fn exists(&self, key: &str) -> Result<bool, BackendError>;
    fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), BackendError>;
}

/// Runs a [`BlockingCacheBackend`] on the blocking worker pool.
///
/// A slow call then stalls only the request awaiting it.
pub struct Blocking<B> {
    inner: Arc<B>,
}

impl<B: BlockingCacheBackend> Blocking<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    async fn run<T, F>(&self, key: &str, op: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&B, &str) -> Result<T, BackendError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || op(inner.as_ref(), key.as_str())).await?
    }
}

#[async_trait]
impl<B: BlockingCacheBackend> CacheBackend for Blocking<B> {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        self.run(key, |b, k| b.get(k)).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<(), BackendError> {
        self.run(key, move |b, k| b.set(k, value, ttl_secs)).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.run(key, |b, k| b.delete(k)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        self.run(key, |b, k| b.exists(k)).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), BackendError> {
        self.run(key, move |b, k| b.expire(k, ttl_secs)).await
    }
}
