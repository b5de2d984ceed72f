//! In-process cache backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::session::backend::{BackendError, CacheBackend};

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// A concurrent map with per-key expiry.
///
/// Expired entries are invisible immediately and reclaimed lazily on access
/// or by the reaper task.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<DashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Sweep expired entries every `interval` until shutdown.
    pub fn spawn_reaper(
        &self,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let backend = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = backend.purge_expired();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = backend.len(), "Reaped expired cache entries");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Cache reaper received shutdown signal");
                        break;
                    }
                }
            }
        })
    }

    fn live(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }
}

/// Roughly thirty years; stands in for TTLs past what `Instant` can hold.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline(ttl_secs: u64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_secs(ttl_secs))
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        Ok(self.live(key))
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<(), BackendError> {
        self.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: deadline(ttl_secs),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.live(key).is_some())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), BackendError> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = deadline(ttl_secs);
            }
        }
        Ok(())
    }
}
