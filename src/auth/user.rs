//! User records and the directory they are looked up in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::config::UserSeed;

/// A user as stored in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub active: bool,
}

/// Lookup of users and their related records.
#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    async fn find_user(&self, id: i64) -> anyhow::Result<Option<UserRecord>>;

    async fn find_by_username(&self, username: &str) -> anyhow::Result<Option<UserRecord>>;

    async fn role(&self, user_id: i64) -> anyhow::Result<Option<String>>;

    async fn regions(&self, user_id: i64) -> anyhow::Result<Vec<String>>;

    async fn groups(&self, user_id: i64) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone)]
struct Entry {
    record: UserRecord,
    role: Option<String>,
    regions: Vec<String>,
    groups: Vec<String>,
}

/// Directory held in memory, seeded from configuration.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    by_id: HashMap<i64, Entry>,
    lookups: AtomicUsize,
}

impl MemoryDirectory {
    pub fn from_seeds(seeds: &[UserSeed]) -> Self {
        let by_id = seeds
            .iter()
            .map(|seed| {
                let entry = Entry {
                    record: UserRecord {
                        id: seed.id,
                        username: seed.username.clone(),
                        active: seed.active,
                    },
                    role: seed.role.clone(),
                    regions: seed.regions.clone(),
                    groups: seed.groups.clone(),
                };
                (seed.id, entry)
            })
            .collect();

        Self {
            by_id,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Number of directory calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    fn entry(&self, id: i64) -> Option<&Entry> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.by_id.get(&id)
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn find_user(&self, id: i64) -> anyhow::Result<Option<UserRecord>> {
        Ok(self.entry(id).map(|e| e.record.clone()))
    }

    async fn find_by_username(&self, username: &str) -> anyhow::Result<Option<UserRecord>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .by_id
            .values()
            .find(|e| e.record.username == username)
            .map(|e| e.record.clone()))
    }

    async fn role(&self, user_id: i64) -> anyhow::Result<Option<String>> {
        Ok(self.entry(user_id).and_then(|e| e.role.clone()))
    }

    async fn regions(&self, user_id: i64) -> anyhow::Result<Vec<String>> {
        Ok(self.entry(user_id).map(|e| e.regions.clone()).unwrap_or_default())
    }

    async fn groups(&self, user_id: i64) -> anyhow::Result<Vec<String>> {
        Ok(self.entry(user_id).map(|e| e.groups.clone()).unwrap_or_default())
    }
}

/// The signed-in user of one request.
///
/// Related records are fetched on first access and reused afterwards.
pub struct CurrentUser {
    record: UserRecord,
    directory: Arc<dyn UserDirectory>,
    role: OnceCell<Option<String>>,
    regions: OnceCell<Vec<String>>,
    groups: OnceCell<Vec<String>>,
}

impl CurrentUser {
    pub fn new(record: UserRecord, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            record,
            directory,
            role: OnceCell::new(),
            regions: OnceCell::new(),
            groups: OnceCell::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn username(&self) -> &str {
        &self.record.username
    }

    pub fn record(&self) -> &UserRecord {
        &self.record
    }

    pub async fn role(&self) -> anyhow::Result<Option<&str>> {
        let role = self
            .role
            .get_or_try_init(|| self.directory.role(self.record.id))
            .await?;
        Ok(role.as_deref())
    }

    pub async fn regions(&self) -> anyhow::Result<&[String]> {
        let regions = self
            .regions
            .get_or_try_init(|| self.directory.regions(self.record.id))
            .await?;
        Ok(regions)
    }

    pub async fn groups(&self) -> anyhow::Result<&[String]> {
        let groups = self
            .groups
            .get_or_try_init(|| self.directory.groups(self.record.id))
            .await?;
        Ok(groups)
    }
}

impl std::fmt::Debug for CurrentUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurrentUser")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}
