use std::fmt;
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::Expiry;

use crate::error::Result;
use crate::storage::{CacheEntry, Storage};

/// Implements [`Storage`] with [`moka`](https://github.com/moka-rs/moka) as
/// the in-memory backend.
///
/// Entries are stored together with the lifetime the dispatcher resolved
/// for them; moka's per-entry expiry enforces it. Entries stored without a
/// lifetime (validator-only entries) live until evicted by capacity.
#[derive(Clone)]
pub struct MokaStorage {
    cache: Cache<String, Stored>,
}

#[derive(Clone)]
struct Stored {
    entry: CacheEntry,
    ttl: Option<Duration>,
}

struct StoredExpiry;

impl Expiry<String, Stored> for StoredExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Stored,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }
}

impl MokaStorage {
    /// Creates a store holding up to `capacity` entries.
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .expire_after(StoredExpiry)
                .build(),
        }
    }

    /// Clears out the entire cache.
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }
}

impl Default for MokaStorage {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl fmt::Debug for MokaStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MokaStorage").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Storage for MokaStorage {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.cache.get(key).await.map(|stored| stored.entry))
    }

    async fn set(
        &self,
        key: String,
        entry: CacheEntry,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.cache.insert(key, Stored { entry, ttl }).await;
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        self.cache.run_pending_tasks().await;
        Ok(())
    }
}
