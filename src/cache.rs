use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::path;
use crate::types::{ConnectionId, DirectoryListing, SearchQuery, SearchResults};

/// Longest TTL representable without overflow in timestamp arithmetic
const MAX_SPAN: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration.min(MAX_SPAN)).unwrap_or_else(|_| chrono::Duration::zero())
}

/// What a cache entry holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum CachedResult {
    Listing(DirectoryListing),
    Search(SearchResults),
}

/// A cached result with its bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: CachedResult,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Last time a background refresh was scheduled for this entry
    pub last_revalidated: DateTime<Utc>,
    pub version: u32,
}

impl CacheEntry {
    pub fn new(value: CachedResult, ttl: Duration, version: u32, now: DateTime<Utc>) -> Self {
        Self {
            value,
            created_at: now,
            last_access: now,
            expires_at: now + span(ttl),
            last_revalidated: now,
            version,
        }
    }

    /// Valid while unexpired and written by the current format version
    pub fn is_valid_at(&self, now: DateTime<Utc>, current_version: u32) -> bool {
        now < self.expires_at && self.version == current_version
    }

    pub fn needs_revalidation(&self, now: DateTime<Utc>, after: Duration) -> bool {
        now - self.last_revalidated >= span(after)
    }
}

/// Cache key, always scoped to a connection id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub connection: ConnectionId,
    /// Normalized path
    pub path: String,
    pub query: Option<String>,
}

impl CacheKey {
    pub fn listing(connection: &ConnectionId, dir: &str) -> Result<Self> {
        Ok(Self {
            connection: connection.clone(),
            path: path::normalize(dir)?,
            query: None,
        })
    }

    pub fn search(connection: &ConnectionId, root: &str, query: &SearchQuery) -> Result<Self> {
        Ok(Self {
            connection: connection.clone(),
            path: path::normalize(root)?,
            query: Some(query.cache_param()),
        })
    }

    pub fn is_query(&self) -> bool {
        self.query.is_some()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.connection,
            self.path,
            self.query.as_deref().unwrap_or("")
        )
    }
}

/// Storage tier for cache entries
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get an entry by key, refreshing its last-access time where the tier supports it
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Store an entry, replacing any previous one
    async fn set(&self, key: &CacheKey, entry: CacheEntry) -> Result<()>;

    /// Check if a key exists in the tier, valid or not
    async fn contains(&self, key: &CacheKey) -> bool;

    /// Remove a key from the tier
    async fn remove(&self, key: &CacheKey) -> Result<()>;

    /// Remove every entry of a connection
    async fn remove_connection(&self, connection: &ConnectionId) -> Result<()>;

    /// Remove every search entry of a connection
    async fn remove_queries(&self, connection: &ConnectionId) -> Result<()>;

    /// Clear all cached entries
    async fn clear(&self) -> Result<()>;
}

/// In-memory cache tier
pub struct MemoryStore {
    store: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let mut store = self.store.write().await;
        Ok(store.get_mut(key).map(|entry| {
            entry.last_access = Utc::now();
            entry.clone()
        }))
    }

    async fn set(&self, key: &CacheKey, entry: CacheEntry) -> Result<()> {
        let mut store = self.store.write().await;
        store.insert(key.clone(), entry);
        Ok(())
    }

    async fn contains(&self, key: &CacheKey) -> bool {
        let store = self.store.read().await;
        store.contains_key(key)
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        let mut store = self.store.write().await;
        store.remove(key);
        Ok(())
    }

    async fn remove_connection(&self, connection: &ConnectionId) -> Result<()> {
        let mut store = self.store.write().await;
        store.retain(|key, _| &key.connection != connection);
        Ok(())
    }

    async fn remove_queries(&self, connection: &ConnectionId) -> Result<()> {
        let mut store = self.store.write().await;
        store.retain(|key, _| !(&key.connection == connection && key.is_query()));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut store = self.store.write().await;
        store.clear();
        Ok(())
    }
}

/// No-op tier that doesn't cache anything
pub struct NoCache;

#[async_trait]
impl CacheStore for NoCache {
    async fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(None)
    }

    async fn set(&self, _key: &CacheKey, _entry: CacheEntry) -> Result<()> {
        Ok(())
    }

    async fn contains(&self, _key: &CacheKey) -> bool {
        false
    }

    async fn remove(&self, _key: &CacheKey) -> Result<()> {
        Ok(())
    }

    async fn remove_connection(&self, _connection: &ConnectionId) -> Result<()> {
        Ok(())
    }

    async fn remove_queries(&self, _connection: &ConnectionId) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// Versioned listing/search cache over a memory tier and an optional persistent tier
///
/// Also owns the generation token: background results captured under an older generation
/// are discarded by their consumers.
pub struct ResultCache {
    memory: Arc<dyn CacheStore>,
    disk: Option<Arc<dyn CacheStore>>,
    version: u32,
    generation: AtomicU64,
    /// Held shared while promoting a disk hit, exclusively while invalidating
    promotion: RwLock<()>,
}

impl ResultCache {
    /// Memory-only cache
    pub fn new(version: u32) -> Self {
        Self::with_tiers(Arc::new(MemoryStore::new()), None, version)
    }

    pub fn with_tiers(
        memory: Arc<dyn CacheStore>,
        disk: Option<Arc<dyn CacheStore>>,
        version: u32,
    ) -> Self {
        Self {
            memory,
            disk,
            version,
            generation: AtomicU64::new(0),
            promotion: RwLock::new(()),
        }
    }

    /// Cache that never hits
    pub fn disabled() -> Self {
        Self::with_tiers(Arc::new(NoCache), None, 0)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Start a new generation; results captured under earlier ones become stale
    pub fn advance_generation(&self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Cache generation advanced to {}", next);
        next
    }

    /// Valid entry for `key`, looking at memory first and promoting disk hits
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let now = Utc::now();

        if let Some(entry) = self.memory.get(key).await? {
            if entry.is_valid_at(now, self.version) {
                return Ok(Some(entry));
            }
            self.memory.remove(key).await?;
        }

        let Some(disk) = &self.disk else {
            return Ok(None);
        };
        // Invalidations wait for the promotion, so they cannot miss what it copies
        let _promotion = self.promotion.read().await;
        match disk.get(key).await? {
            Some(entry) if entry.is_valid_at(now, self.version) => {
                debug!("Promoting {} from disk tier", key);
                self.memory.set(key, entry.clone()).await?;
                Ok(Some(entry))
            }
            Some(_) => {
                disk.remove(key).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Store a result in every tier. A failing disk tier only costs persistence.
    pub async fn store(&self, key: &CacheKey, value: CachedResult, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(value, ttl, self.version, Utc::now());
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.set(key, entry.clone()).await {
                warn!("Disk cache write failed for {}: {}", key, e);
            }
        }
        self.memory.set(key, entry).await
    }

    /// Store a result fetched under `generation`, unless the cache moved on meanwhile.
    ///
    /// Returns false when the result was dropped. An invalidation racing the write
    /// still wins: the entry is removed again if the generation changed during it.
    pub async fn store_if_current(
        &self,
        key: &CacheKey,
        value: CachedResult,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool> {
        if self.current_generation() != generation {
            return Ok(false);
        }
        self.store(key, value, ttl).await?;
        if self.current_generation() != generation {
            debug!("Dropping {}: invalidated while storing", key);
            for tier in self.tiers() {
                tier.remove(key).await?;
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Cached listing, or `None` on a miss
    pub async fn get(
        &self,
        connection: &ConnectionId,
        dir: &str,
    ) -> Result<Option<DirectoryListing>> {
        let key = CacheKey::listing(connection, dir)?;
        Ok(match self.lookup(&key).await? {
            Some(CacheEntry {
                value: CachedResult::Listing(listing),
                ..
            }) => Some(listing),
            _ => None,
        })
    }

    pub async fn put(
        &self,
        connection: &ConnectionId,
        dir: &str,
        listing: DirectoryListing,
        ttl: Duration,
    ) -> Result<()> {
        let key = CacheKey::listing(connection, dir)?;
        self.store(&key, CachedResult::Listing(listing), ttl).await
    }

    pub async fn get_search(
        &self,
        connection: &ConnectionId,
        root: &str,
        query: &SearchQuery,
    ) -> Result<Option<SearchResults>> {
        let key = CacheKey::search(connection, root, query)?;
        Ok(match self.lookup(&key).await? {
            Some(CacheEntry {
                value: CachedResult::Search(results),
                ..
            }) => Some(results),
            _ => None,
        })
    }

    pub async fn put_search(
        &self,
        connection: &ConnectionId,
        results: SearchResults,
        ttl: Duration,
    ) -> Result<()> {
        let key = CacheKey::search(connection, &results.root, &results.query)?;
        self.store(&key, CachedResult::Search(results), ttl).await
    }

    /// Record that a background refresh was scheduled for `key`
    pub async fn mark_revalidated(&self, key: &CacheKey) -> Result<()> {
        if let Some(mut entry) = self.memory.get(key).await? {
            entry.last_revalidated = Utc::now();
            self.memory.set(key, entry).await?;
        }
        Ok(())
    }

    /// Drop the listing of `target`, the listing of its parent, and the connection's
    /// cached searches.
    ///
    /// Starts a new generation first, so fetches already in flight cannot put the
    /// removed entries back.
    pub async fn invalidate_path(&self, connection: &ConnectionId, target: &str) -> Result<()> {
        let key = CacheKey::listing(connection, target)?;
        let parent = path::parent(&key.path)
            .map(|p| CacheKey::listing(connection, &p))
            .transpose()?;

        self.advance_generation();
        let _promotion = self.promotion.write().await;
        for tier in self.tiers() {
            tier.remove(&key).await?;
            if let Some(parent) = &parent {
                tier.remove(parent).await?;
            }
            tier.remove_queries(connection).await?;
        }
        debug!("Invalidated {} on {}", key.path, connection);
        Ok(())
    }

    pub async fn invalidate_connection(&self, connection: &ConnectionId) -> Result<()> {
        self.advance_generation();
        let _promotion = self.promotion.write().await;
        for tier in self.tiers() {
            tier.remove_connection(connection).await?;
        }
        debug!("Invalidated all entries of {}", connection);
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<()> {
        let _promotion = self.promotion.write().await;
        for tier in self.tiers() {
            tier.clear().await?;
        }
        Ok(())
    }

    /// Memory pressure: drop the memory tier, keep what is persisted
    pub async fn on_memory_pressure(&self) -> Result<()> {
        warn!("Memory pressure, clearing in-memory cache tier");
        self.release_memory().await
    }

    /// Drop the memory tier only
    pub async fn release_memory(&self) -> Result<()> {
        self.memory.clear().await
    }

    /// Removal order: promotion only ever copies disk into memory
    fn tiers(&self) -> impl Iterator<Item = &Arc<dyn CacheStore>> {
        self.disk.iter().chain(std::iter::once(&self.memory))
    }
}
