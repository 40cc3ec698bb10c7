use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CachedResult, ResultCache};
use crate::config::CacheConfig;
use crate::control::OperationControl;
use crate::error::Result;
use crate::path;
use crate::storage::{ByteProgress, RemoteStorage};
use crate::types::{
    ConnectionDescriptor, ConnectionId, DirectoryListing, Outcome, SearchQuery, SearchResults,
};

const UPDATE_CHANNEL_CAPACITY: usize = 32;

/// A background refresh found different content for a cached listing
#[derive(Debug, Clone, PartialEq)]
pub struct CacheUpdate {
    pub connection: ConnectionId,
    pub path: String,
    pub listing: DirectoryListing,
}

/// Cached view of remote shares
///
/// Listings are served from the cache when possible and refreshed in the background.
/// Every write goes through here so the affected entries are dropped before the
/// caller sees the write's result.
#[derive(Clone)]
pub struct ShareBrowser {
    inner: Arc<BrowserInner>,
}

struct BrowserInner {
    storage: Arc<dyn RemoteStorage>,
    cache: Arc<ResultCache>,
    config: CacheConfig,
    revalidating: Mutex<HashSet<CacheKey>>,
    active_search: Mutex<Option<Arc<OperationControl>>>,
    updates: broadcast::Sender<CacheUpdate>,
}

impl ShareBrowser {
    pub fn new(
        storage: Arc<dyn RemoteStorage>,
        cache: Arc<ResultCache>,
        config: CacheConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BrowserInner {
                storage,
                cache,
                config,
                revalidating: Mutex::new(HashSet::new()),
                active_search: Mutex::new(None),
                updates,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.inner.cache
    }

    pub fn storage(&self) -> &Arc<dyn RemoteStorage> {
        &self.inner.storage
    }

    /// Receive listings replaced by background refreshes
    pub fn subscribe_updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.inner.updates.subscribe()
    }

    /// Number of background refreshes still running
    pub fn revalidations_in_flight(&self) -> usize {
        self.inner.revalidating.lock().len()
    }

    /// List a directory, answering from the cache when a valid entry exists
    pub async fn list(
        &self,
        connection: &ConnectionDescriptor,
        dir: &str,
    ) -> Result<DirectoryListing> {
        let key = CacheKey::listing(&connection.id, dir)?;

        if let Some(entry) = self.inner.cache.lookup(&key).await? {
            let stale = entry.needs_revalidation(Utc::now(), self.inner.config.revalidate_after());
            if let CachedResult::Listing(listing) = entry.value {
                debug!("Cache hit for {}", key);
                if stale {
                    self.schedule_revalidation(connection.clone(), key, listing.clone())
                        .await;
                }
                return Ok(listing);
            }
        }

        debug!("Cache miss for {}", key);
        self.inner.fetch(connection, &key).await
    }

    /// Fetch a listing from the share, replacing whatever is cached
    pub async fn refresh(
        &self,
        connection: &ConnectionDescriptor,
        dir: &str,
    ) -> Result<DirectoryListing> {
        let key = CacheKey::listing(&connection.id, dir)?;
        self.inner.fetch(connection, &key).await
    }

    async fn schedule_revalidation(
        &self,
        connection: ConnectionDescriptor,
        key: CacheKey,
        cached: DirectoryListing,
    ) {
        if !self.inner.revalidating.lock().insert(key.clone()) {
            return;
        }
        if let Err(e) = self.inner.cache.mark_revalidated(&key).await {
            warn!("Failed to mark {} as revalidated: {}", key, e);
        }
        let generation = self.inner.cache.current_generation();

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.revalidate(&connection, &key, generation, &cached).await {
                warn!("Background refresh of {} failed: {}", key, e);
            }
            inner.revalidating.lock().remove(&key);
        });
    }

    /// Search below `root`, superseding any search still running.
    ///
    /// Cancelled searches resolve to `Outcome::Cancelled` and leave the cache alone.
    /// Results overtaken by a generation change are returned but not cached.
    pub async fn search(
        &self,
        connection: &ConnectionDescriptor,
        root: &str,
        query: SearchQuery,
    ) -> Result<Outcome<SearchResults>> {
        let key = CacheKey::search(&connection.id, root, &query)?;
        if let Some(results) = self.inner.cache.get_search(&connection.id, root, &query).await? {
            debug!("Cache hit for {}", key);
            return Ok(Outcome::Completed(results));
        }

        let control = Arc::new(OperationControl::new());
        if let Some(previous) = self.inner.active_search.lock().replace(control.clone()) {
            previous.cancel();
        }
        let generation = self.inner.cache.current_generation();

        let found = self
            .inner
            .storage
            .search(connection, &key.path, &query, &control)
            .await;

        {
            let mut active = self.inner.active_search.lock();
            if active.as_ref().is_some_and(|c| Arc::ptr_eq(c, &control)) {
                *active = None;
            }
        }

        let matches = match found {
            Ok(matches) => matches,
            Err(e) if e.is_cancelled() => return Ok(Outcome::Cancelled),
            Err(e) => return Err(e),
        };
        if control.is_cancelled() {
            debug!("Discarding search results for {}", key);
            return Ok(Outcome::Cancelled);
        }

        let results = SearchResults {
            root: key.path.clone(),
            query,
            matches,
        };
        let stored = self
            .inner
            .cache
            .store_if_current(
                &key,
                CachedResult::Search(results.clone()),
                self.inner.config.search_ttl(),
                generation,
            )
            .await?;
        if !stored {
            debug!("Not caching {}: share changed during search", key);
        }
        Ok(Outcome::Completed(results))
    }

    /// Cancel the running search; any result already in flight is discarded
    pub fn cancel_search(&self) -> bool {
        self.inner.cache.advance_generation();
        match self.inner.active_search.lock().take() {
            Some(control) => {
                control.cancel();
                true
            }
            None => false,
        }
    }

    /// Leave `previous`: its entries are dropped and pending background work is discarded
    pub async fn switch_connection(&self, previous: &ConnectionId) -> Result<()> {
        info!("Switching away from {}", previous);
        self.cancel_search();
        self.inner.cache.invalidate_connection(previous).await
    }

    pub async fn download(
        &self,
        connection: &ConnectionDescriptor,
        remote: &str,
        local: &Path,
        progress: ByteProgress<'_>,
    ) -> Result<u64> {
        let remote = path::normalize(remote)?;
        self.inner
            .storage
            .download(connection, &remote, local, progress)
            .await
    }

    pub async fn upload(
        &self,
        connection: &ConnectionDescriptor,
        local: &Path,
        remote: &str,
        progress: ByteProgress<'_>,
    ) -> Result<u64> {
        let remote = path::normalize(remote)?;
        let written = self
            .inner
            .storage
            .upload(connection, local, &remote, progress)
            .await;
        let invalidated = self.inner.cache.invalidate_path(&connection.id, &remote).await;
        let written = written?;
        invalidated?;
        Ok(written)
    }

    pub async fn delete(&self, connection: &ConnectionDescriptor, target: &str) -> Result<()> {
        let target = path::normalize(target)?;
        let deleted = self.inner.storage.delete(connection, &target).await;
        let invalidated = self.inner.cache.invalidate_path(&connection.id, &target).await;
        deleted?;
        invalidated
    }

    pub async fn rename(
        &self,
        connection: &ConnectionDescriptor,
        target: &str,
        new_name: &str,
    ) -> Result<()> {
        let target = path::normalize(target)?;
        let renamed = self.inner.storage.rename(connection, &target, new_name).await;

        let renamed_to = path::join(&path::parent(&target).unwrap_or_default(), new_name);
        let mut invalidated = self.inner.cache.invalidate_path(&connection.id, &target).await;
        if invalidated.is_ok() {
            invalidated = self
                .inner
                .cache
                .invalidate_path(&connection.id, &renamed_to)
                .await;
        }
        renamed?;
        invalidated
    }

    pub async fn create_directory(
        &self,
        connection: &ConnectionDescriptor,
        parent: &str,
        name: &str,
    ) -> Result<()> {
        let parent = path::normalize(parent)?;
        let created = self
            .inner
            .storage
            .create_directory(connection, &parent, name)
            .await;
        let invalidated = self
            .inner
            .cache
            .invalidate_path(&connection.id, &path::join(&parent, name))
            .await;
        created?;
        invalidated
    }
}

impl BrowserInner {
    async fn fetch(
        &self,
        connection: &ConnectionDescriptor,
        key: &CacheKey,
    ) -> Result<DirectoryListing> {
        let generation = self.cache.current_generation();
        let listing = self.storage.list(connection, &key.path).await?;

        let stored = self
            .cache
            .store_if_current(
                key,
                CachedResult::Listing(listing.clone()),
                self.config.listing_ttl(),
                generation,
            )
            .await?;
        if !stored {
            debug!("Not caching {}: generation changed during fetch", key);
        }
        Ok(listing)
    }

    async fn revalidate(
        &self,
        connection: &ConnectionDescriptor,
        key: &CacheKey,
        generation: u64,
        cached: &DirectoryListing,
    ) -> Result<()> {
        let fresh = self.storage.list(connection, &key.path).await?;

        let changed = &fresh != cached;
        let stored = self
            .cache
            .store_if_current(
                key,
                CachedResult::Listing(fresh.clone()),
                self.config.listing_ttl(),
                generation,
            )
            .await?;
        if !stored {
            debug!("Discarding stale refresh of {}", key);
            return Ok(());
        }

        if changed {
            debug!("Refreshed {} with new content", key);
            let _ = self.updates.send(CacheUpdate {
                connection: key.connection.clone(),
                path: key.path.clone(),
                listing: fresh,
            });
        }
        Ok(())
    }
}
