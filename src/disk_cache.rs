use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs;
use tracing::warn;

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::error::{OpsError, Result};
use crate::types::ConnectionId;

const LISTINGS_DIR: &str = "listings";
const SEARCHES_DIR: &str = "searches";

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Disk-based cache tier
///
/// Layout: `<root>/<connection hash>/{listings,searches}/<key hash>.json`, so a
/// connection or its searches can be dropped with a single directory removal.
pub struct DiskStore {
    root_dir: PathBuf,
}

impl DiskStore {
    /// Create a new disk store at the specified directory
    pub async fn new(root_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root_dir).await?;
        Ok(Self { root_dir })
    }

    fn connection_dir(&self, connection: &ConnectionId) -> PathBuf {
        self.root_dir.join(&digest(connection.as_str())[..16])
    }

    /// Convert a cache key to a safe file path
    fn key_to_path(&self, key: &CacheKey) -> PathBuf {
        let kind = if key.is_query() {
            SEARCHES_DIR
        } else {
            LISTINGS_DIR
        };
        self.connection_dir(&key.connection)
            .join(kind)
            .join(format!("{}.json", digest(&key.to_string())))
    }

    async fn remove_dir(&self, dir: PathBuf) -> Result<()> {
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OpsError::Cache {
                message: format!("Failed to remove {}: {}", dir.display(), e),
            }),
        }
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let path = self.key_to_path(key);

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(OpsError::Cache {
                    message: format!("Failed to read from disk cache: {}", e),
                })
            }
        };

        match serde_json::from_slice(&data) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Dropping unreadable cache entry {}: {}", path.display(), e);
                self.remove(key).await?;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &CacheKey, entry: CacheEntry) -> Result<()> {
        let path = self.key_to_path(key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec(&entry)?;
        let staging = path.with_extension("tmp");
        fs::write(&staging, &data)
            .await
            .map_err(|e| OpsError::Cache {
                message: format!("Failed to write to disk cache: {}", e),
            })?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn contains(&self, key: &CacheKey) -> bool {
        fs::metadata(self.key_to_path(key)).await.is_ok()
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        let path = self.key_to_path(key);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OpsError::Cache {
                message: format!("Failed to remove from disk cache: {}", e),
            }),
        }
    }

    async fn remove_connection(&self, connection: &ConnectionId) -> Result<()> {
        self.remove_dir(self.connection_dir(connection)).await
    }

    async fn remove_queries(&self, connection: &ConnectionId) -> Result<()> {
        self.remove_dir(self.connection_dir(connection).join(SEARCHES_DIR))
            .await
    }

    async fn clear(&self) -> Result<()> {
        // Remove the entire cache directory and recreate it
        fs::remove_dir_all(&self.root_dir).await?;
        fs::create_dir_all(&self.root_dir).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachedResult, ResultCache};
    use crate::types::{DirectoryListing, SearchQuery, SearchResults};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(dir: &str) -> CacheEntry {
        CacheEntry::new(
            CachedResult::Listing(DirectoryListing {
                path: dir.to_string(),
                entries: vec![],
            }),
            Duration::from_secs(60),
            1,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_disk_store_roundtrip_and_removal() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::new(temp_dir.path().to_path_buf()).await.unwrap();
        let conn = ConnectionId::new("nas");
        let key = CacheKey::listing(&conn, "/docs").unwrap();

        assert!(store.get(&key).await.unwrap().is_none());
        store.set(&key, entry("/docs")).await.unwrap();
        assert!(store.contains(&key).await);
        assert_eq!(store.get(&key).await.unwrap().unwrap().value, entry("/docs").value);

        let search = CacheKey::search(&conn, "/", &SearchQuery::new("*")).unwrap();
        store.set(&search, entry("/")).await.unwrap();
        store.remove_queries(&conn).await.unwrap();
        assert!(!store.contains(&search).await);
        assert!(store.contains(&key).await);

        store.remove_connection(&conn).await.unwrap();
        assert!(!store.contains(&key).await);
        // Removing twice is fine
        store.remove_connection(&conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::new(temp_dir.path().to_path_buf()).await.unwrap();
        let key = CacheKey::listing(&ConnectionId::new("nas"), "/").unwrap();

        store.set(&key, entry("/")).await.unwrap();
        tokio::fs::write(store.key_to_path(&key), b"{ truncated")
            .await
            .unwrap();

        assert!(store.get(&key).await.unwrap().is_none());
        assert!(!store.contains(&key).await);
    }

    #[tokio::test]
    async fn test_persists_across_restarts() {
        let temp_dir = TempDir::new().unwrap();
        let conn = ConnectionId::new("nas");
        let results = SearchResults {
            root: "/".to_string(),
            query: SearchQuery::new("*.mp3"),
            matches: vec![],
        };

        {
            let disk = Arc::new(DiskStore::new(temp_dir.path().to_path_buf()).await.unwrap());
            let cache = ResultCache::with_tiers(
                Arc::new(crate::cache::MemoryStore::new()),
                Some(disk as Arc<dyn CacheStore>),
                1,
            );
            cache
                .put_search(&conn, results.clone(), Duration::from_secs(60))
                .await
                .unwrap();
        }

        // New process: empty memory tier, same directory
        let disk = Arc::new(DiskStore::new(temp_dir.path().to_path_buf()).await.unwrap());
        let cache = ResultCache::with_tiers(
            Arc::new(crate::cache::MemoryStore::new()),
            Some(disk as Arc<dyn CacheStore>),
            1,
        );
        let cached = cache
            .get_search(&conn, "/", &SearchQuery::new("*.mp3"))
            .await
            .unwrap();
        assert_eq!(cached, Some(results));
    }
}
