/// Integration tests for the share operation pipeline
///
/// These tests drive the public API end to end against an in-memory share

use share_ops::{
    BackgroundHost, ByteProgress, ConnectionDescriptor, ConnectionId, CoordinatorConfig,
    CoreConfig, DirectoryListing, EntryKind, HeadlessPlatform, HostConfig, HostLauncher,
    OperationControl, OperationCoordinator, OperationId, OpsError, ProgressEvent, RemoteEntry,
    RemoteStorage, ResultCache, SearchQuery, ShareCore,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

// Mock share for testing without a network
#[derive(Default)]
struct MockShareStorage {
    dirs: parking_lot::Mutex<HashMap<(String, String), Vec<RemoteEntry>>>,
    list_calls: AtomicUsize,
    uploads: AtomicUsize,
    upload_delay: Option<Duration>,
    hold_lists: AtomicBool,
    release: Notify,
}

impl MockShareStorage {
    fn add_directory(&self, conn: &str, path: &str, names: &[&str]) {
        let entries = names
            .iter()
            .map(|name| RemoteEntry {
                name: name.to_string(),
                path: format!("{}/{}", path.trim_end_matches('/'), name),
                kind: EntryKind::File,
                size: 10,
                modified: None,
            })
            .collect();
        self.dirs
            .lock()
            .insert((conn.to_string(), path.to_string()), entries);
    }
}

#[async_trait::async_trait]
impl RemoteStorage for MockShareStorage {
    async fn list(
        &self,
        connection: &ConnectionDescriptor,
        path: &str,
    ) -> share_ops::Result<DirectoryListing> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold_lists.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.dirs
            .lock()
            .get(&(connection.id.as_str().to_string(), path.to_string()))
            .map(|entries| DirectoryListing {
                path: path.to_string(),
                entries: entries.clone(),
            })
            .ok_or_else(|| OpsError::NotFound {
                path: path.to_string(),
            })
    }

    async fn download(
        &self,
        _connection: &ConnectionDescriptor,
        _remote: &str,
        _local: &Path,
        progress: ByteProgress<'_>,
    ) -> share_ops::Result<u64> {
        progress(500, 1000);
        tokio::time::sleep(Duration::from_millis(50)).await;
        progress(999, 1000);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(1000)
    }

    async fn upload(
        &self,
        _connection: &ConnectionDescriptor,
        _local: &Path,
        _remote: &str,
        progress: ByteProgress<'_>,
    ) -> share_ops::Result<u64> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay).await;
        }
        progress(10, 10);
        Ok(10)
    }

    async fn delete(
        &self,
        _connection: &ConnectionDescriptor,
        _path: &str,
    ) -> share_ops::Result<()> {
        Ok(())
    }

    async fn rename(
        &self,
        _connection: &ConnectionDescriptor,
        _path: &str,
        _new_name: &str,
    ) -> share_ops::Result<()> {
        Ok(())
    }

    async fn create_directory(
        &self,
        _connection: &ConnectionDescriptor,
        _parent: &str,
        _name: &str,
    ) -> share_ops::Result<()> {
        Ok(())
    }

    async fn search(
        &self,
        _connection: &ConnectionDescriptor,
        _root: &str,
        _query: &SearchQuery,
        control: &OperationControl,
    ) -> share_ops::Result<Vec<RemoteEntry>> {
        control.checkpoint()?;
        Ok(vec![])
    }

    fn identifier(&self) -> String {
        "mock".to_string()
    }
}

fn fast_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.host.status_interval_ms = 20;
    config.coordinator.rebind_delay_ms = 50;
    config
}

async fn core_with(storage: &Arc<MockShareStorage>, config: CoreConfig) -> ShareCore {
    ShareCore::init(config, storage.clone(), Arc::new(HeadlessPlatform))
        .await
        .unwrap()
}

fn listing(path: &str, names: &[&str]) -> DirectoryListing {
    DirectoryListing {
        path: path.to_string(),
        entries: names
            .iter()
            .map(|name| RemoteEntry {
                name: name.to_string(),
                path: format!("{}/{}", path, name),
                kind: EntryKind::File,
                size: 1,
                modified: None,
            })
            .collect(),
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_connections_never_share_entries() {
    let cache = ResultCache::new(1);
    let a = ConnectionId::new("conn-a");
    let b = ConnectionId::new("conn-b");

    cache
        .put(&a, "/docs", listing("/docs", &["secret.txt"]), Duration::from_secs(60))
        .await
        .unwrap();

    assert!(cache.get(&b, "/docs").await.unwrap().is_none());
    assert_eq!(
        cache.get(&a, "/docs").await.unwrap(),
        Some(listing("/docs", &["secret.txt"]))
    );
}

#[tokio::test]
async fn test_invalidated_path_misses_before_expiry() {
    let cache = ResultCache::new(1);
    let conn = ConnectionId::new("nas");
    cache
        .put(&conn, "/docs/reports", listing("/docs/reports", &["q1"]), Duration::from_secs(3600))
        .await
        .unwrap();
    cache
        .put(&conn, "/docs", listing("/docs", &["reports"]), Duration::from_secs(3600))
        .await
        .unwrap();

    cache.invalidate_path(&conn, "/docs/reports").await.unwrap();

    assert!(cache.get(&conn, "/docs/reports").await.unwrap().is_none());
    assert!(cache.get(&conn, "/docs").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stale_generation_refresh_leaves_cache_untouched() {
    let storage = Arc::new(MockShareStorage::default());
    storage.add_directory("nas", "/docs", &["a.txt"]);
    let mut config = fast_config();
    config.cache.revalidate_after_secs = 0;
    let core = core_with(&storage, config).await;
    let conn = ConnectionDescriptor::new("nas", "nas.local", "public");
    let mut updates = core.browser().subscribe_updates();

    core.browser().list(&conn, "/docs").await.unwrap();

    storage.hold_lists.store(true, Ordering::SeqCst);
    storage.add_directory("nas", "/docs", &["a.txt", "b.txt"]);
    let served = core.browser().list(&conn, "/docs").await.unwrap();
    assert_eq!(served.entries.len(), 1);
    wait_until(|| storage.list_calls.load(Ordering::SeqCst) == 2).await;

    // A search cancellation happens while the refresh is on the wire
    core.browser().cancel_search();
    storage.release.notify_one();
    wait_until(|| core.browser().revalidations_in_flight() == 0).await;

    assert!(updates.try_recv().is_err());
    let cached = core.cache().get(&conn.id, "/docs").await.unwrap().unwrap();
    assert_eq!(cached.entries.len(), 1);
}

#[tokio::test]
async fn test_background_refresh_publishes_changed_listing() {
    let storage = Arc::new(MockShareStorage::default());
    storage.add_directory("nas", "/music", &["a.mp3"]);
    let mut config = fast_config();
    config.cache.revalidate_after_secs = 0;
    let core = core_with(&storage, config).await;
    let conn = ConnectionDescriptor::new("nas", "nas.local", "public");
    let mut updates = core.browser().subscribe_updates();

    core.browser().list(&conn, "/music").await.unwrap();
    storage.add_directory("nas", "/music", &["a.mp3", "b.mp3"]);

    let served = core.browser().list(&conn, "/music").await.unwrap();
    assert_eq!(served.entries.len(), 1);

    let update = tokio::time::timeout(Duration::from_secs(1), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.path, "/music");
    assert_eq!(update.listing.entries.len(), 2);
}

/// Start always refused, bind only works after the host "comes back"
struct LateHostLauncher {
    host: Arc<BackgroundHost>,
    available_at: Instant,
    binds: AtomicUsize,
}

#[async_trait::async_trait]
impl HostLauncher for LateHostLauncher {
    async fn start(&self) -> share_ops::Result<()> {
        Err(OpsError::StartNotAllowed {
            reason: "app in background".to_string(),
        })
    }

    async fn bind(&self) -> share_ops::Result<Arc<BackgroundHost>> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        if Instant::now() < self.available_at {
            return Err(OpsError::transport("service not bound yet"));
        }
        self.host.launch(false)?;
        Ok(self.host.clone())
    }
}

#[tokio::test]
async fn test_operation_survives_disconnected_host() {
    let host = Arc::new(BackgroundHost::new(
        HostConfig::default(),
        Arc::new(HeadlessPlatform),
    ));
    let launcher = Arc::new(LateHostLauncher {
        host: host.clone(),
        available_at: Instant::now() + Duration::from_millis(500),
        binds: AtomicUsize::new(0),
    });
    let coordinator = OperationCoordinator::new(
        CoordinatorConfig {
            rebind_delay_ms: 2000,
            ..CoordinatorConfig::default()
        },
        launcher.clone(),
    );

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_millis(3500),
        coordinator.submit(OperationId::new("sync"), "Sync", |_ctx| async { Ok(42) }),
    )
    .await
    .expect("operation did not complete within the retry window")
    .unwrap();

    assert_eq!(outcome.completed(), Some(42));
    assert!(started.elapsed() >= Duration::from_millis(2000));
    assert_eq!(launcher.binds.load(Ordering::SeqCst), 2);
    assert!(!host.is_foreground());
}

#[tokio::test]
async fn test_download_near_end_reports_full_percent() {
    let storage = Arc::new(MockShareStorage::default());
    let core = core_with(&storage, fast_config()).await;
    let conn = ConnectionDescriptor::new("nas", "nas.local", "public");
    let mut status = core.host().subscribe();

    let outcome = core
        .download_file(conn, "/videos/f.bin", PathBuf::from("/tmp/f.bin"))
        .await
        .unwrap();
    assert_eq!(outcome.completed(), Some(1000));

    let mut byte_percents = Vec::new();
    while let Ok(Ok(update)) =
        tokio::time::timeout(Duration::from_millis(200), status.recv()).await
    {
        if let Some(ProgressEvent::Bytes { percent, .. }) = update.event {
            byte_percents.push(percent);
        }
    }
    assert_eq!(byte_percents.last(), Some(&100));
    assert!(!byte_percents.contains(&99));
    assert!(byte_percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(core.host().active_operations(), 0);
}

#[tokio::test]
async fn test_cancel_mid_batch_upload() {
    let storage = Arc::new(MockShareStorage {
        upload_delay: Some(Duration::from_millis(10)),
        ..MockShareStorage::default()
    });
    let core = core_with(&storage, fast_config()).await;
    let conn = ConnectionDescriptor::new("nas", "nas.local", "public");
    let mut status = core.host().subscribe();

    let files = (1..=50)
        .map(|i| (PathBuf::from(format!("/tmp/f{}.bin", i)), format!("/up/f{}.bin", i)))
        .collect();
    let upload = core.upload_batch(conn, files);
    let id = upload.id().clone();

    wait_until(|| storage.uploads.load(Ordering::SeqCst) >= 10).await;
    assert!(core.coordinator().cancel(&id));
    let cancelled_at = storage.uploads.load(Ordering::SeqCst) as u64;

    let outcome = upload.await.unwrap();
    assert!(outcome.is_cancelled());

    let mut file_events = Vec::new();
    while let Ok(Ok(update)) =
        tokio::time::timeout(Duration::from_millis(200), status.recv()).await
    {
        if let Some(ProgressEvent::Files { current, .. }) = update.event {
            file_events.push(current);
        }
    }
    assert!(file_events.iter().all(|&current| current <= cancelled_at));
    assert_eq!(storage.uploads.load(Ordering::SeqCst) as u64, cancelled_at);
    assert!(!core.host().holds_keep_alive());
}

#[tokio::test]
async fn test_config_file_drives_core() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("share-ops.json");
    let json = r#"{
        "cache": { "listing_ttl_secs": 1 },
        "coordinator": { "max_concurrent_operations": 1 }
    }"#;
    tokio::fs::write(&path, json).await.unwrap();

    let config = assert_ok!(CoreConfig::from_file(&path).await);
    assert_eq!(config.cache.listing_ttl_secs, 1);
    assert_eq!(config.coordinator.max_concurrent_operations, 1);
    assert_eq!(config.coordinator.max_bind_attempts, 3);

    let mut broken = config.clone();
    broken.cache.search_ttl_secs = 0;
    assert!(matches!(
        assert_err!(broken.validate()),
        OpsError::InvalidConfig { .. }
    ));

    let storage = Arc::new(MockShareStorage::default());
    storage.add_directory("nas", "/", &["a"]);
    let core = core_with(&storage, config).await;
    let conn = ConnectionDescriptor::new("nas", "nas.local", "public");

    core.browser().list(&conn, "/").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    core.browser().list(&conn, "/").await.unwrap();
    assert_eq!(storage.list_calls.load(Ordering::SeqCst), 2);
}
