use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::browser::ShareBrowser;
use crate::cache::{CacheStore, MemoryStore, ResultCache};
use crate::config::CoreConfig;
use crate::coordinator::{InProcessLauncher, OperationCoordinator, OperationFuture};
use crate::disk_cache::DiskStore;
use crate::error::Result;
use crate::host::{BackgroundHost, HostPlatform, HostState};
use crate::path;
use crate::storage::RemoteStorage;
use crate::types::{ConnectionDescriptor, OperationId};

/// Process-wide owner of the pipeline.
///
/// Built once at startup with [`ShareCore::init`] and torn down with
/// [`ShareCore::shutdown`]; everything else receives its parts by reference.
pub struct ShareCore {
    config: CoreConfig,
    host: Arc<BackgroundHost>,
    coordinator: OperationCoordinator,
    browser: ShareBrowser,
}

impl ShareCore {
    pub async fn init(
        config: CoreConfig,
        storage: Arc<dyn RemoteStorage>,
        platform: Arc<dyn HostPlatform>,
    ) -> Result<Self> {
        config.validate()?;

        let host = Arc::new(BackgroundHost::new(config.host.clone(), platform));
        let launcher = Arc::new(InProcessLauncher::new(host.clone()));
        let coordinator = OperationCoordinator::new(config.coordinator.clone(), launcher);

        let disk: Option<Arc<dyn CacheStore>> = match &config.cache.disk_dir {
            Some(dir) => Some(Arc::new(DiskStore::new(dir.clone()).await?)),
            None => None,
        };
        let cache = Arc::new(ResultCache::with_tiers(
            Arc::new(MemoryStore::new()),
            disk,
            config.cache.format_version,
        ));
        let browser = ShareBrowser::new(storage.clone(), cache, config.cache.clone());

        info!(
            "Share core initialized over {} (disk cache: {})",
            storage.identifier(),
            config.cache.disk_dir.is_some()
        );
        Ok(Self {
            config,
            host,
            coordinator,
            browser,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<BackgroundHost> {
        &self.host
    }

    pub fn coordinator(&self) -> &OperationCoordinator {
        &self.coordinator
    }

    pub fn browser(&self) -> &ShareBrowser {
        &self.browser
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        self.browser.cache()
    }

    /// Download one file in the background, reporting byte progress
    pub fn download_file(
        &self,
        connection: ConnectionDescriptor,
        remote: &str,
        local: PathBuf,
    ) -> OperationFuture<u64> {
        let browser = self.browser.clone();
        let remote = remote.to_string();
        let label = format!("Downloading {}", path::file_name(&remote));

        self.coordinator
            .submit(OperationId::random(), label, move |ctx| async move {
                ctx.checkpoint()?;
                let name = path::file_name(&remote).to_string();
                let report = |done: u64, total: u64| ctx.report_bytes(done, total, &name);
                let written = browser.download(&connection, &remote, &local, &report).await?;
                ctx.checkpoint()?;
                Ok(written)
            })
    }

    /// Upload `(local, remote)` pairs one after another, reporting per-file progress.
    ///
    /// Cancellation is honoured between files; no progress is reported after it.
    pub fn upload_batch(
        &self,
        connection: ConnectionDescriptor,
        files: Vec<(PathBuf, String)>,
    ) -> OperationFuture<u64> {
        let browser = self.browser.clone();
        let label = format!("Uploading {} files", files.len());

        self.coordinator
            .submit_multi_file(OperationId::random(), label, move |reporter| async move {
                let total = files.len() as u64;
                let mut written = 0;
                for (index, (local, remote)) in files.iter().enumerate() {
                    reporter.checkpoint()?;
                    reporter.report(index as u64 + 1, total, path::file_name(remote));
                    written += browser
                        .upload(&connection, local, remote, &|_, _| {})
                        .await?;
                }
                Ok(written)
            })
    }

    /// Cancel outstanding work, stop the host and drop the in-memory cache
    pub async fn shutdown(&self) -> Result<()> {
        let cancelled = self.coordinator.cancel_pending();
        self.browser.cancel_search();
        self.coordinator.disconnect();

        if self.host.state() != HostState::Stopped {
            self.host.stop()?;
        }
        self.browser.cache().release_memory().await?;

        debug!("Cancelled {} operations on shutdown", cancelled);
        info!("Share core shut down");
        Ok(())
    }
}
