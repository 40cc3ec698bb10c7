use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OpsError, Result};

/// Settings for the background host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Minimum spacing between two visible status updates
    pub status_interval_ms: u64,
    /// Upper bound passed to the platform when taking the keep-alive lock
    pub keep_alive_timeout_secs: u64,
    /// Host-imposed foreground budget; the host stops itself when it runs out
    pub foreground_budget_secs: Option<u64>,
    /// Remaining-bytes threshold under which a transfer is shown as 100%
    pub completion_threshold_bytes: u64,
    /// Capacity of the status broadcast channel
    pub status_channel_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: 1000,
            keep_alive_timeout_secs: 10 * 60,
            foreground_budget_secs: None,
            completion_threshold_bytes: 1024,
            status_channel_capacity: 64,
        }
    }
}

impl HostConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    pub fn foreground_budget(&self) -> Option<Duration> {
        self.foreground_budget_secs.map(Duration::from_secs)
    }
}

/// Settings for the operation coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Wait between two host connection attempts
    pub rebind_delay_ms: u64,
    pub max_bind_attempts: u32,
    /// Operation bodies allowed to run at once
    pub max_concurrent_operations: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            rebind_delay_ms: 2000,
            max_bind_attempts: 3,
            max_concurrent_operations: 3,
        }
    }
}

impl CoordinatorConfig {
    pub fn rebind_delay(&self) -> Duration {
        Duration::from_millis(self.rebind_delay_ms)
    }
}

/// Settings for the listing/search cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub listing_ttl_secs: u64,
    pub search_ttl_secs: u64,
    /// Minimum age since the last background refresh before another is scheduled
    pub revalidate_after_secs: u64,
    /// Bumping this silently invalidates every stored entry
    pub format_version: u32,
    /// Persistent tier location; memory only when unset
    pub disk_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            listing_ttl_secs: 5 * 60,
            search_ttl_secs: 10 * 60,
            revalidate_after_secs: 2 * 60,
            format_version: 1,
            disk_dir: None,
        }
    }
}

impl CacheConfig {
    pub fn listing_ttl(&self) -> Duration {
        Duration::from_secs(self.listing_ttl_secs)
    }

    pub fn search_ttl(&self) -> Duration {
        Duration::from_secs(self.search_ttl_secs)
    }

    pub fn revalidate_after(&self) -> Duration {
        Duration::from_secs(self.revalidate_after_secs)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub host: HostConfig,
    pub coordinator: CoordinatorConfig,
    pub cache: CacheConfig,
    /// Default tracing directive when `RUST_LOG` is unset
    pub log_filter: Option<String>,
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.host.status_interval_ms == 0, "host.status_interval_ms must be > 0"),
            (self.host.status_channel_capacity == 0, "host.status_channel_capacity must be > 0"),
            (
                self.host.foreground_budget_secs == Some(0),
                "host.foreground_budget_secs must be > 0",
            ),
            (self.coordinator.max_bind_attempts == 0, "coordinator.max_bind_attempts must be > 0"),
            (
                self.coordinator.max_concurrent_operations == 0,
                "coordinator.max_concurrent_operations must be > 0",
            ),
            (self.cache.listing_ttl_secs == 0, "cache.listing_ttl_secs must be > 0"),
            (self.cache.search_ttl_secs == 0, "cache.search_ttl_secs must be > 0"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(OpsError::InvalidConfig {
                message: message.to_string(),
            }),
            None => Ok(()),
        }
    }
}
