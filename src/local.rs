use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::{
    control::OperationControl,
    error::{OpsError, Result},
    path,
    storage::{ByteProgress, RemoteStorage},
    types::{
        ConnectionDescriptor, ConnectionId, DirectoryListing, EntryKind, RemoteEntry, SearchQuery,
    },
};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Filesystem-backed storage
///
/// Each connection id is mapped onto a local directory acting as the share root, which
/// is how mounted shares and test fixtures are browsed.
pub struct LocalShareStorage {
    roots: RwLock<HashMap<ConnectionId, PathBuf>>,
    chunk_size: usize,
}

impl LocalShareStorage {
    pub fn new() -> Self {
        Self {
            roots: RwLock::new(HashMap::new()),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Map a connection onto a local root directory
    pub fn mount(&self, connection: ConnectionId, root: PathBuf) {
        self.roots.write().insert(connection, root);
    }

    pub fn unmount(&self, connection: &ConnectionId) {
        self.roots.write().remove(connection);
    }

    /// Translate a share path into a local path under the connection's root
    fn resolve(&self, connection: &ConnectionDescriptor, remote: &str) -> Result<PathBuf> {
        let normalized = path::normalize(remote)?;
        let root = self
            .roots
            .read()
            .get(&connection.id)
            .cloned()
            .ok_or_else(|| OpsError::transport(format!("no share mounted for {}", connection.id)))?;
        Ok(root.join(normalized.trim_start_matches('/')))
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(OpsError::InvalidPath {
                path: name.to_string(),
            });
        }
        Ok(())
    }

    async fn entry_for(local: &Path, remote_dir: &str, name: String) -> Result<RemoteEntry> {
        let metadata = fs::metadata(local).await?;
        Ok(RemoteEntry {
            path: path::join(remote_dir, &name),
            name,
            kind: if metadata.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            },
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    async fn copy_with_progress(
        &self,
        source: &Path,
        destination: &Path,
        source_label: &str,
        progress: ByteProgress<'_>,
    ) -> Result<u64> {
        let mut reader = fs::File::open(source)
            .await
            .map_err(|e| not_found_or_io(e, source_label))?;
        let total = reader.metadata().await?.len();
        let mut writer = fs::File::create(destination).await?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut done = 0u64;
        progress(0, total);
        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read]).await?;
            done += read as u64;
            progress(done, total);
        }
        writer.flush().await?;
        Ok(done)
    }
}

impl Default for LocalShareStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found_or_io(e: std::io::Error, remote: &str) -> OpsError {
    if e.kind() == ErrorKind::NotFound {
        OpsError::NotFound {
            path: remote.to_string(),
        }
    } else {
        OpsError::Io(e)
    }
}

#[async_trait]
impl RemoteStorage for LocalShareStorage {
    async fn connect(&self, connection: &ConnectionDescriptor) -> Result<()> {
        debug!(
            "Connecting {} (encryption required: {}, signing required: {})",
            connection.id,
            connection.security.encryption_required,
            connection.security.signing_required
        );
        let root = self.resolve(connection, "/")?;
        fs::metadata(&root)
            .await
            .map_err(|e| not_found_or_io(e, &connection.share))?;
        Ok(())
    }

    async fn list(&self, connection: &ConnectionDescriptor, dir: &str) -> Result<DirectoryListing> {
        let normalized = path::normalize(dir)?;
        let local = self.resolve(connection, &normalized)?;

        let mut read_dir = fs::read_dir(&local)
            .await
            .map_err(|e| not_found_or_io(e, &normalized))?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(Self::entry_for(&entry.path(), &normalized, name).await?);
        }
        entries.sort_by(|a, b| b.is_dir().cmp(&a.is_dir()).then_with(|| a.name.cmp(&b.name)));

        Ok(DirectoryListing {
            path: normalized,
            entries,
        })
    }

    async fn download(
        &self,
        connection: &ConnectionDescriptor,
        remote: &str,
        local: &Path,
        progress: ByteProgress<'_>,
    ) -> Result<u64> {
        let source = self.resolve(connection, remote)?;
        self.copy_with_progress(&source, local, remote, progress)
            .await
    }

    async fn upload(
        &self,
        connection: &ConnectionDescriptor,
        local: &Path,
        remote: &str,
        progress: ByteProgress<'_>,
    ) -> Result<u64> {
        let destination = self.resolve(connection, remote)?;
        let local_label = local.to_string_lossy().to_string();
        self.copy_with_progress(local, &destination, &local_label, progress)
            .await
    }

    async fn delete(&self, connection: &ConnectionDescriptor, target: &str) -> Result<()> {
        let local = self.resolve(connection, target)?;
        let metadata = fs::metadata(&local)
            .await
            .map_err(|e| not_found_or_io(e, target))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&local).await?;
        } else {
            fs::remove_file(&local).await?;
        }
        Ok(())
    }

    async fn rename(
        &self,
        connection: &ConnectionDescriptor,
        target: &str,
        new_name: &str,
    ) -> Result<()> {
        Self::check_name(new_name)?;
        let normalized = path::normalize(target)?;
        let parent = path::parent(&normalized).ok_or_else(|| OpsError::InvalidPath {
            path: normalized.clone(),
        })?;

        let from = self.resolve(connection, &normalized)?;
        let to = self.resolve(connection, &path::join(&parent, new_name))?;
        fs::metadata(&from)
            .await
            .map_err(|e| not_found_or_io(e, &normalized))?;
        if fs::metadata(&to).await.is_ok() {
            return Err(OpsError::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{} already exists", new_name),
            )));
        }
        fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn create_directory(
        &self,
        connection: &ConnectionDescriptor,
        parent: &str,
        name: &str,
    ) -> Result<()> {
        Self::check_name(name)?;
        let normalized = path::normalize(parent)?;
        let local = self.resolve(connection, &path::join(&normalized, name))?;
        fs::create_dir(&local)
            .await
            .map_err(|e| not_found_or_io(e, &normalized))
    }

    async fn search(
        &self,
        connection: &ConnectionDescriptor,
        root: &str,
        query: &SearchQuery,
        control: &OperationControl,
    ) -> Result<Vec<RemoteEntry>> {
        let matcher = query.matcher();
        let root = path::normalize(root)?;
        let mut pending = vec![root];
        let mut matches = Vec::new();

        while let Some(dir) = pending.pop() {
            control.checkpoint()?;
            let local = self.resolve(connection, &dir)?;
            let mut read_dir = fs::read_dir(&local)
                .await
                .map_err(|e| not_found_or_io(e, &dir))?;

            while let Some(entry) = read_dir.next_entry().await? {
                control.checkpoint()?;
                let name = entry.file_name().to_string_lossy().to_string();
                let found = Self::entry_for(&entry.path(), &dir, name).await?;
                if found.is_dir() && query.include_subdirectories {
                    pending.push(found.path.clone());
                }
                if query.type_filter.accepts(found.kind) && matcher.matches(&found.name) {
                    matches.push(found);
                }
            }
        }

        matches.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(matches)
    }

    fn identifier(&self) -> String {
        format!("local://{} shares", self.roots.read().len())
    }
}
