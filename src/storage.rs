use std::path::Path;

use async_trait::async_trait;

use crate::{
    control::OperationControl,
    error::Result,
    path,
    types::{ConnectionDescriptor, DirectoryListing, RemoteEntry, SearchQuery},
};

/// Byte progress callback: `(bytes_done, bytes_total)`
pub type ByteProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Remote share operations consumed by the pipeline
///
/// Implementors own the wire protocol. Paths are normalized share paths; every call carries
/// the full connection descriptor so implementations can key sessions by `ConnectionId`
/// and apply its transport security settings when connecting.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Establish or validate a session for the connection
    ///
    /// Default implementation does nothing
    async fn connect(&self, _connection: &ConnectionDescriptor) -> Result<()> {
        Ok(())
    }

    /// List a directory, entries in a stable order
    ///
    /// Returns `OpsError::NotFound` if the directory doesn't exist
    async fn list(&self, connection: &ConnectionDescriptor, path: &str)
        -> Result<DirectoryListing>;

    /// Copy a remote file to `local`, returning bytes written
    async fn download(
        &self,
        connection: &ConnectionDescriptor,
        remote: &str,
        local: &Path,
        progress: ByteProgress<'_>,
    ) -> Result<u64>;

    /// Copy `local` to a remote file, returning bytes written
    async fn upload(
        &self,
        connection: &ConnectionDescriptor,
        local: &Path,
        remote: &str,
        progress: ByteProgress<'_>,
    ) -> Result<u64>;

    /// Delete a file or a directory tree
    async fn delete(&self, connection: &ConnectionDescriptor, path: &str) -> Result<()>;

    /// Rename an entry inside its directory
    async fn rename(
        &self,
        connection: &ConnectionDescriptor,
        path: &str,
        new_name: &str,
    ) -> Result<()>;

    async fn create_directory(
        &self,
        connection: &ConnectionDescriptor,
        parent: &str,
        name: &str,
    ) -> Result<()>;

    /// Find entries under `root` whose names match the query.
    ///
    /// Implementations check `control` while traversing and stop with
    /// `OpsError::Cancelled` when it is set.
    async fn search(
        &self,
        connection: &ConnectionDescriptor,
        root: &str,
        query: &SearchQuery,
        control: &OperationControl,
    ) -> Result<Vec<RemoteEntry>>;

    /// Get a human-readable identifier for this storage (for logging/debugging)
    fn identifier(&self) -> String;

    /// Check if an entry exists
    ///
    /// Default implementation lists the parent directory
    async fn exists(&self, connection: &ConnectionDescriptor, entry: &str) -> bool {
        let Some(parent) = path::parent(entry) else {
            return true;
        };
        match self.list(connection, &parent).await {
            Ok(listing) => listing.entries.iter().any(|e| e.path == entry),
            Err(_) => false,
        }
    }
}
