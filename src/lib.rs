pub mod browser;
pub mod cache;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod disk_cache;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod local;
pub mod logging;
pub mod path;
pub mod progress;
pub mod storage;
pub mod types;

pub use browser::{CacheUpdate, ShareBrowser};
pub use cache::{CacheEntry, CacheKey, CacheStore, CachedResult, MemoryStore, NoCache, ResultCache};
pub use config::{CacheConfig, CoordinatorConfig, CoreConfig, HostConfig};
pub use control::OperationControl;
pub use coordinator::{
    FileReporter, HostLauncher, InProcessLauncher, OperationContext, OperationCoordinator,
    OperationFuture,
};
pub use disk_cache::DiskStore;
pub use error::{OpsError, Result};
pub use host::{BackgroundHost, HeadlessPlatform, HostPlatform, HostSignal, HostState, HostStatus};
pub use lifecycle::ShareCore;
pub use local::LocalShareStorage;
pub use logging::init_logging;
pub use progress::{Completion, ProgressEvent, ProgressUpdate};
pub use storage::{ByteProgress, RemoteStorage};
pub use types::{
    ConnectionDescriptor, ConnectionId, Credentials, DirectoryListing, EntryKind, OperationId,
    OperationState, Outcome, RemoteEntry, SearchQuery, SearchResults, TransportSecurity,
    TypeFilter,
};
