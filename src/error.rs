use thiserror::Error;

/// Errors raised by the operation pipeline and the listing cache
#[derive(Error, Debug)]
pub enum OpsError {
    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Transport failure: {message}")]
    Transport { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Background host unavailable after {attempts} attempts")]
    HostUnavailable { attempts: u32 },

    #[error("Foreground start not allowed: {reason}")]
    StartNotAllowed { reason: String },

    #[error("Background host is not running")]
    HostStopped,

    #[error("Invalid host transition from {from} on {signal}")]
    InvalidTransition { from: String, signal: String },

    #[error("Operation {id} is already submitted")]
    DuplicateOperation { id: String },

    #[error("Operation {id} panicked")]
    OperationPanicked { id: String },

    #[error("Operation result channel closed before delivery")]
    Disconnected,

    #[error("Invalid remote path: {path}")]
    InvalidPath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OpsError {
    pub fn transport(message: impl Into<String>) -> Self {
        OpsError::Transport {
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OpsError::Cancelled)
    }

    /// Transport-level failures are surfaced to the caller and never retried internally
    pub fn is_transport(&self) -> bool {
        matches!(self, OpsError::Transport { .. } | OpsError::Io(_))
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, OpsError>;
