//! Error types for the contact sync engine

use std::path::PathBuf;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Comprehensive error type for sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Snapshot store errors
    #[error("Snapshot error for '{source_name}' at '{path}': {message}")]
    Snapshot {
        source_name: String,
        path: PathBuf,
        message: String,
    },

    /// A provider failed while fetching or updating
    #[error("Source '{source_name}' failed: {message}")]
    Source { source_name: String, message: String },

    /// Credential check failed
    #[error("Credentials required for '{0}'")]
    Credentials(String),

    /// A sync is still running or draining
    #[error("A sync between '{local}' and '{remote}' is still in progress")]
    SyncInProgress { local: String, remote: String },

    /// Progress reporting errors
    #[error("Progress reporting error: {0}")]
    Progress(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors with context
    #[error("Error: {0}")]
    Generic(#[from] anyhow::Error),

    /// Cancellation error
    #[error("Operation was cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a new snapshot error
    pub fn snapshot_error(
        source_name: impl Into<String>,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Snapshot {
            source_name: source_name.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new provider error
    pub fn source_error(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Short category name, used to bucket errors in metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Snapshot { .. } => "snapshot",
            Self::Source { .. } => "source",
            Self::Credentials(_) => "credentials",
            Self::SyncInProgress { .. } => "sync_in_progress",
            Self::Progress(_) => "progress",
            Self::Config(_) => "config",
            Self::Generic(_) => "generic",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this error is the cooperative cancellation marker
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
