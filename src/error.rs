// Policy engine error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("Archive already in progress for {0}")]
    AlreadyInProgress(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Cross-device operation rejected: {0}")]
    CrossDevice(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transient I/O error: {0}")]
    IoTransient(String),

    #[error("Fatal I/O error: {0}")]
    IoFatal(String),

    #[error("Database write conflict: {0}")]
    DbConflict(String),

    #[error("Database schema mismatch: {0}")]
    DbSchemaMismatch(String),

    #[error("No backup available for {0}")]
    NoBackup(String),

    #[error("Filesystem identity changed: {0}")]
    FsIdentityChanged(String),

    /// The filesystem copy changed between the status check that started a
    /// recover and the restore completing -- the restored copy no longer
    /// matches what the catalog believes is on disk.
    #[error("Entry {0} drifted during recovery: {1}")]
    Delta(String, String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for PolicyError {
    fn from(err: anyhow::Error) -> Self {
        PolicyError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PolicyError>;

impl PolicyError {
    /// Transient errors cause the pipeline stage to retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, PolicyError::IoTransient(_) | PolicyError::DbConflict(_))
    }

    /// Fatal errors trigger process shutdown rather than per-entry handling.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PolicyError::FsIdentityChanged(_) | PolicyError::DbSchemaMismatch(_)
        )
    }
}
