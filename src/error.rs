use thiserror::Error;

/// Errors surfaced by the persistence layer (storage engine + per-store operations).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid message: {0}")]
    Validation(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("failed to {action}: {source}")]
    Context {
        action: String,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    pub fn context(self, action: impl Into<String>) -> Self {
        StorageError::Context {
            action: action.into(),
            source: Box::new(self),
        }
    }
}

/// Errors from the detector's check pipeline. Most checks never return these —
/// a failing external call is recorded in the `CheckResponse.error` field instead
/// and the check defaults to "ham" per the propagation policy.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("detector has no loaded samples")]
    NoSamples,
}

/// Errors from the admin/report command handler.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("reply target not found")]
    NoReplyTarget,
    #[error("rate limited")]
    RateLimited,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// Errors talking to the chat platform. Never fatal to the event loop — callers
/// log and continue per the error propagation policy in the design doc.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited, retry after {0}s")]
    RetryAfter(u64),
    #[error("api error: {0}")]
    Api(String),
}

/// Errors from the one-shot file-to-database migration and the backup rotator.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
