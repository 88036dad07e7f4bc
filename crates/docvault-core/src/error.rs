use thiserror::Error;

pub type Result<T> = std::result::Result<T, DocvaultError>;

#[derive(Debug, Error)]
pub enum DocvaultError {
    #[error("no backup manifest found at '{0}'")]
    ManifestNotFound(String),

    #[error("unsupported backup format version: '{0}' (run a backup to upgrade it)")]
    UnsupportedVersion(String),

    #[error("snapshot not found for date {0}")]
    SnapshotNotFound(i64),

    #[error("invalid backup format: {0}")]
    InvalidFormat(String),

    #[error("corrupt archive '{name}': {reason}")]
    ArchiveCorrupt { name: String, reason: String },

    #[error("corrupt digest file '{name}': {reason}")]
    DigestCorrupt { name: String, reason: String },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("blob '{id}' is {size} bytes, above the {limit} byte limit")]
    BlobTooLarge { id: String, size: u64, limit: u64 },

    #[error("live store error: {0}")]
    Store(String),

    #[error("blob storage error: {0}")]
    BlobStore(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup is locked by another process (lock: {0})")]
    Locked(String),

    #[error("operation interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}
