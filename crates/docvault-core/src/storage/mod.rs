use std::io::{Read, Write};

use crate::error::{DocvaultError, Result};

pub mod local_backend;

use local_backend::LocalBackend;

/// Write stream handed out by [`StorageBackend::open_write`].
///
/// Nothing is visible under the key until [`StorageWrite::finish`] succeeds;
/// dropping the stream without finishing discards the data.
pub trait StorageWrite: Write + Send {
    /// Commit the written bytes under the key and return how many were written.
    fn finish(self: Box<Self>) -> Result<u64>;
}

/// Byte-addressable backup storage keyed by `/`-separated names.
pub trait StorageBackend: Send + Sync {
    fn exists(&self, key: &str) -> Result<bool>;

    /// Size of the object in bytes, `None` if missing.
    fn stat(&self, key: &str) -> Result<Option<u64>>;

    /// Read a whole object, `None` if missing.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Open a streaming reader, `None` if missing.
    fn open_read(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>>;

    /// Write a whole object, replacing any previous content atomically.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Open a streaming writer for `key`.
    fn open_write(&self, key: &str) -> Result<Box<dyn StorageWrite + '_>>;

    /// Delete an object. Missing objects are not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Delete every object below `prefix` (and `prefix` itself).
    fn delete_recursive(&self, prefix: &str) -> Result<()>;

    /// List object keys starting with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Build a storage backend from a repository URL.
///
/// Bare paths and `file://` URLs resolve to [`LocalBackend`].
pub fn backend_from_url(url: &str) -> Result<Box<dyn StorageBackend>> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(DocvaultError::Config("repository url must not be empty".into()));
    }
    if let Some(path) = trimmed.strip_prefix("file://") {
        return Ok(Box::new(LocalBackend::new(path)?));
    }
    if let Some((scheme, _)) = trimmed.split_once("://") {
        return Err(DocvaultError::UnsupportedBackend(scheme.to_string()));
    }
    Ok(Box::new(LocalBackend::new(trimmed)?))
}
