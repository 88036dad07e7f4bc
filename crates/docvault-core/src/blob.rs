use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use blake2::{Blake2s256, Digest as _};
use tracing::{debug, warn};

use crate::error::{DocvaultError, Result};
use crate::model::{BlobDoc, BlobStore};

/// Retention rules for blob payloads.
#[derive(Debug, Clone, Default)]
pub struct BlobPolicy {
    /// Largest payload kept, in bytes. `None` keeps everything.
    pub size_limit: Option<u64>,
    /// Content-type prefixes never kept, e.g. `video/`.
    pub skip_content_types: Vec<String>,
}

impl BlobPolicy {
    pub fn skips_type(&self, content_type: &str) -> bool {
        self.skip_content_types
            .iter()
            .any(|prefix| content_type.starts_with(prefix.as_str()))
    }

    pub fn exceeds_limit(&self, size: u64) -> bool {
        self.size_limit.is_some_and(|limit| size > limit)
    }

    pub fn excludes(&self, content_type: &str, size: u64) -> bool {
        self.skips_type(content_type) || self.exceeds_limit(size)
    }
}

/// Read a blob's bytes, never holding more than `limit + 1` of them.
///
/// A byte count differing from the declared size is logged; the bytes read
/// are still returned.
pub fn download_blob(blobs: &dyn BlobStore, blob: &BlobDoc, limit: Option<u64>) -> Result<Vec<u8>> {
    let reader = blobs.read(&blob.id)?;
    let mut data = Vec::with_capacity(blob.size.min(limit.unwrap_or(u64::MAX)) as usize);
    match limit {
        Some(limit) => {
            reader.take(limit.saturating_add(1)).read_to_end(&mut data)?;
            if data.len() as u64 > limit {
                return Err(DocvaultError::BlobTooLarge {
                    id: blob.id.clone(),
                    size: blob.size.max(data.len() as u64),
                    limit,
                });
            }
        }
        None => {
            let mut reader = reader;
            reader.read_to_end(&mut data)?;
        }
    }

    if data.len() as u64 != blob.size {
        warn!(
            id = %blob.id,
            declared = blob.size,
            actual = data.len(),
            "blob size differs from declared size"
        );
    }
    Ok(data)
}

/// Identity of a blob's content: its etag, or a hash of the bytes when the
/// provider reports none.
pub fn fingerprint(blob: &BlobDoc, data: &[u8]) -> String {
    if blob.etag.is_empty() {
        hex::encode(Blake2s256::digest(data))
    } else {
        blob.etag.clone()
    }
}

/// Write a blob's bytes to the blob store under its id.
pub fn upload_blob(blobs: &dyn BlobStore, blob: &BlobDoc, data: &[u8]) -> Result<()> {
    if data.len() as u64 != blob.size {
        warn!(
            id = %blob.id,
            declared = blob.size,
            actual = data.len(),
            "uploading blob with mismatched size"
        );
    }
    blobs.write(&blob.id, data.len() as u64, &blob.content_type, &mut Cursor::new(data))?;
    debug!(id = %blob.id, size = data.len(), "blob uploaded");
    Ok(())
}

/// Blob ids already uploaded by earlier restore attempts, with the
/// fingerprint of the content written.
#[derive(Debug, Default)]
pub struct UploadHistory {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl UploadHistory {
    /// Open a history file; a missing or unreadable file starts empty.
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read(path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(path = %path.display(), "ignoring unreadable upload history: {e}");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn is_current(&self, id: &str, fingerprint: &str) -> bool {
        self.entries.get(id).is_some_and(|f| f == fingerprint)
    }

    pub fn record(&mut self, id: &str, fingerprint: String) {
        self.entries.insert(id.to_string(), fingerprint);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the history file atomically.
    pub fn save(&self) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&serde_json::to_vec_pretty(&self.entries)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| DocvaultError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryStore;

    fn policy() -> BlobPolicy {
        BlobPolicy {
            size_limit: Some(100),
            skip_content_types: vec!["video/".into(), "image/".into()],
        }
    }

    #[test]
    fn policy_matches_prefixes_and_limit() {
        let p = policy();
        assert!(p.excludes("video/mp4", 1));
        assert!(p.excludes("image/png", 1));
        assert!(!p.excludes("application/pdf", 100));
        assert!(p.excludes("application/pdf", 101));
        assert!(!BlobPolicy::default().excludes("video/mp4", u64::MAX));
    }

    #[test]
    fn download_respects_limit() {
        let store = MemoryStore::new();
        store.put_blob("big", "application/octet-stream", vec![1u8; 150]);
        let meta = BlobDoc::new("big", "application/octet-stream", 150);
        let err = download_blob(&store, &meta, Some(100)).unwrap_err();
        assert!(matches!(err, DocvaultError::BlobTooLarge { limit: 100, .. }));
        assert_eq!(download_blob(&store, &meta, None).unwrap().len(), 150);
    }

    #[test]
    fn short_read_is_still_returned() {
        let store = MemoryStore::new();
        let declared = 5 * 1024 * 1024;
        store.put_blob("doc", "application/pdf", vec![9u8; declared - 1]);
        let meta = BlobDoc::new("doc", "application/pdf", declared as u64);
        let data = download_blob(&store, &meta, Some(declared as u64)).unwrap();
        assert_eq!(data.len(), declared - 1);
    }

    #[test]
    fn fingerprint_prefers_etag() {
        let mut meta = BlobDoc::new("a", "text/plain", 2);
        let computed = fingerprint(&meta, b"hi");
        assert_eq!(computed.len(), 64);
        meta.etag = "etag-1".into();
        assert_eq!(fingerprint(&meta, b"hi"), "etag-1");
    }

    #[test]
    fn history_tracks_uploaded_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let store = MemoryStore::new();
        let meta = BlobDoc::new("a", "text/plain", 2);

        let mut history = UploadHistory::load(&path);
        assert!(history.is_empty());
        upload_blob(&store, &meta, b"hi").unwrap();
        history.record("a", fingerprint(&meta, b"hi"));
        history.save().unwrap();

        let reloaded = UploadHistory::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.is_current("a", &fingerprint(&meta, b"hi")));
        assert!(!reloaded.is_current("a", &fingerprint(&meta, b"ho")));
        assert!(!reloaded.is_current("b", &fingerprint(&meta, b"hi")));
        assert_eq!(store.blob_bytes("a").as_deref(), Some(&b"hi"[..]));
    }

    #[test]
    fn history_save_replaces_the_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("history.json");
        let meta = BlobDoc::new("a", "text/plain", 2);

        let mut first = UploadHistory::load(&path);
        first.record("a", fingerprint(&meta, b"hi"));
        let mut second = UploadHistory::load(&path);
        second.record("b", fingerprint(&meta, b"ho"));
        first.save().unwrap();
        second.save().unwrap();

        let reloaded = UploadHistory::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.is_current("b", &fingerprint(&meta, b"ho")));
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("history.json")]);
    }
}
