use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::compress;
use crate::error::Result;
use crate::model::DOMAIN_BLOB;
use crate::repo::manifest::{BackupInfo, MANIFEST_KEY};
use crate::storage::StorageBackend;

/// Cache of data file sizes, keyed by file name.
pub const SIZE_INFO_KEY: &str = "backup.size.gz";

/// Blobs skipped by policy: id -> (content type, size).
pub const BLOB_INFO_KEY: &str = "blob-info.json.gz";

pub type SizeInfo = BTreeMap<String, u64>;
pub type BlobInfo = BTreeMap<String, (String, u64)>;

fn load_gz_map<T: serde::de::DeserializeOwned + Default>(
    storage: &dyn StorageBackend,
    key: &str,
) -> Result<T> {
    match storage.get(key)? {
        Some(data) => match compress::gunzip_json(&data) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(file = key, "ignoring unreadable file: {e}");
                Ok(T::default())
            }
        },
        None => Ok(T::default()),
    }
}

pub fn load_size_info(storage: &dyn StorageBackend) -> Result<SizeInfo> {
    load_gz_map(storage, SIZE_INFO_KEY)
}

pub fn load_blob_info(storage: &dyn StorageBackend) -> Result<BlobInfo> {
    load_gz_map(storage, BLOB_INFO_KEY)
}

pub fn save_blob_info(storage: &dyn StorageBackend, blob_info: &BlobInfo, level: u32) -> Result<()> {
    storage.put(BLOB_INFO_KEY, &compress::gzip_json(blob_info, level)?)
}

/// Size figures derived from the size cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizeSummary {
    /// Every file the manifest references, plus the manifest and blob-info.
    pub files: SizeInfo,
    /// Archives and deltas of ordinary domains.
    pub data: u64,
    /// Archives and deltas of the blob domain.
    pub blobs: u64,
    pub total: u64,
}

/// Recompute backup sizes from the size cache, stat-ing files that are not
/// cached (or listed in `recheck`), then persist the refreshed cache.
pub fn rebuild_size_info(
    storage: &dyn StorageBackend,
    info: &BackupInfo,
    recheck: &[String],
    level: u32,
) -> Result<SizeSummary> {
    let mut sizes = load_size_info(storage)?;
    for name in recheck {
        sizes.remove(name);
    }

    let mut summary = SizeSummary::default();
    let mut fresh = 0usize;
    let mut size_of = |name: &str, force: bool, sizes: &mut SizeInfo| -> u64 {
        let cached = if force { None } else { sizes.get(name).copied() };
        match cached {
            Some(size) => size,
            None => match storage.stat(name) {
                Ok(Some(size)) => {
                    sizes.insert(name.to_string(), size);
                    fresh += 1;
                    size
                }
                Ok(None) => {
                    if !force {
                        warn!(file = name, "referenced file is missing");
                    }
                    0
                }
                Err(e) => {
                    warn!(file = name, "failed to stat file: {e}");
                    0
                }
            },
        }
    };

    for snapshot in &info.snapshots {
        for (domain, data) in &snapshot.domains {
            for name in data.files() {
                let size = size_of(name, false, &mut sizes);
                if domain == DOMAIN_BLOB {
                    summary.blobs += size;
                } else {
                    summary.data += size;
                }
                summary.files.insert(name.to_string(), size);
            }
        }
    }
    for name in [MANIFEST_KEY, BLOB_INFO_KEY] {
        let size = size_of(name, true, &mut sizes);
        if size > 0 {
            summary.files.insert(name.to_string(), size);
        }
    }
    summary.total = summary.files.values().sum();

    // Drop entries for files no longer referenced.
    sizes.retain(|name, _| summary.files.contains_key(name));
    storage.put(SIZE_INFO_KEY, &compress::gzip_json(&sizes, level)?)?;
    info!(files = summary.files.len(), fresh, total = summary.total, "size info rebuilt");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::manifest::{BackupSnapshot, DomainData};
    use crate::testutil::MemoryBackend;

    fn info_with(files: &[(&str, &str)]) -> BackupInfo {
        let mut info = BackupInfo::new("ws");
        let mut snap = BackupSnapshot::new(1);
        for (domain, name) in files {
            snap.domains
                .entry(domain.to_string())
                .or_insert_with(DomainData::default)
                .storage
                .push(name.to_string());
        }
        info.snapshots.push(snap);
        info
    }

    #[test]
    fn splits_blob_and_data_sizes() {
        let storage = MemoryBackend::new();
        storage.put("000001/task-data.tar.gz", &[0u8; 100]).unwrap();
        storage.put("000001/blob-data.tar.gz", &[0u8; 40]).unwrap();
        let info = info_with(&[
            ("task", "000001/task-data.tar.gz"),
            (DOMAIN_BLOB, "000001/blob-data.tar.gz"),
        ]);

        let summary = rebuild_size_info(&storage, &info, &[], 6).unwrap();
        assert_eq!(summary.data, 100);
        assert_eq!(summary.blobs, 40);
        assert_eq!(summary.total, 140);
        assert_eq!(load_size_info(&storage).unwrap().len(), 2);
    }

    #[test]
    fn cached_sizes_are_trusted_until_rechecked() {
        let storage = MemoryBackend::new();
        let name = "000001/task-data.tar.gz";
        storage.put(name, &[0u8; 10]).unwrap();
        let info = info_with(&[("task", name)]);
        rebuild_size_info(&storage, &info, &[], 6).unwrap();

        storage.put(name, &[0u8; 25]).unwrap();
        assert_eq!(rebuild_size_info(&storage, &info, &[], 6).unwrap().data, 10);
        let summary = rebuild_size_info(&storage, &info, &[name.to_string()], 6).unwrap();
        assert_eq!(summary.data, 25);
    }

    #[test]
    fn manifest_is_always_restated() {
        let storage = MemoryBackend::new();
        let info = BackupInfo::new("ws");
        info.save(&storage, 6).unwrap();
        let first = rebuild_size_info(&storage, &info, &[], 6).unwrap();
        assert!(first.files.contains_key(MANIFEST_KEY));
        assert_eq!(first.data + first.blobs, 0);
    }

    #[test]
    fn unreadable_blob_info_defaults_to_empty() {
        let storage = MemoryBackend::new();
        storage.put(BLOB_INFO_KEY, b"not gzip").unwrap();
        assert!(load_blob_info(&storage).unwrap().is_empty());

        let mut report = BlobInfo::new();
        report.insert("b1".into(), ("video/mp4".into(), 10));
        save_blob_info(&storage, &report, 6).unwrap();
        assert_eq!(load_blob_info(&storage).unwrap(), report);
    }
}
