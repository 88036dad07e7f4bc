use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::archive::{read_archive, ArchiveItem};
use crate::config::DocvaultConfig;
use crate::error::{DocvaultError, Result};
use crate::repo::digest::{read_delta, read_legacy_delta};
use crate::repo::{BackupInfo, DigestDelta, DomainData, MANIFEST_KEY};
use crate::storage::{self, StorageBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    Updated,
    Removed,
}

impl Change {
    pub fn as_str(self) -> &'static str {
        match self {
            Change::Added => "added",
            Change::Updated => "updated",
            Change::Removed => "removed",
        }
    }
}

/// One recorded change of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentVersion {
    pub date: i64,
    pub domain: String,
    /// Digest file recording the change.
    pub digest: String,
    pub change: Change,
    /// Content hash; empty for removals.
    pub hash: String,
    /// Archive holding this version, when one could be read.
    pub archive: Option<String>,
}

impl DocumentVersion {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.date).single()
    }
}

#[derive(Debug, Clone)]
pub struct FindResult {
    pub id: String,
    /// Oldest first.
    pub versions: Vec<DocumentVersion>,
    /// Newest stored payload, unless the last change removed the document.
    /// Blobs report their metadata only.
    pub latest: Option<Value>,
}

/// Run `docvault find`.
pub fn run(config: &DocvaultConfig, id: &str) -> Result<FindResult> {
    let backend = storage::backend_from_url(&config.repository.url)?;
    find_document(backend.as_ref(), id)
}

fn delta_files(data: &DomainData) -> impl Iterator<Item = (&str, bool)> {
    data.snapshot
        .iter()
        .map(|name| (name.as_str(), true))
        .chain(data.snapshots.iter().map(|name| (name.as_str(), false)))
}

/// Look `id` up in one archive list, returning the archive name and payload.
fn locate(
    storage: &dyn StorageBackend,
    data: &DomainData,
    id: &str,
) -> Option<(String, Value)> {
    for name in &data.storage {
        let mut wanted = HashSet::from([id.to_string()]);
        let mut found = None;
        let read = read_archive(storage, name, &mut wanted, |item| {
            found = Some(match item {
                ArchiveItem::Doc(doc) => serde_json::to_value(&doc)?,
                ArchiveItem::Blob(blob, _) => serde_json::to_value(&blob)?,
            });
            Ok(())
        });
        match read {
            Ok(_) => {
                if let Some(value) = found {
                    return Some((name.clone(), value));
                }
            }
            Err(e) => warn!(archive = %name, "skipping unreadable archive: {e}"),
        }
    }
    None
}

/// Trace a document id through the chain.
///
/// Every snapshot's digests are scanned oldest to newest; additions and
/// updates are matched to the archive of the same snapshot that stores them.
pub fn find_document(storage: &dyn StorageBackend, id: &str) -> Result<FindResult> {
    let info = BackupInfo::load(storage)?
        .ok_or_else(|| DocvaultError::ManifestNotFound(MANIFEST_KEY.to_string()))?;
    let mut result = FindResult {
        id: id.to_string(),
        versions: Vec::new(),
        latest: None,
    };

    for snapshot in &info.snapshots {
        for (domain, data) in &snapshot.domains {
            for (name, legacy) in delta_files(data) {
                let read = if legacy {
                    read_legacy_delta(storage, name)
                } else {
                    read_delta(storage, name)
                };
                let delta: DigestDelta = match read {
                    Ok(delta) => delta,
                    Err(e) => {
                        warn!(file = name, "skipping unreadable digest: {e}");
                        continue;
                    }
                };
                let (change, hash) = if let Some(hash) = delta.added.get(id) {
                    (Change::Added, hash.clone())
                } else if let Some(hash) = delta.updated.get(id) {
                    (Change::Updated, hash.clone())
                } else if delta.removed.iter().any(|r| r == id) {
                    (Change::Removed, String::new())
                } else {
                    continue;
                };

                let mut archive = None;
                if change == Change::Removed {
                    result.latest = None;
                } else if let Some((archive_name, value)) = locate(storage, data, id) {
                    archive = Some(archive_name);
                    result.latest = Some(value);
                }
                debug!(id, date = snapshot.date, change = change.as_str(), "version found");
                result.versions.push(DocumentVersion {
                    date: snapshot.date,
                    domain: domain.clone(),
                    digest: name.to_string(),
                    change,
                    hash,
                    archive,
                });
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Doc, Document};
    use crate::testutil::{quick_backup, MemoryBackend, MemoryStore};

    fn task(id: &str, n: i64) -> Doc {
        Doc::Plain(Document::new(id, "task:class:Task").with_attr("n", n))
    }

    #[test]
    fn traces_every_version() {
        let storage = MemoryBackend::new();
        let store = MemoryStore::new();
        store.put_doc("task", task("t1", 1));
        quick_backup(&storage, &store);
        store.put_doc("task", task("t1", 2));
        quick_backup(&storage, &store);

        let found = find_document(&storage, "t1").unwrap();
        let changes: Vec<Change> = found.versions.iter().map(|v| v.change).collect();
        assert_eq!(changes, vec![Change::Added, Change::Updated]);
        assert!(found.versions.iter().all(|v| v.archive.is_some()));
        assert!(found.versions[0].date < found.versions[1].date);
        assert_eq!(found.latest.unwrap()["n"], 2);
    }

    #[test]
    fn removed_document_has_no_payload() {
        let storage = MemoryBackend::new();
        let store = MemoryStore::new();
        store.put_doc("task", task("t1", 1));
        quick_backup(&storage, &store);
        store.remove_doc("task", "t1");
        quick_backup(&storage, &store);

        let found = find_document(&storage, "t1").unwrap();
        assert_eq!(found.versions.len(), 2);
        let last = &found.versions[1];
        assert_eq!((last.change, last.archive.as_deref()), (Change::Removed, None));
        assert!(found.latest.is_none());
    }

    #[test]
    fn blob_reports_metadata_only() {
        let storage = MemoryBackend::new();
        let store = MemoryStore::new();
        store.put_blob("b1", "application/pdf", vec![1; 32]);
        quick_backup(&storage, &store);

        let found = find_document(&storage, "b1").unwrap();
        assert_eq!(found.versions[0].domain, "blob");
        let latest = found.latest.unwrap();
        assert_eq!(latest["_id"], "b1");
        assert_eq!(latest["size"], 32);
    }

    #[test]
    fn unknown_id_has_no_versions() {
        let storage = MemoryBackend::new();
        let store = MemoryStore::new();
        store.put_doc("task", task("t1", 1));
        quick_backup(&storage, &store);
        let found = find_document(&storage, "nope").unwrap();
        assert!(found.versions.is_empty());
        assert!(found.latest.is_none());
    }
}
