use chrono::{DateTime, TimeZone, Utc};

use crate::config::DocvaultConfig;
use crate::error::{DocvaultError, Result};
use crate::repo::{BackupInfo, MANIFEST_KEY};
use crate::storage::{self, StorageBackend};

/// One domain's share of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSummary {
    pub domain: String,
    pub archives: usize,
    pub digests: usize,
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    /// Milliseconds since the Unix epoch; identifies the snapshot.
    pub date: i64,
    pub compacting: bool,
    pub domains: Vec<DomainSummary>,
}

impl SnapshotSummary {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.date).single()
    }

    pub fn archives(&self) -> usize {
        self.domains.iter().map(|d| d.archives).sum()
    }

    pub fn changes(&self) -> u64 {
        self.domains
            .iter()
            .map(|d| d.added + d.updated + d.removed)
            .sum()
    }
}

/// Run `docvault list`.
pub fn run(config: &DocvaultConfig) -> Result<Vec<SnapshotSummary>> {
    let backend = storage::backend_from_url(&config.repository.url)?;
    list_snapshots(backend.as_ref())
}

/// Snapshots of the chain, oldest first. Readable for any manifest version.
pub fn list_snapshots(storage: &dyn StorageBackend) -> Result<Vec<SnapshotSummary>> {
    let info = BackupInfo::load(storage)?
        .ok_or_else(|| DocvaultError::ManifestNotFound(MANIFEST_KEY.to_string()))?;
    Ok(info
        .snapshots
        .iter()
        .map(|snapshot| SnapshotSummary {
            date: snapshot.date,
            compacting: snapshot.compacting,
            domains: snapshot
                .domains
                .iter()
                .map(|(domain, data)| DomainSummary {
                    domain: domain.clone(),
                    archives: data.storage.len(),
                    digests: data.snapshots.len() + usize::from(data.snapshot.is_some()),
                    added: data.added,
                    updated: data.updated,
                    removed: data.removed,
                })
                .collect(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Doc, Document};
    use crate::testutil::{quick_backup, MemoryBackend, MemoryStore};

    #[test]
    fn lists_every_snapshot_in_order() {
        let storage = MemoryBackend::new();
        let store = MemoryStore::new();
        store.put_doc("task", Doc::Plain(Document::new("t1", "task:class:Task")));
        quick_backup(&storage, &store);
        store.put_doc("contact", Doc::Plain(Document::new("c1", "contact:class:Person")));
        store.remove_doc("task", "t1");
        quick_backup(&storage, &store);

        let list = list_snapshots(&storage).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].date < list[1].date);
        assert_eq!(list[0].domains.len(), 1);
        assert_eq!(list[0].changes(), 1);

        let second: Vec<&str> = list[1].domains.iter().map(|d| d.domain.as_str()).collect();
        assert_eq!(second, vec!["contact", "task"]);
        let task = &list[1].domains[1];
        assert_eq!((task.archives, task.digests, task.removed), (0, 1, 1));
        assert!(list[1].time().is_some());
    }

    #[test]
    fn missing_manifest_is_reported() {
        let storage = MemoryBackend::new();
        assert!(matches!(
            list_snapshots(&storage),
            Err(DocvaultError::ManifestNotFound(_))
        ));
    }
}
