use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use super::collect::Changes;
use crate::archive::{read_archive, ArchiveItem};
use crate::context::RunContext;
use crate::error::{DocvaultError, Result};
use crate::model::{Doc, DocInfo, WorkspaceStore};
use crate::repo::BackupSnapshot;
use crate::storage::StorageBackend;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct VerifyStats {
    pub checked: usize,
    pub mismatched: usize,
    pub unresolved: usize,
}

/// Compare archived copies against the live documents and move every
/// mismatch from `unchanged` to `updated`.
fn compare_batch(
    store: &dyn WorkspaceStore,
    domain: &str,
    archived: &mut Vec<Doc>,
    changes: &mut Changes,
    stats: &mut VerifyStats,
) -> Result<()> {
    if archived.is_empty() {
        return Ok(());
    }
    let ids: Vec<String> = archived.iter().map(|d| d.id().to_string()).collect();
    let live: HashMap<String, Doc> = store
        .load_docs(domain, &ids)?
        .into_iter()
        .map(|d| (d.id().to_string(), d))
        .collect();

    for doc in archived.drain(..) {
        stats.checked += 1;
        // Gone since the listing: the next pass records the removal.
        let Some(current) = live.get(doc.id()) else {
            continue;
        };
        if !doc.content_eq(current) {
            if let Some(hash) = changes.unchanged.remove(doc.id()) {
                stats.mismatched += 1;
                changes.updated.push(DocInfo::new(doc.id(), hash));
            }
        }
    }
    Ok(())
}

/// Deep-compare every unchanged document of `domain` with its newest archived
/// copy. Documents that differ, and documents no archive could produce, are
/// reclassified as updates.
pub(crate) fn full_verify(
    ctx: &RunContext,
    storage: &dyn StorageBackend,
    store: &dyn WorkspaceStore,
    snapshots: &[BackupSnapshot],
    domain: &str,
    changes: &mut Changes,
    batch_size: usize,
) -> Result<VerifyStats> {
    let mut stats = VerifyStats::default();
    let mut wanted: HashSet<String> = changes.unchanged.keys().cloned().collect();
    let mut archived: Vec<Doc> = Vec::new();
    let batch_size = batch_size.max(1);

    'snapshots: for snapshot in snapshots.iter().rev() {
        let Some(data) = snapshot.domains.get(domain) else {
            continue;
        };
        for name in &data.storage {
            if wanted.is_empty() {
                break 'snapshots;
            }
            ctx.check()?;
            let read = read_archive(storage, name, &mut wanted, |item| {
                ctx.tick();
                if let ArchiveItem::Doc(doc) = item {
                    archived.push(doc);
                    if archived.len() >= batch_size {
                        compare_batch(store, domain, &mut archived, changes, &mut stats)?;
                    }
                }
                Ok(())
            });
            match read {
                Ok(_) => {}
                Err(e @ DocvaultError::ArchiveCorrupt { .. }) => {
                    warn!(domain, archive = %name, "skipping archive during verify: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }
    compare_batch(store, domain, &mut archived, changes, &mut stats)?;

    let mut unresolved: Vec<String> = wanted.into_iter().collect();
    unresolved.sort();
    for id in unresolved {
        if let Some(hash) = changes.unchanged.remove(&id) {
            stats.unresolved += 1;
            changes.updated.push(DocInfo::new(id, hash));
        }
    }

    if stats.mismatched > 0 || stats.unresolved > 0 {
        info!(
            domain,
            checked = stats.checked,
            mismatched = stats.mismatched,
            unresolved = stats.unresolved,
            "full verify reclassified documents"
        );
    }
    Ok(stats)
}
