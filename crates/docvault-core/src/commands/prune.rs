use std::collections::BTreeSet;

use tracing::{info, warn};

use super::util::delete_files;
use crate::config::DocvaultConfig;
use crate::error::Result;
use crate::repo::lock::with_lock;
use crate::repo::manifest::parent_dir;
use crate::repo::sizes::rebuild_size_info;
use crate::repo::{BackupInfo, BackupSnapshot};
use crate::storage::{self, StorageBackend};

#[derive(Debug, Default)]
pub struct PruneStats {
    pub snapshots_removed: usize,
    pub snapshots_kept: usize,
    pub files_deleted: usize,
}

/// Run `docvault prune --since`.
pub fn run(config: &DocvaultConfig, since: i64) -> Result<PruneStats> {
    let backend = storage::backend_from_url(&config.repository.url)?;
    remove_snapshots_since(backend.as_ref(), since, config.compression.level)
}

/// Drop every snapshot dated at or after `since`.
///
/// Domain hashes and the transaction marker are cleared, so the next backup
/// compares every domain against the shortened chain.
pub fn remove_snapshots_since(
    storage: &dyn StorageBackend,
    since: i64,
    level: u32,
) -> Result<PruneStats> {
    with_lock(storage, || {
        let mut info = BackupInfo::load_current(storage)?;
        let (kept, removed): (Vec<BackupSnapshot>, Vec<BackupSnapshot>) =
            info.snapshots.drain(..).partition(|s| s.date < since);
        info.snapshots = kept;

        let mut stats = PruneStats {
            snapshots_removed: removed.len(),
            snapshots_kept: info.snapshots.len(),
            ..PruneStats::default()
        };
        if removed.is_empty() {
            info!(since, "no snapshots to prune");
            return Ok(stats);
        }

        info.domain_hashes.clear();
        info.last_tx_id = None;
        info.save(storage, level)?;

        let live_dirs: BTreeSet<&str> = info
            .snapshots
            .iter()
            .flat_map(BackupSnapshot::files)
            .filter_map(parent_dir)
            .collect();
        let files: Vec<&str> = removed.iter().flat_map(BackupSnapshot::files).collect();
        stats.files_deleted = delete_files(storage, files.iter().copied());
        let dead_dirs: BTreeSet<&str> = files
            .iter()
            .filter_map(|name| parent_dir(name))
            .filter(|dir| !live_dirs.contains(dir))
            .collect();
        for dir in dead_dirs {
            if let Err(e) = storage.delete_recursive(dir) {
                warn!(dir, "failed to remove backup directory: {e}");
            }
        }

        let sizes = rebuild_size_info(storage, &info, &[], level)?;
        info.data_size = sizes.data;
        info.blobs_size = sizes.blobs;
        info.backup_size = sizes.total;
        info.save(storage, level)?;

        info!(
            removed = stats.snapshots_removed,
            kept = stats.snapshots_kept,
            files = stats.files_deleted,
            "snapshots pruned"
        );
        Ok(stats)
    })
}
