use chrono::{DateTime, TimeZone, Utc};

use crate::config::DocvaultConfig;
use crate::error::{DocvaultError, Result};
use crate::repo::sizes::{load_blob_info, rebuild_size_info, SizeSummary};
use crate::repo::{BackupInfo, MANIFEST_KEY};
use crate::storage::{self, StorageBackend};

/// Backup statistics for the `size` command.
#[derive(Debug, Clone)]
pub struct SizeReport {
    pub workspace: String,
    pub version: String,
    pub snapshot_count: usize,
    pub last_snapshot_time: Option<DateTime<Utc>>,
    pub sizes: SizeSummary,
    /// Blobs excluded by policy, and their total declared size.
    pub skipped_blobs: usize,
    pub skipped_blob_bytes: u64,
}

/// Run `docvault size`.
pub fn run(config: &DocvaultConfig) -> Result<SizeReport> {
    let backend = storage::backend_from_url(&config.repository.url)?;
    backup_size(backend.as_ref(), config.compression.level)
}

/// Size the backup from the size cache, stat-ing only uncached files.
pub fn backup_size(storage: &dyn StorageBackend, level: u32) -> Result<SizeReport> {
    let info = BackupInfo::load(storage)?
        .ok_or_else(|| DocvaultError::ManifestNotFound(MANIFEST_KEY.to_string()))?;
    let sizes = rebuild_size_info(storage, &info, &[], level)?;
    let blob_info = load_blob_info(storage)?;

    Ok(SizeReport {
        workspace: info.workspace.clone(),
        version: info.version.clone(),
        snapshot_count: info.snapshots.len(),
        last_snapshot_time: info
            .latest_date()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        sizes,
        skipped_blobs: blob_info.len(),
        skipped_blob_bytes: blob_info.values().map(|(_, size)| size).sum(),
    })
}
