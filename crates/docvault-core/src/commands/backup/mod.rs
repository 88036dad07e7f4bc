mod collect;
mod domain;
mod verify;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use self::domain::{process_domain, BackupEnv};
use super::check::verify_manifest;
use super::compact::{compact_manifest, CompactOptions};
use super::pack::PackLimits;
use super::util::{next_snapshot_date, DomainFilter};
use crate::blob::BlobPolicy;
use crate::config::DocvaultConfig;
use crate::context::{RunContext, Watchdog};
use crate::error::{DocvaultError, Result};
use crate::model::{BlobStore, FsStore, WorkspaceStore};
use crate::repo::lock::with_lock;
use crate::repo::manifest::FORCED_FULL_CHECK;
use crate::repo::sizes::{load_blob_info, rebuild_size_info, save_blob_info, BlobInfo};
use crate::repo::{BackupInfo, BackupSnapshot, FORMAT_VERSION};
use crate::storage::{self, StorageBackend};

/// Options for one backup pass.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub workspace: String,
    /// Ignore domain hashes and the transaction marker.
    pub force: bool,
    /// Deep-compare unchanged documents with their archived copies.
    pub full_verify: bool,
    pub filter: DomainFilter,
    pub batch_size: usize,
    pub pack: PackLimits,
    pub blob_policy: BlobPolicy,
    /// Compact first once the chain holds more snapshots than this.
    pub keep_snapshots: usize,
    /// Cancel when no progress is made for this long.
    pub timeout: Option<Duration>,
    /// Listing restarts allowed per domain.
    pub chunk_restarts: usize,
    /// Retries per document batch load.
    pub load_retries: usize,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            workspace: String::new(),
            force: false,
            full_verify: false,
            filter: DomainFilter::default(),
            batch_size: 200,
            pack: PackLimits::default(),
            blob_policy: BlobPolicy {
                size_limit: Some(5 * 1024 * 1024),
                skip_content_types: vec!["video/".into(), "image/".into(), "audio/".into()],
            },
            keep_snapshots: 84,
            timeout: Some(Duration::from_secs(30 * 60)),
            chunk_restarts: 5,
            load_retries: 5,
        }
    }
}

impl BackupOptions {
    pub fn from_config(config: &DocvaultConfig) -> Result<Self> {
        let backup = &config.backup;
        Ok(Self {
            workspace: config.workspace.clone(),
            batch_size: backup.batch_size,
            pack: PackLimits {
                archive_size_limit: backup.archive_size_limit(),
                archive_max_documents: backup.archive_max_documents,
                level: config.compression.level,
                temp_dir: backup.temp_dir.as_ref().map(PathBuf::from),
            },
            blob_policy: BlobPolicy {
                size_limit: Some(backup.blob_limit()),
                skip_content_types: backup.skip_content_types.clone(),
            },
            keep_snapshots: backup.keep_snapshots,
            timeout: Some(backup.timeout()?),
            ..Self::default()
        })
    }

    pub(crate) fn compact_options(&self) -> CompactOptions {
        CompactOptions {
            blob_policy: self.blob_policy.clone(),
            pack: self.pack.clone(),
            force: false,
        }
    }
}

/// Summary of a backup pass.
#[derive(Debug, Default, Clone)]
pub struct BackupResult {
    /// Every selected domain was captured and the run was not canceled.
    pub success: bool,
    /// Nothing changed since the last transaction marker.
    pub skipped: bool,
    pub canceled: bool,
    pub compacted: bool,
    /// Date of the snapshot written, `None` when nothing changed.
    pub snapshot_date: Option<i64>,
    pub domains_processed: usize,
    pub domains_unchanged: usize,
    pub failed_domains: Vec<String>,
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
    pub skipped_blobs: usize,
    pub backup_size: u64,
}

/// Back up the workspace described by `config`.
pub fn run(
    config: &DocvaultConfig,
    opts: &BackupOptions,
    shutdown: Option<Arc<AtomicBool>>,
) -> Result<BackupResult> {
    let backend = storage::backend_from_url(&config.repository.url)?;
    let store = FsStore::open(config.store_root()?)?;
    let ctx = Arc::new(match shutdown {
        Some(flag) => RunContext::with_shutdown(flag),
        None => RunContext::new(),
    });
    run_backup(&ctx, backend.as_ref(), &store, &store, opts)
}

/// One backup pass under the repository lock, watched by the progress
/// timeout.
pub fn run_backup(
    ctx: &Arc<RunContext>,
    storage: &dyn StorageBackend,
    store: &dyn WorkspaceStore,
    blobs: &dyn BlobStore,
    opts: &BackupOptions,
) -> Result<BackupResult> {
    let _watchdog = match opts.timeout {
        Some(timeout) => Some(Watchdog::start(Arc::clone(ctx), timeout)?),
        None => None,
    };
    with_lock(storage, || backup_locked(ctx, storage, store, blobs, opts))
}

fn version_parts(version: &str) -> Option<Vec<u64>> {
    version.split('.').map(|p| p.parse().ok()).collect()
}

/// Load the manifest for writing, upgrading older formats in place.
fn open_manifest(
    ctx: &RunContext,
    storage: &dyn StorageBackend,
    opts: &BackupOptions,
) -> Result<BackupInfo> {
    let Some(mut info) = BackupInfo::load(storage)? else {
        info!(workspace = %opts.workspace, "creating new backup");
        let mut info = BackupInfo::new(&opts.workspace);
        info.migrations.zero_check_size = Some(true);
        info.migrations.forced_full_check = Some(FORCED_FULL_CHECK.to_string());
        return Ok(info);
    };

    if info.version != FORMAT_VERSION {
        let older = match (version_parts(&info.version), version_parts(FORMAT_VERSION)) {
            (Some(found), Some(current)) => found < current,
            _ => false,
        };
        if !older {
            return Err(DocvaultError::UnsupportedVersion(info.version));
        }
        info!(from = %info.version, to = FORMAT_VERSION, "upgrading backup manifest");
        info.version = FORMAT_VERSION.to_string();
    }
    if info.migrations.zero_check_size.is_none() {
        info!("running one-time integrity check");
        verify_manifest(ctx, storage, &mut info, false, opts.pack.level)?;
    }
    if !opts.workspace.is_empty() {
        info.workspace = opts.workspace.clone();
    }
    Ok(info)
}

fn backup_locked(
    ctx: &RunContext,
    storage: &dyn StorageBackend,
    store: &dyn WorkspaceStore,
    blobs: &dyn BlobStore,
    opts: &BackupOptions,
) -> Result<BackupResult> {
    let level = opts.pack.level;
    let mut result = BackupResult::default();
    let mut info = open_manifest(ctx, storage, opts)?;

    let mut full_verify = opts.full_verify
        || info.migrations.forced_full_check.as_deref() != Some(FORCED_FULL_CHECK);

    let compact_opts = opts.compact_options();
    let needs_compaction = info.compacting_position().is_some()
        || info.snapshots.len() > opts.keep_snapshots;
    if needs_compaction {
        info!(snapshots = info.snapshots.len(), "compacting backup before the pass");
        match compact_manifest(ctx, storage, &mut info, &compact_opts) {
            Ok(_) => {
                result.compacted = true;
                full_verify = true;
            }
            Err(DocvaultError::Interrupted) => {
                result.canceled = true;
                return Ok(result);
            }
            Err(e) => {
                warn!("compaction failed: {e}");
                return Ok(result);
            }
        }
    }

    let tx = store.last_tx_id().unwrap_or_else(|e| {
        warn!("failed to read last transaction marker: {e}");
        None
    });
    if !opts.force && !full_verify && tx.is_some() && tx == info.last_tx_id {
        info!(workspace = %info.workspace, "no transaction changes, skipping backup");
        info.save(storage, level)?;
        result.skipped = true;
        result.success = true;
        result.backup_size = info.backup_size;
        return Ok(result);
    }

    let mut domains: Vec<String> = store.domains()?;
    domains.extend(info.domains());
    let domains = opts.filter.select(domains);
    info!(
        workspace = %info.workspace,
        domains = domains.len(),
        full_verify,
        "starting backup"
    );

    // Cleared until a full pass completes.
    info.last_tx_id = None;
    let date = next_snapshot_date(&info);
    info.snapshots_index += 1;
    info.snapshots.push(BackupSnapshot::new(date));
    let snap_idx = info.snapshots.len() - 1;

    let env = BackupEnv {
        storage,
        store,
        blobs,
        opts,
        full_verify,
    };
    let mut skipped_blobs = BlobInfo::new();
    for domain in &domains {
        if ctx.is_canceled() {
            result.canceled = true;
            break;
        }
        match process_domain(ctx, &env, &mut info, snap_idx, domain) {
            Ok(outcome) if outcome.skipped => result.domains_unchanged += 1,
            Ok(outcome) => {
                result.domains_processed += 1;
                result.added += outcome.added;
                result.updated += outcome.updated;
                result.removed += outcome.removed;
                if outcome.incomplete {
                    result.failed_domains.push(domain.clone());
                }
                skipped_blobs.extend(outcome.skipped_blobs);
            }
            Err(DocvaultError::Interrupted) => {
                warn!(domain = %domain, "backup interrupted");
                result.canceled = true;
                break;
            }
            Err(e) => {
                warn!(domain = %domain, "domain backup failed: {e}");
                result.failed_domains.push(domain.clone());
            }
        }
    }

    if info.snapshots[snap_idx].domains.is_empty() {
        info.snapshots.remove(snap_idx);
        info.snapshots_index -= 1;
    } else {
        result.snapshot_date = Some(date);
    }
    result.success = !result.canceled && result.failed_domains.is_empty();
    if result.success {
        info.last_tx_id = tx;
        info.migrations.forced_full_check = Some(FORCED_FULL_CHECK.to_string());
    }
    info.save(storage, level)?;

    if !skipped_blobs.is_empty() {
        result.skipped_blobs = skipped_blobs.len();
        let mut blob_info = load_blob_info(storage)?;
        blob_info.extend(skipped_blobs);
        save_blob_info(storage, &blob_info, level)?;
    }

    let sizes = rebuild_size_info(storage, &info, &[], level)?;
    info.data_size = sizes.data;
    info.blobs_size = sizes.blobs;
    info.backup_size = sizes.total;
    info.save(storage, level)?;
    result.backup_size = info.backup_size;

    info!(
        workspace = %info.workspace,
        success = result.success,
        processed = result.domains_processed,
        unchanged = result.domains_unchanged,
        added = result.added,
        updated = result.updated,
        removed = result.removed,
        "backup finished"
    );
    Ok(result)
}
