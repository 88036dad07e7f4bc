use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::backup::BackupOptions;
use super::pack::{Change, PackLimits, Packer};
use super::util::{delete_files, next_snapshot_date};
use crate::archive::{read_archive, ArchiveItem};
use crate::blob::BlobPolicy;
use crate::config::DocvaultConfig;
use crate::context::RunContext;
use crate::error::{DocvaultError, Result};
use crate::repo::digest::apply_domain_data;
use crate::repo::lock::with_lock;
use crate::repo::manifest::{backup_dir, parent_dir};
use crate::repo::sizes::{load_blob_info, rebuild_size_info, save_blob_info, BlobInfo};
use crate::repo::{load_digest, same_hash, BackupInfo, BackupSnapshot, Digest};
use crate::storage::{self, StorageBackend};

#[derive(Debug, Clone, Default)]
pub struct CompactOptions {
    /// Blobs this policy excludes are dropped from the merged snapshot.
    pub blob_policy: BlobPolicy,
    pub pack: PackLimits,
    /// Rewrite even a single-snapshot chain.
    pub force: bool,
}

impl CompactOptions {
    pub fn from_config(config: &DocvaultConfig) -> Result<Self> {
        Ok(BackupOptions::from_config(config)?.compact_options())
    }
}

/// Statistics returned by the compact command.
#[derive(Debug, Default)]
pub struct CompactStats {
    /// Nothing to merge.
    pub skipped: bool,
    pub resumed: bool,
    pub snapshots_merged: usize,
    pub documents_written: u64,
    pub blobs_dropped: usize,
    /// Digest entries no archive could produce.
    pub unresolved: usize,
    pub files_deleted: usize,
    /// Archives that failed to decode; they are deleted with the old chain.
    pub corrupt_archives: Vec<String>,
}

pub fn run(
    config: &DocvaultConfig,
    opts: &CompactOptions,
    shutdown: Option<Arc<AtomicBool>>,
) -> Result<CompactStats> {
    let backend = storage::backend_from_url(&config.repository.url)?;
    let ctx = match shutdown {
        Some(flag) => RunContext::with_shutdown(flag),
        None => RunContext::new(),
    };
    compact(&ctx, backend.as_ref(), opts)
}

/// Merge the whole snapshot chain into one snapshot under the lock.
pub fn compact(
    ctx: &RunContext,
    storage: &dyn StorageBackend,
    opts: &CompactOptions,
) -> Result<CompactStats> {
    with_lock(storage, || {
        let mut info = BackupInfo::load_current(storage)?;
        let stats = compact_manifest(ctx, storage, &mut info, opts)?;
        if !stats.skipped {
            let level = opts.pack.level;
            let sizes = rebuild_size_info(storage, &info, &[], level)?;
            info.data_size = sizes.data;
            info.blobs_size = sizes.blobs;
            info.backup_size = sizes.total;
            info.save(storage, level)?;
        }
        Ok(stats)
    })
}

#[derive(Debug, Default)]
struct DomainCompaction {
    written: u64,
    dropped: BlobInfo,
    unresolved: usize,
    corrupt: Vec<String>,
}

/// Rewrite the chain of `info` as a single snapshot.
///
/// The new snapshot is built in place, flagged as compacting, and persisted
/// after every archive rotation. An interrupted run resumes from it and only
/// writes what is still missing. Old files are deleted only once the manifest
/// stops referencing them.
pub fn compact_manifest(
    ctx: &RunContext,
    storage: &dyn StorageBackend,
    info: &mut BackupInfo,
    opts: &CompactOptions,
) -> Result<CompactStats> {
    info.ensure_current_version()?;
    let level = opts.pack.level;
    let mut stats = CompactStats::default();

    let snap_idx = match info.compacting_position() {
        Some(pos) => {
            info!(date = info.snapshots[pos].date, "resuming interrupted compaction");
            stats.resumed = true;
            let last = info.snapshots.len() - 1;
            if pos != last {
                let snapshot = info.snapshots.remove(pos);
                info.snapshots.push(snapshot);
            }
            last
        }
        None => {
            let enough = info.snapshots.len() >= 2 || (opts.force && !info.snapshots.is_empty());
            if !enough {
                debug!(snapshots = info.snapshots.len(), "nothing to compact");
                stats.skipped = true;
                return Ok(stats);
            }
            let mut snapshot = BackupSnapshot::new(next_snapshot_date(info));
            snapshot.compacting = true;
            info.snapshots.push(snapshot);
            info.save(storage, level)?;
            info.snapshots.len() - 1
        }
    };

    let settled: Vec<BackupSnapshot> = info.snapshots[..snap_idx].to_vec();
    stats.snapshots_merged = settled.len();
    let dir = backup_dir(info.snapshots_index + 1);
    let domains: BTreeSet<String> = settled
        .iter()
        .flat_map(|s| s.domains.keys().cloned())
        .collect();
    info!(snapshots = settled.len(), domains = domains.len(), dir = %dir, "compacting backup");

    let mut dropped = BlobInfo::new();
    let mut incomplete: BTreeSet<String> = BTreeSet::new();
    for domain in &domains {
        ctx.check()?;
        let outcome =
            compact_domain(ctx, storage, info, opts, &settled, snap_idx, &dir, domain)?;
        stats.documents_written += outcome.written;
        stats.blobs_dropped += outcome.dropped.len();
        stats.unresolved += outcome.unresolved;
        if outcome.unresolved > 0 {
            incomplete.insert(domain.clone());
        }
        dropped.extend(outcome.dropped);
        stats.corrupt_archives.extend(outcome.corrupt);
    }

    let mut compacted = info.snapshots.remove(snap_idx);
    compacted.compacting = false;
    let old_files: Vec<String> = settled
        .iter()
        .flat_map(BackupSnapshot::files)
        .map(str::to_string)
        .collect();
    let old_dirs: BTreeSet<String> = old_files
        .iter()
        .filter_map(|name| parent_dir(name))
        .filter(|d| *d != dir)
        .map(str::to_string)
        .collect();

    info.snapshots = if compacted.domains.is_empty() {
        Vec::new()
    } else {
        vec![compacted]
    };
    info.snapshots_index += 1;
    for domain in &incomplete {
        info.domain_hashes.remove(domain);
    }
    if !incomplete.is_empty() {
        info.last_tx_id = None;
    }
    // The next backup deep-compares against the rewritten archives.
    info.migrations.forced_full_check = None;
    info.save(storage, level)?;

    stats.files_deleted = delete_files(storage, old_files.iter().map(String::as_str));
    for old in &old_dirs {
        if let Err(e) = storage.delete_recursive(old) {
            warn!(dir = %old, "failed to remove backup directory: {e}");
        }
    }

    if !dropped.is_empty() {
        let mut blob_info = load_blob_info(storage)?;
        blob_info.extend(dropped);
        save_blob_info(storage, &blob_info, level)?;
    }

    info!(
        merged = stats.snapshots_merged,
        documents = stats.documents_written,
        dropped_blobs = stats.blobs_dropped,
        unresolved = stats.unresolved,
        deleted = stats.files_deleted,
        "compaction finished"
    );
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn compact_domain(
    ctx: &RunContext,
    storage: &dyn StorageBackend,
    info: &mut BackupInfo,
    opts: &CompactOptions,
    settled: &[BackupSnapshot],
    snap_idx: usize,
    dir: &str,
    domain: &str,
) -> Result<DomainCompaction> {
    let mut outcome = DomainCompaction::default();
    let target = load_digest(storage, settled, domain, None);

    // Entries a previous attempt already wrote.
    let mut written = Digest::new();
    if let Some(data) = info.snapshots[snap_idx].domains.get(domain) {
        apply_domain_data(storage, data, &mut written);
    }
    let stale: Vec<String> = written
        .keys()
        .filter(|id| !target.contains_key(*id))
        .cloned()
        .collect();
    let mut wanted: Digest = target
        .into_iter()
        .filter(|(id, hash)| !written.get(id).is_some_and(|w| same_hash(w, hash)))
        .collect();
    if wanted.is_empty() && stale.is_empty() {
        debug!(domain, "domain already compacted");
        return Ok(outcome);
    }

    let mut packer = Packer::new(storage, &opts.pack, domain, dir, snap_idx);
    for snapshot in settled.iter().rev() {
        if wanted.is_empty() {
            break;
        }
        let Some(data) = snapshot.domains.get(domain) else {
            continue;
        };
        let mut own = Digest::new();
        apply_domain_data(storage, data, &mut own);
        let mut ids: HashSet<String> = own
            .into_iter()
            .filter(|(id, hash)| wanted.get(id).is_some_and(|w| same_hash(w, hash)))
            .map(|(id, _)| id)
            .collect();

        for name in &data.storage {
            if ids.is_empty() {
                break;
            }
            ctx.check()?;
            let read = read_archive(storage, name, &mut ids, |item| {
                ctx.tick();
                let Some(hash) = wanted.remove(item.id()) else {
                    return Ok(());
                };
                match item {
                    ArchiveItem::Doc(doc) => packer.add_doc(info, &doc, Change::Added, &hash)?,
                    ArchiveItem::Blob(meta, bytes) => {
                        let size = bytes.len() as u64;
                        if opts.blob_policy.excludes(&meta.content_type, size) {
                            debug!(id = %meta.id, size, "blob dropped by retention policy");
                            outcome.dropped.insert(meta.id.clone(), (meta.content_type, size));
                            return Ok(());
                        }
                        packer.add_blob(info, &meta, &bytes, Change::Added, &hash)?;
                    }
                }
                outcome.written += 1;
                Ok(())
            });
            match read {
                Ok(_) => {}
                Err(e @ DocvaultError::ArchiveCorrupt { .. }) => {
                    warn!(domain, archive = %name, "skipping archive during compaction: {e}");
                    outcome.corrupt.push(name.clone());
                }
                Err(e) => return Err(e),
            }
        }
    }

    if !wanted.is_empty() {
        outcome.unresolved = wanted.len();
        warn!(
            domain,
            missing = wanted.len(),
            "documents not found in any archive, dropped from compacted snapshot"
        );
    }
    packer.remove(stale);
    packer.finish(info)?;
    Ok(outcome)
}
