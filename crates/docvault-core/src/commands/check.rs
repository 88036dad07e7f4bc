use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{info, warn};

use crate::archive::scan_archive;
use crate::config::DocvaultConfig;
use crate::context::RunContext;
use crate::error::{DocvaultError, Result};
use crate::repo::digest::{read_delta, read_legacy_delta, write_delta};
use crate::repo::lock::with_lock;
use crate::repo::manifest::{backup_dir, digest_name, parent_dir};
use crate::repo::sizes::rebuild_size_info;
use crate::repo::{BackupInfo, DomainData};
use crate::storage::{self, StorageBackend};

/// Findings of an integrity pass. In dry-run mode nothing listed here was
/// changed on storage.
#[derive(Debug, Default, Clone)]
pub struct CheckReport {
    pub dry_run: bool,
    pub archives_checked: usize,
    /// Archives that could not be decoded.
    pub archives_removed: Vec<String>,
    /// Deltas rewritten without ids missing from their archives.
    pub digests_rewritten: Vec<String>,
    /// Deltas that were unreadable or left empty.
    pub digests_removed: Vec<String>,
    /// Legacy JSON deltas converted to the line format.
    pub legacy_converted: usize,
    /// Delta entries dropped because no archive holds them.
    pub invalid_ids: usize,
    pub zero_sized: usize,
    pub malformed: usize,
    pub repaired_domains: BTreeSet<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.archives_removed.is_empty()
            && self.digests_removed.is_empty()
            && self.invalid_ids == 0
            && self.repaired_domains.is_empty()
    }
}

pub fn run(
    config: &DocvaultConfig,
    dry_run: bool,
    shutdown: Option<Arc<AtomicBool>>,
) -> Result<CheckReport> {
    let backend = storage::backend_from_url(&config.repository.url)?;
    let ctx = match shutdown {
        Some(flag) => RunContext::with_shutdown(flag),
        None => RunContext::new(),
    };
    check_integrity(&ctx, backend.as_ref(), dry_run, config.compression.level)
}

/// Verify every archive and delta of the backup, repairing what is broken
/// unless `dry_run` is set.
pub fn check_integrity(
    ctx: &RunContext,
    storage: &dyn StorageBackend,
    dry_run: bool,
    level: u32,
) -> Result<CheckReport> {
    if dry_run {
        let mut info = BackupInfo::load_current(storage)?;
        return verify_manifest(ctx, storage, &mut info, true, level);
    }
    with_lock(storage, || {
        let mut info = BackupInfo::load_current(storage)?;
        verify_manifest(ctx, storage, &mut info, false, level)
    })
}

/// Integrity pass over an already loaded manifest. Repaired domains lose
/// their recorded hash so the next backup captures the missing documents
/// again.
pub fn verify_manifest(
    ctx: &RunContext,
    storage: &dyn StorageBackend,
    info: &mut BackupInfo,
    dry_run: bool,
    level: u32,
) -> Result<CheckReport> {
    let mut report = CheckReport {
        dry_run,
        ..CheckReport::default()
    };
    let mut recheck: Vec<String> = Vec::new();

    for snapshot in &mut info.snapshots {
        let date = snapshot.date;
        for (domain, data) in snapshot.domains.iter_mut() {
            ctx.check()?;
            let mut checked = data.clone();
            let repaired =
                verify_domain_data(ctx, storage, domain, date, &mut checked, dry_run, level, &mut report)?;
            if repaired {
                report.repaired_domains.insert(domain.clone());
            }
            if !dry_run && checked != *data {
                recheck.extend(checked.files().map(str::to_string));
                *data = checked;
            }
        }
        if !dry_run {
            snapshot.domains.retain(|_, data| !data.is_empty());
        }
    }

    if dry_run {
        return Ok(report);
    }

    for domain in &report.repaired_domains {
        info.domain_hashes.remove(domain);
    }
    if !report.repaired_domains.is_empty() {
        info.last_tx_id = None;
        warn!(
            domains = report.repaired_domains.len(),
            "backup repaired, affected domains will be captured again"
        );
    }
    info.migrations.zero_check_size = Some(true);
    info.save(storage, level)?;

    let sizes = rebuild_size_info(storage, info, &recheck, level)?;
    info.data_size = sizes.data;
    info.blobs_size = sizes.blobs;
    info.backup_size = sizes.total;
    info.save(storage, level)?;

    info!(
        archives = report.archives_checked,
        removed = report.archives_removed.len(),
        invalid_ids = report.invalid_ids,
        "integrity check finished"
    );
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn verify_domain_data(
    ctx: &RunContext,
    storage: &dyn StorageBackend,
    domain: &str,
    date: i64,
    data: &mut DomainData,
    dry_run: bool,
    level: u32,
    report: &mut CheckReport,
) -> Result<bool> {
    let mut repaired = false;
    let mut valid: HashSet<String> = HashSet::new();
    let mut zero_sized: HashSet<String> = HashSet::new();
    let mut broken: Vec<String> = Vec::new();

    for name in &data.storage {
        ctx.check()?;
        ctx.tick();
        report.archives_checked += 1;
        match scan_archive(storage, name) {
            Ok(scan) => {
                valid.extend(scan.valid);
                zero_sized.extend(scan.zero_sized);
                report.malformed += scan.malformed;
            }
            Err(e @ DocvaultError::ArchiveCorrupt { .. }) => {
                warn!(domain, archive = %name, "broken archive: {e}");
                broken.push(name.clone());
            }
            Err(e) => return Err(e),
        }
    }
    report.zero_sized += zero_sized.len();
    for id in &zero_sized {
        valid.remove(id);
    }

    if !broken.is_empty() {
        repaired = true;
        data.storage.retain(|name| !broken.contains(name));
        if !dry_run {
            for name in &broken {
                if let Err(e) = storage.delete(name) {
                    warn!(archive = %name, "failed to delete broken archive: {e}");
                }
            }
        }
        report.archives_removed.extend(broken);
    }

    let mut kept = Vec::with_capacity(data.snapshots.len());
    for name in std::mem::take(&mut data.snapshots) {
        ctx.check()?;
        match read_delta(storage, &name) {
            Ok(mut delta) => {
                let dropped = delta.retain_ids(|id| valid.contains(id));
                report.invalid_ids += dropped;
                if dropped > 0 {
                    repaired = true;
                }
                if delta.is_empty() {
                    if !dry_run {
                        storage.delete(&name)?;
                    }
                    report.digests_removed.push(name);
                } else {
                    if dropped > 0 {
                        if !dry_run {
                            write_delta(storage, &name, &delta, level)?;
                        }
                        report.digests_rewritten.push(name.clone());
                    }
                    kept.push(name);
                }
            }
            Err(e @ DocvaultError::DigestCorrupt { .. }) => {
                warn!(domain, digest = %name, "unreadable digest: {e}");
                repaired = true;
                if !dry_run {
                    storage.delete(&name)?;
                }
                report.digests_removed.push(name);
            }
            Err(e) => return Err(e),
        }
    }
    data.snapshots = kept;

    if let Some(legacy) = data.snapshot.take() {
        match read_legacy_delta(storage, &legacy) {
            Ok(mut delta) => {
                let dropped = delta.retain_ids(|id| valid.contains(id));
                report.invalid_ids += dropped;
                repaired |= dropped > 0;
                if !delta.is_empty() {
                    let dir = parent_dir(&legacy)
                        .or_else(|| data.storage.first().and_then(|n| parent_dir(n)))
                        .map(str::to_string)
                        .unwrap_or_else(|| backup_dir(0));
                    let converted = digest_name(&dir, domain, date, 0);
                    if !dry_run {
                        write_delta(storage, &converted, &delta, level)?;
                    }
                    data.snapshots.insert(0, converted);
                    report.legacy_converted += 1;
                }
            }
            Err(e) => {
                warn!(domain, digest = %legacy, "unreadable legacy digest: {e}");
                repaired = true;
                report.digests_removed.push(legacy.clone());
            }
        }
        if !dry_run {
            storage.delete(&legacy)?;
        }
    }

    Ok(repaired)
}
