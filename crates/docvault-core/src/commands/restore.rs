use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use super::util::{live_digest, sleep_interruptible, DomainFilter};
use crate::archive::{read_archive, ArchiveItem};
use crate::blob::{fingerprint, upload_blob, UploadHistory};
use crate::config::DocvaultConfig;
use crate::context::RunContext;
use crate::error::{DocvaultError, Result};
use crate::limiter::{scoped, RateLimiter};
use crate::model::{BlobDoc, BlobStore, Doc, FsStore, WorkspaceStore, DOMAIN_BLOB};
use crate::repo::digest::apply_domain_data;
use crate::repo::{load_digest, same_hash, BackupInfo, BackupSnapshot, Digest};
use crate::storage::{self, StorageBackend};

/// Live documents removed per `clean` call.
const CLEAN_BATCH: usize = 10_000;

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Snapshot date to restore; `None` restores the latest state.
    pub date: Option<i64>,
    /// Keep live documents the backup does not know about.
    pub merge: bool,
    /// Compare every backed-up document with its live copy instead of
    /// trusting listing hashes.
    pub recheck: bool,
    pub filter: DomainFilter,
    /// Domains restored concurrently.
    pub parallel: usize,
    /// Serialized bytes per upload batch.
    pub upload_batch_bytes: usize,
    pub retries: usize,
    pub retry_delay: Duration,
    pub retry_max_delay: Duration,
    pub blob_concurrency: usize,
    pub history_file: Option<PathBuf>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            date: None,
            merge: false,
            recheck: false,
            filter: DomainFilter::default(),
            parallel: 1,
            upload_batch_bytes: 2 * 1024 * 1024,
            retries: 5,
            retry_delay: Duration::from_millis(1000),
            retry_max_delay: Duration::from_millis(60_000),
            blob_concurrency: 10,
            history_file: None,
        }
    }
}

impl RestoreOptions {
    pub fn from_config(config: &DocvaultConfig) -> Self {
        let restore = &config.restore;
        Self {
            parallel: restore.parallel,
            upload_batch_bytes: restore.upload_batch_bytes(),
            retries: restore.retries,
            retry_delay: Duration::from_millis(restore.retry_delay_ms),
            retry_max_delay: Duration::from_millis(restore.retry_max_delay_ms),
            blob_concurrency: restore.blob_concurrency,
            history_file: restore
                .history_file
                .as_deref()
                .map(|p| PathBuf::from(crate::config::expand_tilde(p))),
            ..Self::default()
        }
    }
}

/// Outcome of one restored domain.
#[derive(Debug, Default, Clone)]
pub struct DomainRestore {
    pub domain: String,
    pub uploaded: u64,
    /// Documents found identical to the live copy in recheck mode.
    pub unchanged: u64,
    pub blobs_uploaded: u64,
    /// Blobs already uploaded according to the history file.
    pub blobs_skipped: u64,
    pub removed: u64,
    /// Target ids no archive could produce.
    pub unresolved: Vec<String>,
    /// Archives that failed to decode; `check` removes them.
    pub corrupt_archives: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct RestoreStats {
    pub success: bool,
    pub canceled: bool,
    /// Date of the restored snapshot, `None` for the latest state.
    pub date: Option<i64>,
    pub domains: Vec<DomainRestore>,
    pub failed_domains: Vec<String>,
}

impl RestoreStats {
    pub fn uploaded(&self) -> u64 {
        self.domains.iter().map(|d| d.uploaded + d.blobs_uploaded).sum()
    }

    pub fn removed(&self) -> u64 {
        self.domains.iter().map(|d| d.removed).sum()
    }

    pub fn unresolved(&self) -> usize {
        self.domains.iter().map(|d| d.unresolved.len()).sum()
    }

    pub fn corrupt_archives(&self) -> Vec<&str> {
        self.domains
            .iter()
            .flat_map(|d| d.corrupt_archives.iter().map(String::as_str))
            .collect()
    }
}

pub fn run(
    config: &DocvaultConfig,
    opts: &RestoreOptions,
    shutdown: Option<Arc<AtomicBool>>,
) -> Result<RestoreStats> {
    let backend = storage::backend_from_url(&config.repository.url)?;
    let store = FsStore::open(config.store_root()?)?;
    let ctx = match shutdown {
        Some(flag) => RunContext::with_shutdown(flag),
        None => RunContext::new(),
    };
    restore(&ctx, backend.as_ref(), &store, &store, opts)
}

struct RestoreEnv<'a> {
    storage: &'a dyn StorageBackend,
    store: &'a dyn WorkspaceStore,
    blobs: &'a dyn BlobStore,
    opts: &'a RestoreOptions,
    /// The chain up to and including the restore point.
    snapshots: &'a [BackupSnapshot],
    history: Option<&'a Mutex<UploadHistory>>,
}

/// Bring the live store to the state of the backup at `opts.date`.
pub fn restore(
    ctx: &RunContext,
    storage: &dyn StorageBackend,
    store: &dyn WorkspaceStore,
    blobs: &dyn BlobStore,
    opts: &RestoreOptions,
) -> Result<RestoreStats> {
    let info = BackupInfo::load_current(storage)?;
    let snapshots = match opts.date {
        Some(date) => {
            let pos = info
                .snapshot_position(date)
                .ok_or(DocvaultError::SnapshotNotFound(date))?;
            &info.snapshots[..=pos]
        }
        None => &info.snapshots[..],
    };
    let domains = opts.filter.select(info.domains());
    info!(
        workspace = %info.workspace,
        date = ?opts.date,
        domains = domains.len(),
        merge = opts.merge,
        recheck = opts.recheck,
        "starting restore"
    );

    let history = opts
        .history_file
        .as_deref()
        .map(|path| Mutex::new(UploadHistory::load(path)));
    let env = RestoreEnv {
        storage,
        store,
        blobs,
        opts,
        snapshots,
        history: history.as_ref(),
    };

    let results: Mutex<Vec<DomainRestore>> = Mutex::new(Vec::new());
    let failed: Mutex<Vec<String>> = Mutex::new(Vec::new());
    let canceled = AtomicBool::new(false);
    scoped(opts.parallel, |limiter| {
        for domain in &domains {
            if ctx.is_canceled() {
                canceled.store(true, Ordering::Relaxed);
                break;
            }
            let (env, results, failed, canceled) = (&env, &results, &failed, &canceled);
            limiter.submit(move || {
                match restore_with_retry(ctx, env, domain) {
                    Ok(outcome) => lock(results).push(outcome),
                    Err(DocvaultError::Interrupted) => {
                        canceled.store(true, Ordering::Relaxed);
                        lock(failed).push(domain.clone());
                    }
                    Err(e) => {
                        warn!(domain = %domain, "domain restore failed: {e}");
                        lock(failed).push(domain.clone());
                    }
                }
                Ok(())
            });
        }
    });

    if let Some(history) = &history {
        if let Err(e) = lock(history).save() {
            warn!("failed to save upload history: {e}");
        }
    }

    let mut stats = RestoreStats {
        date: opts.date,
        domains: results.into_inner().unwrap_or_else(PoisonError::into_inner),
        failed_domains: failed.into_inner().unwrap_or_else(PoisonError::into_inner),
        canceled: canceled.into_inner(),
        ..RestoreStats::default()
    };
    stats.domains.sort_by(|a, b| a.domain.cmp(&b.domain));
    stats.failed_domains.sort();
    stats.success = !stats.canceled && stats.failed_domains.is_empty();
    info!(
        success = stats.success,
        uploaded = stats.uploaded(),
        removed = stats.removed(),
        unresolved = stats.unresolved(),
        "restore finished"
    );
    Ok(stats)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exponential delay for `attempt`, capped, with up to half of it jittered.
fn backoff(opts: &RestoreOptions, attempt: u32) -> Duration {
    let grown = opts
        .retry_delay
        .saturating_mul(1u32 << attempt.min(16))
        .min(opts.retry_max_delay);
    let half = grown.as_millis() as u64 / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}

fn restore_with_retry(ctx: &RunContext, env: &RestoreEnv<'_>, domain: &str) -> Result<DomainRestore> {
    let mut attempt: u32 = 0;
    loop {
        match restore_domain(ctx, env, domain) {
            Ok(outcome) => return Ok(outcome),
            Err(DocvaultError::Interrupted) => return Err(DocvaultError::Interrupted),
            Err(e) if (attempt as usize) < env.opts.retries => {
                let delay = backoff(env.opts, attempt);
                attempt += 1;
                warn!(domain, attempt, delay_ms = delay.as_millis() as u64, "restore failed, retrying: {e}");
                sleep_interruptible(ctx, delay)?;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Upload batching
// ---------------------------------------------------------------------------

/// Documents waiting for upload, bounded by serialized size.
struct DocBatch<'a> {
    store: &'a dyn WorkspaceStore,
    domain: &'a str,
    recheck: bool,
    limit: usize,
    docs: Vec<Doc>,
    bytes: usize,
    uploaded: u64,
    unchanged: u64,
}

impl<'a> DocBatch<'a> {
    fn new(store: &'a dyn WorkspaceStore, domain: &'a str, opts: &RestoreOptions) -> Self {
        Self {
            store,
            domain,
            recheck: opts.recheck,
            limit: opts.upload_batch_bytes.max(1),
            docs: Vec::new(),
            bytes: 0,
            uploaded: 0,
            unchanged: 0,
        }
    }

    fn push(&mut self, doc: Doc) -> Result<()> {
        let size = doc.estimated_size();
        if !self.docs.is_empty() && self.bytes + size > self.limit {
            self.flush()?;
        }
        self.bytes += size;
        self.docs.push(doc);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.docs.is_empty() {
            return Ok(());
        }
        let mut docs = std::mem::take(&mut self.docs);
        self.bytes = 0;

        if self.recheck {
            let ids: Vec<String> = docs.iter().map(|d| d.id().to_string()).collect();
            let live: HashMap<String, Doc> = self
                .store
                .load_docs(self.domain, &ids)?
                .into_iter()
                .map(|d| (d.id().to_string(), d))
                .collect();
            let before = docs.len();
            docs.retain(|doc| !live.get(doc.id()).is_some_and(|l| l.content_eq(doc)));
            self.unchanged += (before - docs.len()) as u64;
            if docs.is_empty() {
                return Ok(());
            }
        }

        let count = docs.len();
        self.store.upload(self.domain, docs)?;
        self.uploaded += count as u64;
        debug!(domain = self.domain, count, "documents uploaded");
        Ok(())
    }
}

#[derive(Default)]
struct BlobCounters {
    uploaded: AtomicU64,
    skipped: AtomicU64,
}

fn upload_one(
    blobs: &dyn BlobStore,
    history: Option<&Mutex<UploadHistory>>,
    counters: &BlobCounters,
    meta: &BlobDoc,
    data: &[u8],
) -> Result<()> {
    let print = fingerprint(meta, data);
    if history.is_some_and(|h| lock(h).is_current(&meta.id, &print)) {
        counters.skipped.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }
    upload_blob(blobs, meta, data)?;
    if let Some(history) = history {
        lock(history).record(&meta.id, print);
    }
    counters.uploaded.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn persist_history(history: Option<&Mutex<UploadHistory>>) {
    if let Some(history) = history {
        if let Err(e) = lock(history).save() {
            warn!("failed to save upload history: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Per-domain restore
// ---------------------------------------------------------------------------

fn restore_domain(ctx: &RunContext, env: &RestoreEnv<'_>, domain: &str) -> Result<DomainRestore> {
    let opts = env.opts;
    let target = load_digest(env.storage, env.snapshots, domain, None);
    let live = live_digest(ctx, env.store, domain)?;

    let mut needed: Digest = target
        .iter()
        .filter(|(id, hash)| opts.recheck || !live.get(*id).is_some_and(|l| same_hash(l, hash)))
        .map(|(id, hash)| (id.clone(), hash.clone()))
        .collect();
    let mut to_remove: Vec<String> = live
        .keys()
        .filter(|id| !target.contains_key(*id))
        .cloned()
        .collect();
    to_remove.sort();
    drop(target);
    drop(live);

    info!(
        domain,
        to_upload = needed.len(),
        to_remove = if opts.merge { 0 } else { to_remove.len() },
        "restoring domain"
    );

    let mut batch = DocBatch::new(env.store, domain, opts);
    let counters = BlobCounters::default();
    let workers = if domain == DOMAIN_BLOB { opts.blob_concurrency } else { 1 };
    let corrupt_archives = scoped(workers, |blob_jobs| {
        let corrupt =
            resolve_from_archives(ctx, env, domain, &mut needed, &mut batch, &counters, blob_jobs)?;
        batch.flush()?;
        match blob_jobs.take_errors().into_iter().next() {
            Some(e) => Err(e),
            None => Ok(corrupt),
        }
    })?;
    persist_history(env.history);

    let mut unresolved: Vec<String> = needed.into_keys().collect();
    unresolved.sort();
    if !unresolved.is_empty() {
        warn!(domain, missing = unresolved.len(), "documents not found in any archive");
    }

    let mut removed = 0u64;
    if !opts.merge && domain != DOMAIN_BLOB {
        for ids in to_remove.chunks(CLEAN_BATCH) {
            ctx.check()?;
            env.store.clean(domain, ids)?;
            removed += ids.len() as u64;
        }
    }

    Ok(DomainRestore {
        domain: domain.to_string(),
        uploaded: batch.uploaded,
        unchanged: batch.unchanged,
        blobs_uploaded: counters.uploaded.into_inner(),
        blobs_skipped: counters.skipped.into_inner(),
        removed,
        unresolved,
        corrupt_archives,
    })
}

/// Walk the chain newest to oldest, taking each needed id from the snapshot
/// whose own delta records the target hash. Returns the archives that could
/// not be decoded.
fn resolve_from_archives<'env>(
    ctx: &RunContext,
    env: &'env RestoreEnv<'env>,
    domain: &str,
    needed: &mut Digest,
    batch: &mut DocBatch<'_>,
    counters: &'env BlobCounters,
    blob_jobs: &RateLimiter<'env>,
) -> Result<Vec<String>> {
    let mut corrupt = Vec::new();
    for snapshot in env.snapshots.iter().rev() {
        if needed.is_empty() {
            break;
        }
        let Some(data) = snapshot.domains.get(domain) else {
            continue;
        };
        let mut own = Digest::new();
        apply_domain_data(env.storage, data, &mut own);
        let mut ids: HashSet<String> = own
            .into_iter()
            .filter(|(id, hash)| needed.get(id).is_some_and(|n| same_hash(n, hash)))
            .map(|(id, _)| id)
            .collect();

        for name in &data.storage {
            if ids.is_empty() {
                break;
            }
            ctx.check()?;
            let mut queued_blobs = false;
            let read = read_archive(env.storage, name, &mut ids, |item| {
                ctx.tick();
                let Some(hash) = needed.remove(item.id()) else {
                    return Ok(());
                };
                match item {
                    ArchiveItem::Doc(mut doc) => {
                        doc.apply_default_space();
                        doc.set_hash(Some(hash));
                        batch.push(doc)
                    }
                    ArchiveItem::Blob(meta, bytes) => {
                        queued_blobs = true;
                        let blobs = env.blobs;
                        let history = env.history;
                        blob_jobs.submit(move || upload_one(blobs, history, counters, &meta, &bytes));
                        Ok(())
                    }
                }
            });
            match read {
                Ok(_) => {}
                Err(e @ DocvaultError::ArchiveCorrupt { .. }) => {
                    warn!(domain, archive = %name, "skipping archive during restore: {e}");
                    corrupt.push(name.clone());
                }
                Err(e) => return Err(e),
            }
            if queued_blobs {
                blob_jobs.wait_idle();
                persist_history(env.history);
            }
        }
    }
    Ok(corrupt)
}
