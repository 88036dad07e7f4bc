use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::warn;

use crate::context::RunContext;
use crate::error::Result;
use crate::model::{Chunk, WorkspaceStore, DOMAIN_BLOB};
use crate::repo::{BackupInfo, Digest};
use crate::storage::StorageBackend;

/// Date for a snapshot appended now. Strictly after every existing snapshot,
/// so dates stay usable as snapshot identifiers.
pub(crate) fn next_snapshot_date(info: &BackupInfo) -> i64 {
    let now = Utc::now().timestamp_millis();
    match info.latest_date() {
        Some(last) if last >= now => last + 1,
        _ => now,
    }
}

/// Domain filter shared by backup, restore and download.
#[derive(Debug, Clone, Default)]
pub struct DomainFilter {
    /// When set, only these domains are processed.
    pub include: Option<HashSet<String>>,
    pub skip: HashSet<String>,
}

impl DomainFilter {
    pub fn allows(&self, domain: &str) -> bool {
        !self.skip.contains(domain) && self.include.as_ref().is_none_or(|i| i.contains(domain))
    }

    /// Apply the filter, ordering the blob domain first.
    pub fn select(&self, domains: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut out: Vec<String> = domains.into_iter().filter(|d| self.allows(d)).collect();
        out.sort();
        out.dedup();
        if let Some(pos) = out.iter().position(|d| d == DOMAIN_BLOB) {
            let blob = out.remove(pos);
            out.insert(0, blob);
        }
        out
    }
}

/// Drive a chunk cursor to the end, handing every page to `on_chunk`. The
/// cursor is closed on every exit path.
pub(crate) fn for_each_chunk(
    ctx: &RunContext,
    store: &dyn WorkspaceStore,
    domain: &str,
    mut on_chunk: impl FnMut(Chunk) -> Result<()>,
) -> Result<()> {
    let mut cursor: Option<u64> = None;
    let result = (|| -> Result<()> {
        loop {
            ctx.check()?;
            let chunk = store.load_chunk(domain, cursor)?;
            cursor = Some(chunk.cursor);
            let finished = chunk.finished;
            on_chunk(chunk)?;
            if finished {
                return Ok(());
            }
        }
    })();
    if let Some(id) = cursor {
        if let Err(e) = store.close_chunk(id) {
            warn!(domain, cursor = id, "failed to close chunk cursor: {e}");
        }
    }
    result
}

/// Current `id -> hash` of a live domain.
pub(crate) fn live_digest(
    ctx: &RunContext,
    store: &dyn WorkspaceStore,
    domain: &str,
) -> Result<Digest> {
    let mut digest = Digest::new();
    for_each_chunk(ctx, store, domain, |chunk| {
        for info in chunk.docs {
            ctx.tick();
            digest.insert(info.id, info.hash);
        }
        Ok(())
    })?;
    Ok(digest)
}

/// Sleep for `total`, waking early with an error when the run is canceled.
pub(crate) fn sleep_interruptible(ctx: &RunContext, total: Duration) -> Result<()> {
    let deadline = Instant::now() + total;
    loop {
        ctx.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

/// Delete files, logging failures instead of aborting.
pub(crate) fn delete_files<'a>(
    storage: &dyn StorageBackend,
    names: impl IntoIterator<Item = &'a str>,
) -> usize {
    let mut deleted = 0;
    for name in names {
        match storage.delete(name) {
            Ok(()) => deleted += 1,
            Err(e) => warn!(file = name, "failed to delete file: {e}"),
        }
    }
    deleted
}
