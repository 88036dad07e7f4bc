use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::blob::BlobPolicy;
use crate::commands::util::for_each_chunk;
use crate::context::RunContext;
use crate::error::{DocvaultError, Result};
use crate::model::{DocInfo, WorkspaceStore, DOMAIN_BLOB};
use crate::repo::sizes::BlobInfo;
use crate::repo::{normalize_hash, Digest};

/// Classification of a live domain against its cumulative digest.
#[derive(Debug, Default)]
pub(crate) struct Changes {
    /// Ids missing from the digest, in listing order.
    pub added: Vec<DocInfo>,
    /// Ids whose hash differs from the digest.
    pub updated: Vec<DocInfo>,
    /// Ids whose hash matches: id -> normalized hash.
    pub unchanged: BTreeMap<String, String>,
    /// Digest ids absent from the live listing.
    pub removed: Vec<String>,
    /// Blobs excluded by policy: id -> (content type, size).
    pub skipped_blobs: BlobInfo,
    pub listed: usize,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

fn excluded_by_policy(policy: &BlobPolicy, info: &DocInfo) -> bool {
    info.content_type
        .as_deref()
        .is_some_and(|ct| policy.skips_type(ct))
        || info.size.is_some_and(|size| policy.exceeds_limit(size))
}

fn collect_once(
    ctx: &RunContext,
    store: &dyn WorkspaceStore,
    domain: &str,
    digest: &Digest,
    policy: &BlobPolicy,
) -> Result<Changes> {
    let mut changes = Changes::default();
    let mut working = digest.clone();
    let mut seen: HashSet<String> = HashSet::new();

    for_each_chunk(ctx, store, domain, |chunk| {
        for mut info in chunk.docs {
            ctx.tick();
            changes.listed += 1;
            if !seen.insert(info.id.clone()) {
                continue;
            }
            if domain == DOMAIN_BLOB && excluded_by_policy(policy, &info) {
                working.remove(&info.id);
                changes.skipped_blobs.insert(
                    info.id.clone(),
                    (info.content_type.clone().unwrap_or_default(), info.size.unwrap_or(0)),
                );
                continue;
            }

            info.hash = normalize_hash(&info.hash).to_string();
            match working.remove(&info.id) {
                Some(old) if normalize_hash(&old) == info.hash => {
                    changes.unchanged.insert(info.id, info.hash);
                }
                Some(_) => changes.updated.push(info),
                None => changes.added.push(info),
            }
        }
        Ok(())
    })?;

    let mut removed: Vec<String> = working.into_keys().collect();
    removed.sort();
    changes.removed = removed;
    Ok(changes)
}

/// Pull the live listing of `domain` and classify it against `digest`.
///
/// A failing chunk read discards everything collected so far and restarts
/// from a new cursor, at most `restarts` times.
pub(crate) fn collect_changes(
    ctx: &RunContext,
    store: &dyn WorkspaceStore,
    domain: &str,
    digest: &Digest,
    policy: &BlobPolicy,
    restarts: usize,
) -> Result<Changes> {
    let mut attempt = 0;
    loop {
        match collect_once(ctx, store, domain, digest, policy) {
            Ok(changes) => {
                debug!(
                    domain,
                    listed = changes.listed,
                    added = changes.added.len(),
                    updated = changes.updated.len(),
                    unchanged = changes.unchanged.len(),
                    removed = changes.removed.len(),
                    "changes collected"
                );
                return Ok(changes);
            }
            Err(DocvaultError::Interrupted) => return Err(DocvaultError::Interrupted),
            Err(e) if attempt < restarts => {
                attempt += 1;
                warn!(domain, attempt, "chunk listing failed, restarting: {e}");
            }
            Err(e) => return Err(e),
        }
    }
}
