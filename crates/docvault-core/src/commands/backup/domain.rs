use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::collect::{collect_changes, Changes};
use super::verify::full_verify;
use super::BackupOptions;
use crate::blob::download_blob;
use crate::commands::pack::{Change, Packer};
use crate::context::RunContext;
use crate::error::{DocvaultError, Result};
use crate::model::{BlobDoc, BlobStore, Doc, DocInfo, WorkspaceStore, DOMAIN_BLOB};
use crate::repo::manifest::backup_dir;
use crate::repo::sizes::BlobInfo;
use crate::repo::{load_digest, BackupInfo};
use crate::storage::StorageBackend;

/// Everything one backup pass needs besides the manifest.
pub(super) struct BackupEnv<'a> {
    pub storage: &'a dyn StorageBackend,
    pub store: &'a dyn WorkspaceStore,
    pub blobs: &'a dyn BlobStore,
    pub opts: &'a BackupOptions,
    pub full_verify: bool,
}

#[derive(Debug, Default)]
pub(super) struct DomainOutcome {
    pub skipped: bool,
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
    pub skipped_blobs: BlobInfo,
    /// Some documents could not be captured; the domain hash stays unset so
    /// the next pass looks again.
    pub incomplete: bool,
}

fn load_with_retry(
    ctx: &RunContext,
    store: &dyn WorkspaceStore,
    domain: &str,
    ids: &[String],
    retries: usize,
) -> Result<Vec<Doc>> {
    let mut attempt = 0;
    loop {
        ctx.check()?;
        match store.load_docs(domain, ids) {
            Ok(docs) => return Ok(docs),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(domain, attempt, batch = ids.len(), "document load failed, retrying: {e}");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Capture the changes of one domain into the snapshot at `snap_idx`.
pub(super) fn process_domain(
    ctx: &RunContext,
    env: &BackupEnv<'_>,
    info: &mut BackupInfo,
    snap_idx: usize,
    domain: &str,
) -> Result<DomainOutcome> {
    let opts = env.opts;
    let live_hash = env.store.domain_hash(domain)?;
    if !opts.force && !env.full_verify && info.domain_hashes.get(domain) == Some(&live_hash) {
        debug!(domain, "domain unchanged");
        return Ok(DomainOutcome {
            skipped: true,
            ..DomainOutcome::default()
        });
    }

    let digest = load_digest(env.storage, &info.snapshots, domain, None);
    let mut changes = collect_changes(
        ctx,
        env.store,
        domain,
        &digest,
        &opts.blob_policy,
        opts.chunk_restarts,
    )?;
    drop(digest);

    if env.full_verify && domain != DOMAIN_BLOB && !changes.unchanged.is_empty() {
        full_verify(
            ctx,
            env.storage,
            env.store,
            &info.snapshots,
            domain,
            &mut changes,
            opts.batch_size,
        )?;
    }

    let mut outcome = DomainOutcome {
        skipped_blobs: std::mem::take(&mut changes.skipped_blobs),
        ..DomainOutcome::default()
    };
    if changes.is_empty() {
        debug!(domain, unchanged = changes.unchanged.len(), "no document changes");
    } else {
        info!(
            domain,
            added = changes.added.len(),
            updated = changes.updated.len(),
            removed = changes.removed.len(),
            "backing up domain"
        );
    }

    let dir = backup_dir(info.snapshots_index);
    let mut packer = Packer::new(env.storage, &opts.pack, domain, &dir, snap_idx);
    pack_changes(ctx, env, info, &mut packer, domain, changes, &mut outcome)?;
    packer.finish(info)?;

    if outcome.incomplete {
        warn!(domain, "domain captured incompletely, it will be rechecked next run");
    } else {
        info.domain_hashes.insert(domain.to_string(), live_hash);
    }
    info.save(env.storage, opts.pack.level)?;
    Ok(outcome)
}

fn pack_changes(
    ctx: &RunContext,
    env: &BackupEnv<'_>,
    info: &mut BackupInfo,
    packer: &mut Packer<'_>,
    domain: &str,
    changes: Changes,
    outcome: &mut DomainOutcome,
) -> Result<()> {
    let queue: Vec<(DocInfo, Change)> = changes
        .added
        .into_iter()
        .map(|i| (i, Change::Added))
        .chain(changes.updated.into_iter().map(|i| (i, Change::Updated)))
        .collect();

    for batch in queue.chunks(env.opts.batch_size.max(1)) {
        ctx.check()?;
        if domain == DOMAIN_BLOB {
            pack_blob_batch(ctx, env, info, packer, batch, outcome)?;
        } else {
            pack_doc_batch(ctx, env, info, packer, domain, batch, outcome)?;
        }
    }

    outcome.removed = changes.removed.len() as u64;
    packer.remove(changes.removed);
    Ok(())
}

fn count(outcome: &mut DomainOutcome, change: Change) {
    match change {
        Change::Added => outcome.added += 1,
        Change::Updated => outcome.updated += 1,
    }
}

fn pack_doc_batch(
    ctx: &RunContext,
    env: &BackupEnv<'_>,
    info: &mut BackupInfo,
    packer: &mut Packer<'_>,
    domain: &str,
    batch: &[(DocInfo, Change)],
    outcome: &mut DomainOutcome,
) -> Result<()> {
    let ids: Vec<String> = batch.iter().map(|(i, _)| i.id.clone()).collect();
    let mut docs: HashMap<String, Doc> =
        load_with_retry(ctx, env.store, domain, &ids, env.opts.load_retries)?
            .into_iter()
            .map(|d| (d.id().to_string(), d))
            .collect();

    for (doc_info, change) in batch {
        ctx.tick();
        match docs.remove(&doc_info.id) {
            Some(doc) => {
                packer.add_doc(info, &doc, *change, &doc_info.hash)?;
                count(outcome, *change);
            }
            None => debug!(domain, id = %doc_info.id, "document vanished before load"),
        }
    }
    Ok(())
}

fn pack_blob_batch(
    ctx: &RunContext,
    env: &BackupEnv<'_>,
    info: &mut BackupInfo,
    packer: &mut Packer<'_>,
    batch: &[(DocInfo, Change)],
    outcome: &mut DomainOutcome,
) -> Result<()> {
    let policy = &env.opts.blob_policy;

    // Listings carrying size and content type need no metadata round-trip.
    let mut metas: HashMap<String, BlobDoc> = HashMap::new();
    let mut to_load = Vec::new();
    for (doc_info, _) in batch {
        match (&doc_info.content_type, doc_info.size) {
            (Some(content_type), Some(size)) => {
                let mut meta = BlobDoc::new(&doc_info.id, content_type, size);
                meta.etag = doc_info.hash.clone();
                metas.insert(doc_info.id.clone(), meta);
            }
            _ => to_load.push(doc_info.id.clone()),
        }
    }
    if !to_load.is_empty() {
        for doc in load_with_retry(ctx, env.store, DOMAIN_BLOB, &to_load, env.opts.load_retries)? {
            match doc {
                Doc::Blob(meta) => {
                    metas.insert(meta.id.clone(), meta);
                }
                Doc::Plain(doc) => warn!(id = %doc.id, class = %doc.class, "not a blob document"),
            }
        }
    }

    for (doc_info, change) in batch {
        ctx.check()?;
        ctx.tick();
        let Some(meta) = metas.remove(&doc_info.id) else {
            debug!(id = %doc_info.id, "blob vanished before load");
            continue;
        };
        if policy.excludes(&meta.content_type, meta.size) {
            outcome
                .skipped_blobs
                .insert(meta.id.clone(), (meta.content_type.clone(), meta.size));
            continue;
        }
        match download_blob(env.blobs, &meta, policy.size_limit) {
            Ok(data) => {
                packer.add_blob(info, &meta, &data, *change, &doc_info.hash)?;
                count(outcome, *change);
            }
            Err(DocvaultError::BlobTooLarge { size, .. }) => {
                outcome
                    .skipped_blobs
                    .insert(meta.id.clone(), (meta.content_type.clone(), size));
            }
            Err(e) => {
                warn!(id = %meta.id, "failed to download blob: {e}");
                outcome.incomplete = true;
            }
        }
    }
    Ok(())
}
