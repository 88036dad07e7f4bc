use std::sync::atomic::Ordering;

use blake2::{Blake2s256, Digest as _};

use super::helpers::{
    backup, backup_opts, restore_fresh, same_docs, seed_tasks, task, task_id,
};
use crate::model::{Doc, Document, DOMAIN_BLOB};
use crate::repo::sizes::load_blob_info;
use crate::repo::{load_digest, same_hash, BackupInfo};
use crate::testutil::{MemoryBackend, MemoryStore};

#[test]
fn thousand_documents_with_updates_and_deletes() {
    let storage = MemoryBackend::new();
    let store = MemoryStore::with_chunk_size(64);
    seed_tasks(&store, 1000);
    let opts = backup_opts();

    let first = backup(&storage, &store, &opts).unwrap();
    assert_eq!((first.added, first.updated, first.removed), (1000, 0, 0));
    let info = BackupInfo::load_current(&storage).unwrap();
    let before = load_digest(&storage, &info.snapshots, "task", None);

    for i in 0..10 {
        store.put_doc("task", task(&task_id(i), 10_000 + i as i64));
    }
    for i in 990..995 {
        store.remove_doc("task", &task_id(i));
    }
    let second = backup(&storage, &store, &opts).unwrap();
    assert_eq!((second.added, second.updated, second.removed), (0, 10, 5));

    let info = BackupInfo::load_current(&storage).unwrap();
    assert_eq!(info.snapshots.len(), 2);
    let digest = load_digest(&storage, &info.snapshots, "task", Some(info.snapshots[1].date));
    assert_eq!(digest.len(), 995);
    let changed = digest
        .iter()
        .filter(|(id, hash)| !same_hash(hash, &before[id.as_str()]))
        .count();
    assert_eq!(changed, 10);

    // Cutting at the first snapshot still sees every original document.
    let first_cut = load_digest(&storage, &info.snapshots, "task", Some(info.snapshots[0].date));
    assert_eq!(first_cut.len(), 1000);

    for id in ["n1", "n2", "n3"] {
        store.put_doc("task", task(id, 1));
    }
    let loaded = store.loaded_docs.load(Ordering::Relaxed);
    let third = backup(&storage, &store, &opts).unwrap();
    assert_eq!((third.added, third.updated, third.removed), (3, 0, 0));
    // The 995 unchanged documents were never loaded.
    assert_eq!(store.loaded_docs.load(Ordering::Relaxed) - loaded, 3);
}

#[test]
fn second_backup_without_changes_writes_nothing() {
    let storage = MemoryBackend::new();
    let store = MemoryStore::new();
    seed_tasks(&store, 5);
    store.put_blob("b1", "application/pdf", vec![3; 100]);
    let opts = backup_opts();

    backup(&storage, &store, &opts).unwrap();
    let data_files: Vec<String> = storage
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("000"))
        .collect();

    let again = backup(&storage, &store, &opts).unwrap();
    assert!(again.success);
    assert_eq!((again.added, again.updated, again.removed), (0, 0, 0));
    assert_eq!(again.domains_unchanged, 2);
    assert_eq!(again.snapshot_date, None);

    let info = BackupInfo::load_current(&storage).unwrap();
    assert_eq!(info.snapshots.len(), 1);
    let after: Vec<String> = storage
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("000"))
        .collect();
    assert_eq!(after, data_files);
}

#[test]
fn unchanged_transaction_marker_skips_the_pass() {
    let storage = MemoryBackend::new();
    let store = MemoryStore::new();
    seed_tasks(&store, 3);
    store.set_tx(Some("tx-1"));
    let mut opts = backup_opts();

    backup(&storage, &store, &opts).unwrap();
    assert_eq!(
        BackupInfo::load_current(&storage).unwrap().last_tx_id.as_deref(),
        Some("tx-1")
    );

    // A change behind an unchanged marker goes unnoticed...
    store.put_doc("task", task(&task_id(0), 99));
    let skipped = backup(&storage, &store, &opts).unwrap();
    assert!(skipped.skipped && skipped.success);
    assert_eq!(skipped.updated, 0);

    // ...unless forced.
    opts.force = true;
    let forced = backup(&storage, &store, &opts).unwrap();
    assert!(!forced.skipped);
    assert_eq!(forced.updated, 1);

    opts.force = false;
    store.put_doc("task", task(&task_id(1), 99));
    store.set_tx(Some("tx-2"));
    let next = backup(&storage, &store, &opts).unwrap();
    assert_eq!(next.updated, 1);
}

#[test]
fn full_verify_finds_changes_behind_matching_hashes() {
    let storage = MemoryBackend::new();
    let store = MemoryStore::new();
    seed_tasks(&store, 4);
    let mut opts = backup_opts();
    backup(&storage, &store, &opts).unwrap();

    let info = BackupInfo::load_current(&storage).unwrap();
    let stale = load_digest(&storage, &info.snapshots, "task", None)[&task_id(2)].clone();
    store.put_doc("task", task(&task_id(2), 42));
    store
        .faults
        .lock()
        .unwrap()
        .hash_overrides
        .insert(task_id(2), stale);

    let normal = backup(&storage, &store, &opts).unwrap();
    assert_eq!(normal.updated, 0);
    assert_eq!(normal.domains_unchanged, 1);

    opts.full_verify = true;
    let verified = backup(&storage, &store, &opts).unwrap();
    assert_eq!((verified.added, verified.updated, verified.removed), (0, 1, 0));

    let (restored, _) = restore_fresh(&storage);
    assert!(same_docs(&store, &restored, "task"));
}

#[test]
fn duplicated_listing_entries_are_counted_once() {
    let storage = MemoryBackend::new();
    let store = MemoryStore::with_chunk_size(2);
    seed_tasks(&store, 3);
    store
        .faults
        .lock()
        .unwrap()
        .duplicated_ids
        .insert(task_id(1));

    let result = backup(&storage, &store, &backup_opts()).unwrap();
    assert_eq!(result.added, 3);
    let info = BackupInfo::load_current(&storage).unwrap();
    assert_eq!(load_digest(&storage, &info.snapshots, "task", None).len(), 3);
}

#[test]
fn failed_listing_restarts_then_gives_up() {
    let storage = MemoryBackend::new();
    let store = MemoryStore::with_chunk_size(2);
    seed_tasks(&store, 7);
    store.faults.lock().unwrap().chunk_failures = 2;

    let result = backup(&storage, &store, &backup_opts()).unwrap();
    assert!(result.success);
    assert_eq!(result.added, 7);
    assert_eq!(store.open_cursors(), 0);

    store.put_doc("task", task("late", 1));
    store.faults.lock().unwrap().chunk_failures = 10;
    let failed = backup(&storage, &store, &backup_opts()).unwrap();
    assert!(!failed.success);
    assert_eq!(failed.failed_domains, vec!["task".to_string()]);
    assert_eq!(store.open_cursors(), 0);

    // The domain hash was not recorded, so the next pass picks it up.
    store.faults.lock().unwrap().chunk_failures = 0;
    let retry = backup(&storage, &store, &backup_opts()).unwrap();
    assert_eq!(retry.added, 1);
}

#[test]
fn short_blob_download_is_still_packed() {
    let storage = MemoryBackend::new();
    let store = MemoryStore::new();
    let declared = 5 * 1024 * 1024;
    store.put_blob("big", "application/pdf", vec![9; declared]);
    store
        .faults
        .lock()
        .unwrap()
        .truncated_blobs
        .insert("big".into(), declared - 1);

    let result = backup(&storage, &store, &backup_opts()).unwrap();
    assert!(result.success);
    assert_eq!((result.added, result.skipped_blobs), (1, 0));

    let (restored, _) = restore_fresh(&storage);
    assert_eq!(restored.blob_bytes("big").unwrap().len(), declared - 1);
}

#[test]
fn excluded_blobs_are_reported_in_blob_info() {
    let storage = MemoryBackend::new();
    let store = MemoryStore::new();
    store.put_blob("clip", "video/mp4", vec![1; 10]);
    store.put_blob("large", "application/zip", vec![2; 64]);
    store.put_blob("small", "application/pdf", vec![3; 8]);
    let mut opts = backup_opts();
    opts.blob_policy.size_limit = Some(16);

    let result = backup(&storage, &store, &opts).unwrap();
    assert_eq!((result.added, result.skipped_blobs), (1, 2));

    let blob_info = load_blob_info(&storage).unwrap();
    assert_eq!(blob_info["clip"], ("video/mp4".to_string(), 10));
    assert_eq!(blob_info["large"], ("application/zip".to_string(), 64));
    let info = BackupInfo::load_current(&storage).unwrap();
    let digest = load_digest(&storage, &info.snapshots, DOMAIN_BLOB, None);
    assert_eq!(digest.keys().collect::<Vec<_>>(), vec!["small"]);
}

#[test]
fn vanished_domain_records_every_removal() {
    let storage = MemoryBackend::new();
    let store = MemoryStore::new();
    seed_tasks(&store, 3);
    store.put_doc("contact", task("c1", 1));
    backup(&storage, &store, &backup_opts()).unwrap();

    for i in 0..3 {
        store.remove_doc("task", &task_id(i));
    }
    let result = backup(&storage, &store, &backup_opts()).unwrap();
    assert_eq!(result.removed, 3);

    let info = BackupInfo::load_current(&storage).unwrap();
    assert!(load_digest(&storage, &info.snapshots, "task", None).is_empty());
    assert_eq!(load_digest(&storage, &info.snapshots, "contact", None).len(), 1);
}

#[test]
fn archives_rotate_on_compressed_size() {
    let storage = MemoryBackend::new();
    let store = MemoryStore::with_chunk_size(500);
    for i in 0..3000 {
        let noise = hex::encode(Blake2s256::digest(task_id(i).as_bytes()));
        store.put_doc("task", doc_with_noise(&task_id(i), noise));
    }
    let mut opts = backup_opts();
    opts.pack.archive_size_limit = 200;
    opts.pack.archive_max_documents = 100_000;

    backup(&storage, &store, &opts).unwrap();
    let info = BackupInfo::load_current(&storage).unwrap();
    let data = &info.snapshots[0].domains["task"];
    assert!(data.storage.len() > 1, "{} archive(s)", data.storage.len());
    // Every rotation commits its own digest delta.
    assert_eq!(data.snapshots.len(), data.storage.len());
    assert_eq!(data.added, 3000);

    let (restored, stats) = restore_fresh(&storage);
    assert!(stats.success);
    assert!(same_docs(&store, &restored, "task"));
}

#[test]
fn small_domain_fits_one_archive_under_size_limit() {
    let storage = MemoryBackend::new();
    let store = MemoryStore::new();
    seed_tasks(&store, 50);
    let mut opts = backup_opts();
    opts.pack.archive_size_limit = 200;
    opts.pack.archive_max_documents = 100_000;

    backup(&storage, &store, &opts).unwrap();
    let info = BackupInfo::load_current(&storage).unwrap();
    assert_eq!(info.snapshots[0].domains["task"].storage.len(), 1);
}

fn doc_with_noise(id: &str, noise: String) -> Doc {
    Doc::Plain(
        Document::new(id, "task:class:Task")
            .with_space("space:tasks")
            .with_attr("noise", noise),
    )
}

#[test]
fn archives_rotate_on_document_count() {
    let storage = MemoryBackend::new();
    let store = MemoryStore::new();
    seed_tasks(&store, 10);
    let mut opts = backup_opts();
    opts.pack.archive_max_documents = 3;

    backup(&storage, &store, &opts).unwrap();
    let info = BackupInfo::load_current(&storage).unwrap();
    let data = &info.snapshots[0].domains["task"];
    assert_eq!(data.storage.len(), 4);
    assert_eq!(data.snapshots.len(), 4);
    assert_eq!(data.added, 10);

    let (restored, stats) = restore_fresh(&storage);
    assert!(stats.success);
    assert!(same_docs(&store, &restored, "task"));
}
