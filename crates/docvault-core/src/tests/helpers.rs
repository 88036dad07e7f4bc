use std::sync::Arc;
use std::time::Duration;

use crate::commands::backup::{run_backup, BackupOptions, BackupResult};
use crate::commands::restore::{restore, RestoreOptions, RestoreStats};
use crate::context::RunContext;
use crate::model::{Doc, Document};
use crate::testutil::{MemoryBackend, MemoryStore};

pub fn task(id: &str, n: i64) -> Doc {
    Doc::Plain(
        Document::new(id, "task:class:Task")
            .with_space("space:tasks")
            .with_attr("n", n),
    )
}

/// `count` tasks named `t0000`, `t0001`, ...
pub fn seed_tasks(store: &MemoryStore, count: usize) {
    for i in 0..count {
        store.put_doc("task", task(&task_id(i), i as i64));
    }
}

pub fn task_id(i: usize) -> String {
    format!("t{i:04}")
}

/// Options for a backup pass with no watchdog and no auto-compaction.
pub fn backup_opts() -> BackupOptions {
    let mut opts = BackupOptions {
        workspace: "ws".into(),
        timeout: None,
        keep_snapshots: 100,
        ..BackupOptions::default()
    };
    opts.pack.level = 6;
    opts
}

pub fn backup(
    storage: &MemoryBackend,
    store: &MemoryStore,
    opts: &BackupOptions,
) -> crate::error::Result<BackupResult> {
    let ctx = Arc::new(RunContext::new());
    run_backup(&ctx, storage, store, store, opts)
}

pub fn restore_opts() -> RestoreOptions {
    RestoreOptions {
        retries: 0,
        retry_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(1),
        ..RestoreOptions::default()
    }
}

/// Restore the latest snapshot into a fresh store.
pub fn restore_fresh(storage: &MemoryBackend) -> (MemoryStore, RestoreStats) {
    let dst = MemoryStore::new();
    let stats = restore(&RunContext::new(), storage, &dst, &dst, &restore_opts()).unwrap();
    (dst, stats)
}

/// Same ids with equal content, hashes aside.
pub fn same_docs(a: &MemoryStore, b: &MemoryStore, domain: &str) -> bool {
    let (a, b) = (a.docs(domain), b.docs(domain));
    a.len() == b.len()
        && a.iter()
            .all(|(id, doc)| b.get(id).is_some_and(|other| other.content_eq(doc)))
}
