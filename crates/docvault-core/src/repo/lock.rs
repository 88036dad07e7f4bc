use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DocvaultError, Result};
use crate::storage::StorageBackend;

/// A simple advisory lock stored in `locks/<ts>-<rand>.json`.
#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: String,
}

const LOCKS_PREFIX: &str = "locks/";
const DEFAULT_STALE_LOCK_SECS: i64 = 6 * 60 * 60;

/// Handle to an acquired lock.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Acquire the advisory lock on a workspace backup.
pub fn acquire_lock(storage: &dyn StorageBackend) -> Result<LockGuard> {
    cleanup_stale_locks(storage, Duration::seconds(DEFAULT_STALE_LOCK_SECS))?;

    let now = Utc::now();
    let entry = LockEntry {
        hostname: crate::platform::hostname(),
        pid: std::process::id(),
        time: now.to_rfc3339(),
    };

    let suffix = format!("{:032x}", rand::random::<u128>());
    // Timestamp prefix keeps older lock keys sorted first.
    let ts = now.timestamp_micros();
    let key = format!("{LOCKS_PREFIX}{ts:020}-{suffix}.json");
    storage.put(&key, &serde_json::to_vec(&entry)?)?;

    // Oldest key wins.
    let mut keys = list_lock_keys(storage)?;
    keys.sort();
    if keys.first() != Some(&key) {
        let _ = storage.delete(&key);
        let holder = keys
            .first()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        return Err(DocvaultError::Locked(holder));
    }

    debug!(key, "lock acquired");
    Ok(LockGuard { key })
}

pub fn release_lock(storage: &dyn StorageBackend, guard: LockGuard) -> Result<()> {
    storage.delete(&guard.key)
}

/// Remove every lock file. Recovery for locks left by killed processes.
pub fn break_lock(storage: &dyn StorageBackend) -> Result<usize> {
    let keys = list_lock_keys(storage)?;
    for key in &keys {
        storage.delete(key)?;
    }
    Ok(keys.len())
}

fn list_lock_keys(storage: &dyn StorageBackend) -> Result<Vec<String>> {
    let mut keys = storage.list(LOCKS_PREFIX)?;
    keys.retain(|k| k.starts_with(LOCKS_PREFIX) && k.ends_with(".json"));
    Ok(keys)
}

fn cleanup_stale_locks(storage: &dyn StorageBackend, max_age: Duration) -> Result<()> {
    let now = Utc::now();
    for key in list_lock_keys(storage)? {
        let Some(data) = storage.get(&key)? else {
            continue;
        };
        let Ok(entry) = serde_json::from_slice::<LockEntry>(&data) else {
            continue;
        };
        let Ok(acquired) = chrono::DateTime::parse_from_rfc3339(&entry.time) else {
            continue;
        };
        if now.signed_duration_since(acquired.with_timezone(&Utc)) > max_age {
            warn!(key, host = %entry.hostname, pid = entry.pid, "removing stale lock");
            let _ = storage.delete(&key);
        }
    }
    Ok(())
}

/// Run `action` while holding the lock; the lock is released even when the
/// action fails.
pub fn with_lock<T>(
    storage: &dyn StorageBackend,
    action: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let guard = acquire_lock(storage)?;
    let result = action();
    if let Err(e) = release_lock(storage, guard) {
        warn!("failed to release lock: {e}");
    }
    result
}
