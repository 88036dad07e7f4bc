use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use super::util::DomainFilter;
use crate::config::DocvaultConfig;
use crate::error::{DocvaultError, Result};
use crate::repo::sizes::{load_size_info, BLOB_INFO_KEY, SIZE_INFO_KEY};
use crate::repo::{BackupInfo, MANIFEST_KEY};
use crate::storage::{self, StorageBackend};

#[derive(Debug, Default)]
pub struct DownloadStats {
    pub files_copied: usize,
    /// Files already present locally with the expected size.
    pub files_skipped: usize,
    pub bytes_copied: u64,
}

/// Run `docvault download`.
pub fn run(config: &DocvaultConfig, dest: &Path, filter: &DomainFilter) -> Result<DownloadStats> {
    let backend = storage::backend_from_url(&config.repository.url)?;
    download_backup(backend.as_ref(), dest, filter)
}

/// Resolve a storage key below `dest`, refusing keys that would escape it.
fn local_path(dest: &Path, key: &str) -> Result<PathBuf> {
    let rel = Path::new(key);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(DocvaultError::InvalidFormat(format!(
            "refusing to download unsafe file name '{key}'"
        )));
    }
    Ok(dest.join(rel))
}

/// Stream one object to `path` through a temporary sibling file.
fn copy_file(storage: &dyn StorageBackend, key: &str, path: &Path) -> Result<u64> {
    let mut reader = storage.open_read(key)?.ok_or_else(|| {
        DocvaultError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("backup file '{key}' is missing"),
        ))
    })?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    let size = io::copy(&mut reader, &mut tmp)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| DocvaultError::Io(e.error))?;
    Ok(size)
}

/// Copy a backup to a local directory. Files whose local size matches the
/// size cache are skipped, so an interrupted download resumes cheaply. The
/// manifest is written last.
pub fn download_backup(
    storage: &dyn StorageBackend,
    dest: &Path,
    filter: &DomainFilter,
) -> Result<DownloadStats> {
    let info = BackupInfo::load(storage)?
        .ok_or_else(|| DocvaultError::ManifestNotFound(MANIFEST_KEY.to_string()))?;
    let sizes = load_size_info(storage)?;
    let mut stats = DownloadStats::default();
    fs::create_dir_all(dest)?;

    for snapshot in &info.snapshots {
        for (domain, data) in &snapshot.domains {
            if !filter.allows(domain) {
                debug!(domain = %domain, date = snapshot.date, "skipping domain");
                continue;
            }
            for key in data.files() {
                let path = local_path(dest, key)?;
                let expected = match sizes.get(key) {
                    Some(size) => Some(*size),
                    None => storage.stat(key)?,
                };
                let local = fs::metadata(&path).ok().map(|m| m.len());
                if local.is_some() && local == expected {
                    stats.files_skipped += 1;
                    continue;
                }
                let size = copy_file(storage, key, &path)?;
                stats.files_copied += 1;
                stats.bytes_copied += size;
                debug!(file = key, size, "downloaded");
            }
        }
    }

    for key in [BLOB_INFO_KEY, SIZE_INFO_KEY, MANIFEST_KEY] {
        if storage.exists(key)? {
            stats.bytes_copied += copy_file(storage, key, &local_path(dest, key)?)?;
            stats.files_copied += 1;
        }
    }

    info!(
        dest = %dest.display(),
        copied = stats.files_copied,
        skipped = stats.files_skipped,
        bytes = stats.bytes_copied,
        "backup downloaded"
    );
    Ok(stats)
}
