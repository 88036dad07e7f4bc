use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults::*;
use crate::error::{DocvaultError, Result};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocvaultConfig {
    pub repository: RepositoryConfig,
    /// Workspace identifier recorded in the manifest.
    pub workspace: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
}

impl DocvaultConfig {
    pub fn validate(&self) -> Result<()> {
        if self.repository.url.trim().is_empty() {
            return Err(DocvaultError::Config("repository.url must not be empty".into()));
        }
        if self.workspace.trim().is_empty() {
            return Err(DocvaultError::Config("workspace must not be empty".into()));
        }
        self.backup.validate()?;
        self.restore.validate()?;
        self.compression.validate()
    }

    /// Root of the live filesystem store. Required by backup and restore.
    pub fn store_root(&self) -> Result<PathBuf> {
        self.store
            .path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| DocvaultError::Config("store.path is not set".into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Backup location: bare path or `file://` URL.
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    /// Rotate an archive once its compressed size passes this many MiB.
    #[serde(default = "default_archive_size_mib")]
    pub archive_size_mib: u64,
    /// Rotate an archive once it holds this many changes.
    #[serde(default = "default_archive_max_documents")]
    pub archive_max_documents: usize,
    /// Documents loaded from the store per request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Blobs above this size are skipped (MiB).
    #[serde(default = "default_blob_limit_mib")]
    pub blob_limit_mib: u64,
    /// Blob content-type prefixes never backed up.
    #[serde(default = "default_skip_content_types")]
    pub skip_content_types: Vec<String>,
    /// Chains longer than this are compacted before the next backup.
    #[serde(default = "default_keep_snapshots")]
    pub keep_snapshots: usize,
    /// Cancel a backup making no progress for this long ("30m", "2h").
    #[serde(default = "default_timeout")]
    pub timeout: String,
    /// Directory for archive temp files. System temp dir when unset.
    #[serde(default)]
    pub temp_dir: Option<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            archive_size_mib: default_archive_size_mib(),
            archive_max_documents: default_archive_max_documents(),
            batch_size: default_batch_size(),
            blob_limit_mib: default_blob_limit_mib(),
            skip_content_types: default_skip_content_types(),
            keep_snapshots: default_keep_snapshots(),
            timeout: default_timeout(),
            temp_dir: None,
        }
    }
}

impl BackupConfig {
    pub fn archive_size_limit(&self) -> u64 {
        self.archive_size_mib.saturating_mul(MIB)
    }

    pub fn blob_limit(&self) -> u64 {
        self.blob_limit_mib.saturating_mul(MIB)
    }

    pub fn timeout(&self) -> Result<Duration> {
        parse_human_duration(&self.timeout)
    }

    fn validate(&self) -> Result<()> {
        if self.archive_size_mib == 0 {
            return Err(DocvaultError::Config(
                "backup.archive_size_mib must be greater than zero".into(),
            ));
        }
        if self.archive_max_documents == 0 {
            return Err(DocvaultError::Config(
                "backup.archive_max_documents must be greater than zero".into(),
            ));
        }
        if !(1..=10_000).contains(&self.batch_size) {
            return Err(DocvaultError::Config(format!(
                "backup.batch_size must be in [1, 10000], got {}",
                self.batch_size
            )));
        }
        if self.keep_snapshots == 0 {
            return Err(DocvaultError::Config(
                "backup.keep_snapshots must be greater than zero".into(),
            ));
        }
        self.timeout()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestoreConfig {
    /// Domains restored concurrently.
    #[serde(default = "default_restore_parallel")]
    pub parallel: usize,
    /// Serialized size of one upload batch (MiB).
    #[serde(default = "default_upload_batch_mib")]
    pub upload_batch_mib: u64,
    /// Retries per domain before giving up.
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Concurrent blob uploads.
    #[serde(default = "default_blob_concurrency")]
    pub blob_concurrency: usize,
    /// File recording blobs already uploaded, to resume interrupted restores.
    #[serde(default)]
    pub history_file: Option<String>,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            parallel: default_restore_parallel(),
            upload_batch_mib: default_upload_batch_mib(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            blob_concurrency: default_blob_concurrency(),
            history_file: None,
        }
    }
}

impl RestoreConfig {
    pub fn upload_batch_bytes(&self) -> usize {
        self.upload_batch_mib.saturating_mul(MIB) as usize
    }

    fn validate(&self) -> Result<()> {
        if !(1..=64).contains(&self.parallel) {
            return Err(DocvaultError::Config(format!(
                "restore.parallel must be in [1, 64], got {}",
                self.parallel
            )));
        }
        if !(1..=256).contains(&self.blob_concurrency) {
            return Err(DocvaultError::Config(format!(
                "restore.blob_concurrency must be in [1, 256], got {}",
                self.blob_concurrency
            )));
        }
        if self.upload_batch_mib == 0 {
            return Err(DocvaultError::Config(
                "restore.upload_batch_mib must be greater than zero".into(),
            ));
        }
        if self.retry_max_delay_ms < self.retry_delay_ms {
            return Err(DocvaultError::Config(
                "restore.retry_max_delay_ms must not be below restore.retry_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionConfig {
    /// gzip level, 0-9.
    #[serde(default = "default_gzip_level")]
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: default_gzip_level(),
        }
    }
}

impl CompressionConfig {
    fn validate(&self) -> Result<()> {
        if self.level > 9 {
            return Err(DocvaultError::Config(format!(
                "compression.level must be in [0, 9], got {}",
                self.level
            )));
        }
        Ok(())
    }
}
