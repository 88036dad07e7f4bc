use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compress;
use crate::error::{DocvaultError, Result};
use crate::storage::StorageBackend;

/// Fixed name of the manifest within a workspace's backup root.
pub const MANIFEST_KEY: &str = "backup.json.gz";

/// The only manifest version written, and the only one read without upgrade.
pub const FORMAT_VERSION: &str = "0.6.2";

/// Bumping this marker forces one full-verify pass on every existing backup.
pub const FORCED_FULL_CHECK: &str = "2";

/// Per-domain contribution of one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainData {
    /// Legacy whole-delta JSON file written by older versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    /// Digest-delta files, in write order.
    #[serde(default)]
    pub snapshots: Vec<String>,
    /// Archive files, in write order.
    #[serde(default)]
    pub storage: Vec<String>,
    #[serde(default)]
    pub added: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub removed: u64,
}

impl DomainData {
    /// Every file this domain data references.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.snapshot
            .iter()
            .chain(self.snapshots.iter())
            .chain(self.storage.iter())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.snapshots.is_empty() && self.storage.is_empty()
    }
}

/// One backup run's contribution to the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    /// Milliseconds since the Unix epoch.
    pub date: i64,
    #[serde(default)]
    pub domains: BTreeMap<String, DomainData>,
    /// Running archive counter, shared by every domain of the snapshot.
    #[serde(default)]
    pub st_index: u64,
    /// Set while a compaction is building this snapshot.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compacting: bool,
}

impl BackupSnapshot {
    pub fn new(date: i64) -> Self {
        Self {
            date,
            domains: BTreeMap::new(),
            st_index: 0,
            compacting: false,
        }
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.domains.values().flat_map(DomainData::files)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migrations {
    /// Set once the zero-size entry integrity pass has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zero_check_size: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_full_check: Option<String>,
}

/// The manifest: single source of truth for the whole snapshot chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    #[serde(default)]
    pub workspace: String,
    pub version: String,
    #[serde(default)]
    pub snapshots: Vec<BackupSnapshot>,
    #[serde(default)]
    pub snapshots_index: u64,
    #[serde(default)]
    pub domain_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub migrations: Migrations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tx_id: Option<String>,
    #[serde(default)]
    pub data_size: u64,
    #[serde(default)]
    pub blobs_size: u64,
    #[serde(default)]
    pub backup_size: u64,
}

impl BackupInfo {
    pub fn new(workspace: &str) -> Self {
        Self {
            workspace: workspace.to_string(),
            version: FORMAT_VERSION.to_string(),
            snapshots: Vec::new(),
            snapshots_index: 0,
            domain_hashes: BTreeMap::new(),
            migrations: Migrations::default(),
            last_tx_id: None,
            data_size: 0,
            blobs_size: 0,
            backup_size: 0,
        }
    }

    /// Load the manifest, `None` if no backup exists yet.
    pub fn load(storage: &dyn StorageBackend) -> Result<Option<Self>> {
        let Some(data) = storage.get(MANIFEST_KEY)? else {
            return Ok(None);
        };
        let info: BackupInfo = compress::gunzip_json(&data).map_err(|e| {
            DocvaultError::InvalidFormat(format!("unreadable manifest {MANIFEST_KEY}: {e}"))
        })?;
        debug!(
            workspace = %info.workspace,
            version = %info.version,
            snapshots = info.snapshots.len(),
            "loaded manifest"
        );
        Ok(Some(info))
    }

    /// Load a manifest that must exist and be of the current version.
    pub fn load_current(storage: &dyn StorageBackend) -> Result<Self> {
        let info = Self::load(storage)?
            .ok_or_else(|| DocvaultError::ManifestNotFound(MANIFEST_KEY.to_string()))?;
        info.ensure_current_version()?;
        Ok(info)
    }

    pub fn ensure_current_version(&self) -> Result<()> {
        if self.version != FORMAT_VERSION {
            return Err(DocvaultError::UnsupportedVersion(self.version.clone()));
        }
        Ok(())
    }

    /// Rewrite the manifest atomically.
    pub fn save(&self, storage: &dyn StorageBackend, level: u32) -> Result<()> {
        let data = compress::gzip_json(self, level)?;
        storage.put(MANIFEST_KEY, &data)?;
        debug!(snapshots = self.snapshots.len(), "manifest written");
        Ok(())
    }

    /// Union of every domain recorded in any snapshot.
    pub fn domains(&self) -> BTreeSet<String> {
        self.snapshots
            .iter()
            .flat_map(|s| s.domains.keys().cloned())
            .collect()
    }

    pub fn snapshot_position(&self, date: i64) -> Option<usize> {
        self.snapshots.iter().position(|s| s.date == date)
    }

    pub fn compacting_position(&self) -> Option<usize> {
        self.snapshots.iter().position(|s| s.compacting)
    }

    pub fn latest_date(&self) -> Option<i64> {
        self.snapshots.last().map(|s| s.date)
    }
}

/// Directory holding one run's files, e.g. `000012`.
pub fn backup_dir(index: u64) -> String {
    format!("{index:06}")
}

pub fn archive_name(dir: &str, domain: &str, date: i64, index: u64) -> String {
    format!("{dir}/{domain}-data-{date}-{index:04}.tar.gz")
}

pub fn digest_name(dir: &str, domain: &str, date: i64, index: u64) -> String {
    format!("{dir}/{domain}-digest-{date}-{index:04}.snp.gz")
}

/// Directory component of a data file name.
pub fn parent_dir(name: &str) -> Option<&str> {
    name.rsplit_once('/').map(|(dir, _)| dir)
}
