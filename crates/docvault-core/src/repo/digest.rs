use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::compress;
use crate::error::{DocvaultError, Result};
use crate::repo::manifest::{BackupSnapshot, DomainData};
use crate::storage::{StorageBackend, StorageWrite};

/// Cumulative `id -> hash` map for one domain.
pub type Digest = HashMap<String, String>;

/// Strip surrounding quotes from a store hash so quoted and bare forms compare
/// equal.
pub fn normalize_hash(hash: &str) -> &str {
    let trimmed = hash.strip_prefix('"').unwrap_or(hash);
    trimmed.strip_suffix('"').unwrap_or(trimmed)
}

pub fn same_hash(a: &str, b: &str) -> bool {
    normalize_hash(a) == normalize_hash(b)
}

/// One rotation's add/update/remove record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestDelta {
    pub added: BTreeMap<String, String>,
    pub updated: BTreeMap<String, String>,
    pub removed: Vec<String>,
}

impl DigestDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn clear(&mut self) {
        self.added.clear();
        self.updated.clear();
        self.removed.clear();
    }

    /// Replay onto a digest: add/update overwrite, then removals delete.
    pub fn apply(&self, digest: &mut Digest) {
        for (id, hash) in self.added.iter().chain(self.updated.iter()) {
            digest.insert(id.clone(), hash.clone());
        }
        for id in &self.removed {
            digest.remove(id);
        }
    }

    /// Drop added/updated ids failing `keep`. Returns how many were dropped.
    pub fn retain_ids(&mut self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let before = self.added.len() + self.updated.len();
        self.added.retain(|id, _| keep(id));
        self.updated.retain(|id, _| keep(id));
        before - self.added.len() - self.updated.len()
    }

    /// Line-oriented, length-prefixed text form.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for section in [&self.added, &self.updated] {
            let _ = writeln!(out, "{}", section.len());
            for (id, hash) in section {
                let _ = writeln!(out, "{id};{hash}");
            }
        }
        let _ = writeln!(out, "{}", self.removed.len());
        for id in &self.removed {
            let _ = writeln!(out, "{id}");
        }
        out
    }

    /// Parse the text form produced by [`encode`](Self::encode).
    pub fn parse(name: &str, lines: impl IntoIterator<Item = std::io::Result<String>>) -> Result<Self> {
        let corrupt = |reason: String| DocvaultError::DigestCorrupt {
            name: name.to_string(),
            reason,
        };
        let mut lines = lines.into_iter();
        let mut next_line = |what: &str| -> Result<String> {
            match lines.next() {
                Some(line) => Ok(line.map_err(|e| corrupt(format!("read error: {e}")))?),
                None => Err(corrupt(format!("unexpected end of file reading {what}"))),
            }
        };

        let mut delta = DigestDelta::default();
        for section in ["added", "updated"] {
            let count_line = next_line(section)?;
            let count: usize = count_line
                .trim()
                .parse()
                .map_err(|_| corrupt(format!("bad {section} count '{count_line}'")))?;
            for _ in 0..count {
                let line = next_line(section)?;
                let (id, hash) = line
                    .split_once(';')
                    .ok_or_else(|| corrupt(format!("bad {section} entry '{line}'")))?;
                let target = if section == "added" {
                    &mut delta.added
                } else {
                    &mut delta.updated
                };
                target.insert(id.to_string(), hash.to_string());
            }
        }
        let count_line = next_line("removed")?;
        let count: usize = count_line
            .trim()
            .parse()
            .map_err(|_| corrupt(format!("bad removed count '{count_line}'")))?;
        for _ in 0..count {
            delta.removed.push(next_line("removed")?);
        }
        Ok(delta)
    }
}

/// Stream a delta into storage through gzip.
pub fn write_delta(
    storage: &dyn StorageBackend,
    name: &str,
    delta: &DigestDelta,
    level: u32,
) -> Result<()> {
    let out = storage.open_write(name)?;
    let mut encoder = GzEncoder::new(out, compress::level(level));
    encoder.write_all(delta.encode().as_bytes())?;
    let out = encoder.finish()?;
    StorageWrite::finish(out)?;
    debug!(
        name,
        added = delta.added.len(),
        updated = delta.updated.len(),
        removed = delta.removed.len(),
        "digest delta written"
    );
    Ok(())
}

pub fn read_delta(storage: &dyn StorageBackend, name: &str) -> Result<DigestDelta> {
    let reader = storage
        .open_read(name)?
        .ok_or_else(|| DocvaultError::DigestCorrupt {
            name: name.to_string(),
            reason: "file is missing".into(),
        })?;
    DigestDelta::parse(name, BufReader::new(GzDecoder::new(reader)).lines())
}

/// Whole-delta JSON written by older versions.
#[derive(Deserialize)]
struct LegacyDelta {
    #[serde(default)]
    added: BTreeMap<String, String>,
    #[serde(default)]
    updated: BTreeMap<String, String>,
    #[serde(default)]
    removed: Vec<String>,
}

pub fn read_legacy_delta(storage: &dyn StorageBackend, name: &str) -> Result<DigestDelta> {
    let corrupt = |reason: String| DocvaultError::DigestCorrupt {
        name: name.to_string(),
        reason,
    };
    let data = storage
        .get(name)?
        .ok_or_else(|| corrupt("file is missing".into()))?;
    let legacy: LegacyDelta = compress::gunzip_json(&data).map_err(|e| corrupt(e.to_string()))?;
    Ok(DigestDelta {
        added: legacy.added,
        updated: legacy.updated,
        removed: legacy.removed,
    })
}

/// Apply one snapshot's contribution for a domain, skipping unreadable files.
pub fn apply_domain_data(storage: &dyn StorageBackend, data: &DomainData, digest: &mut Digest) {
    if let Some(legacy) = &data.snapshot {
        match read_legacy_delta(storage, legacy) {
            Ok(delta) => delta.apply(digest),
            Err(e) => warn!(file = %legacy, "skipping unreadable digest: {e}"),
        }
    }
    for name in &data.snapshots {
        match read_delta(storage, name) {
            Ok(delta) => delta.apply(digest),
            Err(e) => warn!(file = %name, "skipping unreadable digest: {e}"),
        }
    }
}

/// Replay a domain's deltas oldest to newest, stopping after the snapshot
/// dated `cutoff` when one is given.
pub fn load_digest(
    storage: &dyn StorageBackend,
    snapshots: &[BackupSnapshot],
    domain: &str,
    cutoff: Option<i64>,
) -> Digest {
    let mut digest = Digest::new();
    for snapshot in snapshots {
        if let Some(data) = snapshot.domains.get(domain) {
            apply_domain_data(storage, data, &mut digest);
        }
        if cutoff == Some(snapshot.date) {
            break;
        }
    }
    debug!(domain, entries = digest.len(), "digest loaded");
    digest
}
