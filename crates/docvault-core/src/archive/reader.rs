use std::collections::{HashMap, HashSet};
use std::io::Read;

use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::error::{DocvaultError, Result};
use crate::model::{BlobDoc, Doc};
use crate::storage::StorageBackend;

/// A document resolved from an archive.
#[derive(Debug)]
pub enum ArchiveItem {
    Doc(Doc),
    /// Blob metadata paired with its bytes.
    Blob(BlobDoc, Vec<u8>),
}

impl ArchiveItem {
    pub fn id(&self) -> &str {
        match self {
            ArchiveItem::Doc(doc) => doc.id(),
            ArchiveItem::Blob(blob, _) => &blob.id,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadStats {
    pub entries: usize,
    pub resolved: usize,
    pub malformed: usize,
}

fn corrupt(name: &str, e: impl std::fmt::Display) -> DocvaultError {
    DocvaultError::ArchiveCorrupt {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

fn open_entries(
    storage: &dyn StorageBackend,
    name: &str,
) -> Result<tar::Archive<GzDecoder<Box<dyn Read + Send>>>> {
    let reader = storage
        .open_read(name)?
        .ok_or_else(|| corrupt(name, "file is missing"))?;
    Ok(tar::Archive::new(GzDecoder::new(reader)))
}

/// Stream an archive, handing every document whose id is in `wanted` to
/// `on_item`. Resolved ids are removed from `wanted`, and reading stops as
/// soon as nothing is left to resolve.
///
/// Blob metadata and blob bytes may arrive in either order; a blob is emitted
/// once both halves are seen. Unparseable document entries are skipped with a
/// warning and stay in `wanted`. A broken compressed or tar stream fails with
/// [`DocvaultError::ArchiveCorrupt`].
pub fn read_archive(
    storage: &dyn StorageBackend,
    name: &str,
    wanted: &mut HashSet<String>,
    mut on_item: impl FnMut(ArchiveItem) -> Result<()>,
) -> Result<ReadStats> {
    let mut stats = ReadStats::default();
    if wanted.is_empty() {
        return Ok(stats);
    }

    let mut archive = open_entries(storage, name)?;
    let mut pending_meta: HashMap<String, BlobDoc> = HashMap::new();
    let mut pending_data: HashMap<String, Vec<u8>> = HashMap::new();

    for entry in archive.entries().map_err(|e| corrupt(name, e))? {
        let mut entry = entry.map_err(|e| corrupt(name, e))?;
        stats.entries += 1;
        let path = entry
            .path()
            .map_err(|e| corrupt(name, e))?
            .to_string_lossy()
            .into_owned();

        if let Some(id) = path.strip_suffix(".json") {
            if !wanted.contains(id) {
                continue;
            }
            let mut raw = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut raw).map_err(|e| corrupt(name, e))?;
            let loaded = match Doc::from_slice(&raw) {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(archive = name, id, "skipping malformed document: {e}");
                    stats.malformed += 1;
                    continue;
                }
            };
            match (loaded.doc, loaded.inline_data) {
                (Doc::Blob(blob), Some(data)) => {
                    wanted.remove(id);
                    stats.resolved += 1;
                    on_item(ArchiveItem::Blob(blob, data))?;
                }
                (Doc::Blob(blob), None) => match pending_data.remove(id) {
                    Some(data) => {
                        wanted.remove(id);
                        stats.resolved += 1;
                        on_item(ArchiveItem::Blob(blob, data))?;
                    }
                    None => {
                        pending_meta.insert(id.to_string(), blob);
                    }
                },
                (doc, _) => {
                    wanted.remove(id);
                    stats.resolved += 1;
                    on_item(ArchiveItem::Doc(doc))?;
                }
            }
        } else if wanted.contains(path.as_str()) {
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data).map_err(|e| corrupt(name, e))?;
            match pending_meta.remove(&path) {
                Some(blob) => {
                    wanted.remove(&path);
                    stats.resolved += 1;
                    on_item(ArchiveItem::Blob(blob, data))?;
                }
                None => {
                    pending_data.insert(path, data);
                }
            }
        }

        if wanted.is_empty() {
            break;
        }
    }

    for id in pending_meta.keys() {
        warn!(archive = name, id = %id, "blob metadata without data");
    }
    debug!(
        archive = name,
        entries = stats.entries,
        resolved = stats.resolved,
        "archive read"
    );
    Ok(stats)
}

/// Verification view of an archive.
#[derive(Debug, Default, Clone)]
pub struct ArchiveScan {
    /// Ids whose documents decode, with blob bytes present and non-empty.
    pub valid: HashSet<String>,
    /// Blob ids whose stored bytes are empty.
    pub zero_sized: HashSet<String>,
    pub malformed: usize,
    pub entries: usize,
}

/// Read every entry of an archive and classify its documents.
pub fn scan_archive(storage: &dyn StorageBackend, name: &str) -> Result<ArchiveScan> {
    let mut scan = ArchiveScan::default();
    let mut archive = open_entries(storage, name)?;
    let mut blob_meta: HashSet<String> = HashSet::new();
    let mut blob_data: HashSet<String> = HashSet::new();

    for entry in archive.entries().map_err(|e| corrupt(name, e))? {
        let mut entry = entry.map_err(|e| corrupt(name, e))?;
        scan.entries += 1;
        let path = entry
            .path()
            .map_err(|e| corrupt(name, e))?
            .to_string_lossy()
            .into_owned();

        match path.strip_suffix(".json") {
            Some(id) => {
                let mut raw = Vec::new();
                entry.read_to_end(&mut raw).map_err(|e| corrupt(name, e))?;
                match Doc::from_slice(&raw) {
                    Ok(loaded) if loaded.doc.is_blob() && loaded.inline_data.is_none() => {
                        blob_meta.insert(id.to_string());
                    }
                    Ok(_) => {
                        scan.valid.insert(id.to_string());
                    }
                    Err(e) => {
                        warn!(archive = name, id, "malformed document: {e}");
                        scan.malformed += 1;
                    }
                }
            }
            None => {
                // Drain so stream damage inside the payload surfaces here.
                let size = std::io::copy(&mut entry, &mut std::io::sink())
                    .map_err(|e| corrupt(name, e))?;
                if size == 0 {
                    scan.zero_sized.insert(path);
                } else {
                    blob_data.insert(path);
                }
            }
        }
    }

    for id in blob_meta {
        if blob_data.contains(&id) {
            scan.valid.insert(id);
        } else if !scan.zero_sized.contains(&id) {
            warn!(archive = name, id = %id, "blob metadata without data");
        }
    }
    Ok(scan)
}
