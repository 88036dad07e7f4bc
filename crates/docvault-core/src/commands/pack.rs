use std::path::PathBuf;

use tracing::{debug, info};

use crate::archive::ArchiveWriter;
use crate::error::Result;
use crate::model::{BlobDoc, Doc};
use crate::repo::manifest::{archive_name, digest_name};
use crate::repo::{BackupInfo, DigestDelta};
use crate::storage::StorageBackend;

/// Archive rotation limits and output settings.
#[derive(Debug, Clone)]
pub struct PackLimits {
    /// Rotate once the compressed archive passes this many bytes.
    pub archive_size_limit: u64,
    /// Rotate once an archive holds this many documents.
    pub archive_max_documents: usize,
    pub level: u32,
    pub temp_dir: Option<PathBuf>,
}

impl Default for PackLimits {
    fn default() -> Self {
        Self {
            archive_size_limit: 250 * 1024 * 1024,
            archive_max_documents: 10_000,
            level: crate::compress::DEFAULT_LEVEL,
            temp_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Change {
    Added,
    Updated,
}

/// Writes one domain's documents into size-rotated archives of one snapshot.
///
/// Every rotation uploads the archive, writes the matching digest delta, then
/// records both in the manifest and rewrites it, in that order.
pub(crate) struct Packer<'a> {
    storage: &'a dyn StorageBackend,
    limits: &'a PackLimits,
    domain: String,
    dir: String,
    snapshot: usize,
    writer: Option<ArchiveWriter>,
    index: Option<u64>,
    delta: DigestDelta,
    pub(crate) documents: u64,
    pub(crate) rotations: usize,
}

impl<'a> Packer<'a> {
    pub(crate) fn new(
        storage: &'a dyn StorageBackend,
        limits: &'a PackLimits,
        domain: &str,
        dir: &str,
        snapshot: usize,
    ) -> Self {
        Self {
            storage,
            limits,
            domain: domain.to_string(),
            dir: dir.to_string(),
            snapshot,
            writer: None,
            index: None,
            delta: DigestDelta::default(),
            documents: 0,
            rotations: 0,
        }
    }

    fn next_index(&self, info: &mut BackupInfo) -> u64 {
        let snapshot = &mut info.snapshots[self.snapshot];
        snapshot.st_index += 1;
        snapshot.st_index
    }

    fn over_limits(&self) -> bool {
        self.writer.as_ref().is_some_and(|w| {
            w.compressed_size() > self.limits.archive_size_limit
                || w.documents() >= self.limits.archive_max_documents
        })
    }

    /// Rotate if the open archive is full, then make sure one is open.
    fn prepare(&mut self, info: &mut BackupInfo) -> Result<&mut ArchiveWriter> {
        if self.over_limits() {
            self.rotate(info)?;
        }
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                let index = self.next_index(info);
                let date = info.snapshots[self.snapshot].date;
                let name = archive_name(&self.dir, &self.domain, date, index);
                self.index = Some(index);
                ArchiveWriter::create(&name, self.limits.temp_dir.as_deref(), self.limits.level)?
            }
        };
        Ok(self.writer.insert(writer))
    }

    fn record(&mut self, id: &str, change: Change, hash: &str) {
        let target = match change {
            Change::Added => &mut self.delta.added,
            Change::Updated => &mut self.delta.updated,
        };
        target.insert(id.to_string(), hash.to_string());
        self.documents += 1;
    }

    pub(crate) fn add_doc(
        &mut self,
        info: &mut BackupInfo,
        doc: &Doc,
        change: Change,
        hash: &str,
    ) -> Result<()> {
        self.prepare(info)?.append_doc(doc)?;
        self.record(doc.id(), change, hash);
        Ok(())
    }

    pub(crate) fn add_blob(
        &mut self,
        info: &mut BackupInfo,
        blob: &BlobDoc,
        data: &[u8],
        change: Change,
        hash: &str,
    ) -> Result<()> {
        self.prepare(info)?.append_blob(blob, data)?;
        self.record(&blob.id, change, hash);
        Ok(())
    }

    /// Record removals for the next rotation.
    pub(crate) fn remove(&mut self, ids: impl IntoIterator<Item = String>) {
        self.delta.removed.extend(ids);
    }

    /// Close the open archive and persist it with its delta.
    pub(crate) fn rotate(&mut self, info: &mut BackupInfo) -> Result<()> {
        let archive = match self.writer.take() {
            Some(writer) if writer.documents() > 0 => {
                let name = writer.name().to_string();
                let size = writer.finish(self.storage)?;
                Some((name, size))
            }
            _ => None,
        };
        if archive.is_none() && self.delta.is_empty() {
            self.index = None;
            return Ok(());
        }

        let index = match self.index.take() {
            Some(index) if archive.is_some() => index,
            _ => self.next_index(info),
        };
        let date = info.snapshots[self.snapshot].date;
        let delta_name = digest_name(&self.dir, &self.domain, date, index);
        crate::repo::digest::write_delta(self.storage, &delta_name, &self.delta, self.limits.level)?;

        let data = info.snapshots[self.snapshot]
            .domains
            .entry(self.domain.clone())
            .or_default();
        if let Some((name, size)) = &archive {
            data.storage.push(name.clone());
            debug!(domain = %self.domain, archive = %name, size, "archive rotated");
        }
        data.snapshots.push(delta_name);
        data.added += self.delta.added.len() as u64;
        data.updated += self.delta.updated.len() as u64;
        data.removed += self.delta.removed.len() as u64;
        info.save(self.storage, self.limits.level)?;

        self.delta.clear();
        self.rotations += 1;
        Ok(())
    }

    /// Final rotation for the domain.
    pub(crate) fn finish(mut self, info: &mut BackupInfo) -> Result<()> {
        self.rotate(info)?;
        if self.documents > 0 || self.rotations > 0 {
            info!(
                domain = %self.domain,
                documents = self.documents,
                rotations = self.rotations,
                "domain packed"
            );
        }
        Ok(())
    }
}
