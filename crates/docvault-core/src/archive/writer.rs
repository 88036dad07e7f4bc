use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

use crate::compress;
use crate::error::Result;
use crate::model::{BlobDoc, Doc};
use crate::storage::{StorageBackend, StorageWrite};

/// Transparent pass-through that counts the bytes reaching `inner`.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

type ArchiveStream = tar::Builder<GzEncoder<CountingWriter<BufWriter<File>>>>;

/// An open archive: tar entries, gzip, byte counter, local temp file.
///
/// The archive reaches storage only in [`finish`](Self::finish); dropping an
/// unfinished writer removes the temp file and leaves storage untouched.
pub struct ArchiveWriter {
    name: String,
    stream: ArchiveStream,
    temp: TempPath,
    documents: usize,
}

impl ArchiveWriter {
    pub fn create(name: &str, temp_dir: Option<&Path>, level: u32) -> Result<Self> {
        let temp = match temp_dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        let (file, temp) = temp.into_parts();
        let encoder = GzEncoder::new(
            CountingWriter::new(BufWriter::new(file)),
            compress::level(level),
        );
        let mut stream = tar::Builder::new(encoder);
        stream.mode(tar::HeaderMode::Deterministic);
        Ok(Self {
            name: name.to_string(),
            stream,
            temp,
            documents: 0,
        })
    }

    /// Storage name the archive will be uploaded under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of documents packed so far.
    pub fn documents(&self) -> usize {
        self.documents
    }

    /// Compressed bytes produced so far.
    pub fn compressed_size(&self) -> u64 {
        self.stream.get_ref().get_ref().count()
    }

    fn append_entry(&mut self, entry_name: &str, data: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        self.stream.append_data(&mut header, entry_name, data)?;
        Ok(())
    }

    /// Pack a document as `<id>.json`.
    pub fn append_doc(&mut self, doc: &Doc) -> Result<()> {
        self.append_entry(&format!("{}.json", doc.id()), &doc.to_json()?)?;
        self.documents += 1;
        Ok(())
    }

    /// Pack blob metadata as `<id>.json` followed by its bytes as `<id>`.
    pub fn append_blob(&mut self, blob: &BlobDoc, data: &[u8]) -> Result<()> {
        let meta = Doc::Blob(blob.clone()).to_json()?;
        self.append_entry(&format!("{}.json", blob.id), &meta)?;
        self.append_entry(&blob.id, data)?;
        self.documents += 1;
        Ok(())
    }

    /// Close the tar and gzip streams and upload the archive. Returns the
    /// uploaded size.
    pub fn finish(self, storage: &dyn StorageBackend) -> Result<u64> {
        let ArchiveWriter {
            name,
            stream,
            temp,
            documents,
        } = self;
        let counter = stream.into_inner()?.finish()?;
        let file = counter.into_inner().into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        let mut reader = File::open(&temp)?;
        let mut out = storage.open_write(&name)?;
        let size = io::copy(&mut reader, &mut out)?;
        StorageWrite::finish(out)?;
        debug!(archive = %name, documents, size, "archive uploaded");
        Ok(size)
    }
}
