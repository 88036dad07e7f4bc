use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use blake2::{Blake2s256, Digest as _};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{DocvaultError, Result};
use crate::model::{BlobDoc, BlobStore, Chunk, Doc, DocInfo, WorkspaceStore, DOMAIN_BLOB};

const CHUNK_SIZE: usize = 500;
const JSON_EXT: &str = "json";
const BLOB_EXT: &str = "bin";

/// Directory-backed workspace store.
///
/// Each domain is a directory of `<id>.json` documents; blob payloads live
/// next to their metadata in the blob domain as `<id>.bin`. Document hashes are
/// content hashes, so a restored document hashes like the one backed up.
pub struct FsStore {
    root: PathBuf,
    cursors: Mutex<HashMap<u64, VecDeque<DocInfo>>>,
    next_cursor: AtomicU64,
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            cursors: Mutex::new(HashMap::new()),
            next_cursor: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_name(kind: &str, name: &str) -> Result<()> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(DocvaultError::Store(format!("unsafe {kind} name '{name}'")));
        }
        Ok(())
    }

    fn domain_dir(&self, domain: &str) -> Result<PathBuf> {
        Self::validate_name("domain", domain)?;
        Ok(self.root.join(domain))
    }

    fn entry_path(&self, domain: &str, id: &str, ext: &str) -> Result<PathBuf> {
        Self::validate_name("document", id)?;
        Ok(self.domain_dir(domain)?.join(format!("{id}.{ext}")))
    }

    fn read_doc(path: &Path) -> Result<Option<Doc>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(Doc::from_slice(&data)?.doc)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| DocvaultError::Store(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn doc_info(doc: &Doc) -> Result<DocInfo> {
        match doc {
            Doc::Blob(blob) => {
                let hash = if blob.etag.is_empty() {
                    doc.content_hash()?
                } else {
                    blob.etag.clone()
                };
                Ok(DocInfo::blob(&blob.id, hash, blob.size, &blob.content_type))
            }
            Doc::Plain(_) => Ok(DocInfo::new(doc.id(), doc.content_hash()?)),
        }
    }

    /// All documents of a domain, sorted by id.
    fn list_infos(&self, domain: &str) -> Result<Vec<DocInfo>> {
        let dir = self.domain_dir(domain)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut infos = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JSON_EXT) {
                continue;
            }
            match Self::read_doc(&path) {
                Ok(Some(doc)) => infos.push(Self::doc_info(&doc)?),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), "skipping unreadable document: {e}"),
            }
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    fn hash_lines<'a>(lines: impl Iterator<Item = (&'a str, &'a str)>) -> String {
        let mut hasher = Blake2s256::new();
        for (key, value) in lines {
            hasher.update(key.as_bytes());
            hasher.update(b";");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

impl WorkspaceStore for FsStore {
    fn domains(&self) -> Result<Vec<String>> {
        let mut domains = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                domains.push(name);
            }
        }
        domains.sort();
        Ok(domains)
    }

    fn load_chunk(&self, domain: &str, cursor: Option<u64>) -> Result<Chunk> {
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| DocvaultError::Store("cursor table poisoned".into()))?;
        let id = match cursor {
            Some(id) => id,
            None => {
                let id = self.next_cursor.fetch_add(1, Ordering::Relaxed);
                cursors.insert(id, self.list_infos(domain)?.into());
                id
            }
        };
        let pending = cursors
            .get_mut(&id)
            .ok_or_else(|| DocvaultError::Store(format!("unknown cursor {id}")))?;
        let take = pending.len().min(CHUNK_SIZE);
        let docs: Vec<DocInfo> = pending.drain(..take).collect();
        Ok(Chunk {
            cursor: id,
            docs,
            finished: pending.is_empty(),
        })
    }

    fn close_chunk(&self, cursor: u64) -> Result<()> {
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| DocvaultError::Store("cursor table poisoned".into()))?;
        cursors.remove(&cursor);
        Ok(())
    }

    fn load_docs(&self, domain: &str, ids: &[String]) -> Result<Vec<Doc>> {
        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = Self::read_doc(&self.entry_path(domain, id, JSON_EXT)?)? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn upload(&self, domain: &str, docs: Vec<Doc>) -> Result<()> {
        for mut doc in docs {
            doc.set_hash(None);
            let path = self.entry_path(domain, doc.id(), JSON_EXT)?;
            Self::write_atomic(&path, &doc.to_json()?)?;
        }
        Ok(())
    }

    fn clean(&self, domain: &str, ids: &[String]) -> Result<()> {
        for id in ids {
            for ext in [JSON_EXT, BLOB_EXT] {
                match fs::remove_file(self.entry_path(domain, id, ext)?) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        debug!(domain, removed = ids.len(), "cleaned documents");
        Ok(())
    }

    fn domain_hash(&self, domain: &str) -> Result<String> {
        let infos = self.list_infos(domain)?;
        Ok(Self::hash_lines(
            infos.iter().map(|i| (i.id.as_str(), i.hash.as_str())),
        ))
    }

    fn last_tx_id(&self) -> Result<Option<String>> {
        let mut hashes = Vec::new();
        for domain in self.domains()? {
            let hash = self.domain_hash(&domain)?;
            hashes.push((domain, hash));
        }
        Ok(Some(Self::hash_lines(
            hashes.iter().map(|(d, h)| (d.as_str(), h.as_str())),
        )))
    }
}

impl BlobStore for FsStore {
    fn read(&self, id: &str) -> Result<Box<dyn Read + Send + '_>> {
        let path = self.entry_path(DOMAIN_BLOB, id, BLOB_EXT)?;
        match fs::File::open(&path) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DocvaultError::BlobStore(format!("blob '{id}' not found")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, id: &str, size: u64, content_type: &str, data: &mut dyn Read) -> Result<()> {
        let path = self.entry_path(DOMAIN_BLOB, id, BLOB_EXT)?;
        let dir = self.domain_dir(DOMAIN_BLOB)?;
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        let mut hasher = Blake2s256::new();
        let mut written = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = data.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            written += n as u64;
        }
        if written != size {
            warn!(id, declared = size, written, "blob size differs from declared size");
        }
        tmp.persist(&path).map_err(|e| e.error)?;

        let mut meta = BlobDoc::new(id, content_type, written);
        meta.etag = hex::encode(hasher.finalize());
        meta.provider = "fs".into();
        let meta_path = self.entry_path(DOMAIN_BLOB, id, JSON_EXT)?;
        Self::write_atomic(&meta_path, &Doc::Blob(meta).to_json()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Document;

    fn store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn collect_all(store: &FsStore, domain: &str) -> Vec<DocInfo> {
        let mut out = Vec::new();
        let mut cursor = None;
        loop {
            let chunk = store.load_chunk(domain, cursor).unwrap();
            cursor = Some(chunk.cursor);
            out.extend(chunk.docs);
            if chunk.finished {
                break;
            }
        }
        store.close_chunk(cursor.unwrap()).unwrap();
        out
    }

    #[test]
    fn chunks_page_through_all_documents() {
        let (_dir, store) = store();
        let docs: Vec<Doc> = (0..1200)
            .map(|i| Doc::Plain(Document::new(format!("d{i:05}"), "c").with_space("s")))
            .collect();
        store.upload("task", docs).unwrap();

        let infos = collect_all(&store, "task");
        assert_eq!(infos.len(), 1200);
        assert_eq!(infos[0].id, "d00000");
        assert_eq!(store.domains().unwrap(), vec!["task"]);
    }

    #[test]
    fn upload_strips_hash_and_hash_tracks_content() {
        let (_dir, store) = store();
        let mut doc = Doc::Plain(Document::new("a", "c").with_attr("v", 1));
        doc.set_hash(Some("stale".into()));
        store.upload("task", vec![doc.clone()]).unwrap();
        let before = store.domain_hash("task").unwrap();

        let loaded = store.load_docs("task", &["a".into(), "missing".into()]).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].hash().is_none());

        store
            .upload("task", vec![Doc::Plain(Document::new("a", "c").with_attr("v", 2))])
            .unwrap();
        assert_ne!(before, store.domain_hash("task").unwrap());
    }

    #[test]
    fn blob_write_then_read() {
        let (_dir, store) = store();
        store
            .write("b1", 5, "text/plain", &mut &b"hello"[..])
            .unwrap();
        let mut out = Vec::new();
        store.read("b1").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");

        let infos = collect_all(&store, DOMAIN_BLOB);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].size, Some(5));
        assert_eq!(infos[0].content_type.as_deref(), Some("text/plain"));

        store.clean(DOMAIN_BLOB, &["b1".into()]).unwrap();
        assert!(store.read("b1").is_err());
    }

    #[test]
    fn rejects_unsafe_ids() {
        let (_dir, store) = store();
        let doc = Doc::Plain(Document::new("../escape", "c"));
        assert!(store.upload("task", vec![doc]).is_err());
        assert!(store.load_chunk("../up", None).is_err());
    }
}
