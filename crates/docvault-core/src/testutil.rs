use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use blake2::{Blake2s256, Digest as _};

use crate::blob::BlobPolicy;
use crate::commands::backup::{run_backup, BackupOptions, BackupResult};
use crate::commands::pack::PackLimits;
use crate::context::RunContext;
use crate::error::{DocvaultError, Result};
use crate::model::{BlobDoc, BlobStore, Chunk, Doc, DocInfo, WorkspaceStore, DOMAIN_BLOB};
use crate::storage::{StorageBackend, StorageWrite};

/// In-memory storage backend for testing. Thread-safe via Mutex.
///
/// `fail_writes_after(n)` lets `n` more writes succeed and fails every one
/// after that, to simulate a crash at a chosen point.
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Vec<u8>>>,
    write_budget: Mutex<Option<usize>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            write_budget: Mutex::new(None),
        }
    }

    pub fn fail_writes_after(&self, n: usize) {
        *self.write_budget.lock().unwrap() = Some(n);
    }

    pub fn allow_writes(&self) {
        *self.write_budget.lock().unwrap() = None;
    }

    /// Every stored key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn charge_write(&self, key: &str) -> Result<()> {
        let mut budget = self.write_budget.lock().unwrap();
        match budget.as_mut() {
            Some(0) => Err(DocvaultError::Io(std::io::Error::other(format!(
                "injected write failure for {key}"
            )))),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

struct MemoryWrite<'a> {
    backend: &'a MemoryBackend,
    key: String,
    buf: Vec<u8>,
}

impl Write for MemoryWrite<'_> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageWrite for MemoryWrite<'_> {
    fn finish(self: Box<Self>) -> Result<u64> {
        let len = self.buf.len() as u64;
        self.backend.put(&self.key, &self.buf)?;
        Ok(len)
    }
}

impl StorageBackend for MemoryBackend {
    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.lock().unwrap().contains_key(key))
    }

    fn stat(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.data.lock().unwrap().get(key).map(|d| d.len() as u64))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn open_read(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>> {
        Ok(self
            .get(key)?
            .map(|d| Box::new(Cursor::new(d)) as Box<dyn Read + Send>))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.charge_write(key)?;
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn open_write(&self, key: &str) -> Result<Box<dyn StorageWrite + '_>> {
        Ok(Box::new(MemoryWrite {
            backend: self,
            key: key.to_string(),
            buf: Vec::new(),
        }))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    fn delete_recursive(&self, prefix: &str) -> Result<()> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        self.data
            .lock()
            .unwrap()
            .retain(|k, _| k != prefix && !k.starts_with(&dir));
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .data
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Injected failures for [`MemoryStore`].
#[derive(Debug, Default)]
pub struct Faults {
    /// Fail this many follow-up chunk reads (never the first page of a
    /// cursor).
    pub chunk_failures: usize,
    /// Fail this many `load_docs` calls.
    pub load_failures: usize,
    /// Let this many `load_docs` calls succeed, then fail all others.
    pub load_budget: Option<usize>,
    /// Blob reads return only this many bytes.
    pub truncated_blobs: HashMap<String, usize>,
    /// Listed twice in every chunk listing.
    pub duplicated_ids: HashSet<String>,
    /// Hash reported by the listing instead of the content hash.
    pub hash_overrides: HashMap<String, String>,
    pub fail_upload: bool,
}

/// In-memory workspace and blob store with fault injection.
///
/// Document hashes are content hashes; blob hashes are the blake2 of the
/// bytes, exposed as the etag.
pub struct MemoryStore {
    domains: Mutex<BTreeMap<String, BTreeMap<String, Doc>>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    cursors: Mutex<HashMap<u64, VecDeque<DocInfo>>>,
    next_cursor: AtomicU64,
    chunk_size: usize,
    tx: Mutex<Option<String>>,
    pub faults: Mutex<Faults>,
    pub loaded_docs: AtomicUsize,
    pub blob_reads: AtomicUsize,
    pub cleaned: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_chunk_size(100)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            domains: Mutex::new(BTreeMap::new()),
            blobs: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            next_cursor: AtomicU64::new(1),
            chunk_size: chunk_size.max(1),
            tx: Mutex::new(None),
            faults: Mutex::new(Faults::default()),
            loaded_docs: AtomicUsize::new(0),
            blob_reads: AtomicUsize::new(0),
            cleaned: Mutex::new(Vec::new()),
        }
    }

    pub fn put_doc(&self, domain: &str, mut doc: Doc) {
        doc.set_hash(None);
        self.domains
            .lock()
            .unwrap()
            .entry(domain.to_string())
            .or_default()
            .insert(doc.id().to_string(), doc);
    }

    pub fn remove_doc(&self, domain: &str, id: &str) {
        if let Some(docs) = self.domains.lock().unwrap().get_mut(domain) {
            docs.remove(id);
        }
    }

    pub fn put_blob(&self, id: &str, content_type: &str, data: Vec<u8>) {
        let mut meta = BlobDoc::new(id, content_type, data.len() as u64);
        meta.etag = hex::encode(Blake2s256::digest(&data));
        meta.provider = "memory".into();
        self.put_doc(DOMAIN_BLOB, Doc::Blob(meta));
        self.blobs.lock().unwrap().insert(id.to_string(), data);
    }

    pub fn blob_bytes(&self, id: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(id).cloned()
    }

    pub fn doc(&self, domain: &str, id: &str) -> Option<Doc> {
        self.domains.lock().unwrap().get(domain)?.get(id).cloned()
    }

    pub fn docs(&self, domain: &str) -> BTreeMap<String, Doc> {
        self.domains
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_tx(&self, tx: Option<&str>) {
        *self.tx.lock().unwrap() = tx.map(str::to_string);
    }

    pub fn open_cursors(&self) -> usize {
        self.cursors.lock().unwrap().len()
    }

    fn listing(&self, domain: &str) -> Vec<DocInfo> {
        let domains = self.domains.lock().unwrap();
        let faults = self.faults.lock().unwrap();
        let mut infos = Vec::new();
        if let Some(docs) = domains.get(domain) {
            for (id, doc) in docs {
                let hash = match faults.hash_overrides.get(id) {
                    Some(h) => h.clone(),
                    None => doc_hash(doc),
                };
                let info = match doc {
                    Doc::Blob(b) => DocInfo::blob(id, hash, b.size, &b.content_type),
                    Doc::Plain(_) => DocInfo::new(id, hash),
                };
                if faults.duplicated_ids.contains(id) {
                    infos.push(info.clone());
                }
                infos.push(info);
            }
        }
        infos
    }
}

fn doc_hash(doc: &Doc) -> String {
    match doc {
        Doc::Blob(b) if !b.etag.is_empty() => b.etag.clone(),
        _ => doc.content_hash().unwrap_or_default(),
    }
}

fn injected(what: &str) -> DocvaultError {
    DocvaultError::Store(format!("injected {what} failure"))
}

impl WorkspaceStore for MemoryStore {
    fn domains(&self) -> Result<Vec<String>> {
        Ok(self.domains.lock().unwrap().keys().cloned().collect())
    }

    fn load_chunk(&self, domain: &str, cursor: Option<u64>) -> Result<Chunk> {
        let id = match cursor {
            Some(id) => {
                let mut faults = self.faults.lock().unwrap();
                if faults.chunk_failures > 0 {
                    faults.chunk_failures -= 1;
                    return Err(injected("chunk"));
                }
                id
            }
            None => {
                let listing = self.listing(domain);
                let id = self.next_cursor.fetch_add(1, Ordering::Relaxed);
                self.cursors.lock().unwrap().insert(id, listing.into());
                id
            }
        };
        let mut cursors = self.cursors.lock().unwrap();
        let pending = cursors
            .get_mut(&id)
            .ok_or_else(|| DocvaultError::Store(format!("unknown cursor {id}")))?;
        let take = pending.len().min(self.chunk_size);
        let docs: Vec<DocInfo> = pending.drain(..take).collect();
        Ok(Chunk {
            cursor: id,
            docs,
            finished: pending.is_empty(),
        })
    }

    fn close_chunk(&self, cursor: u64) -> Result<()> {
        self.cursors.lock().unwrap().remove(&cursor);
        Ok(())
    }

    fn load_docs(&self, domain: &str, ids: &[String]) -> Result<Vec<Doc>> {
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.load_failures > 0 {
                faults.load_failures -= 1;
                return Err(injected("load"));
            }
            match faults.load_budget.as_mut() {
                Some(0) => return Err(injected("load")),
                Some(n) => *n -= 1,
                None => {}
            }
        }
        let domains = self.domains.lock().unwrap();
        let docs: Vec<Doc> = match domains.get(domain) {
            Some(map) => ids.iter().filter_map(|id| map.get(id).cloned()).collect(),
            None => Vec::new(),
        };
        self.loaded_docs.fetch_add(docs.len(), Ordering::Relaxed);
        Ok(docs)
    }

    fn upload(&self, domain: &str, docs: Vec<Doc>) -> Result<()> {
        if self.faults.lock().unwrap().fail_upload {
            return Err(injected("upload"));
        }
        for doc in docs {
            self.put_doc(domain, doc);
        }
        Ok(())
    }

    fn clean(&self, domain: &str, ids: &[String]) -> Result<()> {
        for id in ids {
            self.remove_doc(domain, id);
            self.cleaned.lock().unwrap().push(id.clone());
        }
        Ok(())
    }

    fn domain_hash(&self, domain: &str) -> Result<String> {
        let mut hasher = Blake2s256::new();
        for info in self.listing(domain) {
            hasher.update(info.id.as_bytes());
            hasher.update(b";");
            hasher.update(info.hash.as_bytes());
            hasher.update(b"\n");
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn last_tx_id(&self) -> Result<Option<String>> {
        Ok(self.tx.lock().unwrap().clone())
    }
}

impl BlobStore for MemoryStore {
    fn read(&self, id: &str) -> Result<Box<dyn Read + Send + '_>> {
        self.blob_reads.fetch_add(1, Ordering::Relaxed);
        let mut data = self
            .blob_bytes(id)
            .ok_or_else(|| DocvaultError::BlobStore(format!("blob '{id}' not found")))?;
        if let Some(&len) = self.faults.lock().unwrap().truncated_blobs.get(id) {
            data.truncate(len);
        }
        Ok(Box::new(Cursor::new(data)))
    }

    fn write(&self, id: &str, _size: u64, content_type: &str, data: &mut dyn Read) -> Result<()> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)?;
        self.put_blob(id, content_type, bytes);
        Ok(())
    }
}

/// One successful backup pass without watchdog, auto-compaction or blob
/// exclusions.
pub fn quick_backup(storage: &MemoryBackend, store: &MemoryStore) -> BackupResult {
    let ctx = Arc::new(RunContext::new());
    let opts = BackupOptions {
        workspace: "ws".into(),
        timeout: None,
        keep_snapshots: 100,
        blob_policy: BlobPolicy::default(),
        pack: PackLimits {
            level: 6,
            ..PackLimits::default()
        },
        ..BackupOptions::default()
    };
    let result = run_backup(&ctx, storage, store, store, &opts).unwrap();
    assert!(result.success, "backup failed: {result:?}");
    result
}
