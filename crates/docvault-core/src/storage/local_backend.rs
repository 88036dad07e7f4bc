use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{DocvaultError, Result};
use crate::storage::{StorageBackend, StorageWrite};

/// Storage backend for a local directory using `std::fs` directly.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at the given directory path.
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        // Canonicalize if the path already exists so strip_prefix works with
        // symlinked roots.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            root_path
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject storage keys that could escape the backup root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(DocvaultError::InvalidFormat("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.starts_with('\\') {
            return Err(DocvaultError::InvalidFormat(format!(
                "unsafe storage key: absolute path '{key}'"
            )));
        }
        if key.contains('\\') {
            return Err(DocvaultError::InvalidFormat(format!(
                "unsafe storage key: contains backslash '{key}'"
            )));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(DocvaultError::InvalidFormat(format!(
                    "unsafe storage key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a `/`-separated storage key to a filesystem path under the root.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn temp_for(&self, path: &Path) -> Result<NamedTempFile> {
        let dir = path.parent().unwrap_or(&self.root);
        match NamedTempFile::new_in(dir) {
            Ok(tmp) => Ok(tmp),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(dir)?;
                Ok(NamedTempFile::new_in(dir)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Recursively list all files under `dir` as `/`-separated keys relative
    /// to the root.
    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), keys)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

/// Temp-file backed write stream, renamed into place on finish.
struct LocalWrite {
    out: BufWriter<NamedTempFile>,
    path: PathBuf,
    written: u64,
}

impl Write for LocalWrite {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.out.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

impl StorageWrite for LocalWrite {
    fn finish(self: Box<Self>) -> Result<u64> {
        let LocalWrite { out, path, written } = *self;
        let tmp = out.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(written)
    }
}

impl StorageBackend for LocalBackend {
    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn stat(&self, key: &str) -> Result<Option<u64>> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open_read(&self, key: &str) -> Result<Option<Box<dyn Read + Send>>> {
        let path = self.resolve(key)?;
        match fs::File::open(&path) {
            Ok(file) => Ok(Some(Box::new(std::io::BufReader::new(file)))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        let mut tmp = self.temp_for(&path)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn open_write(&self, key: &str) -> Result<Box<dyn StorageWrite + '_>> {
        let path = self.resolve(key)?;
        let tmp = self.temp_for(&path)?;
        Ok(Box::new(LocalWrite {
            out: BufWriter::new(tmp),
            path,
            written: 0,
        }))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_recursive(&self, prefix: &str) -> Result<()> {
        let path = self.resolve(prefix.trim_end_matches('/'))?;
        let result = match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix.trim_end_matches('/'))?
        };
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {
                let mut keys = Vec::new();
                self.list_recursive(&dir, &mut keys)?;
                Ok(keys)
            }
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        (dir, backend)
    }

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(LocalBackend::validate_key("/etc/passwd").is_err());
        assert!(LocalBackend::validate_key("\\Windows\\System32").is_err());
        assert!(LocalBackend::validate_key("../../outside").is_err());
        assert!(LocalBackend::validate_key("000001/../../etc").is_err());
        assert!(LocalBackend::validate_key("foo\\bar").is_err());
        assert!(LocalBackend::validate_key("").is_err());
    }

    #[test]
    fn validate_key_accepts_backup_keys() {
        assert!(LocalBackend::validate_key("backup.json.gz").is_ok());
        assert!(LocalBackend::validate_key("000001/task-data-1700000000000-0001.tar.gz").is_ok());
        assert!(LocalBackend::validate_key("000001/task-digest-1700000000000-0001.snp.gz").is_ok());
    }

    #[test]
    fn stat_and_exists_for_missing_file() {
        let (_dir, backend) = backend();
        assert!(!backend.exists("no_such_file").unwrap());
        assert_eq!(backend.stat("no_such_file").unwrap(), None);
        assert!(backend.open_read("no_such_file").unwrap().is_none());
    }

    #[test]
    fn put_creates_parent_dirs_and_overwrites() {
        let (_dir, backend) = backend();
        backend.put("000001/a.snp.gz", b"one").unwrap();
        backend.put("000001/a.snp.gz", b"second").unwrap();
        assert_eq!(backend.get("000001/a.snp.gz").unwrap().unwrap(), b"second");
        assert_eq!(backend.stat("000001/a.snp.gz").unwrap(), Some(6));
    }

    #[test]
    fn open_write_is_invisible_until_finished() {
        let (_dir, backend) = backend();
        let mut w = backend.open_write("000002/data.tar.gz").unwrap();
        w.write_all(b"payload").unwrap();
        assert!(!backend.exists("000002/data.tar.gz").unwrap());
        assert_eq!(w.finish().unwrap(), 7);
        assert!(backend.exists("000002/data.tar.gz").unwrap());

        let mut dropped = backend.open_write("000002/abandoned").unwrap();
        dropped.write_all(b"partial").unwrap();
        drop(dropped);
        assert!(!backend.exists("000002/abandoned").unwrap());
    }

    #[test]
    fn open_read_streams_content() {
        let (_dir, backend) = backend();
        backend.put("blob-info.json.gz", b"abc").unwrap();
        let mut buf = String::new();
        backend
            .open_read("blob-info.json.gz")
            .unwrap()
            .unwrap()
            .read_to_string(&mut buf)
            .unwrap();
        assert_eq!(buf, "abc");
    }

    #[test]
    fn delete_recursive_removes_directory() {
        let (_dir, backend) = backend();
        backend.put("000001/x", b"1").unwrap();
        backend.put("000001/y", b"2").unwrap();
        backend.put("000002/z", b"3").unwrap();
        backend.delete_recursive("000001").unwrap();
        backend.delete_recursive("000009").unwrap();
        let mut keys = backend.list("").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["000002/z"]);
    }

    #[test]
    fn resolve_rejects_traversal() {
        let (_dir, backend) = backend();
        assert!(backend.get("../../etc/passwd").is_err());
        assert!(backend.put("../escape", b"bad").is_err());
        assert!(backend.delete("/absolute").is_err());
        assert!(backend.open_write("../escape").is_err());
    }

    #[test]
    fn put_concurrent_writes_are_atomic() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        let (_dir, backend) = backend();
        let backend = Arc::new(backend);
        backend.put("backup.json.gz", b"seed").unwrap();

        let payload_a = vec![0xAAu8; 1024 * 64];
        let payload_b = vec![0xBBu8; 1024 * 64];

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [payload_a.clone(), payload_b.clone()]
            .into_iter()
            .map(|payload| {
                let backend = Arc::clone(&backend);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    backend.put("backup.json.gz", &payload).unwrap();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let result = backend.get("backup.json.gz").unwrap().unwrap();
        assert!(result == payload_a || result == payload_b);
    }
}
