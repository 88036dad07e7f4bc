use std::io::Read;

use crate::error::Result;
use crate::model::Doc;

/// Domain holding binary payload metadata. Its documents are restored through
/// the [`BlobStore`] and never cleaned.
pub const DOMAIN_BLOB: &str = "blob";

/// One entry of a chunk listing: identity plus the store's content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocInfo {
    pub id: String,
    pub hash: String,
    /// Payload size, reported for blob documents.
    pub size: Option<u64>,
    /// Content type, reported for blob documents.
    pub content_type: Option<String>,
}

impl DocInfo {
    pub fn new(id: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hash: hash.into(),
            size: None,
            content_type: None,
        }
    }

    pub fn blob(
        id: impl Into<String>,
        hash: impl Into<String>,
        size: u64,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            hash: hash.into(),
            size: Some(size),
            content_type: Some(content_type.into()),
        }
    }
}

/// A page of the live store's cursor-based listing.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub cursor: u64,
    pub docs: Vec<DocInfo>,
    pub finished: bool,
}

/// The live workspace store, seen through its chunk protocol.
///
/// Cursors returned by [`load_chunk`](WorkspaceStore::load_chunk) must be
/// released with [`close_chunk`](WorkspaceStore::close_chunk), including after
/// errors.
pub trait WorkspaceStore: Send + Sync {
    /// Domains that hold documents to back up.
    fn domains(&self) -> Result<Vec<String>>;

    /// Fetch the next page. `None` opens a new cursor.
    fn load_chunk(&self, domain: &str, cursor: Option<u64>) -> Result<Chunk>;

    fn close_chunk(&self, cursor: u64) -> Result<()>;

    /// Bulk-load full documents. Missing ids are silently absent.
    fn load_docs(&self, domain: &str, ids: &[String]) -> Result<Vec<Doc>>;

    /// Insert or replace documents.
    fn upload(&self, domain: &str, docs: Vec<Doc>) -> Result<()>;

    /// Delete documents by id.
    fn clean(&self, domain: &str, ids: &[String]) -> Result<()>;

    /// Cheap cumulative hash of a domain's content.
    fn domain_hash(&self, domain: &str) -> Result<String>;

    /// Marker of the last applied transaction, if the store tracks one.
    fn last_tx_id(&self) -> Result<Option<String>>;
}

/// Byte storage for blob payloads.
pub trait BlobStore: Send + Sync {
    /// Open a stream over the blob's bytes.
    fn read(&self, id: &str) -> Result<Box<dyn Read + Send + '_>>;

    /// Store a blob's bytes with the declared size and content type.
    fn write(&self, id: &str, size: u64, content_type: &str, data: &mut dyn Read) -> Result<()>;
}
