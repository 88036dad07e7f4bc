pub mod document;
pub mod fs_store;
pub mod store;

pub use document::{BlobDoc, Doc, Document, LoadedDoc};
pub use fs_store::FsStore;
pub use store::{BlobStore, Chunk, DocInfo, WorkspaceStore, DOMAIN_BLOB};
