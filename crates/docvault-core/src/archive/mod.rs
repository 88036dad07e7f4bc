//! Compressed tar archives holding document content.
//!
//! Each document is an entry named `<id>.json`. Blob bytes follow their
//! metadata as a sibling entry named `<id>`.

pub mod reader;
pub mod writer;

pub use reader::{read_archive, scan_archive, ArchiveItem, ArchiveScan, ReadStats};
pub use writer::ArchiveWriter;
