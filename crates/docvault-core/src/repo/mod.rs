pub mod digest;
pub mod lock;
pub mod manifest;
pub mod sizes;

pub use digest::{load_digest, normalize_hash, same_hash, Digest, DigestDelta};
pub use manifest::{BackupInfo, BackupSnapshot, DomainData, FORMAT_VERSION, MANIFEST_KEY};
