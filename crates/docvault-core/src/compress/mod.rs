use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DocvaultError, Result};

/// Default gzip level for manifests, digests and archives.
pub const DEFAULT_LEVEL: u32 = 9;

/// Maximum decompressed size for in-memory metadata files (manifest, size
/// cache, blob info). Prevents decompression bombs from consuming unbounded
/// memory; archives are always streamed and never go through here.
const MAX_DECOMPRESS_SIZE: u64 = 512 * 1024 * 1024;

/// Clamp a configured level into the range flate2 accepts.
pub fn level(level: u32) -> flate2::Compression {
    flate2::Compression::new(level.min(9))
}

pub fn gzip(data: &[u8], compression_level: u32) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), level(compression_level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_DECOMPRESS_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| DocvaultError::InvalidFormat(format!("gzip: {e}")))?;
    if out.len() as u64 > MAX_DECOMPRESS_SIZE {
        return Err(DocvaultError::InvalidFormat(format!(
            "gzip: decompressed size exceeds {MAX_DECOMPRESS_SIZE} bytes"
        )));
    }
    Ok(out)
}

/// Serialize as pretty JSON and gzip it.
pub fn gzip_json<T: Serialize>(value: &T, compression_level: u32) -> Result<Vec<u8>> {
    let json = serde_json::to_vec_pretty(value)?;
    gzip(&json, compression_level)
}

pub fn gunzip_json<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let json = gunzip(data)?;
    Ok(serde_json::from_slice(&json)?)
}
