//! Inference payload compression
//!
//! Request and result payloads cross the gateway/predictor link compressed.
//! The lz4 block format used here prepends the uncompressed length as a
//! little-endian `u32`, which is checked against a size limit before any
//! allocation happens.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Largest payload accepted after decompression
pub const MAX_DECOMPRESSED_BYTES: usize = 64 * 1024 * 1024;

/// Compression method for inference payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionMethod {
    /// Payloads are passed through untouched
    None,
    /// lz4 block compression with a size prefix
    #[default]
    Lz4,
}

/// Compress `data` with `method`
pub fn compress(method: CompressionMethod, data: &[u8]) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Lz4 => lz4::block::compress(data, None, true)
            .map_err(|e| Error::Compression(format!("lz4 compression failed: {e}"))),
    }
}

/// Decompress `data` produced by [`compress`] with the same `method`
pub fn decompress(method: CompressionMethod, data: &[u8]) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Lz4 => {
            let declared = declared_size(data)?;
            if declared > MAX_DECOMPRESSED_BYTES {
                return Err(Error::Compression(format!(
                    "declared size {declared} exceeds limit {MAX_DECOMPRESSED_BYTES}"
                )));
            }
            lz4::block::decompress(data, None)
                .map_err(|e| Error::Compression(format!("lz4 decompression failed: {e}")))
        }
    }
}

fn declared_size(data: &[u8]) -> Result<usize> {
    let prefix: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Compression("payload shorter than size prefix".to_string()))?;
    Ok(u32::from_le_bytes(prefix) as usize)
}
