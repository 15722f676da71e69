//! Block compression for the flush window and upload bodies. Levels map
//! straight onto zstd's 1..=22 range.

use crate::error::{StoreError, StoreResult};

pub const MIN_LEVEL: u32 = 1;
pub const MAX_LEVEL: u32 = 22;

pub fn compress_block(data: &[u8], level: u32) -> StoreResult<Vec<u8>> {
    if level < MIN_LEVEL || level > MAX_LEVEL {
        return Err(StoreError::Compression);
    }

    zstd::bulk::compress(data, level as i32).map_err(|_| StoreError::Compression)
}

pub fn decompress_block(data: &[u8], uncompressed_len: usize) -> StoreResult<Vec<u8>> {
    let out = zstd::bulk::decompress(data, uncompressed_len).map_err(|_| StoreError::Compression)?;

    if out.len() != uncompressed_len {
        return Err(StoreError::Compression);
    }

    Ok(out)
}
