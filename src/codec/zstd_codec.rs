use crate::error::{CompressionFailure, Error, Result};

pub fn compress(bytes: &[u8], level: i32) -> Result<Vec<u8>> {
    let level = level.clamp(1, 22);
    zstd::stream::encode_all(bytes, level)
        .map_err(|_| Error::Compression { kind: CompressionFailure::CompressionFailed })
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    if !bytes.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        return Err(Error::Compression { kind: CompressionFailure::InvalidData });
    }
    zstd::stream::decode_all(bytes)
        .map_err(|_| Error::Compression { kind: CompressionFailure::DecompressionFailed })
}
