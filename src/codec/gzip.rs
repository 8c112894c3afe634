use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{CompressionFailure, Error, Result};

pub fn compress(bytes: &[u8], level: i32) -> Result<Vec<u8>> {
    let level = level.clamp(0, 9) as u32;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder
        .write_all(bytes)
        .map_err(|_| Error::Compression { kind: CompressionFailure::CompressionFailed })?;
    encoder.finish().map_err(|_| Error::Compression { kind: CompressionFailure::CompressionFailed })
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    if !bytes.starts_with(&[0x1f, 0x8b]) {
        return Err(Error::Compression { kind: CompressionFailure::InvalidData });
    }
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| Error::Compression { kind: CompressionFailure::DecompressionFailed })?;
    Ok(out)
}
