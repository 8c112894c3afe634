use std::io::{Read, Write};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::error::{CompressionFailure, Error, Result};

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = FrameEncoder::new(Vec::new());
    encoder
        .write_all(bytes)
        .map_err(|_| Error::Compression { kind: CompressionFailure::CompressionFailed })?;
    encoder.finish().map_err(|_| Error::Compression { kind: CompressionFailure::CompressionFailed })
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    if !bytes.starts_with(&[0x04, 0x22, 0x4d, 0x18]) {
        return Err(Error::Compression { kind: CompressionFailure::InvalidData });
    }
    let mut decoder = FrameDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| Error::Compression { kind: CompressionFailure::DecompressionFailed })?;
    Ok(out)
}
