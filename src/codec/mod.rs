//! Compression codec layer (§4.2): gzip/lz4/zstd with magic-byte detection.

mod gzip;
mod lz4;
mod zstd_codec;

use serde::{Deserialize, Serialize};

use crate::error::{CompressionFailure, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Gzip,
    Zstd,
    Lz4,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Gzip => "gzip",
            Algorithm::Zstd => "zstd",
            Algorithm::Lz4 => "lz4",
        }
    }
}

/// Named presets a caller can ask for without picking an algorithm/level
/// directly (§4.2 "Preset selector").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Speed,
    Ratio,
    Balanced,
}

impl Preset {
    pub fn algorithm(self) -> Algorithm {
        match self {
            Preset::Speed => Algorithm::Lz4,
            Preset::Ratio => Algorithm::Zstd,
            Preset::Balanced => Algorithm::Gzip,
        }
    }

    pub fn level(self) -> i32 {
        match self {
            Preset::Speed => 0,
            Preset::Ratio => 9,
            Preset::Balanced => 6,
        }
    }
}

/// Metrics returned by [`compress_with_metrics`].
#[derive(Debug, Clone)]
pub struct CompressionMetrics {
    pub data: Vec<u8>,
    pub original_size: usize,
    pub compressed_size: usize,
    pub ratio: f64,
    pub expanded: bool,
    pub algorithm: Algorithm,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];

/// Infers the algorithm from the leading magic bytes. Returns `None` for
/// unrecognized leading bytes (§6: "treated as uncompressed").
pub fn auto_detect(bytes: &[u8]) -> Option<Algorithm> {
    if bytes.starts_with(&GZIP_MAGIC) {
        Some(Algorithm::Gzip)
    } else if bytes.starts_with(&ZSTD_MAGIC) {
        Some(Algorithm::Zstd)
    } else if bytes.starts_with(&LZ4_FRAME_MAGIC) {
        Some(Algorithm::Lz4)
    } else {
        None
    }
}

/// Compresses `bytes` with the given algorithm and level. Level ranges are
/// algorithm-specific (gzip 0-9, zstd 1-22, lz4 fast/slow collapsed to an
/// on/off flag here since `lz4_flex`'s frame encoder has no numeric level).
pub fn compress(bytes: &[u8], algorithm: Algorithm, level: i32) -> Result<Vec<u8>> {
    match algorithm {
        Algorithm::Gzip => gzip::compress(bytes, level),
        Algorithm::Zstd => zstd_codec::compress(bytes, level),
        Algorithm::Lz4 => lz4::compress(bytes),
    }
}

/// Decompresses `bytes` that are known to have been produced by `algorithm`.
/// Rejects empty input per §4.2.
pub fn decompress(bytes: &[u8], algorithm: Algorithm) -> Result<Vec<u8>> {
    if bytes.is_empty() {
        return Err(Error::Compression { kind: CompressionFailure::InvalidData });
    }
    match algorithm {
        Algorithm::Gzip => gzip::decompress(bytes),
        Algorithm::Zstd => zstd_codec::decompress(bytes),
        Algorithm::Lz4 => lz4::decompress(bytes),
    }
}

/// Detects the algorithm from magic bytes and decompresses, failing with
/// `UNSUPPORTED_ALGORITHM` if the leading bytes match nothing known.
pub fn auto_decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    match auto_detect(bytes) {
        Some(algorithm) => decompress(bytes, algorithm),
        None => Err(Error::Compression { kind: CompressionFailure::UnsupportedAlgorithm }),
    }
}

pub fn compress_with_metrics(bytes: &[u8], algorithm: Algorithm, level: i32) -> Result<CompressionMetrics> {
    let data = compress(bytes, algorithm, level)?;
    let original_size = bytes.len();
    let compressed_size = data.len();
    let ratio = if original_size == 0 { 1.0 } else { compressed_size as f64 / original_size as f64 };
    Ok(CompressionMetrics {
        data,
        original_size,
        compressed_size,
        ratio,
        expanded: compressed_size > original_size,
        algorithm,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_every_algorithm() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(8);
        for algorithm in [Algorithm::Gzip, Algorithm::Zstd, Algorithm::Lz4] {
            let compressed = compress(&payload, algorithm, Preset::Balanced.level()).unwrap();
            assert_eq!(auto_detect(&compressed), Some(algorithm));
            let restored = decompress(&compressed, algorithm).unwrap();
            assert_eq!(restored, payload);
            assert_eq!(auto_decompress(&compressed).unwrap(), payload);
        }
    }

    #[test]
    fn unknown_magic_is_unsupported() {
        let err = auto_decompress(b"not a compressed stream").unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_ALGORITHM");
    }

    #[test]
    fn empty_decompress_is_invalid_data() {
        let err = decompress(&[], Algorithm::Gzip).unwrap_err();
        assert_eq!(err.code(), "INVALID_DATA");
    }
}
