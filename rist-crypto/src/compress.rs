//! Per-packet LZ4 compression
//!
//! One independent LZ4 block per packet, with the uncompressed size
//! prepended so the receiver can allocate exactly. A packet that fails to
//! decompress is malformed and gets dropped by the caller.

use lz4_flex::block::{compress_prepend_size, decompress_size_prepended};
use thiserror::Error;

/// Decompressed payloads larger than this are rejected outright
pub const MAX_DECOMPRESSED: usize = 64 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressError {
    #[error("LZ4 decompression failed")]
    Malformed,

    #[error("Decompressed size {0} exceeds the {MAX_DECOMPRESSED} byte limit")]
    TooLarge(usize),
}

/// Compress one packet payload
pub fn compress(data: &[u8]) -> Vec<u8> {
    compress_prepend_size(data)
}

/// Whether compressing actually shrank the payload; callers skip the
/// transform (and the flag) when it did not
pub fn worth_compressing(original: usize, compressed: usize) -> bool {
    compressed < original
}

/// Decompress one packet payload
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    if data.len() >= 4 {
        let declared = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if declared > MAX_DECOMPRESSED {
            return Err(CompressError::TooLarge(declared));
        }
    }
    decompress_size_prepended(data).map_err(|_| CompressError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let payload = b"ts packet ts packet ts packet ts packet ts packet".repeat(8);
        let compressed = compress(&payload);
        assert!(compressed.len() < payload.len());
        assert_eq!(decompress(&compressed).unwrap(), payload);
    }

    #[test]
    fn test_incompressible_detected() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let compressed = compress(&payload);
        assert!(!worth_compressing(payload.len(), compressed.len()));
    }

    #[test]
    fn test_garbage_rejected() {
        let garbage = vec![0xFFu8; 64];
        assert!(decompress(&garbage).is_err());
    }

    #[test]
    fn test_oversize_rejected() {
        let mut data = vec![0u8; 32];
        data[..4].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert_eq!(
            decompress(&data),
            Err(CompressError::TooLarge(u32::MAX as usize))
        );
    }

    #[test]
    fn test_empty_roundtrip() {
        let compressed = compress(b"");
        assert_eq!(decompress(&compressed).unwrap(), Vec::<u8>::new());
    }
}
