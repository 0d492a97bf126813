//! Payload transforms for RIST
//!
//! Pre-shared-key AES-CTR encryption with PBKDF2 key derivation, and
//! per-packet LZ4 compression. Both operate on opaque payload bytes; the
//! protocol crate decides when each transform applies.

pub mod compress;
pub mod psk;

pub use compress::{compress, decompress, CompressError};
pub use psk::{CryptoError, KeySize, PskDecryptor, PskEncryptor, MAX_SECRET, SALT_LEN};
