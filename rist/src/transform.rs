//! Outbound and inbound payload pipelines
//!
//! Send side: optional LZ4, then optional AES-CTR, producing the flag bits
//! and salt for the envelope. Receive side: undo both, mapping failures to
//! the per-packet error classes the engine counts.

use bytes::Bytes;
use rist_crypto::psk::{KeySize, PskDecryptor, PskEncryptor};
use rist_crypto::{compress, decompress};
use rist_protocol::packet::SALT_SIZE;

/// Outbound pipeline state
pub struct TxTransform {
    compression: bool,
    encryptor: Option<PskEncryptor>,
}

/// What the outbound pipeline produced for one payload
pub struct TxOutput {
    pub payload: Bytes,
    pub compressed: bool,
    pub salt: Option<[u8; SALT_SIZE]>,
}

impl TxTransform {
    pub fn new(compression: bool, encryptor: Option<PskEncryptor>) -> Self {
        TxTransform {
            compression,
            encryptor,
        }
    }

    pub fn encrypting(&self) -> bool {
        self.encryptor.is_some()
    }

    /// Apply compression then encryption
    ///
    /// Compression is skipped (flag clear) when it does not shrink the
    /// payload. `seq_word` is the per-packet IV component: the sequence
    /// number for data, the NTP fraction word for OOB.
    pub fn apply(&self, payload: Bytes, flow_id: u32, seq_word: u32) -> TxOutput {
        let (mut bytes, compressed) = if self.compression {
            let packed = compress(&payload);
            if packed.len() < payload.len() {
                (packed, true)
            } else {
                (payload.to_vec(), false)
            }
        } else {
            (payload.to_vec(), false)
        };

        let salt = self.encryptor.as_ref().map(|enc| {
            enc.apply(flow_id, seq_word, &mut bytes);
            enc.salt()
        });

        TxOutput {
            payload: Bytes::from(bytes),
            compressed,
            salt,
        }
    }
}

/// Inbound pipeline failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxError {
    /// Encrypted packet but no secret configured, or the plaintext was
    /// unusable under the derived key
    DecryptFailed,
    /// Compressed payload failed to inflate
    Malformed,
}

/// Inbound pipeline state
pub struct RxTransform {
    decryptor: Option<PskDecryptor>,
}

impl RxTransform {
    pub fn new(secret: Option<(&[u8], KeySize)>) -> Result<Self, rist_crypto::CryptoError> {
        let decryptor = match secret {
            Some((secret, size)) => Some(PskDecryptor::new(secret, size)?),
            None => None,
        };
        Ok(RxTransform { decryptor })
    }

    /// Undo encryption then compression according to the packet flags
    ///
    /// A decompression failure on an encrypted packet is reported as a
    /// decryption failure: CTR has no integrity tag, so a wrong key first
    /// shows up as a garbled LZ4 frame.
    pub fn restore(
        &mut self,
        salt: Option<&[u8; SALT_SIZE]>,
        compressed: bool,
        payload: Bytes,
        flow_id: u32,
        seq_word: u32,
    ) -> Result<Bytes, RxError> {
        let encrypted = salt.is_some();
        let mut bytes = payload.to_vec();

        if let Some(salt) = salt {
            let decryptor = self.decryptor.as_mut().ok_or(RxError::DecryptFailed)?;
            decryptor.apply(salt, flow_id, seq_word, &mut bytes);
        }

        if compressed {
            match decompress(&bytes) {
                Ok(inflated) => bytes = inflated,
                Err(_) if encrypted => return Err(RxError::DecryptFailed),
                Err(_) => return Err(RxError::Malformed),
            }
        }

        Ok(Bytes::from(bytes))
    }
}
