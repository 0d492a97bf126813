//! Pre-shared-key payload encryption
//!
//! Keys derive from the configured passphrase with PBKDF2-HMAC-SHA256
//! (65 536 iterations) over a 16-byte salt that travels in the packet header.
//! Payloads are transformed with AES-128 or AES-256 in CTR mode; the IV is
//! built from the salt, the flow id, and the packet's sequence word, so no
//! keystream is ever reused within a flow.

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// PBKDF2 iteration count
pub const PBKDF2_ROUNDS: u32 = 65_536;

/// Salt length carried in encrypted packet headers
pub const SALT_LEN: usize = 16;

/// Maximum passphrase length in bytes
pub const MAX_SECRET: usize = 128;

/// Crypto errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Secret exceeds {MAX_SECRET} bytes")]
    SecretTooLong,

    #[error("Secret must not be empty")]
    EmptySecret,

    #[error("Decryption failed")]
    DecryptFailed,
}

/// AES key width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySize {
    Aes128,
    Aes256,
}

impl KeySize {
    /// Map the configured bit width (128 or 256)
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            128 => Some(KeySize::Aes128),
            256 => Some(KeySize::Aes256),
            _ => None,
        }
    }

    pub fn key_bytes(self) -> usize {
        match self {
            KeySize::Aes128 => 16,
            KeySize::Aes256 => 32,
        }
    }
}

fn derive_key(secret: &[u8], salt: &[u8; SALT_LEN], size: KeySize) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(secret, salt, PBKDF2_ROUNDS, &mut key[..size.key_bytes()]);
    key
}

fn build_iv(salt: &[u8; SALT_LEN], flow_id: u32, seq_word: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&salt[..8]);
    iv[8..12].copy_from_slice(&flow_id.to_be_bytes());
    iv[12..16].copy_from_slice(&seq_word.to_be_bytes());
    iv
}

fn apply_ctr(key: &[u8; 32], size: KeySize, iv: &[u8; 16], data: &mut [u8]) {
    match size {
        KeySize::Aes128 => {
            let mut short = [0u8; 16];
            short.copy_from_slice(&key[..16]);
            let mut cipher = Aes128Ctr::new(&short.into(), iv.into());
            cipher.apply_keystream(data);
        }
        KeySize::Aes256 => {
            let mut cipher = Aes256Ctr::new(key.into(), iv.into());
            cipher.apply_keystream(data);
        }
    }
}

fn check_secret(secret: &[u8]) -> Result<(), CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::EmptySecret);
    }
    if secret.len() > MAX_SECRET {
        return Err(CryptoError::SecretTooLong);
    }
    Ok(())
}

/// Sender-side transform: one derived key under one generated salt
pub struct PskEncryptor {
    size: KeySize,
    salt: [u8; SALT_LEN],
    key: [u8; 32],
}

impl PskEncryptor {
    /// Derive a key under a freshly generated random salt
    pub fn new(secret: &[u8], size: KeySize) -> Result<Self, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::with_salt(secret, size, salt)
    }

    pub fn with_salt(
        secret: &[u8],
        size: KeySize,
        salt: [u8; SALT_LEN],
    ) -> Result<Self, CryptoError> {
        check_secret(secret)?;
        Ok(PskEncryptor {
            size,
            salt,
            key: derive_key(secret, &salt, size),
        })
    }

    /// Salt to carry in the packet header
    pub fn salt(&self) -> [u8; SALT_LEN] {
        self.salt
    }

    /// Transform `data` in place (CTR encryption and decryption coincide)
    pub fn apply(&self, flow_id: u32, seq_word: u32, data: &mut [u8]) {
        let iv = build_iv(&self.salt, flow_id, seq_word);
        apply_ctr(&self.key, self.size, &iv, data);
    }
}

/// Receiver-side transform: derives per-salt keys on demand
///
/// PBKDF2 is deliberately slow, so the key for the most recent salt is
/// cached; senders keep one salt for the lifetime of their context.
pub struct PskDecryptor {
    secret: Vec<u8>,
    size: KeySize,
    cached: Option<([u8; SALT_LEN], [u8; 32])>,
}

impl PskDecryptor {
    pub fn new(secret: &[u8], size: KeySize) -> Result<Self, CryptoError> {
        check_secret(secret)?;
        Ok(PskDecryptor {
            secret: secret.to_vec(),
            size,
            cached: None,
        })
    }

    /// Transform `data` in place using the key for `salt`
    pub fn apply(
        &mut self,
        salt: &[u8; SALT_LEN],
        flow_id: u32,
        seq_word: u32,
        data: &mut [u8],
    ) {
        let key = match &self.cached {
            Some((cached_salt, key)) if cached_salt == salt => *key,
            _ => {
                let key = derive_key(&self.secret, salt, self.size);
                self.cached = Some((*salt, key));
                key
            }
        };
        let iv = build_iv(salt, flow_id, seq_word);
        apply_ctr(&key, self.size, &iv, data);
    }
}
