//! Unified error type for the RIST API surface

use thiserror::Error;

/// Errors surfaced by sender and receiver contexts
///
/// Per-packet conditions (malformed, decrypt failures, late drops) are
/// counted and logged inside the engine, never returned from API calls;
/// these variants cover configuration, lifecycle, and queue conditions.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation would block")]
    WouldBlock,

    #[error("Timed out")]
    TimedOut,

    #[error("Malformed packet: {0}")]
    MalformedPacket(#[from] rist_protocol::PacketError),

    #[error("Decryption failed")]
    DecryptFailed,

    #[error("Peer is dead")]
    PeerDead,

    #[error("Ring buffer is full")]
    RingFull,

    #[error("Peer not authorized")]
    Unauthorized,

    #[error("Context not started")]
    NotStarted,

    #[error("Context already started")]
    AlreadyStarted,

    #[error("Fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rist_crypto::CryptoError> for Error {
    fn from(err: rist_crypto::CryptoError) -> Self {
        match err {
            rist_crypto::CryptoError::DecryptFailed => Error::DecryptFailed,
            other => Error::InvalidConfig(other.to_string()),
        }
    }
}

impl From<rist_io::SocketError> for Error {
    fn from(err: rist_io::SocketError) -> Self {
        Error::Fatal(err.to_string())
    }
}
