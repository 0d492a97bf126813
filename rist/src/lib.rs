//! RIST - Reliable Internet Stream Transport
//!
//! Sender and receiver contexts for carrying latency-sensitive media over
//! UDP with NACK-driven selective retransmission, optional pre-shared-key
//! encryption, and LZ4 compression.
//!
//! ```no_run
//! use rist::{DataBlock, PeerConfig, Profile, Sender};
//! use bytes::Bytes;
//!
//! # fn main() -> rist::Result<()> {
//! let sender = Sender::new(Profile::Main, 0)?;
//! sender.peer_add(&PeerConfig::new("203.0.113.10:1968".parse().unwrap()))?;
//! sender.start()?;
//! sender.data_write(DataBlock::new(Bytes::from_static(b"ts payload")))?;
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod config;
pub mod error;
pub mod handler;
pub mod oob;
pub mod receiver;
pub mod sender;
mod transform;

pub use block::{DataBlock, OobBlock};
pub use config::{ContextConfig, PeerConfig, Profile, RecoveryMode};
pub use error::{Error, Result};
pub use handler::{ConnectRequest, Handlers, StatsSnapshot};
pub use receiver::Receiver;
pub use sender::Sender;

pub use rist_protocol::{
    BufferBloatMode, FlowStats, NackType, PeerId, ReceiverStats, SenderPeerStats, SenderStats,
};

/// Capability bits exchanged in keep-alives
pub mod caps {
    /// Peer services NACK retransmission requests
    pub const RETRANSMIT: u32 = 1;
    /// Peer accepts out-of-band blocks
    pub const OOB: u32 = 1 << 1;
    /// Peer expects encrypted payloads
    pub const ENCRYPTION: u32 = 1 << 2;
}

pub(crate) const OOB_NOT_SUPPORTED: &str = "out-of-band data requires the main profile";
