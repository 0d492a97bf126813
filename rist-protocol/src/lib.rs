//! RIST Protocol Core Implementation
//!
//! This crate implements the core of the RIST (Reliable Internet Stream
//! Transport) protocol: wire framing, the per-flow sequence space, the
//! sender's retransmit ring, the receiver's reorder buffer with NACK
//! scheduling, the peer state machine, and flow aggregation. It performs no
//! I/O and never reads the clock: every time-dependent operation takes an
//! explicit `Instant`, which keeps the engine deterministic under test.

pub mod flow;
pub mod nack;
pub mod packet;
pub mod peer;
pub mod reorder;
pub mod retransmit;
pub mod sequence;
pub mod stats;

pub use flow::{Flow, FlowOutput, PeerArrivals, PeerId};
pub use nack::{NackPayload, NackScheduler, NackType, TimerWheel};
pub use packet::{
    DataPacket, KeepAlivePacket, NackBitmaskPacket, NackRangeEntry, NackRangePacket, OobPacket,
    Packet, PacketError, PacketMeta, PayloadType, ReceiverReport, ReceiverReportPacket, WireKind,
};
pub use peer::{BufferBloat, BufferBloatMode, DeathReason, Peer, PeerEvent, PeerState, RttEstimator};
pub use reorder::{InsertOutcome, ReorderBuffer, ReorderCounters, ReorderError};
pub use retransmit::{RetransmitCounters, RetransmitOutcome, RetransmitQueue};
pub use sequence::Seq;
pub use stats::{FlowStats, ReceiverStats, SenderPeerStats, SenderStats};
