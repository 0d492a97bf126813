//! Application-facing data and OOB blocks

use bytes::Bytes;
use rist_io::NtpTime;
use rist_protocol::PeerId;

/// One block of sequenced media handed to or received from the library
///
/// On the send side `ts_ntp` of zero means "stamp at enqueue time" and
/// `flow_id` of zero means "use the context's flow". On the receive side all
/// fields are filled in by the library.
#[derive(Debug, Clone)]
pub struct DataBlock {
    pub payload: Bytes,
    /// Capture time, NTP short format; preserved end-to-end
    pub ts_ntp: NtpTime,
    pub virt_src_port: u16,
    pub virt_dst_port: u16,
    pub flow_id: u32,
    /// Flow sequence number (receive side)
    pub seq: u32,
    /// Peer that delivered the block (receive side)
    pub peer: Option<PeerId>,
}

impl DataBlock {
    /// A block ready for [`crate::Sender::data_write`]
    pub fn new(payload: Bytes) -> Self {
        DataBlock {
            payload,
            ts_ntp: NtpTime::from_raw(0),
            virt_src_port: 0,
            virt_dst_port: 0,
            flow_id: 0,
            seq: 0,
            peer: None,
        }
    }
}

/// One out-of-band block: unsequenced, never retransmitted
#[derive(Debug, Clone)]
pub struct OobBlock {
    /// Destination peer (send side) or source peer (receive side)
    pub peer: Option<PeerId>,
    pub payload: Bytes,
    pub ts_ntp: NtpTime,
}

impl OobBlock {
    pub fn new(payload: Bytes) -> Self {
        OobBlock {
            peer: None,
            payload,
            ts_ntp: NtpTime::from_raw(0),
        }
    }

    pub fn to_peer(peer: PeerId, payload: Bytes) -> Self {
        OobBlock {
            peer: Some(peer),
            payload,
            ts_ntp: NtpTime::from_raw(0),
        }
    }
}
