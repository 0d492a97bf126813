//! Statistics containers
//!
//! Plain snapshot types assembled by the sender/receiver contexts on the
//! configured stats interval and handed to the application's stats callback.

use crate::reorder::ReorderCounters;
use std::time::Duration;

/// Sender-side per-peer snapshot
#[derive(Debug, Clone, Default)]
pub struct SenderPeerStats {
    pub peer_id: u64,
    pub sent: u64,
    pub sent_bytes: u64,
    pub retransmitted: u64,
    /// Duplicate NACKs suppressed within one RTT
    pub suppressed: u64,
    /// Live retransmit slots lost to ring wrap
    pub evicted: u64,
    /// Retransmissions dropped by buffer-bloat control
    pub bloat_dropped: u64,
    pub rtt: Duration,
    /// Receiver-reported cumulative counts from the last RR
    pub reported_received: u64,
    pub reported_lost: u64,
}

/// Sender context snapshot
#[derive(Debug, Clone, Default)]
pub struct SenderStats {
    pub flow_id: u32,
    pub peers: Vec<SenderPeerStats>,
}

impl SenderStats {
    pub fn total_sent(&self) -> u64 {
        self.peers.iter().map(|p| p.sent).sum()
    }

    pub fn total_retransmitted(&self) -> u64 {
        self.peers.iter().map(|p| p.retransmitted).sum()
    }
}

/// Receiver-side per-flow snapshot
#[derive(Debug, Clone, Default)]
pub struct FlowStats {
    pub flow_id: u32,
    pub received: u64,
    pub recovered: u64,
    pub lost: u64,
    pub reordered: u64,
    pub duplicates: u64,
    pub late_drops: u64,
    pub flow_resets: u64,
}

impl FlowStats {
    pub fn from_counters(flow_id: u32, counters: ReorderCounters) -> Self {
        FlowStats {
            flow_id,
            received: counters.received,
            recovered: counters.recovered,
            lost: counters.lost,
            reordered: counters.reordered,
            duplicates: counters.duplicates,
            late_drops: counters.late_drops,
            flow_resets: counters.flow_resets,
        }
    }

    /// Fraction of expected packets that were never delivered
    pub fn loss_ratio(&self) -> f64 {
        let expected = self.received + self.lost;
        if expected == 0 {
            0.0
        } else {
            self.lost as f64 / expected as f64
        }
    }
}

/// Receiver context snapshot
#[derive(Debug, Clone, Default)]
pub struct ReceiverStats {
    pub flows: Vec<FlowStats>,
}
