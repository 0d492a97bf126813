//! Flow aggregation
//!
//! A flow is one sequenced stream identified by a 32-bit flow id. Several
//! peers may carry the same flow over redundant paths; arrivals are dedup'd
//! by (flow_id, sequence) with the first arrival winning, while duplicates
//! still update the delivering peer's statistics. The flow also decides which
//! peer each NACK is addressed to.

use crate::nack::{NackPayload, NackScheduler, NackType};
use crate::packet::DataPacket;
use crate::reorder::{InsertOutcome, ReorderBuffer, ReorderCounters, ReorderError};
use crate::sequence::Seq;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Opaque peer index; the owning context resolves it to the actual peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

/// Per-peer arrival statistics for one flow
#[derive(Debug, Clone, Default)]
pub struct PeerArrivals {
    pub received: u64,
    pub duplicates: u64,
    pub last_seq: Option<Seq>,
    /// NACK rounds addressed to this peer that did not produce the packet
    pub nack_failures: u64,
}

/// What a data arrival produced
#[derive(Debug, Default)]
pub struct FlowOutput {
    /// Packets released to the application by this arrival (fast-forward flush)
    pub released: Vec<DataPacket>,
    pub duplicate: bool,
    pub recovered: bool,
}

/// One flow's receive state: reorder buffer, NACK scheduler, peer bookkeeping
pub struct Flow {
    flow_id: u32,
    buffer: ReorderBuffer,
    nack: NackScheduler,
    peers: Vec<PeerId>,
    arrivals: HashMap<PeerId, PeerArrivals>,
    /// Peer that delivered the most recent accepted packet
    last_deliverer: Option<PeerId>,
    /// Peer the previous NACK round was addressed to
    last_nack_target: Option<PeerId>,
    created: Instant,
}

impl Flow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flow_id: u32,
        window: usize,
        recovery: Duration,
        rtt_min: Duration,
        rtt_max: Duration,
        max_retries: u32,
        nack_type: NackType,
        now: Instant,
    ) -> Result<Self, ReorderError> {
        let buffer = ReorderBuffer::new(window, recovery, rtt_min)?;
        let wheel_span = rtt_max.as_millis().max(recovery.as_millis()) as usize + 1;
        Ok(Flow {
            flow_id,
            buffer,
            nack: NackScheduler::new(wheel_span, nack_type, rtt_min, rtt_max, max_retries, now),
            peers: Vec::new(),
            arrivals: HashMap::new(),
            last_deliverer: None,
            last_nack_target: None,
            created: now,
        })
    }

    pub fn flow_id(&self) -> u32 {
        self.flow_id
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn counters(&self) -> ReorderCounters {
        self.buffer.counters()
    }

    pub fn high_water(&self) -> Seq {
        self.buffer.high_water()
    }

    pub fn peer_arrivals(&self, peer: PeerId) -> Option<&PeerArrivals> {
        self.arrivals.get(&peer)
    }

    /// Peers currently carrying this flow
    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    /// Attach a peer carrying this flow
    pub fn register_peer(&mut self, peer: PeerId) {
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
            self.arrivals.entry(peer).or_default();
        }
    }

    pub fn remove_peer(&mut self, peer: PeerId) {
        self.peers.retain(|p| *p != peer);
        if self.last_deliverer == Some(peer) {
            self.last_deliverer = None;
        }
        if self.last_nack_target == Some(peer) {
            self.last_nack_target = None;
        }
    }

    /// Process a data packet arriving from `peer`
    pub fn handle_data(&mut self, packet: DataPacket, peer: PeerId, now: Instant) -> FlowOutput {
        self.register_peer(peer);
        let seq = packet.seq;

        let mut out = FlowOutput::default();
        match self.buffer.insert(packet, now) {
            InsertOutcome::Stored {
                recovered, gaps, ..
            } => {
                self.nack.on_gaps(&gaps, now);
                out.recovered = recovered;
                self.record_arrival(peer, seq, false);
                self.last_deliverer = Some(peer);
            }
            InsertOutcome::Duplicate => {
                out.duplicate = true;
                self.record_arrival(peer, seq, true);
            }
            InsertOutcome::LateDrop => {
                tracing::debug!(flow = self.flow_id, %seq, "late packet dropped");
                self.record_arrival(peer, seq, true);
            }
            InsertOutcome::FastForward {
                lost,
                released,
                gaps,
            } => {
                tracing::warn!(
                    flow = self.flow_id,
                    %seq,
                    lost,
                    "flow reset: sequence jumped beyond the reorder window"
                );
                self.nack.on_gaps(&gaps, now);
                out.released = released;
                self.record_arrival(peer, seq, false);
                self.last_deliverer = Some(peer);
            }
        }
        out
    }

    fn record_arrival(&mut self, peer: PeerId, seq: Seq, duplicate: bool) {
        let stats = self.arrivals.entry(peer).or_default();
        if duplicate {
            stats.duplicates += 1;
        } else {
            stats.received += 1;
            stats.last_seq = Some(seq);
        }
    }

    /// Release packets whose deadlines have expired, in order
    pub fn release(&mut self, now: Instant) -> Vec<DataPacket> {
        self.buffer.release(now)
    }

    /// Earliest instant this flow needs the loop to wake up
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.buffer.next_deadline(), self.nack.next_due()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire due NACK timers, returning payloads with their target peers
    pub fn poll_nacks(&mut self, now: Instant) -> Vec<(PeerId, NackPayload)> {
        let retrying = self
            .buffer
            .nacks_due(now)
            .iter()
            .any(|s| self.buffer.nack_count(*s).map_or(false, |c| c > 0));

        let payloads = self.nack.poll(&mut self.buffer, now);
        if payloads.is_empty() {
            return Vec::new();
        }

        // A retry round means the previously targeted peer did not deliver.
        if retrying {
            if let Some(failed) = self.last_nack_target {
                if let Some(stats) = self.arrivals.get_mut(&failed) {
                    stats.nack_failures += 1;
                }
            }
        }

        let target = match self.select_nack_peer(retrying) {
            Some(t) => t,
            None => return Vec::new(),
        };
        self.last_nack_target = Some(target);

        payloads.into_iter().map(|p| (target, p)).collect()
    }

    /// NACK routing: most recent deliverer first; on retries, rotate across
    /// peers favoring the lowest recent loss rate
    fn select_nack_peer(&self, retrying: bool) -> Option<PeerId> {
        if self.peers.is_empty() {
            return None;
        }
        if !retrying {
            if let Some(p) = self.last_deliverer {
                return Some(p);
            }
        }

        let candidates: Vec<PeerId> = if self.peers.len() > 1 && retrying {
            self.peers
                .iter()
                .copied()
                .filter(|p| Some(*p) != self.last_nack_target)
                .collect()
        } else {
            self.peers.clone()
        };

        candidates
            .into_iter()
            .min_by(|a, b| {
                let score = |p: &PeerId| {
                    let s = self.arrivals.get(p);
                    let failures = s.map_or(0, |s| s.nack_failures) as f64;
                    let received = s.map_or(0, |s| s.received) as f64;
                    (failures + 1.0) / (received + 1.0)
                };
                score(a).total_cmp(&score(b))
            })
            .or(self.last_deliverer)
    }
}
