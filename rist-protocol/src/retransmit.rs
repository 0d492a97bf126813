//! Sender retransmit queue
//!
//! Transmitted data packets are retained in a circular buffer indexed by
//! sequence number so that NACKed sequences can be resent from their original
//! wire bytes. Slots age out after the configured retention window; when the
//! ring wraps, the oldest slot is discarded regardless of retry state, which
//! is the only source of unrecoverable loss on the sender side.

use crate::sequence::Seq;
use bytes::Bytes;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Retransmit queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetransmitError {
    #[error("Retransmit ring capacity must be non-zero")]
    ZeroCapacity,
}

/// Stored packet slot
#[derive(Clone)]
struct Slot {
    seq: Seq,
    wire: Bytes,
    first_sent: Instant,
    last_retransmit: Option<Instant>,
    retry_count: u32,
    /// Past this point the slot may no longer be retransmitted
    deadline: Instant,
}

/// Outcome of a retransmission request for one sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetransmitOutcome {
    /// Resend these wire bytes
    Send(Bytes),
    /// A retransmit for this sequence went out within the last RTT
    Suppressed,
    /// The slot's retention deadline has passed
    Expired,
    /// Retry budget exhausted
    RetriesExhausted,
    /// Sequence not present (never sent, or already evicted)
    Missing,
}

/// Cumulative retransmit queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetransmitCounters {
    /// Packets stored
    pub stored: u64,
    /// Retransmissions handed back to the pacer
    pub retransmitted: u64,
    /// Duplicate NACKs suppressed inside one RTT
    pub suppressed: u64,
    /// Live slots discarded because the ring wrapped
    pub evicted: u64,
}

/// Circular retransmit buffer, one per peer
pub struct RetransmitQueue {
    slots: Vec<Option<Slot>>,
    mask: usize,
    /// Highest sequence stored so far, if any
    newest: Option<Seq>,
    max_retries: u32,
    /// How long a stored packet stays eligible for retransmission
    retention: Duration,
    counters: RetransmitCounters,
}

/// Ring capacity for a recovery window, `ceil(window · bitrate / mtu)`
///
/// `recovery_length_max` in milliseconds, `maxbitrate` in bits per second.
/// Rounded up to a power of two for mask indexing.
pub fn ring_capacity(recovery_length_max_ms: u32, maxbitrate_bps: u32, mtu: usize) -> usize {
    let bytes_in_window =
        (recovery_length_max_ms as u64 * maxbitrate_bps as u64).div_ceil(8 * 1000);
    let packets = bytes_in_window.div_ceil(mtu as u64).max(1) as usize;
    packets.next_power_of_two()
}

impl RetransmitQueue {
    pub fn new(
        capacity: usize,
        max_retries: u32,
        retention: Duration,
    ) -> Result<Self, RetransmitError> {
        if capacity == 0 {
            return Err(RetransmitError::ZeroCapacity);
        }
        let capacity = capacity.next_power_of_two();
        Ok(RetransmitQueue {
            slots: vec![None; capacity],
            mask: capacity - 1,
            newest: None,
            max_retries,
            retention,
            counters: RetransmitCounters::default(),
        })
    }

    #[inline]
    fn index(&self, seq: Seq) -> usize {
        seq.as_raw() as usize & self.mask
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Highest sequence stored, used to extend 16-bit NACK-range bases
    pub fn newest_seq(&self) -> Option<Seq> {
        self.newest
    }

    pub fn counters(&self) -> RetransmitCounters {
        self.counters
    }

    /// Retain a transmitted packet's wire bytes for future retransmission
    ///
    /// Returns the sequence of a still-live slot that had to be evicted to
    /// make room, if any.
    pub fn store(&mut self, seq: Seq, wire: Bytes, now: Instant) -> Option<Seq> {
        let idx = self.index(seq);
        let evicted = match self.slots[idx].take() {
            Some(old) if now < old.deadline => {
                self.counters.evicted += 1;
                Some(old.seq)
            }
            _ => None,
        };

        self.slots[idx] = Some(Slot {
            seq,
            wire,
            first_sent: now,
            last_retransmit: None,
            retry_count: 0,
            deadline: now + self.retention,
        });
        self.counters.stored += 1;
        if self.newest.map_or(true, |n| n.precedes(seq)) {
            self.newest = Some(seq);
        }
        evicted
    }

    /// Look up a NACKed sequence for retransmission
    ///
    /// A slot is eligible only while its deadline has not expired and its
    /// retry count is below the limit. A request arriving within `rtt` of the
    /// previous retransmit for the same sequence is suppressed as a
    /// duplicate NACK.
    pub fn request(&mut self, seq: Seq, now: Instant, rtt: Duration) -> RetransmitOutcome {
        let idx = self.index(seq);
        let slot = match &mut self.slots[idx] {
            Some(slot) if slot.seq == seq => slot,
            _ => return RetransmitOutcome::Missing,
        };

        if now >= slot.deadline {
            return RetransmitOutcome::Expired;
        }
        if slot.retry_count >= self.max_retries {
            return RetransmitOutcome::RetriesExhausted;
        }
        if let Some(last) = slot.last_retransmit {
            if now.duration_since(last) < rtt {
                self.counters.suppressed += 1;
                return RetransmitOutcome::Suppressed;
            }
        }

        slot.retry_count += 1;
        slot.last_retransmit = Some(now);
        self.counters.retransmitted += 1;
        RetransmitOutcome::Send(slot.wire.clone())
    }

    /// Age of the original transmission for a stored sequence
    pub fn age(&self, seq: Seq, now: Instant) -> Option<Duration> {
        let idx = self.index(seq);
        match &self.slots[idx] {
            Some(slot) if slot.seq == seq => Some(now.duration_since(slot.first_sent)),
            _ => None,
        }
    }

    /// Drop slots whose retention deadline has passed
    pub fn drop_expired(&mut self, now: Instant) -> usize {
        let mut dropped = 0;
        for slot in &mut self.slots {
            if matches!(slot, Some(s) if now >= s.deadline) {
                *slot = None;
                dropped += 1;
            }
        }
        dropped
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> RetransmitQueue {
        RetransmitQueue::new(capacity, 3, Duration::from_millis(500)).unwrap()
    }

    #[test]
    fn test_ring_capacity() {
        // 1 s window at 8 Mbps with 1000-byte packets: 1000 packets -> 1024
        assert_eq!(ring_capacity(1000, 8_000_000, 1000), 1024);
        // Tiny config still yields one slot
        assert_eq!(ring_capacity(1, 8, 1500), 1);
    }

    #[test]
    fn test_store_and_request() {
        let mut q = queue(16);
        let now = Instant::now();

        q.store(Seq::new(10), Bytes::from_static(b"pkt10"), now);

        match q.request(Seq::new(10), now + Duration::from_millis(10), Duration::from_millis(50)) {
            RetransmitOutcome::Send(wire) => assert_eq!(wire, Bytes::from_static(b"pkt10")),
            other => panic!("expected send, got {:?}", other),
        }
        assert_eq!(q.counters().retransmitted, 1);
    }

    #[test]
    fn test_duplicate_nack_suppressed_within_rtt() {
        let mut q = queue(16);
        let now = Instant::now();
        let rtt = Duration::from_millis(50);

        q.store(Seq::new(1), Bytes::from_static(b"x"), now);

        let t1 = now + Duration::from_millis(10);
        assert!(matches!(q.request(Seq::new(1), t1, rtt), RetransmitOutcome::Send(_)));

        // Second NACK 20 ms later lands inside one RTT of the retransmit.
        let t2 = t1 + Duration::from_millis(20);
        assert_eq!(q.request(Seq::new(1), t2, rtt), RetransmitOutcome::Suppressed);

        // A full RTT later the request goes through again.
        let t3 = t1 + rtt;
        assert!(matches!(q.request(Seq::new(1), t3, rtt), RetransmitOutcome::Send(_)));
        assert_eq!(q.counters().suppressed, 1);
    }

    #[test]
    fn test_retry_limit() {
        let mut q = RetransmitQueue::new(16, 2, Duration::from_secs(10)).unwrap();
        let now = Instant::now();
        let rtt = Duration::from_millis(1);

        q.store(Seq::new(5), Bytes::from_static(b"x"), now);

        let mut t = now + Duration::from_millis(10);
        for _ in 0..2 {
            assert!(matches!(q.request(Seq::new(5), t, rtt), RetransmitOutcome::Send(_)));
            t += Duration::from_millis(10);
        }
        assert_eq!(q.request(Seq::new(5), t, rtt), RetransmitOutcome::RetriesExhausted);
    }

    #[test]
    fn test_expired_slot() {
        let mut q = queue(16);
        let now = Instant::now();

        q.store(Seq::new(5), Bytes::from_static(b"x"), now);

        let late = now + Duration::from_millis(600);
        assert_eq!(
            q.request(Seq::new(5), late, Duration::from_millis(50)),
            RetransmitOutcome::Expired
        );
    }

    #[test]
    fn test_wrap_evicts_oldest() {
        let mut q = queue(4);
        let now = Instant::now();

        for i in 0..4u32 {
            assert_eq!(q.store(Seq::new(i), Bytes::from_static(b"x"), now), None);
        }
        // Sequence 4 lands on slot 0, displacing the still-live sequence 0.
        let evicted = q.store(Seq::new(4), Bytes::from_static(b"y"), now);
        assert_eq!(evicted, Some(Seq::new(0)));
        assert_eq!(q.counters().evicted, 1);
        assert_eq!(
            q.request(Seq::new(0), now, Duration::from_millis(1)),
            RetransmitOutcome::Missing
        );
    }

    #[test]
    fn test_wrap_over_expired_slot_not_counted() {
        let mut q = queue(4);
        let now = Instant::now();

        q.store(Seq::new(0), Bytes::from_static(b"x"), now);
        // Past the 500 ms retention the displaced slot is not live loss.
        let later = now + Duration::from_secs(1);
        assert_eq!(q.store(Seq::new(4), Bytes::from_static(b"y"), later), None);
        assert_eq!(q.counters().evicted, 0);
    }

    #[test]
    fn test_newest_seq_tracks_high_water() {
        let mut q = queue(16);
        let now = Instant::now();

        assert_eq!(q.newest_seq(), None);
        q.store(Seq::new(7), Bytes::from_static(b"a"), now);
        q.store(Seq::new(9), Bytes::from_static(b"b"), now);
        q.store(Seq::new(8), Bytes::from_static(b"c"), now);
        assert_eq!(q.newest_seq(), Some(Seq::new(9)));
    }

    #[test]
    fn test_drop_expired() {
        let mut q = queue(16);
        let now = Instant::now();

        q.store(Seq::new(1), Bytes::from_static(b"a"), now);
        q.store(Seq::new(2), Bytes::from_static(b"b"), now + Duration::from_millis(400));

        assert_eq!(q.drop_expired(now + Duration::from_millis(550)), 1);
        assert_eq!(q.len(), 1);
    }
}
