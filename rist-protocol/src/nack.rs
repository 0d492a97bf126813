//! NACK scheduling
//!
//! Pending gaps in the reorder buffer are indexed in a timer wheel of 1-ms
//! buckets spanning the reorder window. When a slot's timer fires, contiguous
//! pending sequences coalesce into a single range NACK, or a bitmask NACK
//! when the losses are dense. Each retry re-arms at
//! `min(2 * previous interval, rtt_max)` with ±12.5 % jitter so that
//! repeated requests from many receivers do not synchronize.

use crate::packet::{NackBitmaskPacket, NackRangeEntry, NackRangePacket, PacketMeta};
use crate::reorder::ReorderBuffer;
use crate::sequence::Seq;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

/// Which NACK encoding the receiver emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NackType {
    /// Range NACKs, switching to bitmask when losses are dense
    #[default]
    Range,
    /// Always bitmask
    Bitmask,
}

/// A NACK payload ready to be wrapped in an envelope and transmitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackPayload {
    Range(Vec<NackRangeEntry>),
    Bitmask { base: Seq, mask: u128 },
}

impl NackPayload {
    /// Wrap into a wire packet for the given hop metadata
    pub fn into_packet(self, meta: PacketMeta) -> crate::packet::Packet {
        match self {
            NackPayload::Range(entries) => {
                crate::packet::Packet::NackRange(NackRangePacket { meta, entries })
            }
            NackPayload::Bitmask { base, mask } => {
                crate::packet::Packet::NackBitmask(NackBitmaskPacket { meta, base, mask })
            }
        }
    }
}

/// Timer wheel of 1-ms buckets
///
/// Entries are sequence numbers keyed by their due time. Due times beyond the
/// wheel's span are clamped to the last bucket: firing early is harmless
/// because the scheduler re-checks each candidate against the authoritative
/// slot state before emitting a NACK.
pub struct TimerWheel {
    buckets: Vec<Vec<Seq>>,
    mask: usize,
    epoch: Instant,
    /// Bucket index (in ms since epoch) up to which the wheel has been drained
    cursor_ms: u64,
}

impl TimerWheel {
    /// `span_ms` is rounded up to a power of two bucket count
    pub fn new(span_ms: usize, now: Instant) -> Self {
        let count = span_ms.max(2).next_power_of_two();
        TimerWheel {
            buckets: vec![Vec::new(); count],
            mask: count - 1,
            epoch: now,
            cursor_ms: 0,
        }
    }

    fn to_ms(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Arm a timer for `seq` at `due`
    pub fn insert(&mut self, seq: Seq, due: Instant) {
        let due_ms = self
            .to_ms(due)
            .clamp(self.cursor_ms + 1, self.cursor_ms + self.buckets.len() as u64);
        self.buckets[(due_ms as usize) & self.mask].push(seq);
    }

    /// Advance to `now`, draining every bucket whose time has passed
    pub fn pop_due(&mut self, now: Instant) -> Vec<Seq> {
        let now_ms = self.to_ms(now);
        let mut fired = Vec::new();
        while self.cursor_ms < now_ms {
            self.cursor_ms += 1;
            fired.append(&mut self.buckets[(self.cursor_ms as usize) & self.mask]);
        }
        fired
    }

    /// Earliest armed due time, if any
    pub fn next_due(&self) -> Option<Instant> {
        for offset in 1..=self.buckets.len() as u64 {
            let ms = self.cursor_ms + offset;
            if !self.buckets[(ms as usize) & self.mask].is_empty() {
                return Some(self.epoch + Duration::from_millis(ms));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }
}

/// Coalesces due gaps into NACK payloads and manages retry backoff
pub struct NackScheduler {
    wheel: TimerWheel,
    nack_type: NackType,
    rtt_min: Duration,
    rtt_max: Duration,
    max_retries: u32,
    rng: SmallRng,
}

impl NackScheduler {
    pub fn new(
        window_ms: usize,
        nack_type: NackType,
        rtt_min: Duration,
        rtt_max: Duration,
        max_retries: u32,
        now: Instant,
    ) -> Self {
        NackScheduler {
            wheel: TimerWheel::new(window_ms, now),
            nack_type,
            rtt_min,
            rtt_max,
            max_retries,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn nack_type(&self) -> NackType {
        self.nack_type
    }

    /// Register newly observed gaps (their first NACK is due `rtt_min` out)
    pub fn on_gaps(&mut self, gaps: &[Seq], now: Instant) {
        for &seq in gaps {
            self.wheel.insert(seq, now + self.rtt_min);
        }
    }

    /// Next wheel wake-up
    pub fn next_due(&self) -> Option<Instant> {
        self.wheel.next_due()
    }

    /// Fire due timers and build NACK payloads
    ///
    /// Candidates from the wheel are validated against the reorder buffer:
    /// recovered or abandoned slots are silently dropped, not-yet-due slots
    /// (early wheel fire) are re-armed. Emitted sequences are re-armed with
    /// exponential backoff and recorded via `mark_nacked`, which also retires
    /// slots that have exhausted their retry budget.
    pub fn poll(&mut self, buf: &mut ReorderBuffer, now: Instant) -> Vec<NackPayload> {
        let fired = self.wheel.pop_due(now);
        if fired.is_empty() {
            return Vec::new();
        }

        let due_now = buf.nacks_due(now);
        let mut due: Vec<Seq> = Vec::new();
        for seq in fired {
            match buf.nack_count(seq) {
                // Still pending: check the authoritative due time.
                Some(_) if due_now.contains(&seq) => due.push(seq),
                // Early wheel fire; try again next bucket.
                Some(_) => self.wheel.insert(seq, now + Duration::from_millis(1)),
                // Recovered, delivered, or already lost.
                None => {}
            }
        }

        if due.is_empty() {
            return Vec::new();
        }
        due.sort_by_key(|s| buf.cursor().distance_to(*s));
        due.dedup();

        // Re-arm every emitted sequence before building payloads.
        for &seq in &due {
            let count = buf.nack_count(seq).unwrap_or(0) + 1;
            let next = now + self.backoff(count);
            buf.mark_nacked(seq, next, self.max_retries);
            if buf.nack_count(seq).is_some() {
                self.wheel.insert(seq, next);
            }
        }

        self.build_payloads(&due)
    }

    /// `min(rtt_min * 2^count, rtt_max)` with ±12.5 % jitter
    fn backoff(&mut self, count: u32) -> Duration {
        let base = self
            .rtt_min
            .saturating_mul(1u32 << count.min(16))
            .min(self.rtt_max)
            .max(Duration::from_millis(1));
        let jitter: f64 = self.rng.gen_range(-0.125..=0.125);
        base.mul_f64(1.0 + jitter)
    }

    fn build_payloads(&self, due: &[Seq]) -> Vec<NackPayload> {
        let dense = matches!(self.nack_type, NackType::Bitmask) || is_dense(due);
        if dense {
            build_bitmasks(due)
        } else {
            build_ranges(due)
        }
    }
}

/// Loss density test: half of a 16-sequence window missing, fragmented
///
/// A single contiguous run always encodes as one range entry, so only
/// fragmented clusters (where ranges would multiply) switch to bitmask.
fn is_dense(sorted: &[Seq]) -> bool {
    const WINDOW: i32 = 16;
    const THRESHOLD: usize = 8;
    if sorted.len() < THRESHOLD {
        return false;
    }
    sorted.windows(THRESHOLD).any(|w| {
        let span = w[0].distance_to(w[THRESHOLD - 1]);
        span < WINDOW && span > THRESHOLD as i32 - 1
    })
}

fn build_ranges(sorted: &[Seq]) -> Vec<NackPayload> {
    let mut entries = Vec::new();
    let mut start = sorted[0];
    let mut prev = sorted[0];

    for &seq in &sorted[1..] {
        let contiguous = prev.next() == seq;
        let count = start.distance_to(prev);
        if !contiguous || count >= u16::MAX as i32 {
            entries.push(NackRangeEntry {
                base: start.as_rtp(),
                count: count as u16,
            });
            start = seq;
        }
        prev = seq;
    }
    entries.push(NackRangeEntry {
        base: start.as_rtp(),
        count: start.distance_to(prev) as u16,
    });

    vec![NackPayload::Range(entries)]
}

fn build_bitmasks(sorted: &[Seq]) -> Vec<NackPayload> {
    let mut payloads = Vec::new();
    let mut i = 0;

    while i < sorted.len() {
        let base = sorted[i];
        let mut mask = 0u128;
        i += 1;
        while i < sorted.len() {
            let offset = base.distance_to(sorted[i]);
            if offset > 128 {
                break;
            }
            mask |= 1u128 << (128 - offset);
            i += 1;
        }
        payloads.push(NackPayload::Bitmask { base, mask });
    }

    payloads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{DataPacket, PacketMeta};
    use bytes::Bytes;

    const RTT_MIN: Duration = Duration::from_millis(10);
    const RTT_MAX: Duration = Duration::from_millis(200);

    fn pkt(seq: u32) -> DataPacket {
        DataPacket::new(PacketMeta::new(1), Seq::new(seq), 0, Bytes::from_static(b"p"))
    }

    fn setup(now: Instant) -> (ReorderBuffer, NackScheduler) {
        let buf = ReorderBuffer::new(256, Duration::from_millis(500), RTT_MIN).unwrap();
        let sched = NackScheduler::new(512, NackType::Range, RTT_MIN, RTT_MAX, 7, now);
        (buf, sched)
    }

    fn feed(
        buf: &mut ReorderBuffer,
        sched: &mut NackScheduler,
        seq: u32,
        now: Instant,
    ) {
        if let crate::reorder::InsertOutcome::Stored { gaps, .. } = buf.insert(pkt(seq), now) {
            sched.on_gaps(&gaps, now);
        }
    }

    #[test]
    fn test_wheel_fires_in_order() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new(64, now);

        wheel.insert(Seq::new(1), now + Duration::from_millis(5));
        wheel.insert(Seq::new(2), now + Duration::from_millis(3));

        assert!(wheel.pop_due(now + Duration::from_millis(2)).is_empty());
        assert_eq!(
            wheel.pop_due(now + Duration::from_millis(4)),
            vec![Seq::new(2)]
        );
        assert_eq!(
            wheel.pop_due(now + Duration::from_millis(10)),
            vec![Seq::new(1)]
        );
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_wheel_next_due() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new(64, now);

        assert_eq!(wheel.next_due(), None);
        wheel.insert(Seq::new(1), now + Duration::from_millis(7));
        assert_eq!(wheel.next_due(), Some(now + Duration::from_millis(7)));
    }

    #[test]
    fn test_wheel_clamps_beyond_span() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new(16, now);

        // Far-future timer lands in the last bucket rather than aliasing.
        wheel.insert(Seq::new(9), now + Duration::from_secs(60));
        let fired = wheel.pop_due(now + Duration::from_millis(16));
        assert_eq!(fired, vec![Seq::new(9)]);
    }

    #[test]
    fn test_single_gap_coalesces_to_single_range() {
        let t0 = Instant::now();
        let (mut buf, mut sched) = setup(t0);

        feed(&mut buf, &mut sched, 0, t0);
        feed(&mut buf, &mut sched, 5, t0); // gaps 1..=4

        assert!(sched.poll(&mut buf, t0 + Duration::from_millis(5)).is_empty());

        let payloads = sched.poll(&mut buf, t0 + Duration::from_millis(11));
        assert_eq!(
            payloads,
            vec![NackPayload::Range(vec![NackRangeEntry { base: 1, count: 3 }])]
        );
        assert_eq!(buf.nack_count(Seq::new(1)), Some(1));
    }

    #[test]
    fn test_no_nack_before_due_for_reordered_arrival() {
        let t0 = Instant::now();
        let (mut buf, mut sched) = setup(t0);

        feed(&mut buf, &mut sched, 0, t0);
        feed(&mut buf, &mut sched, 2, t0);
        // Sequence 1 arrives reordered, before its nack-due.
        feed(&mut buf, &mut sched, 1, t0 + Duration::from_millis(2));

        assert!(sched
            .poll(&mut buf, t0 + Duration::from_millis(50))
            .is_empty());
    }

    #[test]
    fn test_retry_backoff_rearm() {
        let t0 = Instant::now();
        let (mut buf, mut sched) = setup(t0);

        feed(&mut buf, &mut sched, 0, t0);
        feed(&mut buf, &mut sched, 2, t0);

        let first = sched.poll(&mut buf, t0 + Duration::from_millis(11));
        assert_eq!(first.len(), 1);

        // The retry is owed no earlier than 2 * rtt_min less jitter.
        let next = sched.next_due().expect("re-armed");
        let min_due = t0 + Duration::from_millis(11) + RTT_MIN.mul_f64(2.0 * 0.875);
        assert!(next >= min_due - Duration::from_millis(1));

        // Eventually the retry fires again.
        let second = sched.poll(&mut buf, t0 + Duration::from_millis(100));
        assert_eq!(second.len(), 1);
        assert_eq!(buf.nack_count(Seq::new(1)), Some(2));
    }

    #[test]
    fn test_recovered_gap_is_not_nacked() {
        let t0 = Instant::now();
        let (mut buf, mut sched) = setup(t0);

        feed(&mut buf, &mut sched, 0, t0);
        feed(&mut buf, &mut sched, 2, t0);
        feed(&mut buf, &mut sched, 1, t0 + Duration::from_millis(1));

        assert!(sched
            .poll(&mut buf, t0 + Duration::from_millis(30))
            .is_empty());
    }

    #[test]
    fn test_retries_exhausted_stops_scheduling() {
        let t0 = Instant::now();
        let mut buf = ReorderBuffer::new(256, Duration::from_secs(10), RTT_MIN).unwrap();
        let mut sched = NackScheduler::new(512, NackType::Range, RTT_MIN, RTT_MAX, 2, t0);

        if let crate::reorder::InsertOutcome::Stored { gaps, .. } = buf.insert(pkt(0), t0) {
            sched.on_gaps(&gaps, t0);
        }
        if let crate::reorder::InsertOutcome::Stored { gaps, .. } = buf.insert(pkt(2), t0) {
            sched.on_gaps(&gaps, t0);
        }

        let mut t = t0;
        let mut sent = 0;
        for _ in 0..50 {
            t += Duration::from_millis(20);
            sent += sched.poll(&mut buf, t).len();
        }
        assert_eq!(sent, 2);
        assert_eq!(buf.counters().lost, 1);
    }

    #[test]
    fn test_bitmask_mode() {
        let t0 = Instant::now();
        let mut buf = ReorderBuffer::new(256, Duration::from_millis(500), RTT_MIN).unwrap();
        let mut sched = NackScheduler::new(512, NackType::Bitmask, RTT_MIN, RTT_MAX, 7, t0);

        if let crate::reorder::InsertOutcome::Stored { gaps, .. } = buf.insert(pkt(0), t0) {
            sched.on_gaps(&gaps, t0);
        }
        if let crate::reorder::InsertOutcome::Stored { gaps, .. } = buf.insert(pkt(4), t0) {
            sched.on_gaps(&gaps, t0);
        }

        let payloads = sched.poll(&mut buf, t0 + Duration::from_millis(11));
        match &payloads[..] {
            [NackPayload::Bitmask { base, mask }] => {
                assert_eq!(*base, Seq::new(1));
                // Offsets 1 and 2 from the base (sequences 2 and 3).
                assert_eq!(*mask, (1u128 << 127) | (1u128 << 126));
            }
            other => panic!("expected one bitmask, got {:?}", other),
        }
    }

    #[test]
    fn test_dense_loss_auto_selects_bitmask() {
        // Eight losses scattered over a 15-sequence span: fragmented, dense.
        let scattered: Vec<Seq> = (0..8).map(|i| Seq::new(i * 2)).collect();
        assert!(is_dense(&scattered));

        // A contiguous burst stays a single range entry.
        let burst: Vec<Seq> = (1..=20).map(Seq::new).collect();
        assert!(!is_dense(&burst));

        let sparse: Vec<Seq> = (0..8).map(|i| Seq::new(i * 100)).collect();
        assert!(!is_dense(&sparse));
    }

    #[test]
    fn test_range_split_on_discontinuity() {
        let due = vec![Seq::new(1), Seq::new(2), Seq::new(100)];
        match &build_ranges(&due)[..] {
            [NackPayload::Range(entries)] => {
                assert_eq!(
                    entries,
                    &vec![
                        NackRangeEntry { base: 1, count: 1 },
                        NackRangeEntry { base: 100, count: 0 },
                    ]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
