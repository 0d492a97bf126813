//! Receiver reorder buffer
//!
//! A circular buffer indexed by `sequence mod capacity` that absorbs network
//! reordering and holds packets for the recovery window. Missing sequences
//! become `Pending` slots carrying their NACK bookkeeping; the release clock
//! emits held packets in strictly increasing sequence order once their
//! deadline (`arrival of first held at or above cursor + recovery length`)
//! expires. Sequences below the cursor are delivered or permanently lost.

use crate::packet::DataPacket;
use crate::sequence::Seq;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Reorder buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReorderError {
    #[error("Reorder window capacity must be non-zero")]
    ZeroCapacity,
}

#[derive(Clone)]
enum Slot {
    Empty,
    /// Gap observed, NACK bookkeeping active
    Pending {
        seq: Seq,
        first_missing: Instant,
        nack_count: u32,
        next_nack: Instant,
    },
    /// Payload waiting for its release deadline
    Held {
        seq: Seq,
        arrived: Instant,
        packet: DataPacket,
        recovered: bool,
    },
    /// Released to the application; retained to absorb late duplicates
    Delivered { seq: Seq },
    /// Given up on; the release cursor skips it
    Lost { seq: Seq },
}

/// Outcome of inserting one data packet
#[derive(Debug)]
pub enum InsertOutcome {
    /// Packet stored in the window. `recovered` is set when a NACK had been
    /// sent for this sequence, `reordered` when the gap was observed but no
    /// NACK had fired yet. `gaps` lists sequences that became pending.
    Stored {
        recovered: bool,
        reordered: bool,
        gaps: Vec<Seq>,
    },
    /// Sequence already held or delivered
    Duplicate,
    /// Sequence below the cursor with no slot to fill
    LateDrop,
    /// Sequence beyond the window; the cursor was fast-forwarded
    FastForward {
        lost: u64,
        released: Vec<DataPacket>,
        gaps: Vec<Seq>,
    },
}

/// Cumulative per-flow reorder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderCounters {
    pub received: u64,
    pub recovered: u64,
    pub lost: u64,
    pub reordered: u64,
    pub duplicates: u64,
    pub late_drops: u64,
    pub flow_resets: u64,
}

/// Sequence-indexed reorder ring with timed in-order release
pub struct ReorderBuffer {
    slots: Vec<Slot>,
    mask: usize,
    /// Next sequence to deliver; slots span [cursor, cursor + capacity)
    cursor: Seq,
    /// Highest sequence seen
    high_water: Seq,
    started: bool,
    /// How long packets are held for repair before release
    recovery: Duration,
    /// Delay before the first NACK for a fresh gap (configured RTT floor)
    nack_delay: Duration,
    counters: ReorderCounters,
}

impl ReorderBuffer {
    pub fn new(
        capacity: usize,
        recovery: Duration,
        nack_delay: Duration,
    ) -> Result<Self, ReorderError> {
        if capacity == 0 {
            return Err(ReorderError::ZeroCapacity);
        }
        let capacity = capacity.next_power_of_two();
        Ok(ReorderBuffer {
            slots: vec![Slot::Empty; capacity],
            mask: capacity - 1,
            cursor: Seq::new(0),
            high_water: Seq::new(0),
            started: false,
            recovery,
            nack_delay,
            counters: ReorderCounters::default(),
        })
    }

    #[inline]
    fn index(&self, seq: Seq) -> usize {
        seq.as_raw() as usize & self.mask
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn cursor(&self) -> Seq {
        self.cursor
    }

    pub fn high_water(&self) -> Seq {
        self.high_water
    }

    pub fn counters(&self) -> ReorderCounters {
        self.counters
    }

    /// Insert an arriving data packet
    ///
    /// The four arrival cases: late (fill or drop), beyond-window
    /// (fast-forward), in-window store, and gap creation for skipped
    /// sequences between the previous high water mark and `s`.
    pub fn insert(&mut self, packet: DataPacket, now: Instant) -> InsertOutcome {
        let seq = packet.seq;

        if !self.started {
            self.started = true;
            self.cursor = seq;
            self.high_water = seq;
            let idx = self.index(seq);
            self.slots[idx] = Slot::Held {
                seq,
                arrived: now,
                packet,
                recovered: false,
            };
            self.counters.received += 1;
            return InsertOutcome::Stored {
                recovered: false,
                reordered: false,
                gaps: Vec::new(),
            };
        }

        let d = self.cursor.distance_to(seq);

        if d < 0 {
            return self.insert_late(seq);
        }
        if d as usize >= self.capacity() {
            return self.fast_forward(packet, now);
        }
        self.insert_in_window(packet, now)
    }

    fn insert_late(&mut self, seq: Seq) -> InsertOutcome {
        let idx = self.index(seq);
        match &self.slots[idx] {
            Slot::Delivered { seq: s } if *s == seq => {
                self.counters.duplicates += 1;
                InsertOutcome::Duplicate
            }
            _ => {
                self.counters.late_drops += 1;
                InsertOutcome::LateDrop
            }
        }
    }

    fn insert_in_window(&mut self, packet: DataPacket, now: Instant) -> InsertOutcome {
        let seq = packet.seq;
        let idx = self.index(seq);

        let (recovered, reordered) = match &self.slots[idx] {
            Slot::Held { seq: s, .. } | Slot::Delivered { seq: s } if *s == seq => {
                self.counters.duplicates += 1;
                return InsertOutcome::Duplicate;
            }
            // The sequence was abandoned after exhausting its NACK budget
            // and already counted lost; a retransmit limping in now stays
            // out of the stream so the counters keep adding up.
            Slot::Lost { seq: s } if *s == seq => {
                self.counters.late_drops += 1;
                return InsertOutcome::LateDrop;
            }
            Slot::Pending {
                seq: s, nack_count, ..
            } if *s == seq => (*nack_count > 0, *nack_count == 0),
            _ => (false, false),
        };

        self.slots[idx] = Slot::Held {
            seq,
            arrived: now,
            packet,
            recovered,
        };
        // Recovered retransmits are counted separately from originals.
        if recovered {
            self.counters.recovered += 1;
        } else {
            self.counters.received += 1;
        }
        if reordered {
            self.counters.reordered += 1;
        }

        // Sequences skipped between the previous high water mark and this
        // arrival become pending gaps awaiting their first NACK.
        let mut gaps = Vec::new();
        if self.high_water.precedes(seq) {
            let mut gap = self.high_water.next();
            while gap.precedes(seq) {
                let gidx = self.index(gap);
                if matches!(self.slots[gidx], Slot::Empty) {
                    self.slots[gidx] = Slot::Pending {
                        seq: gap,
                        first_missing: now,
                        nack_count: 0,
                        next_nack: now + self.nack_delay,
                    };
                    gaps.push(gap);
                }
                gap.increment();
            }
            self.high_water = seq;
        }

        InsertOutcome::Stored {
            recovered,
            reordered,
            gaps,
        }
    }

    fn fast_forward(&mut self, packet: DataPacket, now: Instant) -> InsertOutcome {
        let seq = packet.seq;
        let capacity = self.capacity();
        let d = self.cursor.distance_to(seq);

        self.counters.flow_resets += 1;
        let mut released = Vec::new();
        let mut lost = 0u64;

        if (d as usize) < 2 * capacity {
            // Sweep the cursor forward so `seq` lands on the last slot,
            // flushing held packets in order and declaring gaps lost.
            let new_cursor = seq - (capacity as u32 - 1);
            while self.cursor != new_cursor {
                let idx = self.index(self.cursor);
                match std::mem::replace(&mut self.slots[idx], Slot::Empty) {
                    Slot::Held {
                        seq: s, packet: p, ..
                    } if s == self.cursor => {
                        released.push(p);
                    }
                    Slot::Lost { .. } | Slot::Delivered { .. } => {}
                    _ => lost += 1,
                }
                self.cursor.increment();
            }
        } else {
            // The jump is too large to sweep slot by slot. Every window
            // position that held nothing deliverable is lost, matching the
            // bounded sweep above.
            for slot in &mut self.slots {
                match std::mem::replace(slot, Slot::Empty) {
                    Slot::Held { packet: p, .. } => released.push(p),
                    Slot::Lost { .. } | Slot::Delivered { .. } => {}
                    _ => lost += 1,
                }
            }
            released.sort_by(|a, b| {
                if a.seq.precedes(b.seq) {
                    std::cmp::Ordering::Less
                } else if a.seq == b.seq {
                    std::cmp::Ordering::Equal
                } else {
                    std::cmp::Ordering::Greater
                }
            });

            // Sequences between the old window's top and the jump target
            // were skipped outright; the new window starts at `seq`, so none
            // of them is repairable. Counted against the old cursor before
            // it moves.
            let old_window_top = self.cursor + capacity as u32;
            lost += old_window_top.distance_to(seq).max(0) as u64;
            self.cursor = seq;
        }

        self.counters.lost += lost;
        // Flushed packets were counted when they arrived; only `seq` is new.
        self.counters.received += 1;

        let idx = self.index(seq);
        self.slots[idx] = Slot::Held {
            seq,
            arrived: now,
            packet,
            recovered: false,
        };

        // Gaps between the old high water mark and the jump target that fall
        // inside the new window are still repairable.
        let mut gaps = Vec::new();
        let mut gap = if self.cursor.precedes(self.high_water) {
            self.high_water.next()
        } else {
            self.cursor
        };
        while gap.precedes(seq) {
            let gidx = self.index(gap);
            if matches!(self.slots[gidx], Slot::Empty) {
                self.slots[gidx] = Slot::Pending {
                    seq: gap,
                    first_missing: now,
                    nack_count: 0,
                    next_nack: now + self.nack_delay,
                };
                gaps.push(gap);
            }
            gap.increment();
        }
        self.high_water = seq;

        InsertOutcome::FastForward {
            lost,
            released,
            gaps,
        }
    }

    /// The first held sequence at or above the cursor, with its arrival time
    fn first_held(&self) -> Option<(Seq, Instant)> {
        let mut seq = self.cursor;
        for _ in 0..self.capacity() {
            if let Slot::Held {
                seq: s, arrived, ..
            } = &self.slots[self.index(seq)]
            {
                if *s == seq {
                    return Some((seq, *arrived));
                }
            }
            seq.increment();
            if self.high_water.precedes(seq) {
                break;
            }
        }
        None
    }

    /// Release deadline of the next deliverable packet
    pub fn next_deadline(&self) -> Option<Instant> {
        self.first_held().map(|(_, arrived)| arrived + self.recovery)
    }

    /// Emit packets whose deadlines have expired, in sequence order
    ///
    /// Pending gaps the cursor crosses are declared lost; delivered sequences
    /// are strictly increasing and each sequence is delivered at most once.
    pub fn release(&mut self, now: Instant) -> Vec<DataPacket> {
        let mut out = Vec::new();

        while let Some((held_seq, arrived)) = self.first_held() {
            if now < arrived + self.recovery {
                break;
            }

            // Everything between the cursor and the due packet has had its
            // full recovery window; give up on the gaps.
            while self.cursor != held_seq {
                let idx = self.index(self.cursor);
                match std::mem::replace(&mut self.slots[idx], Slot::Empty) {
                    Slot::Pending { .. } | Slot::Empty => {
                        self.counters.lost += 1;
                        self.slots[idx] = Slot::Lost { seq: self.cursor };
                    }
                    Slot::Lost { seq } => self.slots[idx] = Slot::Lost { seq },
                    other => self.slots[idx] = other,
                }
                self.cursor.increment();
            }

            let idx = self.index(held_seq);
            if let Slot::Held { packet, .. } =
                std::mem::replace(&mut self.slots[idx], Slot::Delivered { seq: held_seq })
            {
                out.push(packet);
            }
            self.cursor.increment();

            // Consecutive held packets older than their own deadlines drain
            // in the same pass via the loop condition.
        }

        out
    }

    /// Earliest pending NACK due time
    pub fn next_nack_due(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Pending { seq, next_nack, .. } if self.in_window(*seq) => Some(*next_nack),
                _ => None,
            })
            .min()
    }

    /// Pending sequences whose NACK timers have fired, in sequence order
    pub fn nacks_due(&self, now: Instant) -> Vec<Seq> {
        let mut due: Vec<Seq> = self
            .slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Pending { seq, next_nack, .. }
                    if self.in_window(*seq) && *next_nack <= now =>
                {
                    Some(*seq)
                }
                _ => None,
            })
            .collect();
        due.sort_by_key(|s| self.cursor.distance_to(*s));
        due
    }

    /// Record that a NACK was sent for `seq`
    ///
    /// `next_nack` re-arms the slot's timer. Once `max_retries` NACKs have
    /// been spent the slot is marked lost and the counter bumped.
    pub fn mark_nacked(&mut self, seq: Seq, next_nack: Instant, max_retries: u32) {
        let idx = self.index(seq);
        let exhausted = match &mut self.slots[idx] {
            Slot::Pending {
                seq: s,
                nack_count,
                next_nack: due,
                ..
            } if *s == seq => {
                *nack_count += 1;
                if *nack_count >= max_retries {
                    true
                } else {
                    *due = next_nack;
                    false
                }
            }
            _ => return,
        };

        if exhausted {
            self.slots[idx] = Slot::Lost { seq };
            self.counters.lost += 1;
        }
    }

    /// NACK count already spent on a pending sequence
    pub fn nack_count(&self, seq: Seq) -> Option<u32> {
        match &self.slots[self.index(seq)] {
            Slot::Pending {
                seq: s, nack_count, ..
            } if *s == seq => Some(*nack_count),
            _ => None,
        }
    }

    /// How long a pending sequence has been missing
    pub fn gap_age(&self, seq: Seq, now: Instant) -> Option<Duration> {
        match &self.slots[self.index(seq)] {
            Slot::Pending {
                seq: s,
                first_missing,
                ..
            } if *s == seq => Some(now.duration_since(*first_missing)),
            _ => None,
        }
    }

    #[inline]
    fn in_window(&self, seq: Seq) -> bool {
        let d = self.cursor.distance_to(seq);
        d >= 0 && (d as usize) < self.capacity()
    }
}
