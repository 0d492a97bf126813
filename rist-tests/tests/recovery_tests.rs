//! Loss recovery scenarios driven at the protocol layer
//!
//! These tests wire a sender-side retransmit queue to a receiver-side flow
//! directly, stepping time explicitly, so loss, NACK emission, retransmission
//! and release deadlines are all deterministic.

use bytes::Bytes;
use rist_protocol::{
    DataPacket, Flow, NackPayload, NackType, Packet, PacketMeta, PeerId, RetransmitOutcome,
    RetransmitQueue, Seq,
};
use std::time::{Duration, Instant};

const FLOW_ID: u32 = 0x00BEEF00;
const RTT_MIN: Duration = Duration::from_millis(10);
const RTT_MAX: Duration = Duration::from_millis(100);
const RECOVERY: Duration = Duration::from_millis(200);
const PEER: PeerId = PeerId(1);

fn make_flow(t0: Instant) -> Flow {
    Flow::new(
        FLOW_ID,
        2048,
        RECOVERY,
        RTT_MIN,
        RTT_MAX,
        7,
        NackType::Range,
        t0,
    )
    .unwrap()
}

fn make_queue() -> RetransmitQueue {
    RetransmitQueue::new(2048, 7, Duration::from_secs(10)).unwrap()
}

fn packet(seq: u32) -> DataPacket {
    DataPacket::new(
        PacketMeta::new(FLOW_ID),
        Seq::new(seq),
        seq as u64,
        Bytes::from(vec![seq as u8; 64]),
    )
}

/// Feed a NACK payload back through the sender-side queue, returning the
/// retransmitted packets exactly as a sender would produce them.
fn service_nack(queue: &mut RetransmitQueue, payload: &NackPayload, now: Instant) -> Vec<DataPacket> {
    let newest = queue.newest_seq().expect("queue has traffic");
    let mut out = Vec::new();
    let mut serve = |seq: Seq| {
        if let RetransmitOutcome::Send(wire) = queue.request(seq, now, RTT_MIN) {
            match Packet::from_bytes(&wire).expect("stored wire bytes decode") {
                Packet::Data(p) => out.push(p),
                other => panic!("retransmit ring held non-data packet: {:?}", other),
            }
        }
    };
    match payload {
        NackPayload::Range(entries) => {
            for entry in entries {
                let base = Seq::extend_from_rtp(entry.base, newest);
                for offset in 0..=entry.count as u32 {
                    serve(base + offset);
                }
            }
        }
        NackPayload::Bitmask { base, mask } => {
            let packet = rist_protocol::NackBitmaskPacket {
                meta: PacketMeta::new(FLOW_ID),
                base: *base,
                mask: *mask,
            };
            let seqs: Vec<Seq> = packet.sequences().collect();
            for seq in seqs {
                serve(seq);
            }
        }
    }
    out
}

#[test]
fn single_loss_recovered_by_nack() {
    let t0 = Instant::now();
    let mut flow = make_flow(t0);
    let mut queue = make_queue();

    // 1000 packets at 1 ms spacing; sequence 42 is lost en route.
    for i in 0..1000u32 {
        let t = t0 + Duration::from_millis(i as u64);
        let p = packet(i);
        queue.store(Seq::new(i), p.to_bytes().freeze(), t);
        if i != 42 {
            flow.handle_data(p, PEER, t);
        }
    }

    // The gap's NACK timer fires one rtt_min after the gap was observed.
    let nack_time = t0 + Duration::from_millis(60);
    let nacks = flow.poll_nacks(nack_time);
    assert_eq!(nacks.len(), 1);
    assert_eq!(nacks[0].0, PEER);
    match &nacks[0].1 {
        NackPayload::Range(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].base, 42);
            assert_eq!(entries[0].count, 0);
        }
        other => panic!("expected range nack, got {:?}", other),
    }

    // The retransmit arrives half an RTT later and counts as recovered.
    let retx_time = nack_time + Duration::from_millis(5);
    for p in service_nack(&mut queue, &nacks[0].1, retx_time) {
        let out = flow.handle_data(p, PEER, retx_time);
        assert!(out.recovered);
    }

    let delivered = flow.release(t0 + Duration::from_secs(5));
    assert_eq!(delivered.len(), 1000);
    for (i, p) in delivered.iter().enumerate() {
        assert_eq!(p.seq, Seq::new(i as u32));
    }

    let counters = flow.counters();
    assert_eq!(counters.received, 999);
    assert_eq!(counters.recovered, 1);
    assert_eq!(counters.lost, 0);
}

#[test]
fn burst_loss_coalesces_into_one_range() {
    let t0 = Instant::now();
    let mut flow = make_flow(t0);
    let mut queue = make_queue();

    // Sequences 100..=199 are dropped contiguously.
    for i in 0..1000u32 {
        let t = t0 + Duration::from_millis(i as u64 / 10);
        let p = packet(i);
        queue.store(Seq::new(i), p.to_bytes().freeze(), t);
        if !(100..200).contains(&i) {
            flow.handle_data(p, PEER, t);
        }
    }

    let nack_time = t0 + Duration::from_millis(40);
    let nacks = flow.poll_nacks(nack_time);
    assert_eq!(nacks.len(), 1, "contiguous burst must coalesce");
    match &nacks[0].1 {
        NackPayload::Range(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].base, 100);
            assert_eq!(entries[0].count, 99);
        }
        other => panic!("expected one range, got {:?}", other),
    }

    let retx_time = nack_time + Duration::from_millis(5);
    let retransmits = service_nack(&mut queue, &nacks[0].1, retx_time);
    assert_eq!(retransmits.len(), 100);
    for p in retransmits {
        flow.handle_data(p, PEER, retx_time);
    }

    let delivered = flow.release(t0 + Duration::from_secs(5));
    assert_eq!(delivered.len(), 1000);

    let counters = flow.counters();
    assert_eq!(counters.received, 900);
    assert_eq!(counters.recovered, 100);
    assert_eq!(counters.lost, 0);
}

#[test]
fn burst_loss_beyond_window_counts_lost() {
    let t0 = Instant::now();
    let mut flow = make_flow(t0);

    // The burst is never repaired: after max_retries NACK rounds every
    // missing sequence is abandoned.
    for i in 0..300u32 {
        if !(100..200).contains(&i) {
            flow.handle_data(packet(i), PEER, t0 + Duration::from_millis(i as u64 / 10));
        }
    }

    let mut t = t0;
    for _ in 0..100 {
        t += Duration::from_millis(50);
        flow.poll_nacks(t);
    }

    let counters = flow.counters();
    assert_eq!(counters.lost, 100);
    assert_eq!(counters.recovered, 0);

    let delivered = flow.release(t0 + Duration::from_secs(60));
    assert_eq!(delivered.len(), 200);
}

#[test]
fn reordering_within_window_emits_no_nacks() {
    let t0 = Instant::now();
    let mut flow = make_flow(t0);

    // The first chunk arrives in order (anchoring the flow at sequence 0),
    // then every window of 8 arrives highest-first, well inside the rtt_min
    // NACK delay.
    let mut t = t0;
    for j in 0..8u32 {
        flow.handle_data(packet(j), PEER, t);
        t += Duration::from_micros(100);
    }
    for chunk in 1..125u32 {
        for j in (0..8).rev() {
            let seq = chunk * 8 + j;
            flow.handle_data(packet(seq), PEER, t);
            t += Duration::from_micros(100);
        }
        t += Duration::from_millis(1);
    }

    // No NACK ever becomes due: every gap was filled before its timer.
    let nacks = flow.poll_nacks(t + Duration::from_secs(1));
    assert!(nacks.is_empty());

    let delivered = flow.release(t + Duration::from_secs(5));
    assert_eq!(delivered.len(), 1000);
    for (i, p) in delivered.iter().enumerate() {
        assert_eq!(p.seq, Seq::new(i as u32));
    }

    let counters = flow.counters();
    assert_eq!(counters.recovered, 0);
    assert_eq!(counters.lost, 0);
    assert!(counters.reordered > 0);
}

#[test]
fn duplicate_arrivals_deliver_once() {
    let t0 = Instant::now();
    let mut flow = make_flow(t0);

    for i in 0..10u32 {
        flow.handle_data(packet(i), PEER, t0);
        // Redundant path duplicates everything.
        let dup = flow.handle_data(packet(i), PeerId(2), t0 + Duration::from_millis(1));
        assert!(dup.duplicate);
    }

    let delivered = flow.release(t0 + Duration::from_secs(1));
    assert_eq!(delivered.len(), 10);
    assert_eq!(flow.counters().received, 10);
    assert_eq!(flow.counters().duplicates, 10);
}

#[test]
fn retransmit_before_deadline_is_delivered() {
    let t0 = Instant::now();
    let mut flow = make_flow(t0);
    let mut queue = make_queue();

    for i in 0..10u32 {
        let p = packet(i);
        queue.store(Seq::new(i), p.to_bytes().freeze(), t0);
        if i != 5 {
            flow.handle_data(p, PEER, t0);
        }
    }

    let nacks = flow.poll_nacks(t0 + RTT_MIN + Duration::from_millis(1));
    assert_eq!(nacks.len(), 1);

    // Retransmit lands just before the release deadline of the gap.
    let retx_time = t0 + RECOVERY - Duration::from_millis(5);
    for p in service_nack(&mut queue, &nacks[0].1, retx_time) {
        flow.handle_data(p, PEER, retx_time);
    }

    let delivered = flow.release(t0 + Duration::from_secs(2));
    let seqs: Vec<u32> = delivered.iter().map(|p| p.seq.as_raw()).collect();
    assert_eq!(seqs, (0..10).collect::<Vec<u32>>());
    assert_eq!(flow.counters().lost, 0);
}

#[test]
fn duplicate_nacks_within_rtt_are_suppressed() {
    let t0 = Instant::now();
    let mut queue = make_queue();

    let p = packet(7);
    queue.store(Seq::new(7), p.to_bytes().freeze(), t0);

    let t1 = t0 + Duration::from_millis(20);
    assert!(matches!(
        queue.request(Seq::new(7), t1, RTT_MIN),
        RetransmitOutcome::Send(_)
    ));
    // A second NACK for the same sequence inside one RTT is a duplicate.
    assert_eq!(
        queue.request(Seq::new(7), t1 + Duration::from_millis(2), RTT_MIN),
        RetransmitOutcome::Suppressed
    );
    assert_eq!(queue.counters().suppressed, 1);
}
