//! Property-based tests for RIST packet serialization
//!
//! Random valid packets must round-trip byte-identically, and arbitrary
//! input bytes must never panic the decoder.

use bytes::Bytes;
use proptest::prelude::*;
use rist_protocol::packet::{MAX_CNAME, SALT_SIZE};
use rist_protocol::{
    DataPacket, KeepAlivePacket, NackBitmaskPacket, NackRangeEntry, NackRangePacket, OobPacket,
    Packet, PacketMeta, ReceiverReport, ReceiverReportPacket, Seq,
};

fn meta_strategy() -> impl Strategy<Value = PacketMeta> {
    (
        any::<u16>(),
        any::<u16>(),
        any::<u32>(),
        any::<bool>(),
        proptest::option::of(any::<[u8; SALT_SIZE]>()),
    )
        .prop_map(
            |(virt_src_port, virt_dst_port, flow_id, compressed, salt)| PacketMeta {
                virt_src_port,
                virt_dst_port,
                flow_id,
                compressed,
                salt,
            },
        )
}

fn payload_strategy() -> impl Strategy<Value = Bytes> {
    proptest::collection::vec(any::<u8>(), 0..1316).prop_map(Bytes::from)
}

fn data_strategy() -> impl Strategy<Value = Packet> {
    (meta_strategy(), any::<u32>(), any::<u64>(), payload_strategy()).prop_map(
        |(meta, seq, ntp, payload)| Packet::Data(DataPacket::new(meta, Seq::new(seq), ntp, payload)),
    )
}

fn nack_range_strategy() -> impl Strategy<Value = Packet> {
    (
        meta_strategy(),
        proptest::collection::vec((any::<u16>(), any::<u16>()), 0..64),
    )
        .prop_map(|(meta, raw)| {
            Packet::NackRange(NackRangePacket {
                meta,
                entries: raw
                    .into_iter()
                    .map(|(base, count)| NackRangeEntry { base, count })
                    .collect(),
            })
        })
}

fn nack_bitmask_strategy() -> impl Strategy<Value = Packet> {
    (meta_strategy(), any::<u32>(), any::<u128>()).prop_map(|(meta, base, mask)| {
        Packet::NackBitmask(NackBitmaskPacket {
            meta,
            base: Seq::new(base),
            mask,
        })
    })
}

fn receiver_report_strategy() -> impl Strategy<Value = Packet> {
    (
        meta_strategy(),
        any::<u32>(),
        any::<u32>(),
        any::<u32>(),
        any::<u32>(),
        any::<u32>(),
    )
        .prop_map(|(meta, received, lost, jitter, lsr, dlsr)| {
            Packet::ReceiverReport(ReceiverReportPacket {
                meta,
                report: ReceiverReport {
                    received,
                    lost,
                    jitter,
                    lsr,
                    dlsr,
                },
            })
        })
}

fn keepalive_strategy() -> impl Strategy<Value = Packet> {
    (meta_strategy(), any::<u32>(), "[a-zA-Z0-9._-]{0,128}").prop_map(
        |(meta, capabilities, cname)| {
            Packet::KeepAlive(KeepAlivePacket {
                meta,
                capabilities,
                cname,
            })
        },
    )
}

fn oob_strategy() -> impl Strategy<Value = Packet> {
    (meta_strategy(), any::<u64>(), payload_strategy()).prop_map(|(meta, ntp, payload)| {
        Packet::Oob(OobPacket { meta, ntp, payload })
    })
}

fn packet_strategy() -> impl Strategy<Value = Packet> {
    prop_oneof![
        data_strategy(),
        nack_range_strategy(),
        nack_bitmask_strategy(),
        receiver_report_strategy(),
        keepalive_strategy(),
        oob_strategy(),
    ]
}

proptest! {
    #[test]
    fn roundtrip_preserves_all_fields(packet in packet_strategy()) {
        let wire = packet.to_bytes().unwrap();
        let decoded = Packet::from_bytes(&wire).unwrap();
        prop_assert_eq!(decoded, packet);
    }

    #[test]
    fn reencoding_is_byte_identical(packet in packet_strategy()) {
        let wire = packet.to_bytes().unwrap();
        let decoded = Packet::from_bytes(&wire).unwrap();
        prop_assert_eq!(decoded.to_bytes().unwrap(), wire);
    }

    #[test]
    fn decoder_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let _ = Packet::from_bytes(&bytes);
    }

    #[test]
    fn rtp_decoder_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let _ = DataPacket::from_rtp_bytes(&bytes, Seq::new(0));
    }

    #[test]
    fn cname_length_cap_enforced(len in (MAX_CNAME + 1)..300usize) {
        let packet = KeepAlivePacket {
            meta: PacketMeta::new(1),
            capabilities: 0,
            cname: "x".repeat(len),
        };
        prop_assert!(packet.to_bytes().is_err());
    }

    #[test]
    fn sequence_distance_antisymmetric(a in any::<u32>(), b in any::<u32>()) {
        let (sa, sb) = (Seq::new(a), Seq::new(b));
        prop_assert_eq!(sa.distance_to(sb), sb.distance_to(sa).wrapping_neg());
    }

    #[test]
    fn rtp_extension_recovers_nearby_sequences(raw in any::<u32>(), delta in -20_000i32..20_000) {
        let seq = Seq::new(raw);
        let reference = Seq::new(raw.wrapping_add_signed(delta));
        prop_assert_eq!(Seq::extend_from_rtp(seq.as_rtp(), reference), seq);
    }
}
