//! RIST Packet Structures and Serialization
//!
//! This module implements the RIST wire format. Main-profile packets carry a
//! 12-byte GRE-style envelope (version, flags, payload type, length, virtual
//! ports, flow id) followed by a type-specific body; data packets add a
//! 12-byte extension with the 32-bit sequence number and 64-bit NTP stamp.
//! Simple-profile data packets are plain RTP over UDP with no envelope.
//!
//! Encode/decode is pure and total: decoding never panics and never yields a
//! partially parsed packet.

use crate::sequence::Seq;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Wire protocol version carried in the envelope's upper nibble
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed envelope in bytes
pub const ENVELOPE_SIZE: usize = 12;

/// Size of the data extension (seq + NTP stamp) in bytes
pub const DATA_EXT_SIZE: usize = 12;

/// Size of an RTP header (simple profile) in bytes
pub const RTP_HEADER_SIZE: usize = 12;

/// Size of the key-derivation salt carried by encrypted packets
pub const SALT_SIZE: usize = 16;

/// Maximum cname length in keep-alive packets (bytes, excluding length prefix)
pub const MAX_CNAME: usize = 128;

/// Recommended media payload size (seven 188-byte MPEG-TS packets)
pub const MAX_PAYLOAD_SIZE: usize = 1316;

/// RTP payload type used for simple-profile data (dynamic range)
pub const RTP_PAYLOAD_TYPE: u8 = 33; // MP2T

const FLAG_ENCRYPTED: u8 = 0b0001;
const FLAG_COMPRESSED: u8 = 0b0010;
const FLAG_RESERVED: u8 = 0b1100;

/// Packet payload types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    /// Sequenced media data
    Data = 0x00,
    /// Negative acknowledgement, range form
    NackRange = 0x01,
    /// Negative acknowledgement, bitmask form
    NackBitmask = 0x02,
    /// Receiver report (RTCP-style reception summary)
    ReceiverReport = 0x03,
    /// Keep-alive with cname and capabilities
    KeepAlive = 0x04,
    /// Out-of-band auxiliary data
    Oob = 0x05,
}

impl PayloadType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(PayloadType::Data),
            0x01 => Some(PayloadType::NackRange),
            0x02 => Some(PayloadType::NackBitmask),
            0x03 => Some(PayloadType::ReceiverReport),
            0x04 => Some(PayloadType::KeepAlive),
            0x05 => Some(PayloadType::Oob),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Hop metadata shared by every envelope packet
///
/// The encrypted flag on the wire is implied by `salt`: packets whose payload
/// was transformed with the peer key carry the 16-byte key-derivation salt
/// immediately after the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketMeta {
    pub virt_src_port: u16,
    pub virt_dst_port: u16,
    pub flow_id: u32,
    /// Payload is LZ4-compressed
    pub compressed: bool,
    /// Key-derivation salt, present iff the payload is encrypted
    pub salt: Option<[u8; SALT_SIZE]>,
}

impl PacketMeta {
    pub fn new(flow_id: u32) -> Self {
        PacketMeta {
            flow_id,
            ..Default::default()
        }
    }

    fn flag_bits(&self) -> u8 {
        let mut bits = 0;
        if self.salt.is_some() {
            bits |= FLAG_ENCRYPTED;
        }
        if self.compressed {
            bits |= FLAG_COMPRESSED;
        }
        bits
    }
}

/// Sequenced media data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub meta: PacketMeta,
    pub seq: Seq,
    /// Capture time, 64-bit NTP short format, preserved end-to-end
    pub ntp: u64,
    pub payload: Bytes,
}

/// One NACK-range entry: `count + 1` consecutive sequences starting at `base`
///
/// Bases travel as 16 bits and are extended against the sender's newest
/// transmitted sequence (`Seq::extend_from_rtp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackRangeEntry {
    pub base: u16,
    pub count: u16,
}

/// Negative acknowledgement, range form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackRangePacket {
    pub meta: PacketMeta,
    pub entries: Vec<NackRangeEntry>,
}

/// Negative acknowledgement, bitmask form
///
/// Requests `base` itself plus every sequence `base + 1 + i` for which bit
/// `i` (MSB first) of the 128-bit mask is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackBitmaskPacket {
    pub meta: PacketMeta,
    pub base: Seq,
    pub mask: u128,
}

/// RTCP-style reception summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiverReport {
    pub received: u32,
    pub lost: u32,
    pub jitter: u32,
    /// Last sender report NTP timestamp (middle 32 bits)
    pub lsr: u32,
    /// Delay since last sender report, 1/65536 s units
    pub dlsr: u32,
}

/// Receiver report packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReportPacket {
    pub meta: PacketMeta,
    pub report: ReceiverReport,
}

/// Keep-alive packet carrying the peer's cname and capability bitmap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlivePacket {
    pub meta: PacketMeta,
    pub capabilities: u32,
    pub cname: String,
}

/// Out-of-band auxiliary data packet (unsequenced, never retransmitted)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OobPacket {
    pub meta: PacketMeta,
    pub ntp: u64,
    pub payload: Bytes,
}

/// Unified envelope packet type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    NackRange(NackRangePacket),
    NackBitmask(NackBitmaskPacket),
    ReceiverReport(ReceiverReportPacket),
    KeepAlive(KeepAlivePacket),
    Oob(OobPacket),
}

/// Packet parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Truncated packet: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Declared length {declared} does not match remaining {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("Reserved flag bits set: {0:#06b}")]
    ReservedFlags(u8),

    #[error("Unknown payload type {0:#04x}")]
    UnknownPayloadType(u8),

    #[error("Cname exceeds {MAX_CNAME} bytes: {0}")]
    CnameTooLong(usize),

    #[error("Cname is not valid UTF-8")]
    CnameNotUtf8,

    #[error("Not an RTP packet (version bits {0})")]
    BadRtpVersion(u8),
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), PacketError> {
    if buf.len() < expected {
        return Err(PacketError::Truncated {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn put_envelope(buf: &mut BytesMut, meta: &PacketMeta, payload_type: PayloadType, body_len: usize) {
    buf.put_u8((PROTOCOL_VERSION << 4) | meta.flag_bits());
    buf.put_u8(payload_type.as_u8());
    buf.put_u16(body_len as u16);
    buf.put_u16(meta.virt_src_port);
    buf.put_u16(meta.virt_dst_port);
    buf.put_u32(meta.flow_id);
    if let Some(salt) = &meta.salt {
        buf.put_slice(salt);
    }
}

fn salt_len(meta: &PacketMeta) -> usize {
    if meta.salt.is_some() {
        SALT_SIZE
    } else {
        0
    }
}

impl DataPacket {
    pub fn new(meta: PacketMeta, seq: Seq, ntp: u64, payload: Bytes) -> Self {
        DataPacket {
            meta,
            seq,
            ntp,
            payload,
        }
    }

    pub fn size(&self) -> usize {
        ENVELOPE_SIZE + salt_len(&self.meta) + DATA_EXT_SIZE + self.payload.len()
    }

    /// Serialize as a main-profile envelope packet
    pub fn to_bytes(&self) -> BytesMut {
        let body_len = salt_len(&self.meta) + DATA_EXT_SIZE + self.payload.len();
        let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + body_len);
        put_envelope(&mut buf, &self.meta, PayloadType::Data, body_len);
        buf.put_u32(self.seq.as_raw());
        buf.put_u64(self.ntp);
        buf.put_slice(&self.payload);
        buf
    }

    /// Serialize as a simple-profile RTP packet (no envelope)
    ///
    /// The RTP timestamp is the middle 32 bits of the NTP stamp; the 16-bit
    /// RTP sequence is the low half of the flow sequence.
    pub fn to_rtp_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        buf.put_u8(0x80); // V=2, P=0, X=0, CC=0
        buf.put_u8(RTP_PAYLOAD_TYPE & 0x7F); // M=0
        buf.put_u16(self.seq.as_rtp());
        buf.put_u32(ntp_to_rtp_ts(self.ntp));
        buf.put_u32(self.meta.flow_id);
        buf.put_slice(&self.payload);
        buf
    }

    /// Parse a simple-profile RTP packet
    ///
    /// `reference` is the receiver's highest seen sequence for the flow, used
    /// to extend the 16-bit RTP sequence to the 32-bit space.
    pub fn from_rtp_bytes(bytes: &[u8], reference: Seq) -> Result<Self, PacketError> {
        check_len(bytes, RTP_HEADER_SIZE)?;
        let version = bytes[0] >> 6;
        if version != 2 {
            return Err(PacketError::BadRtpVersion(version));
        }

        let mut buf = &bytes[2..RTP_HEADER_SIZE];
        let seq16 = buf.get_u16();
        let ts = buf.get_u32();
        let ssrc = buf.get_u32();

        Ok(DataPacket {
            meta: PacketMeta::new(ssrc),
            seq: Seq::extend_from_rtp(seq16, reference),
            ntp: rtp_ts_to_ntp(ts),
            payload: Bytes::copy_from_slice(&bytes[RTP_HEADER_SIZE..]),
        })
    }
}

/// Derive the RTP-style 32-bit timestamp (NTP middle bits) from a 64-bit stamp
#[inline]
pub fn ntp_to_rtp_ts(ntp: u64) -> u32 {
    (ntp >> 16) as u32
}

/// Reconstruct an approximate 64-bit NTP stamp from an RTP timestamp
#[inline]
pub fn rtp_ts_to_ntp(ts: u32) -> u64 {
    (ts as u64) << 16
}

impl NackRangePacket {
    pub fn to_bytes(&self) -> BytesMut {
        let body_len = salt_len(&self.meta) + self.entries.len() * 4;
        let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + body_len);
        put_envelope(&mut buf, &self.meta, PayloadType::NackRange, body_len);
        for entry in &self.entries {
            buf.put_u16(entry.base);
            buf.put_u16(entry.count);
        }
        buf
    }

    fn parse_body(meta: PacketMeta, mut body: &[u8]) -> Result<Self, PacketError> {
        if body.len() % 4 != 0 {
            return Err(PacketError::LengthMismatch {
                declared: body.len(),
                actual: body.len() / 4 * 4,
            });
        }
        let mut entries = Vec::with_capacity(body.len() / 4);
        while body.remaining() >= 4 {
            entries.push(NackRangeEntry {
                base: body.get_u16(),
                count: body.get_u16(),
            });
        }
        Ok(NackRangePacket { meta, entries })
    }
}

impl NackBitmaskPacket {
    pub fn to_bytes(&self) -> BytesMut {
        let body_len = salt_len(&self.meta) + 20;
        let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + body_len);
        put_envelope(&mut buf, &self.meta, PayloadType::NackBitmask, body_len);
        buf.put_u32(self.base.as_raw());
        buf.put_u128(self.mask);
        buf
    }

    fn parse_body(meta: PacketMeta, mut body: &[u8]) -> Result<Self, PacketError> {
        check_len(body, 20)?;
        if body.len() != 20 {
            return Err(PacketError::LengthMismatch {
                declared: body.len(),
                actual: 20,
            });
        }
        Ok(NackBitmaskPacket {
            meta,
            base: Seq::new(body.get_u32()),
            mask: body.get_u128(),
        })
    }

    /// Iterate the requested sequence numbers
    pub fn sequences(&self) -> impl Iterator<Item = Seq> + '_ {
        std::iter::once(self.base).chain((0..128u32).filter_map(move |i| {
            if self.mask & (1u128 << (127 - i)) != 0 {
                Some(self.base + 1 + i)
            } else {
                None
            }
        }))
    }
}

impl ReceiverReportPacket {
    pub fn to_bytes(&self) -> BytesMut {
        let body_len = salt_len(&self.meta) + 20;
        let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + body_len);
        put_envelope(&mut buf, &self.meta, PayloadType::ReceiverReport, body_len);
        buf.put_u32(self.report.received);
        buf.put_u32(self.report.lost);
        buf.put_u32(self.report.jitter);
        buf.put_u32(self.report.lsr);
        buf.put_u32(self.report.dlsr);
        buf
    }

    fn parse_body(meta: PacketMeta, mut body: &[u8]) -> Result<Self, PacketError> {
        check_len(body, 20)?;
        if body.len() != 20 {
            return Err(PacketError::LengthMismatch {
                declared: body.len(),
                actual: 20,
            });
        }
        Ok(ReceiverReportPacket {
            meta,
            report: ReceiverReport {
                received: body.get_u32(),
                lost: body.get_u32(),
                jitter: body.get_u32(),
                lsr: body.get_u32(),
                dlsr: body.get_u32(),
            },
        })
    }
}

impl KeepAlivePacket {
    pub fn to_bytes(&self) -> Result<BytesMut, PacketError> {
        let cname = self.cname.as_bytes();
        if cname.len() > MAX_CNAME {
            return Err(PacketError::CnameTooLong(cname.len()));
        }
        let body_len = salt_len(&self.meta) + 5 + cname.len();
        let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + body_len);
        put_envelope(&mut buf, &self.meta, PayloadType::KeepAlive, body_len);
        buf.put_u32(self.capabilities);
        buf.put_u8(cname.len() as u8);
        buf.put_slice(cname);
        Ok(buf)
    }

    fn parse_body(meta: PacketMeta, mut body: &[u8]) -> Result<Self, PacketError> {
        check_len(body, 5)?;
        let capabilities = body.get_u32();
        let cname_len = body.get_u8() as usize;
        if cname_len > MAX_CNAME {
            return Err(PacketError::CnameTooLong(cname_len));
        }
        check_len(body, cname_len)?;
        if body.len() != cname_len {
            return Err(PacketError::LengthMismatch {
                declared: body.len(),
                actual: cname_len,
            });
        }
        let cname = std::str::from_utf8(&body[..cname_len])
            .map_err(|_| PacketError::CnameNotUtf8)?
            .to_string();
        Ok(KeepAlivePacket {
            meta,
            capabilities,
            cname,
        })
    }
}

impl OobPacket {
    pub fn to_bytes(&self) -> BytesMut {
        let body_len = salt_len(&self.meta) + 8 + self.payload.len();
        let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + body_len);
        put_envelope(&mut buf, &self.meta, PayloadType::Oob, body_len);
        buf.put_u64(self.ntp);
        buf.put_slice(&self.payload);
        buf
    }

    fn parse_body(meta: PacketMeta, mut body: &[u8]) -> Result<Self, PacketError> {
        check_len(body, 8)?;
        let ntp = body.get_u64();
        Ok(OobPacket {
            meta,
            ntp,
            payload: Bytes::copy_from_slice(body),
        })
    }
}

impl Packet {
    pub fn meta(&self) -> &PacketMeta {
        match self {
            Packet::Data(p) => &p.meta,
            Packet::NackRange(p) => &p.meta,
            Packet::NackBitmask(p) => &p.meta,
            Packet::ReceiverReport(p) => &p.meta,
            Packet::KeepAlive(p) => &p.meta,
            Packet::Oob(p) => &p.meta,
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        match self {
            Packet::Data(_) => PayloadType::Data,
            Packet::NackRange(_) => PayloadType::NackRange,
            Packet::NackBitmask(_) => PayloadType::NackBitmask,
            Packet::ReceiverReport(_) => PayloadType::ReceiverReport,
            Packet::KeepAlive(_) => PayloadType::KeepAlive,
            Packet::Oob(_) => PayloadType::Oob,
        }
    }

    /// Serialize to the main-profile envelope format
    pub fn to_bytes(&self) -> Result<BytesMut, PacketError> {
        match self {
            Packet::Data(p) => Ok(p.to_bytes()),
            Packet::NackRange(p) => Ok(p.to_bytes()),
            Packet::NackBitmask(p) => Ok(p.to_bytes()),
            Packet::ReceiverReport(p) => Ok(p.to_bytes()),
            Packet::KeepAlive(p) => p.to_bytes(),
            Packet::Oob(p) => Ok(p.to_bytes()),
        }
    }

    /// Parse an envelope packet
    ///
    /// Fails with a `PacketError` (surfaced as `MalformedPacket`) on any
    /// length mismatch, version mismatch, reserved flag, or unknown type.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        check_len(bytes, ENVELOPE_SIZE)?;

        let version = bytes[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(PacketError::BadVersion(version));
        }
        let flags = bytes[0] & 0x0F;
        if flags & FLAG_RESERVED != 0 {
            return Err(PacketError::ReservedFlags(flags));
        }

        let payload_type = PayloadType::from_u8(bytes[1])
            .ok_or(PacketError::UnknownPayloadType(bytes[1]))?;

        let mut head = &bytes[2..ENVELOPE_SIZE];
        let declared = head.get_u16() as usize;
        let virt_src_port = head.get_u16();
        let virt_dst_port = head.get_u16();
        let flow_id = head.get_u32();

        let body = &bytes[ENVELOPE_SIZE..];
        if declared != body.len() {
            return Err(PacketError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }

        let mut meta = PacketMeta {
            virt_src_port,
            virt_dst_port,
            flow_id,
            compressed: flags & FLAG_COMPRESSED != 0,
            salt: None,
        };

        let body = if flags & FLAG_ENCRYPTED != 0 {
            check_len(body, SALT_SIZE)?;
            let mut salt = [0u8; SALT_SIZE];
            salt.copy_from_slice(&body[..SALT_SIZE]);
            meta.salt = Some(salt);
            &body[SALT_SIZE..]
        } else {
            body
        };

        match payload_type {
            PayloadType::Data => {
                check_len(body, DATA_EXT_SIZE)?;
                let mut ext = &body[..DATA_EXT_SIZE];
                let seq = Seq::new(ext.get_u32());
                let ntp = ext.get_u64();
                Ok(Packet::Data(DataPacket {
                    meta,
                    seq,
                    ntp,
                    payload: Bytes::copy_from_slice(&body[DATA_EXT_SIZE..]),
                }))
            }
            PayloadType::NackRange => NackRangePacket::parse_body(meta, body).map(Packet::NackRange),
            PayloadType::NackBitmask => {
                NackBitmaskPacket::parse_body(meta, body).map(Packet::NackBitmask)
            }
            PayloadType::ReceiverReport => {
                ReceiverReportPacket::parse_body(meta, body).map(Packet::ReceiverReport)
            }
            PayloadType::KeepAlive => KeepAlivePacket::parse_body(meta, body).map(Packet::KeepAlive),
            PayloadType::Oob => OobPacket::parse_body(meta, body).map(Packet::Oob),
        }
    }
}

/// First-byte classification of an inbound datagram
///
/// Envelope packets start with version nibble 1 (byte 0x10..=0x1F); RTP data
/// has the version 2 bits on top (byte ≥ 0x80). The receiver uses this to
/// accept simple-profile RTP data alongside envelope control traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    Envelope,
    Rtp,
    Unknown,
}

pub fn classify(bytes: &[u8]) -> WireKind {
    match bytes.first() {
        Some(b) if b >> 6 == 2 => WireKind::Rtp,
        Some(b) if b >> 4 == PROTOCOL_VERSION => WireKind::Envelope,
        _ => WireKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> PacketMeta {
        PacketMeta {
            virt_src_port: 1968,
            virt_dst_port: 1968,
            flow_id: 0xABCD_1234,
            compressed: false,
            salt: None,
        }
    }

    #[test]
    fn test_data_roundtrip() {
        let packet = DataPacket::new(
            meta(),
            Seq::new(77_000),
            0x0102_0304_0506_0708,
            Bytes::from_static(b"seven ts packets worth of media"),
        );
        let bytes = packet.to_bytes();
        let decoded = Packet::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, Packet::Data(packet));
    }

    #[test]
    fn test_data_roundtrip_encrypted_compressed() {
        let mut m = meta();
        m.compressed = true;
        m.salt = Some([7u8; SALT_SIZE]);

        let packet = DataPacket::new(m, Seq::new(1), 42, Bytes::from_static(b"ciphertext"));
        let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();

        match decoded {
            Packet::Data(d) => {
                assert!(d.meta.compressed);
                assert_eq!(d.meta.salt, Some([7u8; SALT_SIZE]));
                assert_eq!(d.payload, Bytes::from_static(b"ciphertext"));
            }
            other => panic!("expected data packet, got {:?}", other),
        }
    }

    #[test]
    fn test_rtp_roundtrip() {
        let packet = DataPacket::new(
            PacketMeta::new(0xABCD_1234),
            Seq::new(0x0001_0042),
            0x0102_0304_0506_0708,
            Bytes::from_static(b"rtp payload"),
        );
        let bytes = packet.to_rtp_bytes();
        let decoded = DataPacket::from_rtp_bytes(&bytes, Seq::new(0x0001_0040)).unwrap();

        assert_eq!(decoded.seq, packet.seq);
        assert_eq!(decoded.meta.flow_id, packet.meta.flow_id);
        assert_eq!(decoded.payload, packet.payload);
        // NTP survives at RTP precision (middle 32 bits)
        assert_eq!(ntp_to_rtp_ts(decoded.ntp), ntp_to_rtp_ts(packet.ntp));
    }

    #[test]
    fn test_nack_range_roundtrip() {
        let packet = NackRangePacket {
            meta: meta(),
            entries: vec![
                NackRangeEntry { base: 42, count: 0 },
                NackRangeEntry {
                    base: 100,
                    count: 99,
                },
            ],
        };
        let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded, Packet::NackRange(packet));
    }

    #[test]
    fn test_nack_bitmask_roundtrip_and_sequences() {
        let packet = NackBitmaskPacket {
            meta: meta(),
            base: Seq::new(1000),
            mask: (1u128 << 127) | (1u128 << 125),
        };
        let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded, Packet::NackBitmask(packet.clone()));

        let seqs: Vec<u32> = packet.sequences().map(|s| s.as_raw()).collect();
        assert_eq!(seqs, vec![1000, 1001, 1003]);
    }

    #[test]
    fn test_receiver_report_roundtrip() {
        let packet = ReceiverReportPacket {
            meta: meta(),
            report: ReceiverReport {
                received: 999,
                lost: 1,
                jitter: 250,
                lsr: 0xAABB_CCDD,
                dlsr: 65_536,
            },
        };
        let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded, Packet::ReceiverReport(packet));
    }

    #[test]
    fn test_keepalive_roundtrip() {
        let packet = KeepAlivePacket {
            meta: meta(),
            capabilities: 0b1011,
            cname: "encoder-01.example".to_string(),
        };
        let decoded = Packet::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, Packet::KeepAlive(packet));
    }

    #[test]
    fn test_keepalive_cname_too_long() {
        let packet = KeepAlivePacket {
            meta: meta(),
            capabilities: 0,
            cname: "x".repeat(MAX_CNAME + 1),
        };
        assert!(matches!(
            packet.to_bytes(),
            Err(PacketError::CnameTooLong(_))
        ));
    }

    #[test]
    fn test_oob_roundtrip() {
        let packet = OobPacket {
            meta: meta(),
            ntp: 12345,
            payload: Bytes::from_static(b"aux"),
        };
        let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded, Packet::Oob(packet));
    }

    #[test]
    fn test_reserved_flags_rejected() {
        let packet = DataPacket::new(meta(), Seq::new(0), 0, Bytes::new());
        let mut bytes = packet.to_bytes();
        bytes[0] |= 0b0100;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(PacketError::ReservedFlags(_))
        ));
    }

    #[test]
    fn test_bad_version_rejected() {
        let packet = DataPacket::new(meta(), Seq::new(0), 0, Bytes::new());
        let mut bytes = packet.to_bytes();
        bytes[0] = (3 << 4) | (bytes[0] & 0x0F);
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(PacketError::BadVersion(3))
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let packet = DataPacket::new(meta(), Seq::new(0), 0, Bytes::from_static(b"abcd"));
        let bytes = packet.to_bytes();
        // Truncate one payload byte without fixing the declared length.
        assert!(matches!(
            Packet::from_bytes(&bytes[..bytes.len() - 1]),
            Err(PacketError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_payload_type_rejected() {
        let packet = DataPacket::new(meta(), Seq::new(0), 0, Bytes::new());
        let mut bytes = packet.to_bytes();
        bytes[1] = 0x7F;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(PacketError::UnknownPayloadType(0x7F))
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(matches!(
            Packet::from_bytes(&[0x10, 0x00, 0x00]),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn test_classify() {
        let data = DataPacket::new(meta(), Seq::new(5), 0, Bytes::new());
        assert_eq!(classify(&data.to_bytes()), WireKind::Envelope);
        assert_eq!(classify(&data.to_rtp_bytes()), WireKind::Rtp);
        assert_eq!(classify(&[0x42]), WireKind::Unknown);
        assert_eq!(classify(&[]), WireKind::Unknown);
    }
}
