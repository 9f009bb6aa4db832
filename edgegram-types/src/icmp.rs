//! IP+ICMP packet codec.
//!
//! The ICMP datagram kind carries a full IP packet (v4 or v6) whose
//! payload is an ICMP message. This module models that packet, provides
//! the reusable encoder/decoder pair the runtime pools, and synthesizes
//! the Time Exceeded replies emitted when a packet's TTL runs out before
//! it reaches an origin.
//!
//! Encoders and decoders own internal scratch buffers and hand out
//! slices that alias them, so neither is safe to share between two
//! concurrent encode/decode calls. The runtime keeps them in pools and
//! releases them only once the produced bytes have been consumed.

use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

use crate::datagram::MAX_DATAGRAM_LEN;

pub const PROTO_ICMPV4: u8 = 1;
pub const PROTO_ICMPV6: u8 = 58;

pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV4_TIME_EXCEEDED: u8 = 11;
pub const ICMPV6_TIME_EXCEEDED: u8 = 3;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const ICMP_HEADER_LEN: usize = 8;

// Minimum MTUs every conformant host must accept; Time Exceeded replies
// are clipped so they never need fragmentation.
const MIN_MTU_V4: usize = 576;
const MIN_MTU_V6: usize = 1280;

const SYNTHESIZED_TTL: u8 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("truncated ip header")]
    TruncatedIpHeader,
    #[error("truncated icmp message")]
    TruncatedIcmpMessage,
    #[error("unsupported ip version {0}")]
    UnsupportedIpVersion(u8),
    #[error("ip protocol {0} is not icmp")]
    NotIcmp(u8),
    #[error("source and destination address families differ")]
    AddressFamilyMismatch,
    #[error("encoded packet exceeds max datagram size")]
    PacketTooLarge,
}

/// An ICMP message: type, code, and everything after the checksum
/// (including the four message-specific header bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpMessage {
    pub typ: u8,
    pub code: u8,
    pub body: Vec<u8>,
}

impl IcmpMessage {
    /// Echo identifier, when this is an echo request or reply.
    pub fn echo_id(&self) -> Option<u16> {
        match self.typ {
            ICMPV4_ECHO_REQUEST | ICMPV4_ECHO_REPLY | ICMPV6_ECHO_REQUEST | ICMPV6_ECHO_REPLY => {
                if self.body.len() >= 2 {
                    Some(u16::from_be_bytes([self.body[0], self.body[1]]))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// A parsed IP+ICMP packet. The address family is inferred from the
/// source and destination addresses, which must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub ttl: u8,
    pub message: IcmpMessage,
}

impl IcmpPacket {
    pub fn is_ipv6(&self) -> bool {
        self.src.is_ipv6()
    }
}

fn sum_bytes(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += u32::from(last) << 8;
    }
    sum
}

fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Serializes [`IcmpPacket`]s into wire bytes.
///
/// The slice returned by [`encode`] aliases the encoder's internal
/// buffer and is invalidated by the next call.
///
/// [`encode`]: IcmpEncoder::encode
#[derive(Debug, Default)]
pub struct IcmpEncoder {
    buf: Vec<u8>,
}

impl IcmpEncoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MAX_DATAGRAM_LEN),
        }
    }

    pub fn encode(&mut self, pkt: &IcmpPacket) -> Result<&[u8], PacketError> {
        self.buf.clear();
        match (pkt.src, pkt.dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => self.encode_v4(src, dst, pkt),
            (IpAddr::V6(src), IpAddr::V6(dst)) => self.encode_v6(src, dst, pkt),
            _ => return Err(PacketError::AddressFamilyMismatch),
        }
        if self.buf.len() > MAX_DATAGRAM_LEN {
            return Err(PacketError::PacketTooLarge);
        }
        Ok(&self.buf)
    }

    fn encode_v4(&mut self, src: Ipv4Addr, dst: Ipv4Addr, pkt: &IcmpPacket) {
        let icmp_len = 4 + pkt.message.body.len();
        let total_len = IPV4_HEADER_LEN + icmp_len;

        self.buf.push(0x45); // version 4, ihl 5
        self.buf.push(0x00);
        self.buf.extend_from_slice(&(total_len as u16).to_be_bytes());
        self.buf.extend_from_slice(&0u16.to_be_bytes()); // identification
        self.buf.extend_from_slice(&0x4000u16.to_be_bytes()); // DF, offset 0
        self.buf.push(pkt.ttl);
        self.buf.push(pkt.protocol);
        self.buf.extend_from_slice(&0u16.to_be_bytes()); // checksum slot
        self.buf.extend_from_slice(&src.octets());
        self.buf.extend_from_slice(&dst.octets());

        let header_cks = fold_checksum(sum_bytes(0, &self.buf[..IPV4_HEADER_LEN]));
        self.buf[10..12].copy_from_slice(&header_cks.to_be_bytes());

        let icmp_start = self.buf.len();
        self.write_message(&pkt.message);
        // ICMPv4 checksum covers the ICMP bytes only.
        let cks = fold_checksum(sum_bytes(0, &self.buf[icmp_start..]));
        self.buf[icmp_start + 2..icmp_start + 4].copy_from_slice(&cks.to_be_bytes());
    }

    fn encode_v6(&mut self, src: Ipv6Addr, dst: Ipv6Addr, pkt: &IcmpPacket) {
        let icmp_len = 4 + pkt.message.body.len();

        self.buf.push(0x60); // version 6, traffic class / flow label zero
        self.buf.extend_from_slice(&[0x00, 0x00, 0x00]);
        self.buf.extend_from_slice(&(icmp_len as u16).to_be_bytes());
        self.buf.push(pkt.protocol);
        self.buf.push(pkt.ttl); // hop limit
        self.buf.extend_from_slice(&src.octets());
        self.buf.extend_from_slice(&dst.octets());

        let icmp_start = self.buf.len();
        self.write_message(&pkt.message);
        // ICMPv6 checksum covers the pseudo-header built from the IPv6
        // source, destination, length and next-header.
        let mut sum = sum_bytes(0, &src.octets());
        sum = sum_bytes(sum, &dst.octets());
        sum = sum_bytes(sum, &(icmp_len as u32).to_be_bytes());
        sum = sum_bytes(sum, &[0, 0, 0, pkt.protocol]);
        let cks = fold_checksum(sum_bytes(sum, &self.buf[icmp_start..]));
        self.buf[icmp_start + 2..icmp_start + 4].copy_from_slice(&cks.to_be_bytes());
    }

    fn write_message(&mut self, message: &IcmpMessage) {
        self.buf.push(message.typ);
        self.buf.push(message.code);
        self.buf.extend_from_slice(&0u16.to_be_bytes());
        self.buf.extend_from_slice(&message.body);
    }
}

/// Parses wire bytes into [`IcmpPacket`]s.
///
/// The decoder retains the raw packet it last decoded; [`raw`] exposes
/// it for Time Exceeded synthesis without another copy. Like the
/// encoder, a decoder must not be shared between concurrent calls.
///
/// [`raw`]: IcmpDecoder::raw
#[derive(Debug, Default)]
pub struct IcmpDecoder {
    raw: Vec<u8>,
}

impl IcmpDecoder {
    pub fn new() -> Self {
        Self {
            raw: Vec::with_capacity(MAX_DATAGRAM_LEN),
        }
    }

    /// The raw bytes of the most recently decoded packet.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn decode(&mut self, packet: &[u8]) -> Result<IcmpPacket, PacketError> {
        self.raw.clear();
        self.raw.extend_from_slice(packet);

        let first = *self.raw.first().ok_or(PacketError::TruncatedIpHeader)?;
        match first >> 4 {
            4 => Self::decode_v4(&self.raw),
            6 => Self::decode_v6(&self.raw),
            version => Err(PacketError::UnsupportedIpVersion(version)),
        }
    }

    fn decode_v4(buf: &[u8]) -> Result<IcmpPacket, PacketError> {
        let ihl = usize::from(buf[0] & 0x0f) * 4;
        if ihl < IPV4_HEADER_LEN || buf.len() < ihl {
            return Err(PacketError::TruncatedIpHeader);
        }

        let mut cur = Cursor::new(&buf[..ihl]);
        cur.set_position(1);
        let _tos = read_u8(&mut cur)?;
        let _total_len = read_u16(&mut cur)?;
        let _identification = read_u16(&mut cur)?;
        let _flags_fragment = read_u16(&mut cur)?;
        let ttl = read_u8(&mut cur)?;
        let protocol = read_u8(&mut cur)?;
        let _checksum = read_u16(&mut cur)?;
        let src = Ipv4Addr::from(read_u32(&mut cur)?);
        let dst = Ipv4Addr::from(read_u32(&mut cur)?);

        if protocol != PROTO_ICMPV4 {
            return Err(PacketError::NotIcmp(protocol));
        }

        Ok(IcmpPacket {
            src: IpAddr::V4(src),
            dst: IpAddr::V4(dst),
            protocol,
            ttl,
            message: Self::decode_message(&buf[ihl..])?,
        })
    }

    fn decode_v6(buf: &[u8]) -> Result<IcmpPacket, PacketError> {
        if buf.len() < IPV6_HEADER_LEN {
            return Err(PacketError::TruncatedIpHeader);
        }

        let mut cur = Cursor::new(&buf[..IPV6_HEADER_LEN]);
        cur.set_position(4);
        let _payload_len = read_u16(&mut cur)?;
        let next_header = read_u8(&mut cur)?;
        let hop_limit = read_u8(&mut cur)?;
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        cur.read_exact(&mut src)
            .map_err(|_| PacketError::TruncatedIpHeader)?;
        cur.read_exact(&mut dst)
            .map_err(|_| PacketError::TruncatedIpHeader)?;

        if next_header != PROTO_ICMPV6 {
            return Err(PacketError::NotIcmp(next_header));
        }

        Ok(IcmpPacket {
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            protocol: next_header,
            ttl: hop_limit,
            message: Self::decode_message(&buf[IPV6_HEADER_LEN..])?,
        })
    }

    fn decode_message(buf: &[u8]) -> Result<IcmpMessage, PacketError> {
        if buf.len() < 4 {
            return Err(PacketError::TruncatedIcmpMessage);
        }
        Ok(IcmpMessage {
            typ: buf[0],
            code: buf[1],
            body: buf[4..].to_vec(),
        })
    }
}

fn read_u8(cur: &mut Cursor<&[u8]>) -> Result<u8, PacketError> {
    cur.read_u8().map_err(|_| PacketError::TruncatedIpHeader)
}

fn read_u16(cur: &mut Cursor<&[u8]>) -> Result<u16, PacketError> {
    cur.read_u16::<BigEndian>()
        .map_err(|_| PacketError::TruncatedIpHeader)
}

fn read_u32(cur: &mut Cursor<&[u8]>) -> Result<u32, PacketError> {
    cur.read_u32::<BigEndian>()
        .map_err(|_| PacketError::TruncatedIpHeader)
}

/// Builds the Time Exceeded reply for a packet whose TTL ran out.
///
/// The reply carries the leading bytes of the offending packet, clipped
/// so the result fits the minimum MTU of its address family, and is
/// sourced from the router address of that family.
pub fn ttl_exceeded(
    pkt: &IcmpPacket,
    raw: &[u8],
    router_v4: Ipv4Addr,
    router_v6: Ipv6Addr,
) -> IcmpPacket {
    let (src, typ, protocol, max_embedded) = if pkt.is_ipv6() {
        (
            IpAddr::V6(router_v6),
            ICMPV6_TIME_EXCEEDED,
            PROTO_ICMPV6,
            MIN_MTU_V6 - IPV6_HEADER_LEN - ICMP_HEADER_LEN,
        )
    } else {
        (
            IpAddr::V4(router_v4),
            ICMPV4_TIME_EXCEEDED,
            PROTO_ICMPV4,
            MIN_MTU_V4 - IPV4_HEADER_LEN - ICMP_HEADER_LEN,
        )
    };

    let clipped = raw.len().min(max_embedded);
    let mut body = Vec::with_capacity(4 + clipped);
    body.extend_from_slice(&[0u8; 4]);
    body.extend_from_slice(&raw[..clipped]);

    IcmpPacket {
        src,
        dst: pkt.src,
        protocol,
        ttl: SYNTHESIZED_TTL,
        message: IcmpMessage { typ, code: 0, body },
    }
}
