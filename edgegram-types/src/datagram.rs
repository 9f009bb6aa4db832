//! Framed datagram codec.
//!
//! Every datagram exchanged over the QUIC connection starts with a one
//! byte type tag. All integers are big-endian. The layouts here must
//! stay bit-for-bit compatible with the edge; see the individual types
//! for their framing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

use crate::rid::{RequestId, REQUEST_ID_LEN};

/// Upper bound on a session-bearing datagram, chosen to fit the typical
/// QUIC datagram MTU without further fragmentation.
pub const MAX_DATAGRAM_LEN: usize = 1280;

/// Length of the payload datagram header: type tag plus flow id.
pub const SESSION_PAYLOAD_HEADER_LEN: usize = 1 + REQUEST_ID_LEN;

/// Largest UDP payload that still frames into a payload datagram.
pub const MAX_SESSION_PAYLOAD_LEN: usize = MAX_DATAGRAM_LEN - SESSION_PAYLOAD_HEADER_LEN;

const REGISTRATION_HEADER_V4_LEN: usize = 26;
const REGISTRATION_HEADER_V6_LEN: usize = 38;

const RESPONSE_FIXED_LEN: usize = 1 + 1 + REQUEST_ID_LEN + 2;

const FLAG_V6: u8 = 0b0000_0001;
const FLAG_TRACED: u8 = 0b0000_0010;
const FLAG_BUNDLED: u8 = 0b0000_0100;

/// Codec failure kinds shared by every datagram type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("invalid datagram type")]
    InvalidDatagramType,
    #[error("datagram header too small")]
    HeaderTooSmall,
    #[error("datagram payload exceeds max size")]
    PayloadTooLarge,
    #[error("payload header destination too small")]
    PayloadHeaderTooSmall,
    #[error("payload datagram size outside of limits")]
    PayloadInvalidSize,
    #[error("response message length does not match buffer")]
    ResponseMsgInvalidSize,
    #[error("response datagram too small")]
    ResponseInvalidSize,
    #[error("response message exceeds max encodable length")]
    ResponseMsgTooLargeMax,
    #[error("response message does not fit in datagram")]
    ResponseMsgTooLargeDatagram,
    #[error("icmp payload exceeds max size")]
    IcmpPayloadTooLarge,
    #[error("icmp payload missing")]
    IcmpPayloadMissing,
}

/// A [`WireError`] raised while encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("marshal datagram: {0}")]
pub struct MarshalError(pub WireError);

/// A [`WireError`] raised while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unmarshal datagram: {0}")]
pub struct UnmarshalError(pub WireError);

/// The one-byte tag in front of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DatagramType {
    Registration = 0x00,
    Payload = 0x01,
    Icmp = 0x02,
    RegistrationResponse = 0x03,
}

impl DatagramType {
    pub fn from_byte(byte: u8) -> Result<Self, UnmarshalError> {
        match byte {
            0x00 => Ok(Self::Registration),
            0x01 => Ok(Self::Payload),
            0x02 => Ok(Self::Icmp),
            0x03 => Ok(Self::RegistrationResponse),
            _ => Err(UnmarshalError(WireError::InvalidDatagramType)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Session registration datagram (type `0x00`).
///
/// Opens a new UDP flow toward `dest`. The header is 26 bytes for an
/// IPv4 destination and 38 bytes for IPv6; an optional UDP payload may
/// be bundled after it so the first packet does not cost a round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRegistration {
    pub id: RequestId,
    pub dest: SocketAddr,
    pub traced: bool,
    /// Idle timeout advertised by the edge. Carried on the wire as whole
    /// seconds in a u16: sub-second precision is discarded and values of
    /// 2^16 seconds or more wrap. Zero means "use the default".
    pub idle_hint: Duration,
    pub payload: Vec<u8>,
}

impl SessionRegistration {
    fn header_len(&self) -> usize {
        if self.dest.is_ipv6() {
            REGISTRATION_HEADER_V6_LEN
        } else {
            REGISTRATION_HEADER_V4_LEN
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, MarshalError> {
        let header_len = self.header_len();
        if header_len + self.payload.len() > MAX_DATAGRAM_LEN {
            return Err(MarshalError(WireError::PayloadTooLarge));
        }

        let mut flags = 0u8;
        if self.dest.is_ipv6() {
            flags |= FLAG_V6;
        }
        if self.traced {
            flags |= FLAG_TRACED;
        }
        if !self.payload.is_empty() {
            flags |= FLAG_BUNDLED;
        }

        let mut buf = Vec::with_capacity(header_len + self.payload.len());
        buf.push(DatagramType::Registration.as_byte());
        buf.push(flags);
        buf.extend_from_slice(&self.dest.port().to_be_bytes());
        buf.extend_from_slice(&(self.idle_hint.as_secs() as u16).to_be_bytes());
        buf.extend_from_slice(&self.id.to_bytes());
        match self.dest.ip() {
            IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
        }
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn from_slice(buf: &[u8]) -> Result<Self, UnmarshalError> {
        if buf.len() < 2 {
            return Err(UnmarshalError(WireError::HeaderTooSmall));
        }
        if buf[0] != DatagramType::Registration.as_byte() {
            return Err(UnmarshalError(WireError::InvalidDatagramType));
        }

        let flags = buf[1];
        let header_len = if flags & FLAG_V6 != 0 {
            REGISTRATION_HEADER_V6_LEN
        } else {
            REGISTRATION_HEADER_V4_LEN
        };
        if buf.len() < header_len {
            return Err(UnmarshalError(WireError::HeaderTooSmall));
        }

        let port = u16::from_be_bytes([buf[2], buf[3]]);
        let idle_secs = u16::from_be_bytes([buf[4], buf[5]]);
        let id = RequestId::from_slice(&buf[6..22]).map_err(UnmarshalError)?;
        let ip = if flags & FLAG_V6 != 0 {
            let octets: [u8; 16] = buf[22..38]
                .try_into()
                .map_err(|_| UnmarshalError(WireError::HeaderTooSmall))?;
            IpAddr::V6(Ipv6Addr::from(octets))
        } else {
            IpAddr::V4(Ipv4Addr::new(buf[22], buf[23], buf[24], buf[25]))
        };

        // A bundled payload is present only when the flag says so and
        // bytes actually remain after the header.
        let payload = if flags & FLAG_BUNDLED != 0 && buf.len() > header_len {
            buf[header_len..].to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            id,
            dest: SocketAddr::new(ip, port),
            traced: flags & FLAG_TRACED != 0,
            idle_hint: Duration::from_secs(u64::from(idle_secs)),
            payload,
        })
    }
}

/// Session payload datagram (type `0x01`), decoded as a borrowed view.
///
/// A 17-byte header followed by the opaque UDP payload. Senders that
/// read origin data into a reused buffer should lay the header down once
/// with [`SessionPayload::write_header`] and refill only the bytes after
/// it; the decode side borrows from the input and never copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPayload<'a> {
    pub id: RequestId,
    pub payload: &'a [u8],
}

impl<'a> SessionPayload<'a> {
    /// Writes the 17-byte payload header into `dst[0..17]`, leaving the
    /// rest of `dst` untouched.
    pub fn write_header(id: RequestId, dst: &mut [u8]) -> Result<(), MarshalError> {
        if dst.len() < SESSION_PAYLOAD_HEADER_LEN {
            return Err(MarshalError(WireError::PayloadHeaderTooSmall));
        }
        dst[0] = DatagramType::Payload.as_byte();
        id.write_to(&mut dst[1..SESSION_PAYLOAD_HEADER_LEN])
            .map_err(MarshalError)?;
        Ok(())
    }

    /// Frames a standalone payload datagram. Prefer [`write_header`]
    /// plus a reused buffer on hot paths.
    ///
    /// [`write_header`]: SessionPayload::write_header
    pub fn encode(id: RequestId, payload: &[u8]) -> Result<Vec<u8>, MarshalError> {
        if payload.len() > MAX_SESSION_PAYLOAD_LEN {
            return Err(MarshalError(WireError::PayloadInvalidSize));
        }
        let mut buf = vec![0u8; SESSION_PAYLOAD_HEADER_LEN + payload.len()];
        Self::write_header(id, &mut buf)?;
        buf[SESSION_PAYLOAD_HEADER_LEN..].copy_from_slice(payload);
        Ok(buf)
    }

    pub fn from_slice(buf: &'a [u8]) -> Result<Self, UnmarshalError> {
        if buf.len() < SESSION_PAYLOAD_HEADER_LEN || buf.len() > MAX_DATAGRAM_LEN {
            return Err(UnmarshalError(WireError::PayloadInvalidSize));
        }
        if buf[0] != DatagramType::Payload.as_byte() {
            return Err(UnmarshalError(WireError::InvalidDatagramType));
        }
        let id = RequestId::from_slice(&buf[1..SESSION_PAYLOAD_HEADER_LEN]).map_err(UnmarshalError)?;
        Ok(Self {
            id,
            payload: &buf[SESSION_PAYLOAD_HEADER_LEN..],
        })
    }
}

/// ICMP datagram (type `0x02`): the tag byte followed by a raw IP+ICMP
/// packet of 1..=1280 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpDatagram {
    pub packet: Vec<u8>,
}

impl IcmpDatagram {
    /// Frames a raw IP+ICMP packet without copying it into an owned
    /// datagram first.
    pub fn frame(packet: &[u8]) -> Result<Vec<u8>, MarshalError> {
        if packet.is_empty() {
            return Err(MarshalError(WireError::IcmpPayloadMissing));
        }
        if packet.len() > MAX_DATAGRAM_LEN {
            return Err(MarshalError(WireError::IcmpPayloadTooLarge));
        }
        let mut buf = Vec::with_capacity(1 + packet.len());
        buf.push(DatagramType::Icmp.as_byte());
        buf.extend_from_slice(packet);
        Ok(buf)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, MarshalError> {
        Self::frame(&self.packet)
    }

    pub fn from_slice(buf: &[u8]) -> Result<Self, UnmarshalError> {
        if buf.len() <= 1 {
            return Err(UnmarshalError(WireError::IcmpPayloadMissing));
        }
        if buf[0] != DatagramType::Icmp.as_byte() {
            return Err(UnmarshalError(WireError::InvalidDatagramType));
        }
        if buf.len() - 1 > MAX_DATAGRAM_LEN {
            return Err(UnmarshalError(WireError::IcmpPayloadTooLarge));
        }
        Ok(Self {
            packet: buf[1..].to_vec(),
        })
    }
}

/// Registration outcome reported back to the edge.
///
/// Unknown codes round-trip unchanged so that newer peers can extend
/// the set without being misread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    DestinationUnreachable,
    UnableToBindSocket,
    TooManyActiveFlows,
    ErrorWithMsg,
    Other(u8),
}

impl ResponseCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Ok,
            0x01 => Self::DestinationUnreachable,
            0x02 => Self::UnableToBindSocket,
            0x03 => Self::TooManyActiveFlows,
            0xff => Self::ErrorWithMsg,
            other => Self::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::DestinationUnreachable => 0x01,
            Self::UnableToBindSocket => 0x02,
            Self::TooManyActiveFlows => 0x03,
            Self::ErrorWithMsg => 0xff,
            Self::Other(other) => other,
        }
    }
}

/// Registration response datagram (type `0x03`).
///
/// Layout: `type || code || id || msg_len(u16) || msg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResponse {
    pub id: RequestId,
    pub code: ResponseCode,
    pub msg: String,
}

impl RegistrationResponse {
    pub fn new(id: RequestId, code: ResponseCode) -> Self {
        Self {
            id,
            code,
            msg: String::new(),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, MarshalError> {
        if self.msg.len() > usize::from(u16::MAX) {
            return Err(MarshalError(WireError::ResponseMsgTooLargeMax));
        }
        if RESPONSE_FIXED_LEN + self.msg.len() > MAX_DATAGRAM_LEN {
            return Err(MarshalError(WireError::ResponseMsgTooLargeDatagram));
        }

        let mut buf = Vec::with_capacity(RESPONSE_FIXED_LEN + self.msg.len());
        buf.push(DatagramType::RegistrationResponse.as_byte());
        buf.push(self.code.as_byte());
        buf.extend_from_slice(&self.id.to_bytes());
        buf.extend_from_slice(&(self.msg.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.msg.as_bytes());
        Ok(buf)
    }

    pub fn from_slice(buf: &[u8]) -> Result<Self, UnmarshalError> {
        if buf.len() < RESPONSE_FIXED_LEN {
            return Err(UnmarshalError(WireError::ResponseInvalidSize));
        }
        if buf[0] != DatagramType::RegistrationResponse.as_byte() {
            return Err(UnmarshalError(WireError::InvalidDatagramType));
        }
        let code = ResponseCode::from_byte(buf[1]);
        let id = RequestId::from_slice(&buf[2..18]).map_err(UnmarshalError)?;
        let msg_len = usize::from(u16::from_be_bytes([buf[18], buf[19]]));
        if msg_len > buf.len() - RESPONSE_FIXED_LEN {
            return Err(UnmarshalError(WireError::ResponseMsgInvalidSize));
        }
        let msg = String::from_utf8_lossy(&buf[RESPONSE_FIXED_LEN..RESPONSE_FIXED_LEN + msg_len])
            .into_owned();
        Ok(Self { id, code, msg })
    }
}
