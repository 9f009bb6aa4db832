//! Wire formats for the edge datagram plane.
//!
//! This crate defines the framed datagram protocol spoken over a QUIC
//! connection between an edge point of presence and the local agent:
//! the four datagram kinds with their bit-exact layouts, the 128-bit
//! flow identifier, and the IP+ICMP packet codec used by the ICMP path.
//!
//! Nothing in here performs I/O; the runtime lives in the `edgegram`
//! crate.

pub mod datagram;
pub mod icmp;

mod rid;

pub use datagram::{
    DatagramType, IcmpDatagram, MarshalError, RegistrationResponse, ResponseCode,
    SessionPayload, SessionRegistration, UnmarshalError, WireError, MAX_DATAGRAM_LEN,
    MAX_SESSION_PAYLOAD_LEN, SESSION_PAYLOAD_HEADER_LEN,
};
pub use icmp::{IcmpDecoder, IcmpEncoder, IcmpMessage, IcmpPacket, PacketError};
pub use rid::RequestId;
