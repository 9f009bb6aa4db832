//! Datagram data plane of an edge-tunneling agent.
//!
//! The crate terminates the datagram side of a QUIC connection coming
//! from an edge point of presence and multiplexes many concurrent
//! origin-bound flows over it:
//!
//! - [`mux::Muxer`] reads the connection and routes datagrams by type;
//! - [`session`] holds the per-flow registry and the bidirectional UDP
//!   pumps, including cross-connection migration;
//! - [`icmp`] forwards raw ICMP packets and answers for expired TTLs;
//! - [`dns`] rewrites dials to the virtual DNS address so the host's
//!   own recursive resolver is honoured.
//!
//! QUIC itself, tunnel orchestration and metrics exposition stay
//! outside; they reach the data plane through the traits in [`conn`],
//! [`origin`] and [`metrics`].

pub mod conn;
pub mod dns;
pub mod icmp;
pub mod metrics;
pub mod mux;
pub mod origin;
pub mod pool;
pub mod session;

#[cfg(feature = "quinn")]
pub mod quic;

pub use edgegram_types as types;
