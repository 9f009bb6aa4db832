//! The datagram-connection contract.
//!
//! A datagram connection is a QUIC connection viewed as a bidirectional
//! stream of atomic, bounded byte payloads. Handshake, congestion
//! control and stream multiplexing all live behind this trait; the data
//! plane only sends, receives, and watches the connection's lifetime.

use std::io::Result;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// One QUIC connection, reduced to its datagram surface.
///
/// `send_datagram` and `receive_datagram` are assumed safe for
/// concurrent use by the underlying implementation; the data plane adds
/// no serialization of its own.
#[async_trait]
pub trait DatagramConn: Send + Sync {
    /// Token cancelled when the connection closes. Sessions bind their
    /// lifetime to this, not to the muxer, so an agent shutdown does not
    /// abort in-flight flows while a dying connection does.
    fn context(&self) -> CancellationToken;

    fn send_datagram(&self, data: &[u8]) -> Result<()>;

    async fn receive_datagram(&self) -> Result<Bytes>;
}
