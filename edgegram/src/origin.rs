//! Origin-side collaborators: connected UDP sockets, the dialer that
//! opens them, and the flow limiter consulted at admission.

use std::io::{Error, ErrorKind, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error as ThisError;
use tokio::net::UdpSocket;

/// A connected datagram socket toward one origin.
#[async_trait]
pub trait OriginSocket: Send + Sync {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;
    async fn send(&self, buf: &[u8]) -> Result<usize>;
    /// Marks the socket unusable. Dropping the last reference releases
    /// the descriptor; `close` only has to stop further traffic.
    fn close(&self);
    fn local_addr(&self) -> Result<SocketAddr>;
    fn peer_addr(&self) -> Result<SocketAddr>;
}

/// Opens connected UDP sockets toward origins.
#[async_trait]
pub trait UdpOriginDialer: Send + Sync {
    async fn dial_udp(&self, addr: SocketAddr) -> Result<Box<dyn OriginSocket>>;
}

/// [`OriginSocket`] over a connected [`tokio::net::UdpSocket`].
#[derive(Debug)]
pub struct UdpOrigin {
    socket: UdpSocket,
}

impl UdpOrigin {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl OriginSocket for UdpOrigin {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.socket.recv(buf).await
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.socket.send(buf).await
    }

    fn close(&self) {}

    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        self.socket.peer_addr()
    }
}

/// Default dialer: binds an unspecified local address of the matching
/// family and connects to the destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetDialer;

#[async_trait]
impl UdpOriginDialer for NetDialer {
    async fn dial_udp(&self, addr: SocketAddr) -> Result<Box<dyn OriginSocket>> {
        let local: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(Box::new(UdpOrigin::new(socket)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
#[error("too many active flows")]
pub struct FlowLimitError;

/// Admission control for new flows. One token is held for the lifetime
/// of each session.
pub trait FlowLimiter: Send + Sync {
    fn acquire(&self, kind: &'static str) -> std::result::Result<(), FlowLimitError>;
    fn release(&self);
}

/// Capacity-bounded limiter backed by a single atomic counter.
#[derive(Debug)]
pub struct CountingLimiter {
    active: AtomicUsize,
    capacity: usize,
}

impl CountingLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

impl FlowLimiter for CountingLimiter {
    fn acquire(&self, _kind: &'static str) -> std::result::Result<(), FlowLimitError> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.capacity).then_some(active + 1)
            })
            .map(|_| ())
            .map_err(|_| FlowLimitError)
    }

    fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                active.checked_sub(1)
            });
    }
}

/// Promotes a short datagram write to an error, so callers never see a
/// partially delivered payload.
pub fn ensure_complete_write(written: usize, expected: usize) -> Result<()> {
    if written != expected {
        return Err(Error::new(
            ErrorKind::WriteZero,
            format!("short origin write: {written} of {expected} bytes"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_limiter_enforces_capacity() {
        let limiter = CountingLimiter::new(2);
        assert!(limiter.acquire("udp").is_ok());
        assert!(limiter.acquire("udp").is_ok());
        assert_eq!(limiter.acquire("udp"), Err(FlowLimitError));
        limiter.release();
        assert!(limiter.acquire("udp").is_ok());
        assert_eq!(limiter.active(), 2);
    }

    #[test]
    fn release_never_underflows() {
        let limiter = CountingLimiter::new(1);
        limiter.release();
        assert_eq!(limiter.active(), 0);
        assert!(limiter.acquire("udp").is_ok());
    }

    #[tokio::test]
    async fn net_dialer_connects() {
        let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();

        let dialed = NetDialer.dial_udp(origin_addr).await.unwrap();
        assert_eq!(dialed.peer_addr().unwrap(), origin_addr);

        dialed.send(b"knock").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = origin.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"knock");
        assert_eq!(from, dialed.local_addr().unwrap());
    }
}
