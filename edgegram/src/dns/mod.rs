//! The local-DNS virtual origin.
//!
//! Flows whose destination is the well-known virtual resolver address
//! are not tunneled anywhere: the dial is transparently retargeted to
//! the host's own recursive resolver, so policy-aware DNS stacks on the
//! machine keep working. The resolver is discovered from the platform
//! resolver configuration and re-checked periodically.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::origin::{NetDialer, OriginSocket, UdpOriginDialer};

/// Destination that marks a flow as local-DNS bound.
pub const VIRTUAL_DNS_ADDR: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0x0cf1, 0x2000, 0, 0, 0, 0x0001)),
    53,
);

const DNS_PORT: u16 = 53;
const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Per-request counters, readable via [`DnsOrigin::stats`].
#[derive(Debug, Default)]
struct DnsCounters {
    udp_dials: AtomicU64,
    tcp_dials: AtomicU64,
    discovery_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsStats {
    pub udp_dials: u64,
    pub tcp_dials: u64,
    pub discovery_failures: u64,
}

/// Tracks the host's recursive resolver and dials it on demand.
pub struct DnsOrigin {
    addresses: RwLock<Vec<SocketAddr>>,
    is_static: bool,
    resolv_conf: PathBuf,
    counters: DnsCounters,
}

impl DnsOrigin {
    /// Dynamic origin reading the platform resolver configuration,
    /// starting from the loopback resolver until discovery runs.
    pub fn new() -> Arc<Self> {
        Self::with_resolv_conf(PathBuf::from(DEFAULT_RESOLV_CONF))
    }

    pub fn with_resolv_conf(resolv_conf: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            addresses: RwLock::new(vec![(Ipv4Addr::LOCALHOST, DNS_PORT).into()]),
            is_static: false,
            resolv_conf,
            counters: DnsCounters::default(),
        })
    }

    /// Frozen address list; the refresh loop becomes a no-op. An empty
    /// list falls back to the loopback resolver.
    pub fn with_static_addresses(addresses: Vec<SocketAddr>) -> Arc<Self> {
        let addresses = if addresses.is_empty() {
            vec![(Ipv4Addr::LOCALHOST, DNS_PORT).into()]
        } else {
            addresses
        };
        Arc::new(Self {
            addresses: RwLock::new(addresses),
            is_static: true,
            resolv_conf: PathBuf::from(DEFAULT_RESOLV_CONF),
            counters: DnsCounters::default(),
        })
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats(&self) -> DnsStats {
        DnsStats {
            udp_dials: self.counters.udp_dials.load(Ordering::Relaxed),
            tcp_dials: self.counters.tcp_dials.load(Ordering::Relaxed),
            discovery_failures: self.counters.discovery_failures.load(Ordering::Relaxed),
        }
    }

    /// Discovers once immediately, then every five minutes until the
    /// token fires. Returns at once for a static origin.
    pub fn spawn_refresh_loop(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = self;
        tokio::spawn(async move {
            if this.is_static {
                return;
            }
            loop {
                this.refresh().await;
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
                }
            }
        })
    }

    /// One discovery attempt. Failures keep the previous addresses.
    pub async fn refresh(&self) {
        match tokio::time::timeout(DISCOVERY_TIMEOUT, self.discover()).await {
            Ok(Ok(addresses)) if !addresses.is_empty() => {
                let mut slot = self
                    .addresses
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                if *slot != addresses {
                    tracing::info!(?addresses, "local resolver changed");
                    *slot = addresses;
                }
            }
            Ok(Ok(_)) => {
                self.counters
                    .discovery_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!("resolver discovery found no nameservers, keeping previous");
            }
            Ok(Err(err)) => {
                self.counters
                    .discovery_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%err, "resolver discovery failed, keeping previous");
            }
            Err(_) => {
                self.counters
                    .discovery_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!("resolver discovery timed out, keeping previous");
            }
        }
    }

    async fn discover(&self) -> io::Result<Vec<SocketAddr>> {
        let text = tokio::fs::read_to_string(&self.resolv_conf).await?;
        Ok(parse_resolv_conf(&text))
    }

    /// One resolver address for this request. With multiple candidates
    /// the pick is uniform via the system RNG; on RNG failure the first
    /// entry wins.
    fn pick(&self) -> SocketAddr {
        let addresses = self
            .addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if addresses.len() <= 1 {
            return addresses[0];
        }
        let mut bytes = [0u8; 4];
        let index = match OsRng.try_fill_bytes(&mut bytes) {
            Ok(()) => (u32::from_ne_bytes(bytes) as usize) % addresses.len(),
            Err(_) => 0,
        };
        addresses[index]
    }

    /// Dials the current resolver over TCP. The requested address is
    /// ignored by design.
    pub async fn dial_tcp(&self, _addr: SocketAddr) -> io::Result<TcpStream> {
        let resolver = self.pick();
        self.counters.tcp_dials.fetch_add(1, Ordering::Relaxed);
        TcpStream::connect(resolver).await
    }
}

#[async_trait]
impl UdpOriginDialer for DnsOrigin {
    /// Dials the current resolver over UDP. The requested address is
    /// ignored by design.
    async fn dial_udp(&self, _addr: SocketAddr) -> io::Result<Box<dyn OriginSocket>> {
        let resolver = self.pick();
        self.counters.udp_dials.fetch_add(1, Ordering::Relaxed);
        NetDialer.dial_udp(resolver).await
    }
}

/// Routes virtual-DNS dials to the local resolver and everything else
/// to the wrapped dialer.
pub struct VirtualDnsDialer {
    inner: Arc<dyn UdpOriginDialer>,
    dns: Arc<DnsOrigin>,
}

impl VirtualDnsDialer {
    pub fn new(inner: Arc<dyn UdpOriginDialer>, dns: Arc<DnsOrigin>) -> Self {
        Self { inner, dns }
    }
}

#[async_trait]
impl UdpOriginDialer for VirtualDnsDialer {
    async fn dial_udp(&self, addr: SocketAddr) -> io::Result<Box<dyn OriginSocket>> {
        if addr == VIRTUAL_DNS_ADDR {
            self.dns.dial_udp(addr).await
        } else {
            self.inner.dial_udp(addr).await
        }
    }
}

fn parse_resolv_conf(text: &str) -> Vec<SocketAddr> {
    let mut addresses = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        let Some(value) = fields.next() else {
            continue;
        };
        // Scoped link-local entries (fe80::1%eth0) are not dialable here.
        if value.contains('%') {
            continue;
        }
        if let Ok(ip) = value.parse::<IpAddr>() {
            addresses.push(SocketAddr::new(ip, DNS_PORT));
        } else if let Ok(addr) = value.parse::<SocketAddr>() {
            addresses.push(addr);
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nameserver_lines() {
        let text = "\
# generated by resolvconf
domain lan
nameserver 192.0.2.53
nameserver 2001:db8::53
nameserver fe80::1%eth0
; trailing comment
nameserver 198.51.100.1:5353
options edns0
";
        let addresses = parse_resolv_conf(text);
        assert_eq!(
            addresses,
            vec![
                "192.0.2.53:53".parse().unwrap(),
                "[2001:db8::53]:53".parse().unwrap(),
                "198.51.100.1:5353".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn bare_address_defaults_to_port_53() {
        let addresses = parse_resolv_conf("nameserver 10.1.2.3\n");
        assert_eq!(addresses, vec!["10.1.2.3:53".parse().unwrap()]);
    }

    #[test]
    fn virtual_dns_addr_is_well_known() {
        assert_eq!(
            VIRTUAL_DNS_ADDR,
            "[2606:4700:cf1:2000::1]:53".parse().unwrap()
        );
    }

    #[test]
    fn static_origin_freezes_addresses() {
        let frozen: SocketAddr = "127.0.0.1:5353".parse().unwrap();
        let dns = DnsOrigin::with_static_addresses(vec![frozen]);
        assert_eq!(dns.addresses(), vec![frozen]);
        assert_eq!(dns.pick(), frozen);
    }

    #[test]
    fn empty_static_list_falls_back_to_loopback() {
        let dns = DnsOrigin::with_static_addresses(Vec::new());
        assert_eq!(dns.addresses(), vec!["127.0.0.1:53".parse().unwrap()]);
    }

    #[tokio::test]
    async fn discovery_updates_and_failure_retains() {
        let path =
            std::env::temp_dir().join(format!("edgegram-resolv-{}", std::process::id()));
        std::fs::write(&path, "nameserver 192.0.2.7\n").unwrap();

        let dns = DnsOrigin::with_resolv_conf(path.clone());
        assert_eq!(dns.addresses(), vec!["127.0.0.1:53".parse().unwrap()]);

        dns.refresh().await;
        assert_eq!(dns.addresses(), vec!["192.0.2.7:53".parse().unwrap()]);

        // A vanished file keeps the previous address and counts a
        // failure.
        std::fs::remove_file(&path).unwrap();
        dns.refresh().await;
        assert_eq!(dns.addresses(), vec!["192.0.2.7:53".parse().unwrap()]);
        assert_eq!(dns.stats().discovery_failures, 1);
    }

    #[tokio::test]
    async fn static_refresh_loop_returns_immediately() {
        let dns = DnsOrigin::with_static_addresses(vec!["127.0.0.1:53".parse().unwrap()]);
        let handle = dns.clone().spawn_refresh_loop(CancellationToken::new());
        handle.await.unwrap();
    }
}
