//! Shared harness for the integration tests: an in-memory datagram
//! connection pair, a failing dialer, and a recording metrics sink.
#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use edgegram::conn::DatagramConn;
use edgegram::metrics::Metrics;
use edgegram::origin::{OriginSocket, UdpOriginDialer};
use edgegram::types::{RegistrationResponse, RequestId, SessionPayload, SessionRegistration};

/// The flow id used by most scenarios:
/// 00112233445566778899aabbccddeeff.
pub fn rid() -> RequestId {
    RequestId::from_parts(0x0011_2233_4455_6677, 0x8899_aabb_ccdd_eeff)
}

/// Installs a fmt subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// In-memory stand-in for one QUIC connection, muxer side.
pub struct EdgeConn {
    token: CancellationToken,
    incoming: AsyncMutex<mpsc::Receiver<Bytes>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

/// Edge side of the same connection.
pub struct EdgeHandle {
    pub token: CancellationToken,
    to_mux: mpsc::Sender<Bytes>,
    from_mux: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn edge_conn() -> (Arc<EdgeConn>, EdgeHandle) {
    let token = CancellationToken::new();
    let (to_mux, incoming) = mpsc::channel(64);
    let (outgoing, from_mux) = mpsc::unbounded_channel();
    let conn = Arc::new(EdgeConn {
        token: token.clone(),
        incoming: AsyncMutex::new(incoming),
        outgoing,
    });
    let handle = EdgeHandle {
        token,
        to_mux,
        from_mux,
    };
    (conn, handle)
}

#[async_trait]
impl DatagramConn for EdgeConn {
    fn context(&self) -> CancellationToken {
        self.token.clone()
    }

    fn send_datagram(&self, data: &[u8]) -> io::Result<()> {
        self.outgoing
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "edge gone"))
    }

    async fn receive_datagram(&self) -> io::Result<Bytes> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"))
    }
}

impl EdgeHandle {
    pub async fn send(&self, frame: Vec<u8>) {
        self.to_mux
            .send(Bytes::from(frame))
            .await
            .expect("muxer stopped reading");
    }

    /// Next frame emitted by the muxer, bounded by a one second wait.
    pub async fn next_frame(&mut self) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(1), self.from_mux.recv())
            .await
            .expect("timed out waiting for a datagram from the muxer")
            .expect("muxer side closed")
    }

    pub async fn expect_response(&mut self) -> RegistrationResponse {
        let frame = self.next_frame().await;
        RegistrationResponse::from_slice(&frame).expect("expected a registration response")
    }

    /// Next frame, decoded as a session payload.
    pub async fn expect_payload(&mut self) -> (RequestId, Vec<u8>) {
        let frame = self.next_frame().await;
        let payload = SessionPayload::from_slice(&frame).expect("expected a payload datagram");
        (payload.id, payload.payload.to_vec())
    }

    pub fn try_next_frame(&mut self) -> Option<Vec<u8>> {
        self.from_mux.try_recv().ok()
    }
}

pub fn registration(dest: std::net::SocketAddr, idle: Duration) -> SessionRegistration {
    SessionRegistration {
        id: rid(),
        dest,
        traced: false,
        idle_hint: idle,
        payload: Vec::new(),
    }
}

/// Dialer that refuses everything.
pub struct FailingDialer;

#[async_trait]
impl UdpOriginDialer for FailingDialer {
    async fn dial_udp(&self, _addr: std::net::SocketAddr) -> io::Result<Box<dyn OriginSocket>> {
        Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "no route to origin",
        ))
    }
}

/// Records every hook invocation.
#[derive(Default)]
pub struct TestMetrics {
    pub flows: AtomicI64,
    pub retry_flow_response: AtomicU64,
    pub migrate_flow: AtomicU64,
    pub payload_too_large: AtomicU64,
    pub unsupported: AtomicU64,
    pub dropped_udp: Mutex<Vec<(u8, &'static str)>>,
    pub dropped_icmp: Mutex<Vec<(u8, &'static str)>>,
}

impl TestMetrics {
    pub fn dropped_udp(&self) -> Vec<(u8, &'static str)> {
        self.dropped_udp.lock().unwrap().clone()
    }

    pub fn dropped_icmp(&self) -> Vec<(u8, &'static str)> {
        self.dropped_icmp.lock().unwrap().clone()
    }
}

impl Metrics for TestMetrics {
    fn incr_flows(&self, _conn_index: u8) {
        self.flows.fetch_add(1, Ordering::SeqCst);
    }

    fn decr_flows(&self, _conn_index: u8) {
        self.flows.fetch_sub(1, Ordering::SeqCst);
    }

    fn payload_too_large(&self, _conn_index: u8) {
        self.payload_too_large.fetch_add(1, Ordering::SeqCst);
    }

    fn retry_flow_response(&self, _conn_index: u8) {
        self.retry_flow_response.fetch_add(1, Ordering::SeqCst);
    }

    fn migrate_flow(&self, _conn_index: u8) {
        self.migrate_flow.fetch_add(1, Ordering::SeqCst);
    }

    fn dropped_udp_datagram(&self, conn_index: u8, reason: &'static str) {
        self.dropped_udp.lock().unwrap().push((conn_index, reason));
    }

    fn dropped_icmp_packet(&self, conn_index: u8, reason: &'static str) {
        self.dropped_icmp.lock().unwrap().push((conn_index, reason));
    }

    fn unsupported_remote_command(&self, _conn_index: u8, _command: u8) {
        self.unsupported.fetch_add(1, Ordering::SeqCst);
    }
}
