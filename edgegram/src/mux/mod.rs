//! The datagram muxer: reads one QUIC connection's datagrams and routes
//! them by type to sessions or the ICMP path.
//!
//! One muxer serves one datagram connection. Several muxers share the
//! same session manager, which is what lets a flow migrate between
//! connections when the edge retransmits its registration elsewhere.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use edgegram_types::{
    DatagramType, IcmpDatagram, IcmpDecoder, IcmpEncoder, IcmpPacket, RegistrationResponse,
    RequestId, ResponseCode, SessionPayload, SessionRegistration,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::conn::DatagramConn;
use crate::icmp::{IcmpResponder, IcmpRouter};
use crate::metrics::{reason, Metrics};
use crate::pool::Pool;
use crate::session::{RegisterError, SessionManager};

const DATAGRAM_QUEUE_LEN: usize = 16;
const READ_ERROR_QUEUE_LEN: usize = 2;
const ICMP_QUEUE_LEN: usize = 128;

/// Why `serve` returned. The muxer never exits for per-datagram
/// failures; only shutdown, connection loss, or a hard read error end
/// it.
#[derive(Debug, Error)]
pub enum MuxerError {
    #[error("muxer cancelled")]
    Cancelled,
    #[error("datagram connection closed")]
    ConnectionClosed,
    #[error("datagram read: {0}")]
    Read(#[source] io::Error),
}

pub struct Muxer {
    conn: Arc<dyn DatagramConn>,
    conn_token: CancellationToken,
    sessions: Arc<SessionManager>,
    icmp_router: Option<Arc<dyn IcmpRouter>>,
    index: u8,
    metrics: Arc<dyn Metrics>,
    icmp_tx: mpsc::Sender<IcmpDatagram>,
    icmp_rx: Mutex<Option<mpsc::Receiver<IcmpDatagram>>>,
    encoders: Pool<IcmpEncoder>,
    decoders: Pool<IcmpDecoder>,
}

impl Muxer {
    pub fn new(
        conn: Arc<dyn DatagramConn>,
        sessions: Arc<SessionManager>,
        icmp_router: Option<Arc<dyn IcmpRouter>>,
        index: u8,
        metrics: Arc<dyn Metrics>,
    ) -> Arc<Self> {
        let (icmp_tx, icmp_rx) = mpsc::channel(ICMP_QUEUE_LEN);
        Arc::new(Self {
            conn_token: conn.context(),
            conn,
            sessions,
            icmp_router,
            index,
            metrics,
            icmp_tx,
            icmp_rx: Mutex::new(Some(icmp_rx)),
            encoders: Pool::new(IcmpEncoder::new),
            decoders: Pool::new(IcmpDecoder::new),
        })
    }

    pub fn conn_index(&self) -> u8 {
        self.index
    }

    /// Runs the read loop until `shutdown` fires, the connection dies,
    /// or a hard read error surfaces.
    pub async fn serve(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), MuxerError> {
        let (dgram_tx, mut dgram_rx) = mpsc::channel::<Bytes>(DATAGRAM_QUEUE_LEN);
        let (err_tx, mut err_rx) = mpsc::channel::<io::Error>(READ_ERROR_QUEUE_LEN);

        // The reader and the icmp worker stop with this muxer, not with
        // the whole agent.
        let subtask_token = shutdown.child_token();
        let _subtask_guard = subtask_token.clone().drop_guard();

        tokio::spawn(read_loop(
            self.conn.clone(),
            dgram_tx,
            err_tx,
            subtask_token.clone(),
        ));

        if self.icmp_router.is_some() {
            let taken = self
                .icmp_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(icmp_rx) = taken {
                tokio::spawn(self.clone().icmp_worker(icmp_rx, subtask_token));
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(MuxerError::Cancelled),
                _ = self.conn_token.cancelled() => return Err(MuxerError::ConnectionClosed),
                err = err_rx.recv() => {
                    return Err(err.map_or(MuxerError::ConnectionClosed, MuxerError::Read));
                }
                dgram = dgram_rx.recv() => match dgram {
                    Some(dgram) => Self::dispatch(&self, dgram).await,
                    None => return Err(MuxerError::ConnectionClosed),
                },
            }
        }
    }

    async fn dispatch(mux: &Arc<Self>, dgram: Bytes) {
        let Some(&tag) = dgram.first() else {
            tracing::debug!("dropping empty datagram");
            return;
        };

        match DatagramType::from_byte(tag) {
            Ok(DatagramType::Registration) => Self::handle_registration(mux, &dgram),
            // Payloads stay inline so payloads of the same flow reach
            // the origin in arrival order.
            Ok(DatagramType::Payload) => mux.handle_payload(&dgram).await,
            Ok(DatagramType::Icmp) => mux.handle_icmp(&dgram),
            Ok(DatagramType::RegistrationResponse) => {
                mux.metrics.unsupported_remote_command(mux.index, tag);
                tracing::warn!(
                    conn_index = mux.index,
                    "dropping registration response sent by the edge"
                );
            }
            Err(err) => {
                mux.metrics.unsupported_remote_command(mux.index, tag);
                tracing::debug!(conn_index = mux.index, tag, %err, "dropping unknown datagram");
            }
        }
    }

    fn handle_registration(mux: &Arc<Self>, dgram: &[u8]) {
        let registration = match SessionRegistration::from_slice(dgram) {
            Ok(registration) => registration,
            Err(err) => {
                tracing::error!(%err, "failed to unmarshal session registration");
                return;
            }
        };

        let mux = mux.clone();
        tokio::spawn(async move {
            mux.serve_registration(registration).await;
        });
    }

    /// One registration, from admission to the end of the session.
    async fn serve_registration(self: Arc<Self>, registration: SessionRegistration) {
        let id = registration.id;
        let admitted = self
            .sessions
            .register_session(
                &registration,
                self.conn.clone(),
                self.conn_token.clone(),
                self.index,
            )
            .await;

        match admitted {
            Ok(session) => {
                self.respond(id, ResponseCode::Ok);
                self.metrics.incr_flows(self.index);
                tracing::debug!(flow = %id, dest = %registration.dest, "session registered");

                if !registration.payload.is_empty() {
                    if let Err(err) = session.write(&registration.payload).await {
                        tracing::error!(flow = %id, %err, "failed to write bundled payload");
                    }
                }

                let result = session.serve().await;
                self.sessions.unregister_session(id);
                self.metrics.decr_flows(self.index);
                match result {
                    Err(err) if err.is_graceful() => {
                        tracing::debug!(flow = %id, %err, "session ended");
                    }
                    Err(err) => {
                        tracing::error!(flow = %id, %err, "session failed");
                    }
                    Ok(()) => tracing::debug!(flow = %id, "session ended"),
                }
            }
            Err(RegisterError::AlreadyRegistered) => {
                // The edge retransmitted because our first response got
                // lost. Re-ack and refresh the existing session.
                self.respond(id, ResponseCode::Ok);
                if let Some(session) = self.sessions.get_session(id) {
                    session.reset_idle_timer();
                }
                self.metrics.retry_flow_response(self.index);
                tracing::debug!(flow = %id, "re-acknowledged replayed registration");
            }
            Err(RegisterError::BoundToOtherConn) => match self.sessions.get_session(id) {
                Some(session) => {
                    session.migrate(self.conn.clone(), self.conn_token.clone(), self.index);
                    self.metrics.migrate_flow(self.index);
                    self.respond(id, ResponseCode::Ok);
                }
                None => {
                    // The owning session ended between lookup and fetch.
                    self.respond(id, ResponseCode::UnableToBindSocket);
                }
            },
            Err(RegisterError::RateLimited) => {
                self.respond(id, ResponseCode::TooManyActiveFlows);
                tracing::debug!(flow = %id, "rejected rate-limited registration");
            }
            Err(err @ RegisterError::Dial(_)) => {
                tracing::error!(flow = %id, %err, "failed to open origin socket");
                self.respond(id, ResponseCode::UnableToBindSocket);
            }
        }
    }

    async fn handle_payload(&self, dgram: &[u8]) {
        let payload = match SessionPayload::from_slice(dgram) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(%err, "failed to unmarshal session payload");
                return;
            }
        };

        let Some(session) = self.sessions.get_session(payload.id) else {
            self.metrics
                .dropped_udp_datagram(self.index, reason::UNKNOWN_FLOW);
            tracing::debug!(flow = %payload.id, "dropping payload for unknown flow");
            return;
        };

        if let Err(err) = session.write(payload.payload).await {
            self.metrics
                .dropped_udp_datagram(self.index, reason::ORIGIN_WRITE);
            tracing::error!(flow = %payload.id, %err, "failed to forward payload to origin");
        }
    }

    fn handle_icmp(&self, dgram: &[u8]) {
        if self.icmp_router.is_none() {
            return;
        }

        let icmp = match IcmpDatagram::from_slice(dgram) {
            Ok(icmp) => icmp,
            Err(err) => {
                tracing::error!(%err, "failed to unmarshal icmp datagram");
                return;
            }
        };

        // Dropping on overflow keeps the read loop from stalling behind
        // a slow ICMP origin.
        if self.icmp_tx.try_send(icmp).is_err() {
            self.metrics
                .dropped_icmp_packet(self.index, reason::CHANNEL_FULL);
            tracing::warn!(conn_index = self.index, "icmp queue full, dropping packet");
        }
    }

    /// Single consumer of the ICMP queue: decode, gate on TTL, submit.
    async fn icmp_worker(
        self: Arc<Self>,
        mut icmp_rx: mpsc::Receiver<IcmpDatagram>,
        stop: CancellationToken,
    ) {
        let Some(router) = self.icmp_router.clone() else {
            return;
        };
        let responder: Arc<dyn IcmpResponder> = self.clone();

        loop {
            let datagram = tokio::select! {
                _ = stop.cancelled() => return,
                datagram = icmp_rx.recv() => match datagram {
                    Some(datagram) => datagram,
                    None => return,
                },
            };

            let mut decoder = self.decoders.get();
            let mut pkt = match decoder.decode(&datagram.packet) {
                Ok(pkt) => pkt,
                Err(err) => {
                    self.metrics
                        .dropped_icmp_packet(self.index, reason::MALFORMED);
                    tracing::error!(%err, "failed to decode icmp packet");
                    continue;
                }
            };

            if pkt.ttl <= 1 {
                // The packet would die before reaching the origin;
                // answer for it and never submit the original.
                if let Err(err) = self.send_icmp_ttl_exceed(&pkt, decoder.raw()) {
                    tracing::debug!(%err, "failed to send ttl exceeded reply");
                }
                continue;
            }
            pkt.ttl -= 1;
            drop(decoder);

            if let Err(err) = router.request(pkt, responder.clone()).await {
                tracing::warn!(%err, "icmp router rejected packet");
            }
        }
    }

    fn respond(&self, id: RequestId, code: ResponseCode) {
        if let Err(err) = self.send_udp_session_response(id, code) {
            tracing::error!(flow = %id, %err, "failed to send registration response");
        }
    }

    pub fn send_datagram(&self, data: &[u8]) -> io::Result<()> {
        self.conn.send_datagram(data)
    }

    pub fn send_udp_session_response(&self, id: RequestId, code: ResponseCode) -> io::Result<()> {
        let frame = RegistrationResponse::new(id, code)
            .to_vec()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        self.conn.send_datagram(&frame)
    }

    /// Encodes and sends one ICMP packet. The pooled encoder is
    /// released only after the send, because the encoded slice aliases
    /// its scratch buffer.
    pub fn send_icmp_packet(&self, pkt: &IcmpPacket) -> io::Result<()> {
        let mut encoder = self.encoders.get();
        let packet = encoder
            .encode(pkt)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let frame = IcmpDatagram::frame(packet)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        self.conn.send_datagram(&frame)
    }

    pub fn send_icmp_ttl_exceed(&self, pkt: &IcmpPacket, raw: &[u8]) -> io::Result<()> {
        let Some(router) = &self.icmp_router else {
            return Ok(());
        };
        self.send_icmp_packet(&router.convert_to_ttl_exceeded(pkt, raw))
    }
}

#[async_trait]
impl IcmpResponder for Muxer {
    async fn return_packet(&self, pkt: &IcmpPacket) -> io::Result<()> {
        self.send_icmp_packet(pkt)
    }
}

/// Dedicated reader: pulls datagrams off the connection and feeds the
/// bounded channel, leaving backpressure to the QUIC layer.
async fn read_loop(
    conn: Arc<dyn DatagramConn>,
    dgram_tx: mpsc::Sender<Bytes>,
    err_tx: mpsc::Sender<io::Error>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            received = conn.receive_datagram() => match received {
                Ok(dgram) => {
                    if dgram_tx.send(dgram).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = err_tx.try_send(err);
                    return;
                }
            },
        }
    }
}
