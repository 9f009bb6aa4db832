//! The ICMP origin path.
//!
//! The muxer hands decoded ICMP packets to an [`IcmpRouter`], which
//! forwards them toward origins and routes replies back through the
//! responder supplied with each request. [`OriginIcmpRouter`] is the
//! provided implementation: a serialized dispatcher over an injected
//! raw-packet transport, since opening ICMP sockets is privileged and
//! platform specific.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use edgegram_types::icmp::{ttl_exceeded, IcmpPacket};
use fxhash::FxHashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ROUTER_QUEUE_LEN: usize = 128;

/// Sink for replies belonging to one submitted packet.
#[async_trait]
pub trait IcmpResponder: Send + Sync {
    async fn return_packet(&self, pkt: &IcmpPacket) -> io::Result<()>;
}

/// The contract the muxer consumes.
#[async_trait]
pub trait IcmpRouter: Send + Sync {
    /// Submits one packet to the origin path; replies go to `responder`.
    async fn request(
        &self,
        pkt: IcmpPacket,
        responder: Arc<dyn IcmpResponder>,
    ) -> io::Result<()>;

    /// Builds the Time Exceeded reply for a packet whose TTL ran out.
    fn convert_to_ttl_exceeded(&self, pkt: &IcmpPacket, raw: &[u8]) -> IcmpPacket;
}

/// Raw ICMP transport toward origins.
#[async_trait]
pub trait IcmpTransport: Send + Sync {
    async fn send(&self, pkt: &IcmpPacket) -> io::Result<()>;
    async fn recv(&self) -> io::Result<IcmpPacket>;
}

/// Flows are keyed by the origin address plus the echo identifier, so
/// concurrent pings to the same origin stay separable. Non-echo
/// messages share the zero identifier.
type FlowKey = (IpAddr, u16);

struct RouterRequest {
    pkt: IcmpPacket,
    responder: Arc<dyn IcmpResponder>,
}

/// Serialized origin dispatcher: a single sender task owns the
/// transport's write side, so packet emission order matches submission
/// order. A companion task pumps replies back to the stored responders.
pub struct OriginIcmpRouter {
    requests: mpsc::Sender<RouterRequest>,
    router_v4: Ipv4Addr,
    router_v6: Ipv6Addr,
}

impl OriginIcmpRouter {
    /// `router_v4`/`router_v6` become the source addresses of
    /// synthesized Time Exceeded replies.
    pub fn spawn(
        transport: Arc<dyn IcmpTransport>,
        router_v4: Ipv4Addr,
        router_v6: Ipv6Addr,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (requests, request_rx) = mpsc::channel(ROUTER_QUEUE_LEN);
        let flows: Arc<Mutex<FxHashMap<FlowKey, Arc<dyn IcmpResponder>>>> =
            Arc::new(Mutex::new(FxHashMap::default()));

        tokio::spawn(dispatch_requests(
            transport.clone(),
            request_rx,
            flows.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(pump_replies(transport, flows, shutdown));

        Arc::new(Self {
            requests,
            router_v4,
            router_v6,
        })
    }
}

#[async_trait]
impl IcmpRouter for OriginIcmpRouter {
    async fn request(
        &self,
        pkt: IcmpPacket,
        responder: Arc<dyn IcmpResponder>,
    ) -> io::Result<()> {
        self.requests
            .send(RouterRequest { pkt, responder })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "icmp dispatcher stopped"))
    }

    fn convert_to_ttl_exceeded(&self, pkt: &IcmpPacket, raw: &[u8]) -> IcmpPacket {
        ttl_exceeded(pkt, raw, self.router_v4, self.router_v6)
    }
}

async fn dispatch_requests(
    transport: Arc<dyn IcmpTransport>,
    mut request_rx: mpsc::Receiver<RouterRequest>,
    flows: Arc<Mutex<FxHashMap<FlowKey, Arc<dyn IcmpResponder>>>>,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => return,
            request = request_rx.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };

        let key = (
            request.pkt.dst,
            request.pkt.message.echo_id().unwrap_or(0),
        );
        flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, request.responder);

        if let Err(err) = transport.send(&request.pkt).await {
            tracing::warn!(%err, dst = %request.pkt.dst, "failed to send icmp packet to origin");
        }
    }
}

async fn pump_replies(
    transport: Arc<dyn IcmpTransport>,
    flows: Arc<Mutex<FxHashMap<FlowKey, Arc<dyn IcmpResponder>>>>,
    shutdown: CancellationToken,
) {
    loop {
        let reply = tokio::select! {
            _ = shutdown.cancelled() => return,
            reply = transport.recv() => match reply {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::warn!(%err, "icmp transport read failed; stopping reply pump");
                    return;
                }
            },
        };

        let key = (reply.src, reply.message.echo_id().unwrap_or(0));
        let responder = flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        match responder {
            Some(responder) => {
                if let Err(err) = responder.return_packet(&reply).await {
                    tracing::debug!(%err, src = %reply.src, "failed to return icmp reply");
                }
            }
            None => {
                tracing::debug!(src = %reply.src, "dropping icmp reply without a flow");
            }
        }
    }
}
