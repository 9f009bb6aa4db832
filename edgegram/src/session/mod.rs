//! One UDP flow: the bidirectional pump between a datagram connection
//! and a connected origin socket.
//!
//! A session is created by the manager on registration and serves until
//! its idle timer fires, it is closed, the owning connection dies, or
//! origin I/O fails. Registrations replayed by the edge can migrate a
//! live session to another connection without touching the origin
//! socket.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use edgegram_types::{
    RequestId, SessionPayload, MAX_DATAGRAM_LEN, MAX_SESSION_PAYLOAD_LEN,
    SESSION_PAYLOAD_HEADER_LEN,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::conn::DatagramConn;
use crate::metrics::Metrics;
use crate::origin::{ensure_complete_write, OriginSocket};

mod activity;
mod manager;

use activity::ActivityTracker;
pub use manager::{RegisterError, SessionInfo, SessionManager, FLOW_KIND_UDP};

/// Idle timeout applied when the registration hints zero.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(210);

/// Reused origin read buffer: payload header plus the largest datagram.
const ORIGIN_READ_BUFFER_LEN: usize = SESSION_PAYLOAD_HEADER_LEN + MAX_DATAGRAM_LEN;

/// Why a serve loop ended.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No payload moved in either direction for the whole idle window.
    #[error("session idled out after {0:?}")]
    Idle(Duration),
    /// The session was closed explicitly.
    #[error("session closed")]
    Closed,
    /// The owning datagram connection went away.
    #[error("datagram connection closed")]
    ConnectionClosed,
    /// Reading from or writing to the origin socket failed.
    #[error("origin: {0}")]
    Origin(#[source] io::Error),
    /// Sending a datagram to the edge failed.
    #[error("transport: {0}")]
    Transport(#[source] io::Error),
}

impl SessionError {
    /// Idle expiry and explicit close are normal endings; everything
    /// else deserves an error-level log line.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::Idle(_) | Self::Closed)
    }
}

/// The connection currently owning a session. Only `migrate` replaces
/// it; the epoch lets the serve loop tell a stale cancellation from a
/// live one.
struct ConnBinding {
    conn: Arc<dyn DatagramConn>,
    token: CancellationToken,
    index: u8,
    epoch: u64,
}

pub struct Session {
    id: RequestId,
    origin: Arc<dyn OriginSocket>,
    current: RwLock<ConnBinding>,
    activity: ActivityTracker,
    activity_rx: Mutex<Option<mpsc::Receiver<()>>>,
    idle_timeout: Duration,
    close: CancellationToken,
    closed: AtomicBool,
    metrics: Arc<dyn Metrics>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Session {
    pub fn new(
        id: RequestId,
        origin: Box<dyn OriginSocket>,
        conn: Arc<dyn DatagramConn>,
        conn_token: CancellationToken,
        conn_index: u8,
        idle_hint: Duration,
        metrics: Arc<dyn Metrics>,
    ) -> Arc<Self> {
        let (activity, activity_rx) = ActivityTracker::new();
        let idle_timeout = if idle_hint.is_zero() {
            DEFAULT_IDLE_TIMEOUT
        } else {
            idle_hint
        };
        Arc::new(Self {
            id,
            origin: Arc::from(origin),
            current: RwLock::new(ConnBinding {
                conn,
                token: conn_token,
                index: conn_index,
                epoch: 0,
            }),
            activity,
            activity_rx: Mutex::new(Some(activity_rx)),
            idle_timeout,
            close: CancellationToken::new(),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn conn_index(&self) -> u8 {
        self.binding().index
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn last_active(&self) -> Instant {
        self.activity.last_active()
    }

    pub(crate) fn origin(&self) -> &Arc<dyn OriginSocket> {
        &self.origin
    }

    fn binding(&self) -> RwLockReadGuard<'_, ConnBinding> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_conn(&self) -> Arc<dyn DatagramConn> {
        self.binding().conn.clone()
    }

    fn current_epoch(&self) -> u64 {
        self.binding().epoch
    }

    /// Runs the pump until a terminal condition; always returns the
    /// reason. The caller unregisters the session afterwards.
    pub async fn serve(self: Arc<Self>) -> Result<(), SessionError> {
        let Some(mut activity_rx) = self
            .activity_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(SessionError::Closed);
        };

        let (err_tx, mut err_rx) = mpsc::channel::<SessionError>(1);
        let reader = tokio::spawn(read_from_origin(self.clone(), err_tx));

        let result = self.select_loop(&mut activity_rx, &mut err_rx).await;

        reader.abort();
        self.close();
        result
    }

    async fn select_loop(
        &self,
        activity_rx: &mut mpsc::Receiver<()>,
        err_rx: &mut mpsc::Receiver<SessionError>,
    ) -> Result<(), SessionError> {
        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        loop {
            // Snapshot the owning connection's token; migration bumps
            // the epoch, turning an old token's cancellation into a
            // no-op below.
            let (token, epoch) = {
                let binding = self.binding();
                (binding.token.clone(), binding.epoch)
            };

            tokio::select! {
                _ = token.cancelled() => {
                    if self.current_epoch() == epoch {
                        return Err(SessionError::ConnectionClosed);
                    }
                }
                _ = self.close.cancelled() => {
                    return Err(SessionError::Closed);
                }
                () = &mut idle => {
                    return Err(SessionError::Idle(self.idle_timeout));
                }
                err = err_rx.recv() => {
                    return Err(err.unwrap_or(SessionError::Closed));
                }
                signal = activity_rx.recv() => {
                    if signal.is_some() {
                        idle.as_mut().reset(Instant::now() + self.idle_timeout);
                    }
                }
            }
        }
    }

    /// Forwards one payload from the edge into the origin socket.
    pub async fn write(&self, payload: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "session closed",
            ));
        }
        let written = self.origin.send(payload).await?;
        ensure_complete_write(written, payload.len())?;
        self.activity.update();
        Ok(())
    }

    /// Rebinds the session to another datagram connection. The prior
    /// connection's cancellation no longer ends the serve loop and
    /// origin reads flow to the new connection; the origin socket is
    /// untouched.
    pub fn migrate(
        &self,
        conn: Arc<dyn DatagramConn>,
        conn_token: CancellationToken,
        conn_index: u8,
    ) {
        let mut binding = self.current.write().unwrap_or_else(PoisonError::into_inner);
        binding.conn = conn;
        binding.token = conn_token;
        binding.index = conn_index;
        binding.epoch += 1;
        let epoch = binding.epoch;
        drop(binding);
        tracing::debug!(flow = %self.id, conn_index, epoch, "migrated session");
    }

    /// Nudges the idle timer without moving data, for replayed
    /// registrations of an already-active flow.
    pub fn reset_idle_timer(&self) {
        self.activity.update();
    }

    /// Idempotent: closes the origin socket and ends the serve loop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.origin.close();
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Pumps origin reads into payload datagrams on the session's current
/// connection. The 17-byte payload header is laid down once; each read
/// refills only the bytes after it, so the filled prefix of the buffer
/// is handed to the transport without copying.
async fn read_from_origin(session: Arc<Session>, err_tx: mpsc::Sender<SessionError>) {
    let mut buf = vec![0u8; ORIGIN_READ_BUFFER_LEN];
    if let Err(err) = SessionPayload::write_header(session.id, &mut buf) {
        let _ = err_tx.try_send(SessionError::Transport(io::Error::new(
            io::ErrorKind::InvalidInput,
            err,
        )));
        return;
    }

    loop {
        tokio::select! {
            _ = session.close.cancelled() => return,
            read = session.origin.recv(&mut buf[SESSION_PAYLOAD_HEADER_LEN..]) => match read {
                Ok(0) => {}
                Ok(n) if n > MAX_SESSION_PAYLOAD_LEN => {
                    session.metrics.payload_too_large(session.conn_index());
                    tracing::warn!(
                        flow = %session.id,
                        size = n,
                        "dropping origin read larger than max payload"
                    );
                }
                Ok(n) => {
                    let conn = session.current_conn();
                    if let Err(err) =
                        conn.send_datagram(&buf[..SESSION_PAYLOAD_HEADER_LEN + n])
                    {
                        let _ = err_tx.try_send(SessionError::Transport(err));
                        return;
                    }
                    session.activity.update();
                }
                Err(err) => {
                    let _ = err_tx.try_send(SessionError::Origin(err));
                    return;
                }
            },
        }
    }
}
