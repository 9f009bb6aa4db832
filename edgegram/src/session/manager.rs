//! The session registry: admission, lookup, and teardown, keyed by
//! flow id under a single reader/writer lock.

use std::collections::hash_map::Entry;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use edgegram_types::{RequestId, SessionRegistration};
use fxhash::FxHashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::conn::DatagramConn;
use crate::metrics::Metrics;
use crate::origin::{FlowLimiter, UdpOriginDialer};
use crate::session::Session;

/// Limiter token kind for UDP flows.
pub const FLOW_KIND_UDP: &str = "udp";

#[derive(Debug, Error)]
pub enum RegisterError {
    /// The flow is already registered on the requesting connection —
    /// the edge most likely never saw our response.
    #[error("flow already registered on this connection")]
    AlreadyRegistered,
    /// The flow is live on a different connection and may be migrated.
    #[error("flow bound to another connection")]
    BoundToOtherConn,
    #[error("flow rate limited")]
    RateLimited,
    #[error("origin dial: {0}")]
    Dial(#[source] io::Error),
}

/// Snapshot of one registered flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: RequestId,
    pub conn_index: u8,
    pub peer: Option<SocketAddr>,
}

pub struct SessionManager {
    sessions: RwLock<FxHashMap<RequestId, Arc<Session>>>,
    dialer: Arc<dyn UdpOriginDialer>,
    limiter: Arc<dyn FlowLimiter>,
    metrics: Arc<dyn Metrics>,
}

impl SessionManager {
    pub fn new(
        dialer: Arc<dyn UdpOriginDialer>,
        limiter: Arc<dyn FlowLimiter>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            sessions: RwLock::new(FxHashMap::default()),
            dialer,
            limiter,
            metrics,
        }
    }

    /// Admits one flow: checks occupancy, takes a limiter token, dials
    /// the origin and inserts the new session.
    ///
    /// The dial happens outside the lock; the insert re-checks
    /// occupancy so a lost race rolls back cleanly instead of clobbering
    /// the winner.
    pub async fn register_session(
        &self,
        registration: &SessionRegistration,
        conn: Arc<dyn DatagramConn>,
        conn_token: CancellationToken,
        conn_index: u8,
    ) -> Result<Arc<Session>, RegisterError> {
        self.check_occupancy(registration.id, conn_index)?;

        self.limiter
            .acquire(FLOW_KIND_UDP)
            .map_err(|_| RegisterError::RateLimited)?;

        let origin = match self.dialer.dial_udp(registration.dest).await {
            Ok(origin) => origin,
            Err(err) => {
                self.limiter.release();
                return Err(RegisterError::Dial(err));
            }
        };

        let session = Session::new(
            registration.id,
            origin,
            conn,
            conn_token,
            conn_index,
            registration.idle_hint,
            self.metrics.clone(),
        );

        let mut sessions = self.write_lock();
        match sessions.entry(registration.id) {
            Entry::Occupied(entry) => {
                let existing_index = entry.get().conn_index();
                drop(sessions);
                session.close();
                self.limiter.release();
                if existing_index == conn_index {
                    Err(RegisterError::AlreadyRegistered)
                } else {
                    Err(RegisterError::BoundToOtherConn)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(session)
            }
        }
    }

    pub fn get_session(&self, id: RequestId) -> Option<Arc<Session>> {
        self.read_lock().get(&id).cloned()
    }

    /// Removes and closes a session, returning its limiter token.
    /// Calling it again for the same id is a no-op.
    pub fn unregister_session(&self, id: RequestId) {
        let removed = self.write_lock().remove(&id);
        if let Some(session) = removed {
            session.close();
            self.limiter.release();
        }
    }

    pub fn session_count(&self) -> usize {
        self.read_lock().len()
    }

    pub fn session_info(&self, id: RequestId) -> Option<SessionInfo> {
        self.read_lock().get(&id).map(|session| SessionInfo {
            id,
            conn_index: session.conn_index(),
            peer: session.origin().peer_addr().ok(),
        })
    }

    fn check_occupancy(&self, id: RequestId, conn_index: u8) -> Result<(), RegisterError> {
        match self.read_lock().get(&id) {
            Some(existing) if existing.conn_index() == conn_index => {
                Err(RegisterError::AlreadyRegistered)
            }
            Some(_) => Err(RegisterError::BoundToOtherConn),
            None => Ok(()),
        }
    }

    fn read_lock(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, FxHashMap<RequestId, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, FxHashMap<RequestId, Arc<Session>>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
