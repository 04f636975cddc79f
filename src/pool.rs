use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::backend::{BackendSession, SessionAuthenticator, SessionId};
use crate::error::ProxyError;
use crate::location::DcId;
use crate::streamer::ChunkStreamer;

type MediaSessionCell = Arc<OnceCell<Arc<dyn BackendSession>>>;

/// A backend session plus the number of streams currently running on it.
pub struct PooledSession {
    id: SessionId,
    backend: Arc<dyn BackendSession>,
    load: AtomicU64,
    /// Sessions opened in other datacenters on behalf of this one.
    media_sessions: Mutex<HashMap<DcId, MediaSessionCell>>,
}

impl PooledSession {
    fn new(id: SessionId, backend: Arc<dyn BackendSession>) -> Self {
        Self {
            id,
            backend,
            load: AtomicU64::new(0),
            media_sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn datacenter(&self) -> DcId {
        self.backend.datacenter()
    }

    pub fn load(&self) -> u64 {
        self.load.load(Ordering::Acquire)
    }

    /// Add `delta` to the load counter in one atomic step and return the new
    /// value. A delta that would take the counter below zero is refused and
    /// leaves it untouched.
    pub fn adjust_load(&self, delta: i64) -> Result<u64, ProxyError> {
        self.load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add_signed(delta)
            })
            .map(|prev| prev.wrapping_add_signed(delta))
            .map_err(|cur| {
                ProxyError::Internal(format!(
                    "load counter of session {} cannot move by {delta} from {cur}",
                    self.id
                ))
            })
    }

    /// Count one in-flight stream until the returned claim is dropped.
    pub fn claim(self: &Arc<Self>) -> LoadClaim {
        // Incrementing a u64 by one cannot underflow.
        let _ = self.adjust_load(1);
        LoadClaim {
            session: self.clone(),
        }
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("datacenter", &self.datacenter())
            .field("load", &self.load())
            .finish()
    }
}

/// Holds one unit of a session's load counter; releases it on drop.
#[must_use = "dropping the claim releases the load immediately"]
pub struct LoadClaim {
    session: Arc<PooledSession>,
}

impl LoadClaim {
    pub fn session_id(&self) -> SessionId {
        self.session.id
    }
}

impl Drop for LoadClaim {
    fn drop(&mut self) {
        if let Err(e) = self.session.adjust_load(-1) {
            error!(session = self.session.id, "releasing load claim: {e}");
        }
    }
}

/// Interchangeable backend sessions with least-loaded selection.
pub struct SessionPool {
    sessions: RwLock<BTreeMap<SessionId, Arc<PooledSession>>>,
    streamers: Mutex<HashMap<SessionId, Arc<ChunkStreamer>>>,
    authenticator: Arc<dyn SessionAuthenticator>,
}

impl SessionPool {
    pub fn new(authenticator: Arc<dyn SessionAuthenticator>) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            streamers: Mutex::new(HashMap::new()),
            authenticator,
        }
    }

    /// Add a session with zero load. Returns false, and keeps the existing
    /// session, if `id` is already registered.
    pub fn register(&self, id: SessionId, backend: Arc<dyn BackendSession>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return false;
        }
        let datacenter = backend.datacenter();
        sessions.insert(id, Arc::new(PooledSession::new(id, backend)));
        info!(session = id, datacenter, "session registered");
        true
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<PooledSession>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn load(&self, id: SessionId) -> Option<u64> {
        self.sessions.read().get(&id).map(|s| s.load())
    }

    /// The session with the fewest in-flight streams; the lowest id wins ties.
    pub fn select_least_loaded(&self) -> Result<Arc<PooledSession>, ProxyError> {
        self.sessions
            .read()
            .values()
            .min_by_key(|s| s.load())
            .cloned()
            .ok_or(ProxyError::PoolUnavailable)
    }

    pub fn adjust_load(&self, id: SessionId, delta: i64) -> Result<u64, ProxyError> {
        self.session(id)
            .ok_or(ProxyError::PoolUnavailable)?
            .adjust_load(delta)
    }

    /// Backend to use for a file stored in `datacenter`.
    ///
    /// Sessions in a foreign datacenter are opened once per
    /// `(session, datacenter)` pair and reused for the life of the process.
    /// Concurrent callers share one handshake; a failed handshake is retried
    /// by the next caller.
    pub async fn acquire(
        &self,
        session: &PooledSession,
        datacenter: DcId,
    ) -> Result<Arc<dyn BackendSession>, ProxyError> {
        if session.datacenter() == datacenter {
            return Ok(session.backend.clone());
        }
        let cell = session
            .media_sessions
            .lock()
            .entry(datacenter)
            .or_default()
            .clone();
        let backend = cell
            .get_or_try_init(|| async {
                info!(
                    session = session.id,
                    home = session.datacenter(),
                    datacenter,
                    "opening cross-datacenter session"
                );
                self.authenticator
                    .acquire_session(session.id, datacenter)
                    .await
            })
            .await?;
        Ok(backend.clone())
    }

    /// Streamer bound to `session`, created on first use.
    pub fn streamer(&self, session: &Arc<PooledSession>) -> Arc<ChunkStreamer> {
        self.streamers
            .lock()
            .entry(session.id)
            .or_insert_with(|| Arc::new(ChunkStreamer::new(session)))
            .clone()
    }
}
