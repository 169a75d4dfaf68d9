//! Per-target session pools.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::metrics::{CONNECT_ERRORS, IDLE_EVICTIONS};
use crate::session::{Lease, Session, SessionState};
use ahash::AHashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Sessions to one target address.
struct TargetPool {
    target: SocketAddr,
    sessions: Mutex<Vec<Arc<Session>>>,
    /// Serializes session creation so concurrent acquires share one dial.
    opening: tokio::sync::Mutex<()>,
    /// Number of dials in progress.
    dialing: AtomicUsize,
    /// Keepalive interval shared by the target's sessions.
    ping_interval_ms: Arc<AtomicU64>,
}

impl TargetPool {
    fn new(target: SocketAddr, config: &SessionConfig) -> Self {
        Self {
            target,
            sessions: Mutex::new(Vec::new()),
            opening: tokio::sync::Mutex::new(()),
            dialing: AtomicUsize::new(0),
            ping_interval_ms: Arc::new(AtomicU64::new(config.ping_interval_ms.unwrap_or(0))),
        }
    }

    /// Reserve a slot on the least loaded ready session.
    ///
    /// Sessions at the peer's stream limit are skipped while another
    /// session may still be opened; once the pool is full the least loaded
    /// session is used anyway and the lease waits for capacity.
    fn reserve(&self, max_sessions: usize) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.state() != SessionState::Closed);

        let mut ready: Vec<&Arc<Session>> = sessions
            .iter()
            .filter(|s| s.state() == SessionState::Ready)
            .collect();
        ready.sort_by_key(|s| s.open_streams());

        if let Some(session) = ready.iter().find(|s| s.try_reserve(true)) {
            return Some(Arc::clone(session));
        }
        if ready.len() >= max_sessions
            && let Some(session) = ready.iter().find(|s| s.try_reserve(false))
        {
            return Some(Arc::clone(session));
        }
        None
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().clone()
    }

    /// No live session and no dial in progress.
    fn is_empty(&self) -> bool {
        self.dialing.load(Ordering::Acquire) == 0
            && self
                .sessions
                .lock()
                .iter()
                .all(|s| s.state() == SessionState::Closed)
    }
}

/// Owns the HTTP/2 sessions of a client.
///
/// Cheap to share: clone the `Arc` returned by [`SessionManager::new`].
pub struct SessionManager {
    config: SessionConfig,
    pools: Mutex<AHashMap<SocketAddr, Arc<TargetPool>>>,
    next_id: AtomicU64,
    created: AtomicU64,
    reaper_started: AtomicBool,
    shutdown: AtomicBool,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            pools: Mutex::new(AHashMap::new()),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            reaper_started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Sessions this manager has opened so far.
    pub fn sessions_created(&self) -> u64 {
        self.created.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn pool(&self, target: SocketAddr) -> Arc<TargetPool> {
        let mut pools = self.pools.lock();
        Arc::clone(
            pools
                .entry(target)
                .or_insert_with(|| Arc::new(TargetPool::new(target, &self.config))),
        )
    }

    /// Targets with a pool entry.
    pub fn target_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Drop pools that hold no live session. A pool some acquire is still
    /// using is kept.
    fn prune(&self) -> usize {
        let mut pools = self.pools.lock();
        let before = pools.len();
        pools.retain(|_, pool| Arc::strong_count(pool) > 1 || !pool.is_empty());
        before - pools.len()
    }

    fn existing_pool(&self, target: SocketAddr) -> Option<Arc<TargetPool>> {
        self.pools.lock().get(&target).cloned()
    }

    fn all_sessions(&self) -> Vec<Arc<Session>> {
        let pools: Vec<_> = self.pools.lock().values().cloned().collect();
        pools.iter().flat_map(|p| p.snapshot()).collect()
    }

    /// Lease a stream on a session to `target`, opening a session if none
    /// has capacity.
    ///
    /// Concurrent callers that find no usable session wait for a single
    /// dial instead of each opening their own. A session that refuses the
    /// stream (for example after GOAWAY) is retired and the lease retried;
    /// a freshly opened session that refuses fails the acquire.
    pub async fn acquire(self: &Arc<Self>, target: SocketAddr) -> Result<Lease, SessionError> {
        if self.is_shutdown() {
            return Err(SessionError::Shutdown);
        }
        self.ensure_reaper();
        let pool = self.pool(target);
        let max_sessions = self.config.max_sessions_per_target;

        loop {
            let (session, fresh) = match pool.reserve(max_sessions) {
                Some(session) => (session, false),
                None => {
                    let _opening = pool.opening.lock().await;
                    match pool.reserve(max_sessions) {
                        Some(session) => (session, false),
                        None => (self.open(&pool).await?, true),
                    }
                }
            };

            match Lease::ready(Arc::clone(&session)).await {
                Ok(lease) => return Ok(lease),
                Err(e) if fresh => {
                    self.retire(&session);
                    return Err(e);
                }
                Err(e) => {
                    debug!(session = session.id(), %target, error = %e, "retiring session");
                    self.retire(&session);
                }
            }
        }
    }

    /// Return a lease. Equivalent to dropping it.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    /// Dial a new session. Called with the pool's opening lock held.
    async fn open(&self, pool: &TargetPool) -> Result<Arc<Session>, SessionError> {
        if self.is_shutdown() {
            return Err(SessionError::Shutdown);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        pool.dialing.fetch_add(1, Ordering::AcqRel);
        let result = Session::connect(
            id,
            pool.target,
            &self.config,
            Arc::clone(&pool.ping_interval_ms),
        )
        .await;
        pool.dialing.fetch_sub(1, Ordering::AcqRel);

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                CONNECT_ERRORS.increment();
                warn!(target = %pool.target, error = %e, "failed to open session");
                return Err(e);
            }
        };
        self.created.fetch_add(1, Ordering::AcqRel);

        if !session.try_reserve(false) {
            // torn down before the first stream
            return Err(SessionError::Closed);
        }
        pool.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }

    /// Close a session in the background, letting its streams finish.
    fn retire(&self, session: &Arc<Session>) {
        if !session.begin_close() {
            return;
        }
        let session = Arc::clone(session);
        let drain = self.config.drain_timeout();
        tokio::spawn(async move { session.close(Some(drain)).await });
    }

    /// Aggregate state of the sessions to `target`.
    ///
    /// `None` when the manager never connected there. A dial in progress
    /// reports `Opening`; otherwise the most usable session state wins.
    pub fn state(&self, target: SocketAddr) -> Option<SessionState> {
        let pool = self.existing_pool(target)?;
        let states: Vec<_> = pool.snapshot().iter().map(|s| s.state()).collect();

        if states.contains(&SessionState::Ready) {
            Some(SessionState::Ready)
        } else if pool.dialing.load(Ordering::Acquire) > 0 {
            Some(SessionState::Opening)
        } else if states.contains(&SessionState::Closing) {
            Some(SessionState::Closing)
        } else {
            Some(SessionState::Closed)
        }
    }

    /// Sessions to `target` that are not yet closed.
    pub fn session_count(&self, target: SocketAddr) -> usize {
        self.existing_pool(target).map_or(0, |pool| {
            pool.snapshot()
                .iter()
                .filter(|s| s.state() != SessionState::Closed)
                .count()
        })
    }

    /// Streams currently leased on sessions to `target`.
    pub fn open_streams(&self, target: SocketAddr) -> usize {
        self.existing_pool(target).map_or(0, |pool| {
            pool.snapshot().iter().map(|s| s.open_streams()).sum()
        })
    }

    /// Close every session idle for at least the idle timeout. Sessions
    /// with open streams are never touched. Returns how many were closed.
    pub fn evict_idle(&self) -> usize {
        let Some(threshold) = self.config.idle_timeout() else {
            return 0;
        };

        let mut evicted = 0;
        for session in self.all_sessions() {
            if session.begin_idle_close(threshold) {
                IDLE_EVICTIONS.increment();
                debug!(
                    session = session.id(),
                    target = %session.target(),
                    "closing idle session"
                );
                // a stream reserved during the race is allowed to finish
                tokio::spawn(async move { session.close(None).await });
                evicted += 1;
            }
        }

        let pruned = self.prune();
        if pruned > 0 {
            trace!(pruned, "dropped empty target pools");
        }
        evicted
    }

    fn ensure_reaper(self: &Arc<Self>) {
        let Some(idle) = self.config.idle_timeout() else {
            return;
        };
        if self.reaper_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let period = (idle / 4).clamp(Duration::from_millis(5), Duration::from_secs(1));
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.is_shutdown() {
                    break;
                }
                manager.evict_idle();
            }
        });
    }

    /// Close the sessions to one target, waiting up to the drain timeout
    /// for their streams.
    pub async fn close_target(&self, target: SocketAddr) {
        let Some(pool) = self.existing_pool(target) else {
            return;
        };
        let sessions = pool.snapshot();
        let drain = self.config.drain_timeout();
        join_all(sessions.iter().map(|s| s.close(Some(drain)))).await;
        drop(pool);
        self.prune();
    }

    /// Refuse new acquires and close every session, waiting up to the
    /// drain timeout for open streams.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions = self.all_sessions();
        info!(sessions = sessions.len(), "shutting down session manager");

        let drain = self.config.drain_timeout();
        join_all(sessions.iter().map(|s| s.close(Some(drain)))).await;
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for session in self.all_sessions() {
            session.abort(rpc::Status::unavailable("session manager dropped"));
        }
    }
}
