//! A single HTTP/2 session and the leases handed out on it.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::keepalive;
use crate::metrics::{DRAIN_TIMEOUTS, SESSIONS_ACTIVE, SESSIONS_CREATED, STREAMS_ACTIVE};
use bytes::Bytes;
use h2::client::{ResponseFuture, SendRequest};
use h2::{Reason, SendStream};
use parking_lot::Mutex;
use rpc::Status;
use std::fmt;
use std::future::{Future, poll_fn};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::Poll;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Connecting or handshaking.
    Opening = 0,
    /// Accepting new streams.
    Ready = 1,
    /// No new streams; waiting for open streams to finish.
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Opening,
            1 => SessionState::Ready,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One HTTP/2 connection to a target.
pub struct Session {
    id: u64,
    target: SocketAddr,
    state: AtomicU8,
    open_streams: AtomicUsize,
    /// Concurrency limit advertised by the peer, refreshed by the driver.
    max_streams: AtomicUsize,
    last_activity: Mutex<Instant>,
    sender: Mutex<Option<SendRequest<Bytes>>>,
    /// Why the session was torn down, when it was not a clean close.
    close_reason: Mutex<Option<Status>>,
    driver: Mutex<Option<AbortHandle>>,
    keepalive: Mutex<Option<AbortHandle>>,
    drained: Notify,
    /// Set once ENHANCE_YOUR_CALM slowed the keepalive down.
    calmed: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state())
            .field("open_streams", &self.open_streams())
            .finish()
    }
}

impl Session {
    /// Connect, handshake and start the connection driver.
    ///
    /// `ping_interval_ms` is shared with the other sessions of the target so
    /// a peer complaining about PINGs slows all of them down.
    pub(crate) async fn connect(
        id: u64,
        target: SocketAddr,
        config: &SessionConfig,
        ping_interval_ms: Arc<AtomicU64>,
    ) -> Result<Arc<Session>, SessionError> {
        let handshake = async {
            let tcp = TcpStream::connect(target)
                .await
                .map_err(|source| SessionError::Connect { target, source })?;
            if let Err(e) = tcp.set_nodelay(true) {
                debug!(%target, error = %e, "failed to set TCP_NODELAY");
            }
            h2::client::Builder::new()
                .handshake::<_, Bytes>(tcp)
                .await
                .map_err(|source| SessionError::Handshake { target, source })
        };

        let (sender, mut connection) = tokio::time::timeout(config.connect_timeout(), handshake)
            .await
            .map_err(|_| SessionError::ConnectTimeout { target })??;

        let ping_pong = connection.ping_pong();
        let session = Arc::new(Session {
            id,
            target,
            state: AtomicU8::new(SessionState::Ready as u8),
            open_streams: AtomicUsize::new(0),
            max_streams: AtomicUsize::new(connection.max_concurrent_send_streams()),
            last_activity: Mutex::new(Instant::now()),
            sender: Mutex::new(Some(sender)),
            close_reason: Mutex::new(None),
            driver: Mutex::new(None),
            keepalive: Mutex::new(None),
            drained: Notify::new(),
            calmed: AtomicBool::new(false),
        });
        SESSIONS_CREATED.increment();
        SESSIONS_ACTIVE.increment();

        let weak = Arc::downgrade(&session);
        let interval = Arc::clone(&ping_interval_ms);
        let drain = config.drain_timeout();
        // a spare handle reports a peer GOAWAY while streams are still open
        let mut watcher = session.sender();
        let driver = tokio::spawn(async move {
            let result = poll_fn(|cx| {
                let poll = Pin::new(&mut connection).poll(cx);
                if let Some(session) = weak.upgrade() {
                    session
                        .max_streams
                        .store(connection.max_concurrent_send_streams(), Ordering::Release);
                    if session.state() != SessionState::Ready {
                        watcher = None;
                    }
                    if let Some(handle) = watcher.as_mut()
                        && let Poll::Ready(Err(e)) = handle.poll_ready(cx)
                    {
                        watcher = None;
                        session.on_go_away(&e, &interval, drain);
                    }
                }
                poll
            })
            .await;
            if let Some(session) = weak.upgrade() {
                session.on_connection_end(result, &interval);
            }
        });
        *session.driver.lock() = Some(driver.abort_handle());

        if config.ping_interval().is_some()
            && let Some(ping_pong) = ping_pong
        {
            let task = tokio::spawn(keepalive::run(
                Arc::downgrade(&session),
                ping_pong,
                ping_interval_ms,
                config.ping_timeout(),
                config.ping_idle,
            ));
            *session.keepalive.lock() = Some(task.abort_handle());
        }

        debug!(session = id, %target, "session ready");
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::Acquire)
    }

    /// Peer's limit on concurrent streams.
    pub fn max_streams(&self) -> usize {
        self.max_streams.load(Ordering::Acquire).max(1)
    }

    /// Time since a stream was last opened or released.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Status recorded when the session was torn down abnormally.
    pub fn close_reason(&self) -> Option<Status> {
        self.close_reason.lock().clone()
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Reserve a stream slot. With `respect_limit` unset the reservation may
    /// exceed the peer's limit and the lease waits for capacity instead.
    pub(crate) fn try_reserve(&self, respect_limit: bool) -> bool {
        let max = self.max_streams();
        let mut current = self.open_streams.load(Ordering::Acquire);
        loop {
            if self.state() != SessionState::Ready || (respect_limit && current >= max) {
                return false;
            }
            match self.open_streams.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        STREAMS_ACTIVE.increment();

        // an idle close may have won the race after the state check
        if self.state() != SessionState::Ready {
            self.release_stream();
            return false;
        }
        self.touch();
        true
    }

    pub(crate) fn release_stream(&self) {
        let previous = self.open_streams.fetch_sub(1, Ordering::AcqRel);
        STREAMS_ACTIVE.decrement();
        self.touch();
        if previous == 1 {
            self.drained.notify_waiters();
        }
    }

    fn sender(&self) -> Option<SendRequest<Bytes>> {
        self.sender.lock().clone()
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stop handing out streams. Returns false if the session was not Ready.
    pub(crate) fn begin_close(&self) -> bool {
        if !self.transition(SessionState::Ready, SessionState::Closing) {
            return false;
        }
        self.sender.lock().take();
        trace!(session = self.id, target = %self.target, "session closing");
        true
    }

    /// Begin closing if the session has been idle for `threshold`.
    pub(crate) fn begin_idle_close(&self, threshold: Duration) -> bool {
        if self.open_streams() != 0 || self.idle_for() < threshold {
            return false;
        }
        self.begin_close()
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.open_streams() == 0 || self.state() == SessionState::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Close gracefully. Open streams are allowed to finish; with a drain
    /// timeout, streams still open when it elapses are aborted.
    pub async fn close(&self, drain: Option<Duration>) {
        self.begin_close();
        if self.state() == SessionState::Closed {
            return;
        }

        match drain {
            None => self.wait_drained().await,
            Some(limit) => {
                if tokio::time::timeout(limit, self.wait_drained()).await.is_err() {
                    DRAIN_TIMEOUTS.increment();
                    warn!(
                        session = self.id,
                        target = %self.target,
                        open_streams = self.open_streams(),
                        "drain timed out, aborting open streams"
                    );
                    self.abort(Status::unavailable("session closed before the stream finished"));
                    return;
                }
            }
        }
        self.finish();
    }

    /// Tear the session down now, failing any open streams.
    pub(crate) fn abort(&self, reason: Status) {
        if self.state() == SessionState::Closed {
            return;
        }
        self.close_reason.lock().get_or_insert(reason);
        self.finish();
    }

    fn finish(&self) {
        let previous = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        if previous == SessionState::Closed as u8 {
            return;
        }
        SESSIONS_ACTIVE.decrement();
        self.sender.lock().take();
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        if let Some(keepalive) = self.keepalive.lock().take() {
            keepalive.abort();
        }
        self.drained.notify_waiters();
        debug!(session = self.id, target = %self.target, "session closed");
    }

    /// Double the target's keepalive interval, once per session.
    fn calm_down(&self, ping_interval_ms: &AtomicU64) {
        if self.calmed.swap(true, Ordering::AcqRel) {
            return;
        }
        let interval = ping_interval_ms.load(Ordering::Acquire);
        let doubled = interval.saturating_mul(2);
        ping_interval_ms.store(doubled, Ordering::Release);
        warn!(
            target = %self.target,
            ping_interval_ms = doubled,
            "peer sent ENHANCE_YOUR_CALM, doubling keepalive interval"
        );
    }

    /// The peer sent GOAWAY: refuse new streams and let open ones drain.
    fn on_go_away(self: Arc<Self>, err: &h2::Error, ping_interval_ms: &AtomicU64, drain: Duration) {
        if err.reason() == Some(Reason::ENHANCE_YOUR_CALM) {
            self.calm_down(ping_interval_ms);
        }
        if !self.begin_close() {
            return;
        }
        debug!(
            session = self.id,
            target = %self.target,
            open_streams = self.open_streams(),
            error = %err,
            "peer is going away"
        );
        tokio::spawn(async move { self.close(Some(drain)).await });
    }

    fn on_connection_end(&self, result: Result<(), h2::Error>, ping_interval_ms: &AtomicU64) {
        match result {
            Ok(()) => debug!(session = self.id, target = %self.target, "connection finished"),
            Err(e) => {
                if e.is_go_away() && e.reason() == Some(Reason::ENHANCE_YOUR_CALM) {
                    self.calm_down(ping_interval_ms);
                } else {
                    debug!(session = self.id, target = %self.target, error = %e, "connection error");
                }
                self.close_reason
                    .lock()
                    .get_or_insert_with(|| crate::error::status_from_h2(&e));
            }
        }
        // the driver task is exiting on its own
        self.driver.lock().take();
        self.finish();
    }
}

/// A reserved stream slot on a session.
///
/// Dropping the lease releases the slot.
pub struct Lease {
    session: Arc<Session>,
    sender: SendRequest<Bytes>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("session", &self.session).finish()
    }
}

impl Lease {
    /// Wrap a reserved slot and wait until the session can open a stream.
    ///
    /// The slot is released if this fails or the future is dropped.
    pub(crate) async fn ready(session: Arc<Session>) -> Result<Lease, SessionError> {
        let Some(sender) = session.sender() else {
            session.release_stream();
            return Err(SessionError::Closed);
        };
        let mut lease = Lease { session, sender };
        lease.sender = lease
            .sender
            .clone()
            .ready()
            .await
            .map_err(SessionError::Refused)?;
        Ok(lease)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Open the stream this lease was reserved for.
    pub fn send_request(
        &mut self,
        request: http::Request<()>,
        end_of_stream: bool,
    ) -> Result<(ResponseFuture, SendStream<Bytes>), h2::Error> {
        self.session.touch();
        self.sender.send_request(request, end_of_stream)
    }

    /// Record stream activity for keepalive and idle accounting.
    pub fn touch(&self) {
        self.session.touch();
    }

    /// Status explaining a stream failure, preferring the reason the
    /// session itself went down.
    pub fn status_for(&self, err: &h2::Error) -> Status {
        self.session
            .close_reason()
            .unwrap_or_else(|| crate::error::status_from_h2(err))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.session.release_stream();
    }
}
