//! Keepalive PINGs.

use crate::metrics::PING_TIMEOUTS;
use crate::session::{Session, SessionState};
use h2::{Ping, PingPong};
use rpc::Status;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{trace, warn};

/// Ping the peer every interval until the session goes away.
///
/// A round is skipped when the session has no streams (unless `ping_idle`)
/// or when stream activity within the interval already proves the peer is
/// alive. An unanswered PING tears the session down.
pub(crate) async fn run(
    session: Weak<Session>,
    mut ping_pong: PingPong,
    interval_ms: Arc<AtomicU64>,
    timeout: Duration,
    ping_idle: bool,
) {
    loop {
        let interval = Duration::from_millis(interval_ms.load(Ordering::Acquire).max(1));
        tokio::time::sleep(interval).await;

        let Some(session) = session.upgrade() else {
            return;
        };
        if session.state() == SessionState::Closed {
            return;
        }
        if !ping_idle && session.open_streams() == 0 {
            continue;
        }
        if session.idle_for() < interval {
            continue;
        }

        match tokio::time::timeout(timeout, ping_pong.ping(Ping::opaque())).await {
            Ok(Ok(_)) => trace!(session = session.id(), "PING acknowledged"),
            Ok(Err(e)) => {
                trace!(session = session.id(), error = %e, "PING failed, connection is gone");
                return;
            }
            Err(_) => {
                PING_TIMEOUTS.increment();
                warn!(
                    session = session.id(),
                    target = %session.target(),
                    timeout_ms = timeout.as_millis() as u64,
                    "PING timed out, closing session"
                );
                session.abort(Status::unavailable("PING timed out"));
                return;
            }
        }
    }
}
