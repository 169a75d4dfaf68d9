//! Session pool metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "sessions_created",
    description = "Total number of HTTP/2 sessions opened"
)]
pub static SESSIONS_CREATED: Counter = Counter::new();

#[metric(
    name = "sessions_active",
    description = "Number of HTTP/2 sessions not yet closed"
)]
pub static SESSIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "session_connect_errors",
    description = "Failed attempts to open a session"
)]
pub static CONNECT_ERRORS: Counter = Counter::new();

#[metric(
    name = "session_streams_active",
    description = "Streams currently leased across all sessions"
)]
pub static STREAMS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "session_idle_evictions",
    description = "Sessions closed after staying idle"
)]
pub static IDLE_EVICTIONS: Counter = Counter::new();

#[metric(
    name = "session_ping_timeouts",
    description = "Sessions closed because a keepalive PING went unanswered"
)]
pub static PING_TIMEOUTS: Counter = Counter::new();

#[metric(
    name = "session_drain_timeouts",
    description = "Sessions aborted with streams still open after the drain timeout"
)]
pub static DRAIN_TIMEOUTS: Counter = Counter::new();
