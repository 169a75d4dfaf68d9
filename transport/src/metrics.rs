//! Client and server call metrics.

use metriken::{Counter, Gauge, metric};

// Client
#[metric(
    name = "client_calls_started",
    description = "Outbound calls started"
)]
pub static CLIENT_CALLS: Counter = Counter::new();

#[metric(
    name = "client_calls_failed",
    description = "Outbound calls that ended with a non-OK status"
)]
pub static CLIENT_CALLS_FAILED: Counter = Counter::new();

#[metric(
    name = "client_deadlines_exceeded",
    description = "Outbound calls abandoned at their deadline"
)]
pub static CLIENT_DEADLINES_EXCEEDED: Counter = Counter::new();

// Server
#[metric(
    name = "server_connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "server_connections_active",
    description = "Number of currently open connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "server_calls",
    description = "Inbound calls received"
)]
pub static SERVER_CALLS: Counter = Counter::new();

#[metric(
    name = "server_calls_active",
    description = "Inbound calls currently running a handler"
)]
pub static SERVER_CALLS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "server_calls_rejected",
    description = "Inbound calls rejected before reaching a handler"
)]
pub static SERVER_CALLS_REJECTED: Counter = Counter::new();

#[metric(
    name = "server_calls_failed",
    description = "Inbound calls whose handler ended with a non-OK status"
)]
pub static SERVER_CALLS_FAILED: Counter = Counter::new();

#[metric(
    name = "server_deadlines_exceeded",
    description = "Handlers cut off at the caller's deadline"
)]
pub static SERVER_DEADLINES_EXCEEDED: Counter = Counter::new();
