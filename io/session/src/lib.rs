//! session - pooled HTTP/2 sessions for RPC clients.
//!
//! A [`SessionManager`] keeps a small pool of HTTP/2 connections per target
//! address. Callers [`acquire`](SessionManager::acquire) a [`Lease`] for one
//! stream; dropping the lease returns the slot. The manager opens at most
//! one session per target at a time, keeps sessions alive with PINGs and
//! closes sessions that stay idle, always waiting for in-flight streams.

mod config;
mod error;
mod keepalive;
mod manager;
pub mod metrics;
mod session;

pub use config::SessionConfig;
pub use error::{SessionError, status_from_h2};
pub use manager::SessionManager;
pub use session::{Lease, Session, SessionState};
