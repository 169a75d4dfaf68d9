//! transport - gRPC, gRPC-Web and Triple over HTTP/2 and HTTP/1.1.
//!
//! The [`Client`] leases streams from a [`session::SessionManager`] and
//! drives unary and streaming calls. The [`Server`] accepts HTTP/1.1 and
//! HTTP/2 connections, dispatches each request through the `rpc`
//! dispatcher and runs the registered [`Handler`].

pub mod client;
pub mod config;
mod error;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod signal;

mod codec;

pub use client::{CallHandle, CallOptions, CallResult, Client, UnaryResponse};
pub use config::Config;
pub use error::Error;
pub use server::{
    BoxFuture, CallInfo, Handler, Responder, Server, ServerBuilder, ServerCall, ServerHandle,
    SharedHandler, UnaryReply, UnaryRequest, handler_fn, unary_fn,
};

use tokio::task::AbortHandle;

/// Aborts a background task when dropped.
pub(crate) struct AbortOnDrop(pub(crate) AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
