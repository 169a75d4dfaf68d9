//! RPC server.
//!
//! Accepts HTTP/1.1 and HTTP/2 connections on one listener, dispatches
//! every request through the registry and runs the matching handler.
//!
//! # Shutdown
//!
//! [`ServerHandle::shutdown`] stops the accept loop and asks every
//! connection to close gracefully. Calls already running get up to
//! `drain_timeout_ms` to finish; whatever is left is completed with
//! Unavailable.

mod call;
mod handler;
mod respond;
mod service;

pub use call::{CallInfo, Responder, ServerCall};
pub use handler::{
    BoxFuture, Handler, SharedHandler, UnaryReply, UnaryRequest, handler_fn, unary_fn,
};

use crate::config::{Config, ServerConfig};
use crate::error::Error;
use crate::metrics::{CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rpc::compression::accept_header;
use rpc::{DispatchOptions, Dispatcher, Registry, RegistryError, ServiceDescriptor};
use service::CallTracker;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Extra time connections get to flush after the call drain ends.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// State shared by the accept loop, connections and handles.
struct Shared {
    dispatcher: Dispatcher<SharedHandler>,
    config: ServerConfig,
    accept: String,
    calls: Arc<CallTracker>,
    /// Stop accepting and close connections gracefully.
    shutdown: watch::Sender<bool>,
    /// Abort the handlers still running.
    force: watch::Sender<bool>,
    /// True while no accept loop is running.
    stopped: watch::Sender<bool>,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Collects services before the server is built.
#[derive(Default)]
pub struct ServerBuilder {
    registry: Registry<SharedHandler>,
}

impl ServerBuilder {
    /// Register a service. Its method table is validated here.
    pub fn register(
        mut self,
        service: ServiceDescriptor,
        handler: SharedHandler,
    ) -> Result<Self, RegistryError> {
        let name = service.name.clone();
        let methods = service.methods.len();
        self.registry.register(service, handler)?;
        debug!(service = %name, methods, "registered service");
        Ok(self)
    }

    /// Validate `config` and build the server.
    pub fn build(self, config: &Config) -> Result<Server, Error> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let encodings = config.server.encodings();
        let options = DispatchOptions {
            content_types: (&config.content_types).into(),
            max_timeout_ms: config.server.max_timeout_ms,
            accept_compression: encodings.clone(),
            require_protocol_version: config.server.require_protocol_version,
        };

        Ok(Server {
            shared: Arc::new(Shared {
                dispatcher: Dispatcher::new(Arc::new(self.registry), options),
                config: config.server.clone(),
                accept: accept_header(&encodings),
                calls: Arc::new(CallTracker::default()),
                shutdown: watch::channel(false).0,
                force: watch::channel(false).0,
                stopped: watch::channel(true).0,
            }),
        })
    }
}

/// A configured server, ready to serve a listener.
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, Error> {
        let addr = self.shared.config.address;
        TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })
    }

    /// Calls that have not finished writing their response.
    pub fn active_calls(&self) -> usize {
        self.shared.calls.active()
    }

    /// Serve connections until [`ServerHandle::shutdown`] is called.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Error> {
        let shared = self.shared;
        shared.stopped.send_replace(false);
        let mut shutdown = shared.shutdown.subscribe();
        let mut connections = JoinSet::new();

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "listening");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        CONNECTIONS_ACCEPTED.increment();
                        connections.spawn(serve_connection(Arc::clone(&shared), stream, remote));
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                },
                _ = stopping(&mut shutdown) => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        info!(connections = connections.len(), "stopped accepting connections");

        let limit = shared.config.drain_timeout() + CLOSE_GRACE;
        let closed = tokio::time::timeout(limit, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if closed.is_err() {
            warn!(remaining = connections.len(), "closing connections that did not drain");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        info!("server stopped");
        shared.stopped.send_replace(true);
        Ok(())
    }
}

/// Controls a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Calls that have not finished writing their response.
    pub fn active_calls(&self) -> usize {
        self.shared.calls.active()
    }

    /// Stop accepting, drain in-flight calls for up to the drain timeout,
    /// abort the rest with Unavailable, and wait for the server to stop.
    pub async fn shutdown(&self) {
        if !self.shared.shutdown.send_replace(true) {
            let drain = self.shared.config.drain_timeout();
            info!(
                active_calls = self.shared.calls.active(),
                drain_ms = drain.as_millis() as u64,
                "shutting down"
            );
            if tokio::time::timeout(drain, self.shared.calls.wait_idle())
                .await
                .is_err()
            {
                warn!(
                    remaining = self.shared.calls.active(),
                    "drain timeout elapsed, aborting calls"
                );
                self.shared.force.send_replace(true);
            }
        }

        let mut stopped = self.shared.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

/// Resolves once shutdown is requested. The watch guard is released before
/// returning so callers may await afterwards.
async fn stopping(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn serve_connection(shared: Arc<Shared>, stream: TcpStream, remote: SocketAddr) {
    CONNECTIONS_ACTIVE.increment();
    let _ = stream.set_nodelay(true);
    let mut shutdown = shared.shutdown.subscribe();

    let mut builder = auto::Builder::new(TokioExecutor::new());
    if !shared.config.http1 {
        builder = builder.http2_only();
    }

    let service = service_fn(move |request| {
        let shared = Arc::clone(&shared);
        async move { Ok::<_, Infallible>(shared.handle(request, remote).await) }
    });
    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = stopping(&mut shutdown) => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    if let Err(e) = result {
        debug!(%remote, error = %e, "connection closed with error");
    }
    CONNECTIONS_ACTIVE.decrement();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_serve_futures_are_send() {
        let server = Server::builder().build(&Config::default()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();

        assert_send(&serve_connection(Arc::clone(&server.shared), stream, addr));
        assert_send(&server.serve(listener));
    }
}
