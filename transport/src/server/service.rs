//! Per-request call execution.

use super::Shared;
use super::call::{CallInfo, Outbound, Responder, ServerCall};
use super::handler::SharedHandler;
use super::respond::{self, Exchange, ResponseBody};
use crate::codec::MessageWriter;
use crate::metrics::{
    SERVER_CALLS, SERVER_CALLS_ACTIVE, SERVER_CALLS_FAILED, SERVER_CALLS_REJECTED,
    SERVER_DEADLINES_EXCEEDED,
};
use http::{Request, Response};
use hyper::body::Incoming;
use rpc::{DispatchState, HeaderSet, InboundCall, Status};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::AbortHandle;
use tracing::debug;

/// Bound on handler events queued ahead of the response body.
const OUTBOUND_CAPACITY: usize = 16;

/// Counts calls that have not finished writing their response.
#[derive(Debug, Default)]
pub(crate) struct CallTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl CallTracker {
    pub(crate) fn enter(self: &Arc<Self>) -> CallGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        SERVER_CALLS_ACTIVE.increment();
        CallGuard(Arc::clone(self))
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until no call is active.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct CallGuard(Arc<CallTracker>);

impl Drop for CallGuard {
    fn drop(&mut self) {
        SERVER_CALLS_ACTIVE.decrement();
        if self.0.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Dispatch record of a running call.
///
/// Dropping it before the terminal status was written means the peer went
/// away: the call is marked failed and the handler task aborted.
pub(crate) struct CallTracking {
    inbound: InboundCall<SharedHandler>,
    task: AbortHandle,
    started: Instant,
    _guard: CallGuard,
}

impl CallTracking {
    pub(crate) fn finish(&mut self, status: &Status) {
        if self.inbound.complete(status.clone()).is_err() {
            return;
        }
        if !status.is_ok() {
            SERVER_CALLS_FAILED.increment();
        }
        debug!(
            path = self.inbound.path(),
            code = %status.code(),
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "call completed"
        );
    }
}

impl Drop for CallTracking {
    fn drop(&mut self) {
        if !self.inbound.state().is_terminal() {
            self.inbound
                .fail(Status::cancelled("call abandoned before it completed"));
            debug!(path = self.inbound.path(), "call abandoned by peer");
        }
        self.task.abort();
    }
}

impl Shared {
    /// Serve one HTTP request as an RPC.
    pub(crate) async fn handle(
        self: Arc<Self>,
        request: Request<Incoming>,
        remote: SocketAddr,
    ) -> Response<ResponseBody> {
        SERVER_CALLS.increment();
        let (parts, body) = request.into_parts();
        let headers = HeaderSet::from_header_map(&parts.headers);
        let mut inbound = self
            .dispatcher
            .dispatch(&parts.method, parts.uri.path(), headers);

        if inbound.state() == DispatchState::HeaderValidated && self.is_shutting_down() {
            inbound.fail(Status::unavailable("server shutting down"));
        }
        if inbound.state() != DispatchState::HeaderValidated {
            SERVER_CALLS_REJECTED.increment();
            return respond::rejected(&parts.method, &inbound);
        }

        let (Some(content_type), Some(route), Some(negotiation)) = (
            inbound.content_type(),
            inbound.route().cloned(),
            inbound.compression().cloned(),
        ) else {
            inbound.fail(Status::internal("validated call is incomplete"));
            return respond::rejected(&parts.method, &inbound);
        };
        if inbound.bind().is_err() {
            return respond::rejected(&parts.method, &inbound);
        }

        let deadline = inbound.timeout().map(|timeout| Instant::now() + timeout);
        let info = CallInfo {
            path: inbound.path().to_string(),
            method: Arc::clone(&route.method),
            content_type,
            identity: inbound.identity().clone(),
            deadline,
            remote_addr: remote,
        };
        debug!(
            path = %info.path,
            protocol = %content_type.protocol,
            %remote,
            timeout_ms = inbound.timeout().map(|t| t.as_millis() as u64),
            "call started"
        );

        let call = ServerCall::new(
            info,
            inbound.headers().clone(),
            body,
            negotiation.request,
            negotiation.error.clone(),
            self.config.read_max_bytes,
        );
        let writer = MessageWriter::new(negotiation.response.encoding, self.config.compress_min_bytes);
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let responder = Responder::new(
            tx.clone(),
            writer,
            content_type.enveloped,
            route.method.kind,
        );

        let guard = self.calls.enter();
        let force = self.force.subscribe();
        let handler = route.handler;
        let task = tokio::spawn(async move {
            let result = run_handler(handler, call, responder, deadline, force).await;
            let _ = tx.send(Outbound::Done(result)).await;
        });

        let tracking = CallTracking {
            inbound,
            task: task.abort_handle(),
            started: Instant::now(),
            _guard: guard,
        };
        respond::respond(Exchange {
            content_type,
            writer,
            accept: self.accept.clone(),
            rx,
            tracking,
        })
        .await
    }
}

/// Run a handler under the call deadline and the forced shutdown signal.
async fn run_handler(
    handler: SharedHandler,
    call: ServerCall,
    responder: Responder,
    deadline: Option<Instant>,
    mut force: watch::Receiver<bool>,
) -> Result<HeaderSet, Status> {
    let work = handler.handle(call, responder);
    let bounded = async move {
        match deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(deadline, work).await {
                    Ok(result) => result,
                    Err(_) => {
                        SERVER_DEADLINES_EXCEEDED.increment();
                        Err(Status::deadline_exceeded("deadline exceeded"))
                    }
                }
            }
            None => work.await,
        }
    };

    tokio::select! {
        result = bounded => result,
        _ = forced(&mut force) => Err(Status::unavailable("server shutting down")),
    }
}

async fn forced(force: &mut watch::Receiver<bool>) {
    if force.wait_for(|forced| *forced).await.is_err() {
        std::future::pending::<()>().await;
    }
}
