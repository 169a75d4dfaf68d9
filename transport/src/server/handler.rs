//! The handler contract and closure adapters.

use super::call::{CallInfo, Responder, ServerCall};
use bytes::Bytes;
use rpc::{HeaderSet, Status};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Serves the methods of one registered service.
///
/// `handle` reads the request messages from `call` and writes response
/// headers and messages through `responder`. It resolves to the response
/// trailers on success or to the terminal status on failure.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, call: ServerCall, responder: Responder) -> BoxFuture<Result<HeaderSet, Status>>;
}

pub type SharedHandler = Arc<dyn Handler>;

/// A unary request after its single message has been read.
#[derive(Debug, Clone)]
pub struct UnaryRequest {
    pub info: CallInfo,
    pub metadata: HeaderSet,
    pub message: Bytes,
}

/// The response of a unary handler.
#[derive(Debug, Clone, Default)]
pub struct UnaryReply {
    pub message: Bytes,
    pub headers: HeaderSet,
    pub trailers: HeaderSet,
}

impl UnaryReply {
    pub fn new(message: impl Into<Bytes>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    pub fn trailer(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers.append(key, value);
        self
    }
}

struct UnaryFn<F>(Arc<F>);

impl<F, Fut> Handler for UnaryFn<F>
where
    F: Fn(UnaryRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<UnaryReply, Status>> + Send + 'static,
{
    fn handle(&self, mut call: ServerCall, mut responder: Responder) -> BoxFuture<Result<HeaderSet, Status>> {
        let f = Arc::clone(&self.0);
        Box::pin(async move {
            let Some(message) = call.message().await? else {
                return Err(Status::internal("missing request message"));
            };
            let request = UnaryRequest {
                info: call.info().clone(),
                metadata: call.metadata().clone(),
                message,
            };

            let reply = (*f)(request).await?;
            if !reply.headers.is_empty() {
                responder.send_headers(reply.headers).await?;
            }
            responder.send(reply.message).await?;
            Ok(reply.trailers)
        })
    }
}

/// Adapt an async closure into a handler for unary methods.
pub fn unary_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(UnaryRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<UnaryReply, Status>> + Send + 'static,
{
    Arc::new(UnaryFn(Arc::new(f)))
}

struct HandlerFn<F>(F);

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(ServerCall, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HeaderSet, Status>> + Send + 'static,
{
    fn handle(&self, call: ServerCall, responder: Responder) -> BoxFuture<Result<HeaderSet, Status>> {
        Box::pin((self.0)(call, responder))
    }
}

/// Adapt an async closure into a handler with full access to the call.
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(ServerCall, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HeaderSet, Status>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}
