//! The request and response halves a handler works with.

use crate::codec::MessageWriter;
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use rpc::protocol::open_message;
use rpc::{CallKind, ContentType, Encoding, HeaderSet, MessageDecoder, MethodDescriptor, Protocol};
use rpc::{ServiceIdentity, Status};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// What the server knows about an inbound call.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub path: String,
    pub method: Arc<MethodDescriptor>,
    pub content_type: ContentType,
    pub identity: ServiceIdentity,
    /// Set when the caller sent a timeout.
    pub deadline: Option<Instant>,
    pub remote_addr: SocketAddr,
}

impl CallInfo {
    pub fn protocol(&self) -> Protocol {
        self.content_type.protocol
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// The inbound half of a call: request metadata and messages.
pub struct ServerCall {
    info: CallInfo,
    metadata: HeaderSet,
    body: Option<Incoming>,
    decoder: MessageDecoder,
    encoding: Encoding,
    /// Negotiation error for an encoding we cannot read.
    unsupported: Option<Status>,
    read_max_bytes: usize,
}

impl ServerCall {
    pub(crate) fn new(
        info: CallInfo,
        metadata: HeaderSet,
        body: Incoming,
        encoding: Encoding,
        unsupported: Option<Status>,
        read_max_bytes: usize,
    ) -> Self {
        Self {
            info,
            metadata,
            body: Some(body),
            decoder: MessageDecoder::new(read_max_bytes),
            encoding,
            unsupported,
            read_max_bytes,
        }
    }

    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    /// Request headers as received.
    pub fn metadata(&self) -> &HeaderSet {
        &self.metadata
    }

    /// Next request message, or `None` once the caller half-closed.
    pub async fn message(&mut self) -> Result<Option<Bytes>, Status> {
        if !self.info.content_type.enveloped {
            return self.whole_body().await;
        }

        loop {
            if let Some(envelope) = self.decoder.decode()? {
                return open_message(
                    &envelope,
                    self.encoding,
                    self.unsupported.as_ref(),
                    self.read_max_bytes,
                )
                .map(Some);
            }

            let Some(body) = self.body.as_mut() else {
                return Ok(None);
            };
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.decoder.feed(&data);
                    }
                }
                Some(Err(e)) => {
                    self.body = None;
                    return Err(Status::cancelled(format!("failed to read request: {e}")));
                }
                None => {
                    self.body = None;
                    if self.decoder.has_buffered_data() {
                        return Err(Status::internal(
                            "protocol error: request ended inside a message",
                        ));
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Read an unenveloped Triple unary body.
    async fn whole_body(&mut self) -> Result<Option<Bytes>, Status> {
        let Some(body) = self.body.take() else {
            return Ok(None);
        };
        let max = self.read_max_bytes;
        let data = Limited::new(body, max)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    Status::resource_exhausted(format!(
                        "message larger than read_max_bytes ({max} bytes)"
                    ))
                } else {
                    Status::cancelled(format!("failed to read request: {e}"))
                }
            })?
            .to_bytes();

        if data.is_empty() || self.encoding.is_identity() {
            return match &self.unsupported {
                Some(status) if !data.is_empty() => Err(status.clone()),
                _ => Ok(Some(data)),
            };
        }
        self.encoding.decompress(&data, max).map(Some)
    }
}

/// Events flowing from a handler to the response writer.
#[derive(Debug)]
pub(crate) enum Outbound {
    Headers(HeaderSet),
    /// An encoded message: enveloped, or the raw body for Triple unary.
    Message(Bytes),
    Done(Result<HeaderSet, Status>),
}

/// The outbound half of a call.
pub struct Responder {
    tx: mpsc::Sender<Outbound>,
    writer: MessageWriter,
    enveloped: bool,
    kind: CallKind,
    headers_sent: bool,
    messages: usize,
}

impl Responder {
    pub(crate) fn new(
        tx: mpsc::Sender<Outbound>,
        writer: MessageWriter,
        enveloped: bool,
        kind: CallKind,
    ) -> Self {
        Self {
            tx,
            writer,
            enveloped,
            kind,
            headers_sent: false,
            messages: 0,
        }
    }

    /// Response messages sent so far.
    pub fn messages_sent(&self) -> usize {
        self.messages
    }

    /// Send response headers. Only allowed before the first message.
    pub async fn send_headers(&mut self, headers: HeaderSet) -> Result<(), Status> {
        if self.headers_sent || self.messages > 0 {
            return Err(Status::internal("response headers already sent"));
        }
        self.headers_sent = true;
        self.emit(Outbound::Headers(headers)).await
    }

    /// Send one response message.
    pub async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        if !self.kind.server_streams() && self.messages > 0 {
            return Err(Status::internal(
                "method is not server streaming but sent a second response",
            ));
        }

        let encoded = if self.enveloped {
            self.writer.envelope(&message)?
        } else {
            // Triple unary compresses the whole body once it is complete
            message
        };
        self.messages += 1;
        self.emit(Outbound::Message(encoded)).await
    }

    async fn emit(&self, event: Outbound) -> Result<(), Status> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Status::cancelled("call was cancelled"))
    }
}
