//! Streaming calls over a leased HTTP/2 stream.

use super::response::{head_status, read_inbound, status_at_end};
use crate::codec::{MessageWriter, encoding_from_header};
use crate::metrics::{CLIENT_CALLS_FAILED, CLIENT_DEADLINES_EXCEEDED};
use bytes::Bytes;
use h2::client::ResponseFuture;
use h2::{Reason, RecvStream, SendStream};
use rpc::protocol::grpc;
use rpc::{ContentType, Encoding, HeaderSet, Inbound, MessageDecoder, Status};
use session::{Lease, status_from_h2};
use std::future::{Future, poll_fn};
use tokio::time::Instant;
use tracing::debug;

/// Run `fut` until `deadline`. `None` means the deadline passed first.
pub(crate) async fn bounded<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Write `data` to an h2 stream, waiting for flow control capacity.
pub(crate) async fn send_data(
    send: &mut SendStream<Bytes>,
    mut data: Bytes,
    end_of_stream: bool,
) -> Result<(), h2::Error> {
    if data.is_empty() {
        return send.send_data(data, end_of_stream);
    }

    while !data.is_empty() {
        send.reserve_capacity(data.len());
        let granted = match poll_fn(|cx| send.poll_capacity(cx)).await {
            Some(granted) => granted?,
            None => return Err(h2::Error::from(Reason::STREAM_CLOSED)),
        };
        if granted == 0 {
            continue;
        }
        let chunk = data.split_to(granted.min(data.len()));
        send.send_data(chunk, end_of_stream && data.is_empty())?;
    }
    Ok(())
}

/// Terminal outcome of a streaming call.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub status: Status,
    pub headers: HeaderSet,
    pub trailers: HeaderSet,
}

/// A streaming call in progress.
///
/// Every wait is bounded by the call deadline. When it passes the stream
/// is reset with CANCEL, the lease goes back to its session and the call
/// ends with DeadlineExceeded. Dropping an unfinished handle cancels it.
pub struct CallHandle {
    content_type: ContentType,
    lease: Option<Lease>,
    send: Option<SendStream<Bytes>>,
    send_closed: bool,
    response: Option<ResponseFuture>,
    recv: Option<RecvStream>,
    http_status: u16,
    headers: HeaderSet,
    headers_received: bool,
    decoder: MessageDecoder,
    writer: MessageWriter,
    encoding: Encoding,
    unsupported: Option<Status>,
    read_max_bytes: usize,
    deadline: Option<Instant>,
    outcome: Option<(Status, HeaderSet)>,
}

impl CallHandle {
    pub(crate) fn new(
        content_type: ContentType,
        lease: Lease,
        response: ResponseFuture,
        send: SendStream<Bytes>,
        writer: MessageWriter,
        read_max_bytes: usize,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            content_type,
            lease: Some(lease),
            send: Some(send),
            send_closed: false,
            response: Some(response),
            recv: None,
            http_status: 0,
            headers: HeaderSet::new(),
            headers_received: false,
            decoder: MessageDecoder::new(read_max_bytes),
            writer,
            encoding: Encoding::Identity,
            unsupported: None,
            read_max_bytes,
            deadline,
            outcome: None,
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// The terminal status, once the call ended.
    pub fn status(&self) -> Option<&Status> {
        self.outcome.as_ref().map(|(status, _)| status)
    }

    /// Send one request message.
    pub async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        if let Some((status, _)) = &self.outcome {
            return Err(if status.is_ok() {
                Status::internal("call already finished")
            } else {
                status.clone()
            });
        }
        if self.send_closed {
            return Err(Status::internal("request stream already closed"));
        }

        let frame = self.writer.envelope(&message)?;
        let deadline = self.deadline;
        let Some(send) = self.send.as_mut() else {
            return Err(Status::internal("request stream already closed"));
        };
        match bounded(deadline, send_data(send, frame, false)).await {
            None => Err(self.expire()),
            Some(Ok(())) => {
                if let Some(lease) = &self.lease {
                    lease.touch();
                }
                Ok(())
            }
            Some(Err(e)) => {
                // the peer may have ended the call already; prefer its status
                let send_error = self.status_for(&e);
                self.send_closed = true;
                let status = self.drain().await;
                Err(if status.is_ok() { send_error } else { status })
            }
        }
    }

    /// Half-close the request stream.
    pub fn close_send(&mut self) -> Result<(), Status> {
        if self.send_closed {
            return Ok(());
        }
        self.send_closed = true;
        let Some(send) = self.send.as_mut() else {
            return Ok(());
        };
        if let Err(e) = send.send_data(Bytes::new(), true) {
            if self.outcome.is_some() {
                return Ok(());
            }
            return Err(self.status_for(&e));
        }
        Ok(())
    }

    /// Response headers, waiting for them if necessary.
    pub async fn response_headers(&mut self) -> Result<&HeaderSet, Status> {
        self.await_response().await?;
        Ok(&self.headers)
    }

    /// Next response message, or `None` once the call ended with OK.
    pub async fn message(&mut self) -> Result<Option<Bytes>, Status> {
        self.await_response().await?;

        loop {
            if let Some((status, _)) = &self.outcome {
                return if status.is_ok() {
                    Ok(None)
                } else {
                    Err(status.clone())
                };
            }

            match self.decoder.decode() {
                Ok(Some(envelope)) => {
                    let inbound = read_inbound(
                        self.content_type.protocol,
                        envelope,
                        self.encoding,
                        self.unsupported.as_ref(),
                        self.read_max_bytes,
                    );
                    match inbound {
                        Ok(Inbound::Message(message)) => return Ok(Some(message)),
                        Ok(Inbound::End { status, trailers }) => {
                            self.settle(status, trailers);
                            continue;
                        }
                        Err(status) => return Err(self.abandon(status)),
                    }
                }
                Ok(None) => {}
                Err(status) => return Err(self.abandon(status)),
            }

            let deadline = self.deadline;
            let Some(recv) = self.recv.as_mut() else {
                return Err(self.settle(Status::internal("response stream closed"), HeaderSet::new()));
            };
            match bounded(deadline, recv.data()).await {
                None => return Err(self.expire()),
                Some(Some(Ok(chunk))) => {
                    let _ = recv.flow_control().release_capacity(chunk.len());
                    self.decoder.feed(&chunk);
                    if let Some(lease) = &self.lease {
                        lease.touch();
                    }
                }
                Some(Some(Err(e))) => {
                    let status = self.status_for(&e);
                    return Err(self.settle(status, HeaderSet::new()));
                }
                Some(None) => {
                    let (status, trailers) = self.end_of_body().await;
                    self.settle(status, trailers);
                }
            }
        }
    }

    /// Half-close, read the remaining response and return the outcome.
    pub async fn finish(mut self) -> CallResult {
        let _ = self.close_send();
        let status = self.drain().await;
        let trailers = self.outcome.take().map(|(_, t)| t).unwrap_or_default();
        CallResult {
            status,
            headers: std::mem::take(&mut self.headers),
            trailers,
        }
    }

    /// Abandon the call: the stream is reset with CANCEL.
    pub fn cancel(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        self.reset();
        self.settle(Status::cancelled("call cancelled by the client"), HeaderSet::new());
    }

    async fn await_response(&mut self) -> Result<(), Status> {
        if let Some(response) = self.response.take() {
            match bounded(self.deadline, response).await {
                None => return Err(self.expire()),
                Some(Err(e)) => {
                    let status = self.status_for(&e);
                    return Err(self.settle(status, HeaderSet::new()));
                }
                Some(Ok(response)) => {
                    let (parts, recv) = response.into_parts();
                    self.http_status = parts.status.as_u16();
                    self.headers = HeaderSet::from_header_map(&parts.headers);
                    self.headers_received = true;
                    self.recv = Some(recv);

                    let encoding_key = self.content_type.encoding_headers().0;
                    (self.encoding, self.unsupported) = encoding_from_header(self.headers.get(encoding_key));

                    if let Some(status) = head_status(self.content_type, self.http_status, &self.headers) {
                        self.headers = grpc::strip_status(&self.headers);
                        self.settle(status, HeaderSet::new());
                    }
                }
            }
        }

        match &self.outcome {
            Some((status, _)) if !self.headers_received => Err(status.clone()),
            _ => Ok(()),
        }
    }

    /// Read to the end, returning the terminal status.
    async fn drain(&mut self) -> Status {
        loop {
            match self.message().await {
                Ok(Some(_)) => continue,
                Ok(None) => return Status::ok(),
                Err(status) => return status,
            }
        }
    }

    async fn end_of_body(&mut self) -> (Status, HeaderSet) {
        if self.decoder.has_buffered_data() {
            return (
                Status::internal("protocol error: response ended inside a message"),
                HeaderSet::new(),
            );
        }

        let protocol = self.content_type.protocol;
        let trailers = match (protocol, self.recv.as_mut()) {
            (rpc::Protocol::Grpc, Some(recv)) => match recv.trailers().await {
                Ok(trailers) => trailers.map(|map| HeaderSet::from_header_map(&map)),
                Err(e) => return (self.status_for(&e), HeaderSet::new()),
            },
            _ => None,
        };
        status_at_end(protocol, self.http_status, trailers.as_ref())
    }

    fn status_for(&self, err: &h2::Error) -> Status {
        match &self.lease {
            Some(lease) => lease.status_for(err),
            None => status_from_h2(err),
        }
    }

    fn reset(&mut self) {
        if let Some(send) = self.send.as_mut() {
            send.send_reset(Reason::CANCEL);
        }
    }

    /// Fail the call on a local protocol error, resetting the stream.
    fn abandon(&mut self, status: Status) -> Status {
        self.reset();
        self.settle(status, HeaderSet::new())
    }

    fn expire(&mut self) -> Status {
        CLIENT_DEADLINES_EXCEEDED.increment();
        debug!(content_type = self.content_type.as_str(), "call deadline exceeded");
        self.reset();
        self.settle(Status::deadline_exceeded("deadline exceeded"), HeaderSet::new())
    }

    /// Record the terminal status and give the stream slot back.
    fn settle(&mut self, status: Status, trailers: HeaderSet) -> Status {
        if let Some((first, _)) = &self.outcome {
            return first.clone();
        }
        if !status.is_ok() {
            CLIENT_CALLS_FAILED.increment();
        }
        self.outcome = Some((status.clone(), trailers));
        self.response = None;
        self.recv = None;
        self.send = None;
        self.lease = None;
        status
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            self.reset();
        }
    }
}
