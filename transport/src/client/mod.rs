//! RPC client.
//!
//! Unary and streaming calls share a [`SessionManager`]: every HTTP/2 call
//! leases one stream on a pooled session and gives it back when it ends.
//! Unary calls may instead run over HTTP/1.1 on a connection of their own.

mod call;
mod http1;
mod response;

pub use call::{CallHandle, CallResult};

use crate::codec::MessageWriter;
use crate::config::{ClientConfig, Config};
use crate::metrics::{CLIENT_CALLS, CLIENT_CALLS_FAILED, CLIENT_DEADLINES_EXCEEDED};
use bytes::{Bytes, BytesMut};
use call::{bounded, send_data};
use h2::RecvStream;
use http::{Method, Request, Uri, header};
use http_body_util::Full;
use rpc::compression::accept_header;
use rpc::protocol::{CONTENT_TYPE, SERVICE_GROUP, SERVICE_VERSION, USER_AGENT, grpc, grpc_web, triple};
use rpc::{Codec, ContentType, Encoding, GrpcTimeout, HeaderSet, Protocol, Status, format_timeout};
use session::{Lease, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Room above `read_max_bytes` for framing and trailer frames when a
/// unary body is buffered whole.
const BODY_SLACK: usize = 64 * 1024;

/// Per-call settings.
#[derive(Debug, Clone)]
pub struct CallOptions {
    protocol: Protocol,
    codec: Codec,
    group: String,
    version: String,
    timeout: Option<Duration>,
    metadata: HeaderSet,
    http1: bool,
    compression: Encoding,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::new(Protocol::Triple)
    }
}

impl CallOptions {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            codec: Codec::Proto,
            group: String::new(),
            version: String::new(),
            timeout: None,
            metadata: HeaderSet::new(),
            http1: false,
            compression: Encoding::Identity,
        }
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Service group the call is addressed to.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Service version the call is addressed to.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a request header.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.append(key, value);
        self
    }

    /// Run a unary call over HTTP/1.1 instead of a pooled HTTP/2 stream.
    pub fn http1(mut self, http1: bool) -> Self {
        self.http1 = http1;
        self
    }

    /// Compress request messages with this encoding.
    pub fn compression(mut self, encoding: Encoding) -> Self {
        self.compression = encoding;
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn content_type(&self, unary: bool) -> ContentType {
        ContentType::new(self.protocol, self.codec, !unary)
    }
}

/// Outcome of a unary call. A failed call still carries whatever
/// metadata arrived.
#[derive(Debug, Clone)]
pub struct UnaryResponse {
    pub status: Status,
    pub headers: HeaderSet,
    pub trailers: HeaderSet,
    pub message: Option<Bytes>,
}

impl UnaryResponse {
    fn failed(status: Status) -> Self {
        Self {
            status,
            headers: HeaderSet::new(),
            trailers: HeaderSet::new(),
            message: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// The response message, or the status when the call failed.
    pub fn into_result(self) -> Result<Bytes, Status> {
        if !self.status.is_ok() {
            return Err(self.status);
        }
        self.message
            .ok_or_else(|| Status::internal("protocol error: missing response message"))
    }
}

/// Issues calls to any number of targets.
pub struct Client {
    sessions: Arc<SessionManager>,
    config: ClientConfig,
    encodings: Vec<Encoding>,
}

impl Client {
    pub fn new(config: &Config) -> Self {
        Self::with_sessions(config, SessionManager::new(config.session.clone()))
    }

    /// Build a client on an existing session manager.
    pub fn with_sessions(config: &Config, sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            config: config.client.clone(),
            encodings: config.client.encodings(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Close every session, letting open streams drain.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }

    fn deadline(&self, options: &CallOptions) -> Option<Instant> {
        options
            .timeout
            .or_else(|| self.config.default_timeout())
            .map(|timeout| Instant::now() + timeout)
    }

    /// Make a unary call. The terminal status is always in the response.
    pub async fn unary(
        &self,
        target: SocketAddr,
        path: &str,
        options: CallOptions,
        message: Bytes,
    ) -> UnaryResponse {
        CLIENT_CALLS.increment();
        let deadline = self.deadline(&options);
        let response = match bounded(deadline, self.try_unary(target, path, &options, deadline, message)).await {
            Some(Ok(response)) => response,
            Some(Err(status)) => UnaryResponse::failed(status),
            None => {
                // dropping the call future resets the stream with CANCEL
                CLIENT_DEADLINES_EXCEEDED.increment();
                UnaryResponse::failed(Status::deadline_exceeded("deadline exceeded"))
            }
        };

        if !response.status.is_ok() {
            CLIENT_CALLS_FAILED.increment();
            debug!(
                %target,
                path,
                protocol = %options.protocol,
                code = %response.status.code(),
                "unary call failed"
            );
        }
        response
    }

    async fn try_unary(
        &self,
        target: SocketAddr,
        path: &str,
        options: &CallOptions,
        deadline: Option<Instant>,
        message: Bytes,
    ) -> Result<UnaryResponse, Status> {
        let content_type = options.content_type(true);
        let writer = MessageWriter::new(options.compression, self.config.compress_min_bytes);
        let (body, announced) = if content_type.enveloped {
            (writer.envelope(&message)?, Some(options.compression))
        } else {
            let (body, compressed) = writer.body(message)?;
            (body, compressed.then_some(options.compression))
        };
        let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let max = self.config.read_max_bytes;

        if options.http1 {
            if !content_type.protocol.supports_http1() {
                return Err(Status::unimplemented(
                    "gRPC needs HTTP/2 trailers and cannot run over HTTP/1.1",
                ));
            }
            let mut request = self.request(path, options, content_type, remaining, announced)?;
            let host = http::HeaderValue::from_str(&target.to_string())
                .map_err(|e| Status::internal(format!("invalid host header: {e}")))?;
            request.headers_mut().insert(header::HOST, host);

            let exchanged = http1::exchange(
                target,
                request.map(|()| Full::new(body)),
                self.sessions.config().connect_timeout(),
                max.saturating_add(BODY_SLACK),
            )
            .await?;
            return Ok(response::unary_response(
                content_type,
                exchanged.status,
                exchanged.headers,
                exchanged.body,
                None,
                max,
            ));
        }

        let uri = format!("http://{target}{path}");
        let request = self.request(&uri, options, content_type, remaining, announced)?;
        let mut lease = self.sessions.acquire(target).await?;
        let (response, mut send) = lease
            .send_request(request, false)
            .map_err(|e| lease.status_for(&e))?;
        send_data(&mut send, body, true)
            .await
            .map_err(|e| lease.status_for(&e))?;

        let response = response.await.map_err(|e| lease.status_for(&e))?;
        let (parts, mut recv) = response.into_parts();
        let body = read_body(&mut recv, &lease, max.saturating_add(BODY_SLACK)).await?;
        let trailers = if content_type.protocol == Protocol::Grpc {
            recv.trailers()
                .await
                .map_err(|e| lease.status_for(&e))?
                .map(|map| HeaderSet::from_header_map(&map))
        } else {
            None
        };

        Ok(response::unary_response(
            content_type,
            parts.status.as_u16(),
            HeaderSet::from_header_map(&parts.headers),
            body,
            trailers,
            max,
        ))
    }

    /// Start a streaming call over HTTP/2.
    pub async fn call(
        &self,
        target: SocketAddr,
        path: &str,
        options: CallOptions,
    ) -> Result<CallHandle, Status> {
        CLIENT_CALLS.increment();
        self.start_call(target, path, &options).await.inspect_err(|status| {
            CLIENT_CALLS_FAILED.increment();
            debug!(%target, path, code = %status.code(), "call failed to start");
        })
    }

    async fn start_call(
        &self,
        target: SocketAddr,
        path: &str,
        options: &CallOptions,
    ) -> Result<CallHandle, Status> {
        if options.http1 {
            return Err(Status::unimplemented("streaming calls need HTTP/2"));
        }

        let content_type = options.content_type(false);
        let deadline = self.deadline(options);
        let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let uri = format!("http://{target}{path}");
        let request = self.request(&uri, options, content_type, remaining, Some(options.compression))?;

        let mut lease = match bounded(deadline, self.sessions.acquire(target)).await {
            Some(lease) => lease?,
            None => {
                CLIENT_DEADLINES_EXCEEDED.increment();
                return Err(Status::deadline_exceeded("deadline exceeded waiting for a stream"));
            }
        };
        let (response, send) = lease
            .send_request(request, false)
            .map_err(|e| lease.status_for(&e))?;

        Ok(CallHandle::new(
            content_type,
            lease,
            response,
            send,
            MessageWriter::new(options.compression, self.config.compress_min_bytes),
            self.config.read_max_bytes,
            deadline,
        ))
    }

    /// Build the request head for a call.
    fn request(
        &self,
        uri: &str,
        options: &CallOptions,
        content_type: ContentType,
        remaining: Option<Duration>,
        body_encoding: Option<Encoding>,
    ) -> Result<Request<()>, Status> {
        let mut headers = options.metadata.clone();
        headers.set(CONTENT_TYPE, content_type.as_str());
        headers.set(USER_AGENT, self.config.user_agent.as_str());
        if !options.group.is_empty() {
            headers.set(SERVICE_GROUP, options.group.as_str());
        }
        if !options.version.is_empty() {
            headers.set(SERVICE_VERSION, options.version.as_str());
        }

        let (encoding_key, accept_key) = content_type.encoding_headers();
        if let Some(encoding) = body_encoding.filter(|e| !e.is_identity()) {
            headers.set(encoding_key, encoding.as_str());
        }
        let accept = accept_header(&self.encodings);
        if !accept.is_empty() {
            headers.set(accept_key, accept);
        }

        match content_type.protocol {
            Protocol::Grpc | Protocol::GrpcWeb => {
                if content_type.protocol == Protocol::Grpc {
                    headers.set(grpc::TE, "trailers");
                } else {
                    headers.set(grpc_web::MARKER, "1");
                }
                if let Some(remaining) = remaining {
                    headers.set(grpc::TIMEOUT, GrpcTimeout::from_duration(remaining).to_grpc_format());
                }
            }
            Protocol::Triple => {
                headers.set(triple::PROTOCOL_VERSION, triple::PROTOCOL_VERSION_VALUE);
                if let Some(remaining) = remaining {
                    headers.set(triple::TIMEOUT, format_timeout(remaining));
                }
            }
        }

        let mut request = Request::new(());
        *request.method_mut() = Method::POST;
        *request.uri_mut() = uri
            .parse::<Uri>()
            .map_err(|e| Status::internal(format!("invalid request uri {uri}: {e}")))?;
        headers.write_into(request.headers_mut())?;
        Ok(request)
    }
}

/// Buffer a whole response body, releasing flow control as it arrives.
async fn read_body(recv: &mut RecvStream, lease: &Lease, limit: usize) -> Result<Bytes, Status> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = recv.data().await {
        let chunk = chunk.map_err(|e| lease.status_for(&e))?;
        let _ = recv.flow_control().release_capacity(chunk.len());
        if buf.len() + chunk.len() > limit {
            return Err(Status::resource_exhausted(format!(
                "response body larger than {limit} bytes"
            )));
        }
        buf.extend_from_slice(&chunk);
        lease.touch();
    }
    Ok(buf.freeze())
}
