//! Inbound call dispatch.
//!
//! Every inbound request walks
//! `Received -> Identified -> HeaderValidated -> StreamBound -> Completed`,
//! or drops to `Failed` at any step with the status that ended it.

use crate::compression::{Encoding, Negotiation, negotiate_request};
use crate::metadata::HeaderSet;
use crate::protocol::{self, ContentType, ContentTypes, Protocol, grpc, triple};
use crate::registry::{MethodDescriptor, Registry, Route, ServiceIdentity};
use crate::status::Status;
use crate::timeout::{ParsedTimeout, parse_grpc_timeout, parse_timeout};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default upper bound on a requested timeout (5 minutes).
pub const DEFAULT_MAX_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Received,
    Identified,
    HeaderValidated,
    StreamBound,
    Completed,
    Failed,
}

impl DispatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DispatchState::Completed | DispatchState::Failed)
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Knobs applied while validating request headers.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub content_types: ContentTypes,
    pub max_timeout_ms: u64,
    /// Encodings we can read and write, in preference order.
    pub accept_compression: Vec<Encoding>,
    /// Reject Triple requests without `tri-protocol-version`.
    pub require_protocol_version: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            content_types: ContentTypes::default(),
            max_timeout_ms: DEFAULT_MAX_TIMEOUT_MS,
            accept_compression: vec![Encoding::Gzip, Encoding::Deflate],
            require_protocol_version: false,
        }
    }
}

/// One inbound request as it moves through dispatch.
#[derive(Debug)]
pub struct InboundCall<H> {
    state: DispatchState,
    is_post: bool,
    path: String,
    headers: HeaderSet,
    content_type: Option<ContentType>,
    identity: ServiceIdentity,
    timeout: Option<Duration>,
    compression: Option<Negotiation>,
    route: Option<Route<H>>,
    status: Option<Status>,
}

impl<H> InboundCall<H> {
    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderSet {
        &self.headers
    }

    pub fn content_type(&self) -> Option<ContentType> {
        self.content_type
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.content_type.map(|ct| ct.protocol)
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// Deadline requested by the caller, once validated.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn compression(&self) -> Option<&Negotiation> {
        self.compression.as_ref()
    }

    pub fn route(&self) -> Option<&Route<H>> {
        self.route.as_ref()
    }

    pub fn method(&self) -> Option<&Arc<MethodDescriptor>> {
        self.route.as_ref().map(|r| &r.method)
    }

    pub fn handler(&self) -> Option<&H> {
        self.route.as_ref().map(|r| &r.handler)
    }

    /// Terminal status, once the call completed or failed.
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    fn expect_state(&mut self, expected: DispatchState, next: DispatchState) -> Result<(), Status> {
        if self.state == expected {
            return Ok(());
        }
        let status = Status::internal(format!(
            "invalid dispatch transition {} -> {next}",
            self.state
        ));
        self.fail(status.clone());
        Err(status)
    }

    fn advance(&mut self, from: DispatchState, to: DispatchState) -> Result<(), Status> {
        self.expect_state(from, to)?;
        self.state = to;
        Ok(())
    }

    fn reject(&mut self, status: Status) -> Status {
        self.fail(status.clone());
        status
    }

    /// Bind the validated call to its stream.
    pub fn bind(&mut self) -> Result<(), Status> {
        self.advance(DispatchState::HeaderValidated, DispatchState::StreamBound)
    }

    /// Record the terminal status delivered to the peer.
    pub fn complete(&mut self, status: Status) -> Result<(), Status> {
        self.advance(DispatchState::StreamBound, DispatchState::Completed)?;
        self.status = Some(status);
        Ok(())
    }

    /// Fail the call. A call that already reached a terminal state keeps
    /// its first status.
    pub fn fail(&mut self, status: Status) {
        if self.state.is_terminal() {
            return;
        }
        self.state = DispatchState::Failed;
        self.status = Some(status);
    }
}

/// Routes inbound requests to registered methods.
#[derive(Debug)]
pub struct Dispatcher<H> {
    registry: Arc<Registry<H>>,
    options: DispatchOptions,
}

impl<H: Clone> Dispatcher<H> {
    pub fn new(registry: Arc<Registry<H>>, options: DispatchOptions) -> Self {
        Self { registry, options }
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<Registry<H>> {
        &self.registry
    }

    /// Start tracking a request in the `Received` state.
    pub fn receive(&self, method: &http::Method, path: &str, headers: HeaderSet) -> InboundCall<H> {
        InboundCall {
            state: DispatchState::Received,
            is_post: method == http::Method::POST,
            path: path.to_string(),
            headers,
            content_type: None,
            identity: ServiceIdentity::default(),
            timeout: None,
            compression: None,
            route: None,
            status: None,
        }
    }

    /// `Received -> Identified`: pick the protocol from the content type.
    pub fn identify(&self, call: &mut InboundCall<H>) -> Result<ContentType, Status> {
        call.expect_state(DispatchState::Received, DispatchState::Identified)?;
        if !call.is_post {
            return Err(call.reject(Status::unimplemented("only POST is supported")));
        }

        let value = call.headers.get(protocol::CONTENT_TYPE).unwrap_or_default();
        let Some(content_type) = self.options.content_types.identify(value) else {
            let status = Status::unimplemented(format!("unsupported content-type: {value:?}"));
            return Err(call.reject(status));
        };

        call.content_type = Some(content_type);
        call.advance(DispatchState::Received, DispatchState::Identified)?;
        Ok(content_type)
    }

    /// `Identified -> HeaderValidated`: deadline, protocol version,
    /// compression, and the group/version match against the registry.
    pub fn validate(&self, call: &mut InboundCall<H>) -> Result<(), Status> {
        call.expect_state(DispatchState::Identified, DispatchState::HeaderValidated)?;
        let Some(content_type) = call.content_type else {
            return Err(call.reject(Status::internal("identified call has no content type")));
        };

        let parsed = match content_type.protocol {
            Protocol::Triple => parse_timeout(call.headers.get(triple::TIMEOUT), self.options.max_timeout_ms),
            Protocol::Grpc | Protocol::GrpcWeb => {
                parse_grpc_timeout(call.headers.get(grpc::TIMEOUT), self.options.max_timeout_ms)
            }
        };
        call.timeout = match self.check_timeout(call.path(), parsed) {
            Ok(timeout) => timeout,
            Err(status) => return Err(call.reject(status)),
        };

        if content_type.protocol == Protocol::Triple
            && let Err(status) =
                triple::validate_protocol_version(&call.headers, self.options.require_protocol_version)
        {
            return Err(call.reject(status));
        }

        let (encoding_header, accept_header) = content_type.encoding_headers();
        let negotiation = negotiate_request(
            &self.options.accept_compression,
            call.headers.get(encoding_header),
            call.headers.get(accept_header),
            content_type.compression_scope(),
        );
        if let Some(error) = &negotiation.error {
            debug!(path = call.path(), "{}", error);
        }
        call.compression = Some(negotiation);

        call.identity = ServiceIdentity::new(
            call.headers.get(protocol::SERVICE_GROUP).unwrap_or_default(),
            call.headers.get(protocol::SERVICE_VERSION).unwrap_or_default(),
        );
        let route = match self.registry.lookup(&call.path, &call.identity) {
            Ok(route) => route.clone(),
            Err(status) => return Err(call.reject(status)),
        };

        if content_type.protocol == Protocol::Triple && content_type.enveloped == route.method.kind.is_unary() {
            let status = Status::unimplemented(format!(
                "content-type {} does not match {:?} method {}",
                content_type.as_str(),
                route.method.kind,
                call.path
            ));
            return Err(call.reject(status));
        }

        call.route = Some(route);
        call.advance(DispatchState::Identified, DispatchState::HeaderValidated)
    }

    fn check_timeout(&self, path: &str, parsed: ParsedTimeout) -> Result<Option<Duration>, Status> {
        if let (Some(requested_ms), Some(_)) = (parsed.timeout_ms, &parsed.error) {
            debug!(path, requested_ms, max_ms = self.options.max_timeout_ms, "rejecting timeout");
        }
        parsed.into_result()
    }

    /// Run identification and validation. Check `state()` on the result.
    pub fn dispatch(&self, method: &http::Method, path: &str, headers: HeaderSet) -> InboundCall<H> {
        let mut call = self.receive(method, path, headers);
        if self.identify(&mut call).is_ok() {
            let _ = self.validate(&mut call);
        }
        call
    }
}
