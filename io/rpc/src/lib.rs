//! rpc - protocol core for gRPC, gRPC-Web and Triple.
//!
//! This crate holds everything about the three wire protocols that does not
//! touch a socket: header sets, trailer muxing, deadline headers, status
//! translation, compression, envelope framing and inbound dispatch. The
//! `session` and `transport` crates drive it over HTTP/2 and HTTP/1.1.
//!
//! # Architecture
//!
//! Streaming messages are framed as:
//! - 1 byte: flags (compressed, end-of-stream, trailers)
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload
//!
//! Message serialization (protobuf or JSON) is left to the application.

pub mod compression;
pub mod dispatch;
pub mod envelope;
pub mod frame;
pub mod metadata;
pub mod protocol;
pub mod registry;
pub mod status;
pub mod timeout;
pub mod trailer;

pub use compression::{CompressionChoice, CompressionScope, Encoding, Negotiation, negotiate};
pub use dispatch::{DispatchOptions, DispatchState, Dispatcher, InboundCall};
pub use envelope::{error_from_json, error_to_json};
pub use frame::{Envelope, MessageDecoder, encode_envelope};
pub use metadata::HeaderSet;
pub use protocol::{Codec, ContentType, ContentTypes, Inbound, Protocol};
pub use registry::{
    CallKind, MethodDescriptor, Registry, RegistryError, Route, ServiceDescriptor, ServiceIdentity,
};
pub use status::{Code, ErrorDetail, Status, code_from_http_status, http_status_from_code};
pub use timeout::{
    GrpcTimeout, MAX_TIMEOUT_MS, ParsedTimeout, format_timeout, parse_grpc_timeout, parse_timeout,
};
pub use trailer::{TRAILER_PREFIX, demux, mux};
