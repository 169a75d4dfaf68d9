//! Protocol identification and per-protocol wire rules.

pub mod grpc;
pub mod grpc_web;
pub mod triple;

use crate::compression::{CompressionScope, Encoding};
use crate::frame::Envelope;
use crate::metadata::HeaderSet;
use crate::status::Status;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

pub const CONTENT_TYPE: &str = "content-type";
pub const SERVICE_GROUP: &str = "tri-service-group";
pub const SERVICE_VERSION: &str = "tri-service-version";
pub const USER_AGENT: &str = "user-agent";

/// Wire protocol of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Grpc,
    GrpcWeb,
    Triple,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Grpc => "grpc",
            Protocol::GrpcWeb => "grpc-web",
            Protocol::Triple => "triple",
        }
    }

    /// Whether the protocol can run over a transport without trailers.
    pub fn supports_http1(self) -> bool {
        !matches!(self, Protocol::Grpc)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grpc" => Ok(Protocol::Grpc),
            "grpc-web" | "grpc_web" => Ok(Protocol::GrpcWeb),
            "triple" | "tri" => Ok(Protocol::Triple),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Message serialization named by the content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Proto,
    Json,
}

/// What a content type identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentType {
    pub protocol: Protocol,
    pub codec: Codec,
    /// Messages are enveloped. Always true except for Triple unary.
    pub enveloped: bool,
}

impl ContentType {
    pub fn new(protocol: Protocol, codec: Codec, enveloped: bool) -> Self {
        Self {
            protocol,
            codec,
            enveloped: enveloped || protocol != Protocol::Triple,
        }
    }

    /// Canonical header value for this combination.
    pub fn as_str(&self) -> &'static str {
        match (self.protocol, self.enveloped, self.codec) {
            (Protocol::Grpc, _, Codec::Proto) => "application/grpc+proto",
            (Protocol::Grpc, _, Codec::Json) => "application/grpc+json",
            (Protocol::GrpcWeb, _, Codec::Proto) => "application/grpc-web+proto",
            (Protocol::GrpcWeb, _, Codec::Json) => "application/grpc-web+json",
            (Protocol::Triple, false, Codec::Proto) => "application/proto",
            (Protocol::Triple, false, Codec::Json) => "application/json",
            (Protocol::Triple, true, Codec::Proto) => "application/connect+proto",
            (Protocol::Triple, true, Codec::Json) => "application/connect+json",
        }
    }

    /// Headers naming the payload encoding and the accepted encodings.
    pub fn encoding_headers(&self) -> (&'static str, &'static str) {
        match (self.protocol, self.enveloped) {
            (Protocol::Triple, false) => (triple::CONTENT_ENCODING, triple::ACCEPT_ENCODING),
            (Protocol::Triple, true) => (triple::STREAM_CONTENT_ENCODING, triple::STREAM_ACCEPT_ENCODING),
            _ => (grpc::ENCODING, grpc::ACCEPT_ENCODING),
        }
    }

    pub fn compression_scope(&self) -> CompressionScope {
        if self.enveloped {
            CompressionScope::PerMessage
        } else {
            CompressionScope::WholeBody
        }
    }
}

/// The content types recognised for each protocol.
///
/// An entry ending in `*` matches by prefix, otherwise the media type must
/// match exactly. gRPC-Web is checked before gRPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentTypes {
    pub grpc: Vec<String>,
    pub grpc_web: Vec<String>,
    pub triple_unary: Vec<String>,
    pub triple_stream: Vec<String>,
}

impl Default for ContentTypes {
    fn default() -> Self {
        let list = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            grpc: list(&["application/grpc", "application/grpc+*"]),
            grpc_web: list(&["application/grpc-web", "application/grpc-web+*"]),
            triple_unary: list(&["application/proto", "application/json"]),
            triple_stream: list(&["application/connect+proto", "application/connect+json"]),
        }
    }
}

impl ContentTypes {
    /// Identify the protocol from a content-type header value.
    pub fn identify(&self, value: &str) -> Option<ContentType> {
        let media = value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let codec = if media.ends_with("json") {
            Codec::Json
        } else {
            Codec::Proto
        };

        let candidates = [
            (&self.grpc_web, Protocol::GrpcWeb, true),
            (&self.grpc, Protocol::Grpc, true),
            (&self.triple_stream, Protocol::Triple, true),
            (&self.triple_unary, Protocol::Triple, false),
        ];

        candidates
            .into_iter()
            .find(|(patterns, _, _)| patterns.iter().any(|p| media_matches(p, &media)))
            .map(|(_, protocol, enveloped)| ContentType::new(protocol, codec, enveloped))
    }
}

fn media_matches(pattern: &str, media: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => media.len() > prefix.len() && media.starts_with(prefix),
        None => pattern.eq_ignore_ascii_case(media),
    }
}

/// A decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Bytes),
    End { status: Status, trailers: HeaderSet },
}

/// Decompress a message envelope.
///
/// `unsupported` is the negotiation error for a peer that announced an
/// encoding we cannot read. It only applies when this message is actually
/// compressed.
pub fn open_message(
    envelope: &Envelope,
    encoding: Encoding,
    unsupported: Option<&Status>,
    max_bytes: usize,
) -> Result<Bytes, Status> {
    if !envelope.is_compressed() {
        return Ok(envelope.data.clone());
    }
    if let Some(status) = unsupported {
        return Err(status.clone());
    }
    if encoding.is_identity() {
        return Err(Status::internal(
            "protocol error: received compressed message without compression",
        ));
    }
    encoding.decompress(&envelope.data, max_bytes)
}

/// Interpret an envelope received by a client.
pub fn read_envelope(
    protocol: Protocol,
    envelope: Envelope,
    encoding: Encoding,
    max_bytes: usize,
) -> Result<Inbound, Status> {
    match protocol {
        Protocol::GrpcWeb if envelope.is_trailers() => {
            let trailers = grpc_web::decode_trailers(&envelope.data)?;
            let status = grpc::status_from_metadata(&trailers)
                .unwrap_or_else(|| grpc::missing_status(200));
            Ok(Inbound::End {
                status,
                trailers: grpc::strip_status(&trailers),
            })
        }
        Protocol::Triple if envelope.is_end_stream() => {
            let (status, trailers) = triple::decode_end_stream(&envelope.data)?;
            Ok(Inbound::End { status, trailers })
        }
        _ => open_message(&envelope, encoding, None, max_bytes).map(Inbound::Message),
    }
}
