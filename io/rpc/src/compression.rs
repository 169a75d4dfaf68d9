//! Compression negotiation and codecs.
//!
//! `identity` is always implicitly supported and never appears in an
//! accept list this crate writes.

use crate::status::Status;
use bytes::Bytes;
use flate2::Compression as Level;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Default payload size below which messages are sent uncompressed.
pub const DEFAULT_COMPRESS_MIN_BYTES: usize = 1024;

/// A content encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }

    pub fn is_identity(self) -> bool {
        self == Encoding::Identity
    }

    /// Compress a payload.
    pub fn compress(self, data: &[u8]) -> io::Result<Bytes> {
        match self {
            Encoding::Identity => Ok(Bytes::copy_from_slice(data)),
            Encoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Level::default());
                encoder.write_all(data)?;
                encoder.finish().map(Bytes::from)
            }
            Encoding::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Level::default());
                encoder.write_all(data)?;
                encoder.finish().map(Bytes::from)
            }
        }
    }

    /// Decompress a payload, refusing to produce more than `max_bytes`.
    pub fn decompress(self, data: &[u8], max_bytes: usize) -> Result<Bytes, Status> {
        let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(max_bytes));
        let limit = max_bytes as u64 + 1;

        let result = match self {
            Encoding::Identity => {
                out.extend_from_slice(data);
                Ok(data.len())
            }
            Encoding::Gzip => GzDecoder::new(data).take(limit).read_to_end(&mut out),
            Encoding::Deflate => ZlibDecoder::new(data).take(limit).read_to_end(&mut out),
        };

        match result {
            Ok(_) if out.len() > max_bytes => Err(Status::resource_exhausted(format!(
                "message is larger than read_max_bytes {max_bytes} after decompression"
            ))),
            Ok(_) => Ok(Bytes::from(out)),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput || e.kind() == io::ErrorKind::InvalidData => {
                Err(Status::invalid_argument(format!("failed to decompress {self} payload: {e}")))
            }
            Err(e) => Err(Status::internal(format!("failed to decompress {self} payload: {e}"))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" => Ok(Encoding::Identity),
            "gzip" => Ok(Encoding::Gzip),
            "deflate" => Ok(Encoding::Deflate),
            other => Err(format!("unknown compression \"{other}\"")),
        }
    }
}

/// Whether compression applies to each message or the whole body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionScope {
    PerMessage,
    WholeBody,
}

/// The negotiated algorithm and where it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionChoice {
    pub encoding: Encoding,
    pub scope: CompressionScope,
}

impl CompressionChoice {
    pub fn identity(scope: CompressionScope) -> Self {
        Self {
            encoding: Encoding::Identity,
            scope,
        }
    }
}

/// Outcome of negotiating compression for an inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiation {
    /// Encoding the peer used for its own payload.
    pub request: Encoding,
    /// Encoding chosen for our payload.
    pub response: CompressionChoice,
    /// Set when the peer named an encoding we do not support. Only payloads
    /// that actually arrive compressed are rejected with it.
    pub error: Option<Status>,
}

/// Pick the first local encoding the peer accepts, else identity.
pub fn negotiate(local: &[Encoding], peer_accepts: &[Encoding]) -> Encoding {
    local
        .iter()
        .copied()
        .find(|e| !e.is_identity() && peer_accepts.contains(e))
        .unwrap_or(Encoding::Identity)
}

/// Parse a comma-separated accept header, skipping unknown names.
pub fn parse_accept(header: &str) -> Vec<Encoding> {
    header
        .split(',')
        .filter_map(|name| name.parse().ok())
        .collect()
}

/// Render an accept header for the given encodings.
pub fn accept_header(encodings: &[Encoding]) -> String {
    encodings
        .iter()
        .filter(|e| !e.is_identity())
        .map(|e| e.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Negotiate both directions of an inbound call.
///
/// `requested` is the encoding header on the request, `accepted` its accept
/// header. When the peer sent no accept list the response mirrors the
/// request encoding.
pub fn negotiate_request(
    available: &[Encoding],
    requested: Option<&str>,
    accepted: Option<&str>,
    scope: CompressionScope,
) -> Negotiation {
    let mut error = None;
    let request = match requested.map(str::trim) {
        None | Some("") => Encoding::Identity,
        Some(name) => match name.parse::<Encoding>() {
            Ok(encoding) if encoding.is_identity() || available.contains(&encoding) => encoding,
            _ => {
                error = Some(Status::unimplemented(format!(
                    "unknown compression \"{name}\": supported encodings are {}",
                    accept_header(available)
                )));
                Encoding::Identity
            }
        },
    };

    let response = match accepted.map(str::trim) {
        None | Some("") => request,
        Some(header) => negotiate(available, &parse_accept(header)),
    };

    Negotiation {
        request,
        response: CompressionChoice {
            encoding: response,
            scope,
        },
        error,
    }
}
