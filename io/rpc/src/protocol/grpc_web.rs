//! gRPC-Web trailer frames.
//!
//! gRPC-Web has no native trailers; they travel as the last body envelope
//! (flag `0x80`) holding an HTTP/1 style header block.

use crate::metadata::HeaderSet;
use crate::status::Status;
use bytes::Bytes;

pub const MARKER: &str = "x-grpc-web";

/// Serialize trailers as `name: value\r\n` lines.
///
/// Names and values must be valid HTTP header fields; anything else would
/// let a value spill into extra lines of the block.
pub fn encode_trailers(trailers: &HeaderSet) -> Result<Bytes, Status> {
    trailers.to_header_map()?;
    let mut out = String::new();
    for (key, value) in trailers.iter() {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    Ok(Bytes::from(out))
}

/// Parse a trailer block.
pub fn decode_trailers(data: &[u8]) -> Result<HeaderSet, Status> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Status::internal("protocol error: trailers are not valid UTF-8"))?;

    let mut trailers = HeaderSet::new();
    for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Status::internal(format!(
                "protocol error: invalid trailer line: {line}"
            )));
        };
        trailers.append(name.trim(), value.trim());
    }
    Ok(trailers)
}
