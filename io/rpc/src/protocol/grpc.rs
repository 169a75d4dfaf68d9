//! gRPC status metadata.

use crate::metadata::HeaderSet;
use crate::status::{Code, Status, code_from_http_status};

pub const TIMEOUT: &str = "grpc-timeout";
pub const ENCODING: &str = "grpc-encoding";
pub const ACCEPT_ENCODING: &str = "grpc-accept-encoding";
pub const STATUS: &str = "grpc-status";
pub const MESSAGE: &str = "grpc-message";
pub const TE: &str = "te";

/// Read `grpc-status` and `grpc-message` from headers or trailers.
///
/// Returns `None` when no status is present. A malformed status value is
/// itself reported as an Internal status.
pub fn status_from_metadata(metadata: &HeaderSet) -> Option<Status> {
    let raw = metadata.get(STATUS)?;
    let Some(code) = raw.trim().parse::<u32>().ok().and_then(Code::try_from_u32) else {
        return Some(Status::internal(format!(
            "protocol error: invalid grpc-status: {raw}"
        )));
    };

    if code.is_ok() {
        return Some(Status::ok());
    }
    Some(match metadata.get(MESSAGE) {
        Some(message) => Status::new(code, percent_decode(message)),
        None => Status::from_code(code),
    })
}

/// Status for a response that ended without `grpc-status`.
pub fn missing_status(http_status: u16) -> Status {
    Status::new(
        code_from_http_status(http_status),
        format!("protocol error: missing grpc-status (HTTP {http_status})"),
    )
}

/// Append the status fields after the user trailers.
pub fn status_to_trailers(status: &Status, trailers: &HeaderSet) -> HeaderSet {
    let mut out = strip_status(trailers);
    out.set(STATUS, status.code().as_u32().to_string());
    if let Some(message) = status.message() {
        out.set(MESSAGE, percent_encode(message));
    }
    out
}

/// Remove the status fields, leaving user trailers.
pub fn strip_status(trailers: &HeaderSet) -> HeaderSet {
    let mut out = trailers.clone();
    out.remove(STATUS);
    out.remove(MESSAGE);
    out
}

/// Percent-encode a `grpc-message` value.
pub fn percent_encode(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for byte in message.bytes() {
        if (0x20..=0x7e).contains(&byte) && byte != b'%' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Decode a `grpc-message` value. Invalid escapes are kept verbatim.
pub fn percent_decode(message: &str) -> String {
    let bytes = message.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
            && let Some(decoded) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            out.push(decoded);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
