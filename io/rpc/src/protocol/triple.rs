//! Triple, the Connect-style protocol.
//!
//! Unary calls send a bare body and signal errors with the HTTP status and
//! a JSON error envelope; trailers are muxed into headers. Streaming calls
//! are enveloped and end with a JSON end-stream frame.

use crate::envelope::{ErrorJson, error_from_json};
use crate::metadata::HeaderSet;
use crate::status::Status;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const TIMEOUT: &str = "tri-service-timeout";
pub const PROTOCOL_VERSION: &str = "tri-protocol-version";
pub const PROTOCOL_VERSION_VALUE: &str = "1.0.0";
pub const CONTENT_ENCODING: &str = "content-encoding";
pub const ACCEPT_ENCODING: &str = "accept-encoding";
pub const STREAM_CONTENT_ENCODING: &str = "connect-content-encoding";
pub const STREAM_ACCEPT_ENCODING: &str = "connect-accept-encoding";

/// Check `tri-protocol-version`.
pub fn validate_protocol_version(headers: &HeaderSet, required: bool) -> Result<(), Status> {
    match headers.get(PROTOCOL_VERSION) {
        Some(PROTOCOL_VERSION_VALUE) => Ok(()),
        Some(other) => Err(Status::invalid_argument(format!(
            "{PROTOCOL_VERSION} must be {PROTOCOL_VERSION_VALUE}: got \"{other}\""
        ))),
        None if required => Err(Status::invalid_argument(format!(
            "missing required header: set {PROTOCOL_VERSION} to \"{PROTOCOL_VERSION_VALUE}\""
        ))),
        None => Ok(()),
    }
}

/// Status of a unary response.
///
/// HTTP 200 is success. Anything else carries a JSON error envelope,
/// falling back to the HTTP status mapping.
pub fn unary_status(http_status: u16, body: &[u8]) -> Status {
    if http_status == 200 {
        return Status::ok();
    }
    error_from_json(body, Status::from_http_status(http_status))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EndStreamJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorJson>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, Vec<String>>,
}

/// Serialize the end-stream frame payload.
pub fn encode_end_stream(status: &Status, trailers: &HeaderSet) -> Bytes {
    let json = EndStreamJson {
        error: (!status.is_ok()).then(|| ErrorJson::from_status(status)),
        metadata: trailers
            .entries()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect(),
    };
    serde_json::to_vec(&json).map(Bytes::from).unwrap_or_default()
}

/// Parse the end-stream frame payload into the terminal status and trailers.
pub fn decode_end_stream(data: &[u8]) -> Result<(Status, HeaderSet), Status> {
    let json: EndStreamJson = serde_json::from_slice(data)
        .map_err(|e| Status::internal(format!("protocol error: invalid end stream: {e}")))?;

    let mut trailers = HeaderSet::new();
    for (key, values) in json.metadata {
        trailers.set_all(key, values);
    }

    let status = match json.error {
        None => Status::ok(),
        Some(error) => error
            .into_status()
            .unwrap_or_else(|| Status::internal("protocol error: invalid error in end stream")),
    };
    Ok((status, trailers))
}
