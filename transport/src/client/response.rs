//! Reading statuses and messages out of responses.

use super::UnaryResponse;
use crate::codec::encoding_from_header;
use bytes::Bytes;
use rpc::protocol::{grpc, read_envelope, triple};
use rpc::{ContentType, Encoding, Envelope, HeaderSet, Inbound, MessageDecoder, Protocol, Status, demux};

/// Decode one inbound envelope, rejecting compressed payloads in an
/// encoding the peer announced but we cannot read.
pub(crate) fn read_inbound(
    protocol: Protocol,
    envelope: Envelope,
    encoding: Encoding,
    unsupported: Option<&Status>,
    max_bytes: usize,
) -> Result<Inbound, Status> {
    if let Some(status) = unsupported
        && envelope.is_compressed()
        && !envelope.is_trailers()
        && !envelope.is_end_stream()
    {
        return Err(status.clone());
    }
    read_envelope(protocol, envelope, encoding, max_bytes)
}

/// Terminal status visible in the response head, before any body.
///
/// For gRPC and gRPC-Web that is a trailers-only response or a non-200
/// status. Triple streaming only fails early on a non-200 status.
pub(crate) fn head_status(content_type: ContentType, http_status: u16, headers: &HeaderSet) -> Option<Status> {
    match content_type.protocol {
        Protocol::Grpc | Protocol::GrpcWeb => grpc::status_from_metadata(headers)
            .or_else(|| (http_status != 200).then(|| grpc::missing_status(http_status))),
        Protocol::Triple => (http_status != 200).then(|| Status::from_http_status(http_status)),
    }
}

/// Status of a body that ended without an in-band terminal frame.
pub(crate) fn status_at_end(protocol: Protocol, http_status: u16, trailers: Option<&HeaderSet>) -> (Status, HeaderSet) {
    match (protocol, trailers) {
        (Protocol::Grpc, Some(trailers)) => (
            grpc::status_from_metadata(trailers).unwrap_or_else(|| grpc::missing_status(http_status)),
            grpc::strip_status(trailers),
        ),
        (Protocol::Triple, _) => (
            Status::internal("protocol error: stream ended without an end-stream frame"),
            HeaderSet::new(),
        ),
        _ => (grpc::missing_status(http_status), HeaderSet::new()),
    }
}

/// Interpret a fully buffered unary response.
pub(crate) fn unary_response(
    content_type: ContentType,
    http_status: u16,
    headers: HeaderSet,
    body: Bytes,
    trailers: Option<HeaderSet>,
    max_bytes: usize,
) -> UnaryResponse {
    if content_type.enveloped {
        enveloped(content_type, http_status, headers, body, trailers, max_bytes)
    } else {
        triple_unary(http_status, headers, body, max_bytes)
    }
}

fn triple_unary(http_status: u16, headers: HeaderSet, body: Bytes, max_bytes: usize) -> UnaryResponse {
    let (headers, trailers) = demux(&headers);
    let status = triple::unary_status(http_status, &body);
    if !status.is_ok() {
        return UnaryResponse {
            status,
            headers,
            trailers,
            message: None,
        };
    }

    let (encoding, unsupported) = encoding_from_header(headers.get(triple::CONTENT_ENCODING));
    let message = match unsupported {
        Some(status) if !body.is_empty() => Err(status),
        _ if body.is_empty() || encoding.is_identity() => {
            if body.len() > max_bytes {
                Err(Status::resource_exhausted(format!(
                    "message larger than read_max_bytes ({max_bytes} bytes)"
                )))
            } else {
                Ok(body)
            }
        }
        _ => encoding.decompress(&body, max_bytes),
    };

    match message {
        Ok(message) => UnaryResponse {
            status: Status::ok(),
            headers,
            trailers,
            message: Some(message),
        },
        Err(status) => UnaryResponse {
            status,
            headers,
            trailers,
            message: None,
        },
    }
}

fn enveloped(
    content_type: ContentType,
    http_status: u16,
    headers: HeaderSet,
    body: Bytes,
    trailers: Option<HeaderSet>,
    max_bytes: usize,
) -> UnaryResponse {
    let protocol = content_type.protocol;
    let failed = |status: Status, headers: HeaderSet| UnaryResponse {
        status,
        headers,
        trailers: HeaderSet::new(),
        message: None,
    };

    if protocol == Protocol::Triple && http_status != 200 {
        let status = triple::unary_status(http_status, &body);
        return failed(status, headers);
    }
    if let Some(status) = head_status(content_type, http_status, &headers) {
        return failed(status, grpc::strip_status(&headers));
    }

    let (encoding, unsupported) = encoding_from_header(headers.get(content_type.encoding_headers().0));
    let mut decoder = MessageDecoder::new(max_bytes);
    decoder.feed(&body);

    let mut message = None;
    let mut end = None;
    loop {
        let envelope = match decoder.decode() {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(status) => return failed(status, headers),
        };
        match read_inbound(protocol, envelope, encoding, unsupported.as_ref(), max_bytes) {
            Ok(Inbound::Message(_)) if message.is_some() => {
                return failed(
                    Status::internal("protocol error: unary response carried more than one message"),
                    headers,
                );
            }
            Ok(Inbound::Message(data)) => message = Some(data),
            Ok(Inbound::End { status, trailers }) => {
                end = Some((status, trailers));
                break;
            }
            Err(status) => return failed(status, headers),
        }
    }

    let (mut status, trailers) = match end {
        Some(end) => end,
        None if decoder.has_buffered_data() => (
            Status::internal("protocol error: response ended inside a message"),
            HeaderSet::new(),
        ),
        None => status_at_end(protocol, http_status, trailers.as_ref()),
    };
    if status.is_ok() && message.is_none() {
        status = Status::internal("protocol error: missing response message");
    }

    UnaryResponse {
        message: message.filter(|_| status.is_ok()),
        status,
        headers,
        trailers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc::frame::{FLAG_END_STREAM, FLAG_TRAILERS};
    use rpc::protocol::grpc_web;
    use rpc::{Code, Codec, encode_envelope, error_to_json, mux};

    const MAX: usize = 1 << 20;

    fn set(pairs: &[(&str, &str)]) -> HeaderSet {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_triple_unary_demuxes_trailers() {
        let ct = ContentType::new(Protocol::Triple, Codec::Proto, false);
        let headers = mux(&set(&[("x-request-id", "7")]), &set(&[("x-cost", "3")]));
        let response = unary_response(ct, 200, headers, Bytes::from_static(b"reply"), None, MAX);

        assert!(response.status.is_ok());
        assert_eq!(response.message.as_deref(), Some(&b"reply"[..]));
        assert_eq!(response.headers.get("x-request-id"), Some("7"));
        assert_eq!(response.trailers.get("x-cost"), Some("3"));
        assert!(response.headers.keys().all(|k| !k.starts_with("trailer-")));
    }

    #[test]
    fn test_triple_unary_error_envelope() {
        let ct = ContentType::new(Protocol::Triple, Codec::Json, false);
        let body = error_to_json(&Status::not_found("no such user"));
        let response = unary_response(ct, 404, HeaderSet::new(), body, None, MAX);
        assert_eq!(response.status.code(), Code::NotFound);
        assert_eq!(response.status.message(), Some("no such user"));
        assert!(response.message.is_none());
    }

    #[test]
    fn test_grpc_trailers_only() {
        let ct = ContentType::new(Protocol::Grpc, Codec::Proto, true);
        let headers = set(&[("grpc-status", "12"), ("grpc-message", "nope")]);
        let response = unary_response(ct, 200, headers, Bytes::new(), None, MAX);
        assert_eq!(response.status.code(), Code::Unimplemented);
        assert!(!response.headers.contains_key("grpc-status"));
    }

    #[test]
    fn test_grpc_missing_status_maps_http() {
        let ct = ContentType::new(Protocol::Grpc, Codec::Proto, true);
        let body = encode_envelope(0, b"reply");

        let response = unary_response(ct, 200, HeaderSet::new(), body, None, MAX);
        assert_eq!(response.status.code(), Code::Unknown);

        let response = unary_response(ct, 503, HeaderSet::new(), Bytes::new(), None, MAX);
        assert_eq!(response.status.code(), Code::Unavailable);
    }

    #[test]
    fn test_grpc_status_in_trailers() {
        let ct = ContentType::new(Protocol::Grpc, Codec::Proto, true);
        let body = encode_envelope(0, b"reply");
        let trailers = set(&[("grpc-status", "0"), ("x-cost", "3")]);
        let response = unary_response(ct, 200, HeaderSet::new(), body, Some(trailers), MAX);

        assert!(response.status.is_ok());
        assert_eq!(response.message.as_deref(), Some(&b"reply"[..]));
        assert_eq!(response.trailers.get("x-cost"), Some("3"));
        assert!(!response.trailers.contains_key("grpc-status"));
    }

    #[test]
    fn test_ok_without_message_is_internal() {
        let ct = ContentType::new(Protocol::Grpc, Codec::Proto, true);
        let trailers = set(&[("grpc-status", "0")]);
        let response = unary_response(ct, 200, HeaderSet::new(), Bytes::new(), Some(trailers), MAX);
        assert_eq!(response.status.code(), Code::Internal);
    }

    #[test]
    fn test_grpc_web_trailer_frame() {
        let ct = ContentType::new(Protocol::GrpcWeb, Codec::Proto, true);
        let mut body = encode_envelope(0, b"reply").to_vec();
        let block = grpc_web::encode_trailers(&set(&[("grpc-status", "0"), ("x-cost", "3")])).unwrap();
        body.extend_from_slice(&encode_envelope(FLAG_TRAILERS, &block));

        let response = unary_response(ct, 200, HeaderSet::new(), Bytes::from(body), None, MAX);
        assert!(response.status.is_ok());
        assert_eq!(response.trailers.get("x-cost"), Some("3"));
    }

    #[test]
    fn test_triple_stream_needs_end_frame() {
        let ct = ContentType::new(Protocol::Triple, Codec::Proto, true);
        let body = encode_envelope(0, b"reply");
        let response = unary_response(ct, 200, HeaderSet::new(), body.clone(), None, MAX);
        assert_eq!(response.status.code(), Code::Internal);

        let mut full = body.to_vec();
        full.extend_from_slice(&encode_envelope(
            FLAG_END_STREAM,
            &triple::encode_end_stream(&Status::ok(), &HeaderSet::new()),
        ));
        let response = unary_response(ct, 200, HeaderSet::new(), Bytes::from(full), None, MAX);
        assert!(response.status.is_ok());
    }

    #[test]
    fn test_unsupported_encoding_only_fails_compressed_messages() {
        let ct = ContentType::new(Protocol::GrpcWeb, Codec::Proto, true);
        let headers = set(&[("grpc-encoding", "snappy")]);
        let block = grpc_web::encode_trailers(&set(&[("grpc-status", "0")])).unwrap();

        let mut plain = encode_envelope(0, b"reply").to_vec();
        plain.extend_from_slice(&encode_envelope(FLAG_TRAILERS, &block));
        let response = unary_response(ct, 200, headers.clone(), Bytes::from(plain), None, MAX);
        assert!(response.status.is_ok());

        let mut compressed = encode_envelope(rpc::frame::FLAG_COMPRESSED, b"????").to_vec();
        compressed.extend_from_slice(&encode_envelope(FLAG_TRAILERS, &block));
        let response = unary_response(ct, 200, headers, Bytes::from(compressed), None, MAX);
        assert_eq!(response.status.code(), Code::Internal);
    }
}
