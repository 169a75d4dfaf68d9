//! Response writers for each protocol.
//!
//! The handler runs in its own task and emits [`Outbound`] events. The
//! writers here turn them into an HTTP response: the head is produced
//! once the first event arrives and the rest streams through the body.

use super::call::Outbound;
use super::service::CallTracking;
use crate::codec::MessageWriter;
use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode, header};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use rpc::frame::{FLAG_END_STREAM, FLAG_TRAILERS};
use rpc::protocol::{CONTENT_TYPE, grpc, grpc_web, triple};
use rpc::{
    ContentType, HeaderSet, InboundCall, Protocol, Status, encode_envelope, error_to_json,
    http_status_from_code, mux,
};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

/// Everything needed to write the response of a running call.
pub(crate) struct Exchange {
    pub(crate) content_type: ContentType,
    pub(crate) writer: MessageWriter,
    /// Encodings the server accepts, as a header value.
    pub(crate) accept: String,
    pub(crate) rx: mpsc::Receiver<Outbound>,
    pub(crate) tracking: CallTracking,
}

fn handler_vanished() -> Status {
    Status::internal("handler ended without a status")
}

fn empty() -> ResponseBody {
    Empty::<Bytes>::new().boxed_unsync()
}

fn full(data: Bytes) -> ResponseBody {
    Full::new(data).boxed_unsync()
}

/// Response head with validated metadata. Nothing is written when a header
/// is invalid, so a bad entry can never truncate the rest of the head.
fn build(status: u16, headers: &HeaderSet, body: ResponseBody) -> Result<Response<ResponseBody>, Status> {
    let map = headers.to_header_map()?;
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    *response.headers_mut() = map;
    Ok(response)
}

fn plain(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

/// Error response carrying nothing but the status.
fn bare(content_type: ContentType, status: &Status) -> Response<ResponseBody> {
    early_end(content_type, &HeaderSet::new(), status, &HeaderSet::new())
        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR))
}

/// Record the outcome of a call and hand back its response. Invalid
/// handler metadata turns the call into an Internal error.
fn conclude(
    tracking: &mut CallTracking,
    content_type: ContentType,
    status: &Status,
    response: Result<Response<ResponseBody>, Status>,
) -> Response<ResponseBody> {
    match response {
        Ok(response) => {
            tracking.finish(status);
            response
        }
        Err(invalid) => {
            warn!(error = %invalid, "invalid response metadata");
            tracking.finish(&invalid);
            bare(content_type, &invalid)
        }
    }
}

fn split(result: Result<HeaderSet, Status>) -> (Status, HeaderSet) {
    match result {
        Ok(trailers) => (Status::ok(), trailers),
        Err(status) => (status, HeaderSet::new()),
    }
}

/// Final frame of an enveloped response.
fn end_frame(protocol: Protocol, status: &Status, trailers: &HeaderSet) -> Result<Frame<Bytes>, Status> {
    let with_status = grpc::status_to_trailers(status, trailers);
    Ok(match protocol {
        Protocol::Grpc => Frame::trailers(with_status.to_header_map()?),
        Protocol::GrpcWeb => Frame::data(encode_envelope(
            FLAG_TRAILERS,
            &grpc_web::encode_trailers(&with_status)?,
        )),
        Protocol::Triple => {
            trailers.to_header_map()?;
            Frame::data(encode_envelope(
                FLAG_END_STREAM,
                &triple::encode_end_stream(status, trailers),
            ))
        }
    })
}

/// Response for a request that never reached a handler.
pub(crate) fn rejected<H>(method: &Method, inbound: &InboundCall<H>) -> Response<ResponseBody> {
    let status = inbound
        .status()
        .cloned()
        .unwrap_or_else(|| Status::internal("call failed without a status"));

    let Some(content_type) = inbound.content_type() else {
        debug!(path = inbound.path(), %status, "unidentified request");
        if *method != Method::POST {
            let mut response = plain(StatusCode::METHOD_NOT_ALLOWED);
            response
                .headers_mut()
                .insert(header::ALLOW, http::HeaderValue::from_static("POST"));
            return response;
        }
        return plain(StatusCode::UNSUPPORTED_MEDIA_TYPE);
    };

    debug!(
        path = inbound.path(),
        protocol = %content_type.protocol,
        %status,
        "rejected call"
    );
    bare(content_type, &status)
}

/// A response ending before any message: trailers-only for gRPC and
/// gRPC-Web, an error body for Triple unary, and a lone end-stream frame
/// for Triple streaming.
fn early_end(
    content_type: ContentType,
    headers: &HeaderSet,
    status: &Status,
    trailers: &HeaderSet,
) -> Result<Response<ResponseBody>, Status> {
    match (content_type.protocol, content_type.enveloped) {
        (Protocol::Triple, false) => unary_error(headers, status),
        (Protocol::Triple, true) => {
            let mut all = headers.clone();
            all.set(CONTENT_TYPE, content_type.as_str());
            let frame = end_frame(Protocol::Triple, status, trailers)?;
            let data = frame.into_data().unwrap_or_default();
            build(200, &all, full(data))
        }
        (Protocol::Grpc | Protocol::GrpcWeb, _) => {
            let mut all = headers.clone();
            all.extend(&grpc::status_to_trailers(status, trailers));
            all.set(CONTENT_TYPE, content_type.as_str());
            build(200, &all, empty())
        }
    }
}

fn unary_error(headers: &HeaderSet, status: &Status) -> Result<Response<ResponseBody>, Status> {
    let mut all = headers.clone();
    all.set(CONTENT_TYPE, "application/json");
    build(http_status_from_code(status.code()), &all, full(error_to_json(status)))
}

/// Write the response of a running call.
pub(crate) async fn respond(exchange: Exchange) -> Response<ResponseBody> {
    if exchange.content_type.enveloped {
        streaming(exchange).await
    } else {
        unary(exchange).await
    }
}

/// Triple unary: collect the whole reply, then mux trailers into headers.
async fn unary(mut exchange: Exchange) -> Response<ResponseBody> {
    let mut headers = HeaderSet::new();
    let mut message = None;
    let result = loop {
        match exchange.rx.recv().await {
            Some(Outbound::Headers(h)) => headers.extend(&h),
            Some(Outbound::Message(m)) => message = Some(m),
            Some(Outbound::Done(result)) => break result,
            None => break Err(handler_vanished()),
        }
    };

    let reply = result.and_then(|trailers| {
        let message =
            message.ok_or_else(|| Status::internal("unary handler returned no response"))?;
        let (body, compressed) = exchange.writer.body(message)?;
        Ok((body, compressed, trailers))
    });

    let content_type = exchange.content_type;
    match reply {
        Ok((body, compressed, trailers)) => {
            let mut all = mux(&headers, &trailers);
            all.set(CONTENT_TYPE, content_type.as_str());
            all.set(triple::ACCEPT_ENCODING, exchange.accept.as_str());
            if compressed {
                all.set(triple::CONTENT_ENCODING, exchange.writer.encoding().as_str());
            }
            let response = build(200, &all, full(body));
            conclude(&mut exchange.tracking, content_type, &Status::ok(), response)
        }
        Err(status) => {
            let response = unary_error(&headers, &status);
            conclude(&mut exchange.tracking, content_type, &status, response)
        }
    }
}

struct BodyState {
    exchange: Exchange,
    pending: Option<Bytes>,
    done: bool,
}

/// gRPC, gRPC-Web and Triple streaming.
async fn streaming(mut exchange: Exchange) -> Response<ResponseBody> {
    let content_type = exchange.content_type;
    let (headers, pending) = match exchange.rx.recv().await {
        Some(Outbound::Headers(headers)) => (headers, None),
        Some(Outbound::Message(message)) => (HeaderSet::new(), Some(message)),
        Some(Outbound::Done(result)) => {
            let (status, trailers) = split(result);
            let response = early_end(content_type, &HeaderSet::new(), &status, &trailers);
            return conclude(&mut exchange.tracking, content_type, &status, response);
        }
        None => {
            let status = handler_vanished();
            let response = early_end(content_type, &HeaderSet::new(), &status, &HeaderSet::new());
            return conclude(&mut exchange.tracking, content_type, &status, response);
        }
    };

    let mut all = headers;
    all.set(CONTENT_TYPE, content_type.as_str());
    let (encoding_header, accept_header) = content_type.encoding_headers();
    if !exchange.writer.encoding().is_identity() {
        all.set(encoding_header, exchange.writer.encoding().as_str());
    }
    if !exchange.accept.is_empty() {
        all.set(accept_header, exchange.accept.as_str());
    }
    // dropping the tracking record aborts the handler
    let head = match all.to_header_map() {
        Ok(head) => head,
        Err(invalid) => return conclude(&mut exchange.tracking, content_type, &invalid, Err(invalid.clone())),
    };

    let state = BodyState {
        exchange,
        pending,
        done: false,
    };
    let stream = futures_util::stream::unfold(state, next_frame);
    let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
    *response.headers_mut() = head;
    response
}

async fn next_frame(mut state: BodyState) -> Option<(Result<Frame<Bytes>, Infallible>, BodyState)> {
    if state.done {
        return None;
    }
    if let Some(message) = state.pending.take() {
        return Some((Ok(Frame::data(message)), state));
    }

    let result = loop {
        match state.exchange.rx.recv().await {
            Some(Outbound::Message(message)) => return Some((Ok(Frame::data(message)), state)),
            Some(Outbound::Headers(_)) => debug!("ignoring headers sent after the response started"),
            Some(Outbound::Done(result)) => break result,
            None => break Err(handler_vanished()),
        }
    };

    let protocol = state.exchange.content_type.protocol;
    let (status, trailers) = split(result);
    let (status, frame) = match end_frame(protocol, &status, &trailers) {
        Ok(frame) => (status, frame),
        Err(invalid) => {
            warn!(error = %invalid, "dropping invalid response trailers");
            let frame = end_frame(protocol, &invalid, &HeaderSet::new())
                .unwrap_or_else(|_| Frame::trailers(HeaderMap::new()));
            (invalid, frame)
        }
    };
    state.exchange.tracking.finish(&status);
    state.done = true;
    Some((Ok(frame), state))
}
