//! Unary calls over HTTP/1.1.
//!
//! Each call dials its own connection; nothing is pooled.

use crate::AbortOnDrop;
use bytes::Bytes;
use http::Request;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper_util::rt::TokioIo;
use rpc::{HeaderSet, Status};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Response head and buffered body of an HTTP/1.1 exchange.
pub(crate) struct Exchanged {
    pub(crate) status: u16,
    pub(crate) headers: HeaderSet,
    pub(crate) body: Bytes,
}

pub(crate) async fn exchange(
    target: SocketAddr,
    request: Request<Full<Bytes>>,
    connect_timeout: Duration,
    limit: usize,
) -> Result<Exchanged, Status> {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(Status::unavailable(format!("failed to connect to {target}: {e}")));
        }
        Err(_) => {
            return Err(Status::unavailable(format!("timed out connecting to {target}")));
        }
    };
    let _ = stream.set_nodelay(true);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Status::unavailable(format!("HTTP/1.1 handshake with {target} failed: {e}")))?;
    let _driver = AbortOnDrop(
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%target, error = %e, "HTTP/1.1 connection closed with error");
            }
        })
        .abort_handle(),
    );

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| Status::unavailable(format!("HTTP/1.1 request to {target} failed: {e}")))?;
    let (parts, body) = response.into_parts();
    let body = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                Status::resource_exhausted(format!("response body larger than {limit} bytes"))
            } else {
                Status::unavailable(format!("failed to read response from {target}: {e}"))
            }
        })?
        .to_bytes();

    Ok(Exchanged {
        status: parts.status.as_u16(),
        headers: HeaderSet::from_header_map(&parts.headers),
        body,
    })
}
