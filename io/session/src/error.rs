//! Session errors and their RPC status.

use rpc::Status;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {target}")]
    ConnectTimeout { target: SocketAddr },
    #[error("HTTP/2 handshake with {target} failed: {source}")]
    Handshake {
        target: SocketAddr,
        #[source]
        source: h2::Error,
    },
    #[error("session refused a new stream: {0}")]
    Refused(#[source] h2::Error),
    #[error("session closed")]
    Closed,
    #[error("session manager is shut down")]
    Shutdown,
}

impl From<SessionError> for Status {
    fn from(err: SessionError) -> Self {
        match &err {
            SessionError::Refused(e) => {
                let status = status_from_h2(e);
                Status::new(status.code(), err.to_string())
            }
            _ => Status::unavailable(err.to_string()),
        }
    }
}

/// Map an HTTP/2 error observed on a stream to an RPC status.
pub fn status_from_h2(err: &h2::Error) -> Status {
    if let Some(reason) = err.reason() {
        return match reason {
            h2::Reason::CANCEL => Status::cancelled("stream cancelled by peer"),
            h2::Reason::REFUSED_STREAM => Status::unavailable("stream refused by peer"),
            h2::Reason::ENHANCE_YOUR_CALM => {
                Status::resource_exhausted("peer asked to enhance your calm")
            }
            h2::Reason::INADEQUATE_SECURITY => {
                Status::new(rpc::Code::PermissionDenied, "inadequate transport security")
            }
            _ if err.is_go_away() => Status::unavailable(format!("session went away: {reason}")),
            h2::Reason::NO_ERROR => Status::unavailable("stream closed by peer"),
            _ => Status::internal(format!("stream reset: {reason}")),
        };
    }
    if err.is_io() {
        return Status::unavailable(format!("connection error: {err}"));
    }
    Status::internal(format!("HTTP/2 error: {err}"))
}
