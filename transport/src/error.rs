//! Startup and configuration errors.
//!
//! Per-call failures are always an [`rpc::Status`]; this type only covers
//! building and running a server.

use rpc::RegistryError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}
