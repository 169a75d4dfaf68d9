//! Signal handling for graceful shutdown.

use crate::error::Error;
use tokio::sync::watch;

/// Install a handler for SIGINT and SIGTERM.
///
/// The returned receiver flips to `true` on the first signal. A second
/// signal exits the process immediately.
pub fn install_signal_handler() -> Result<watch::Receiver<bool>, Error> {
    let (tx, rx) = watch::channel(false);

    ctrlc::set_handler(move || {
        if tx.send_replace(true) {
            tracing::warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal, draining in-flight calls");
    })?;

    Ok(rx)
}
