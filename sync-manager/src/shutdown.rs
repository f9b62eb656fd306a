//! SIGINT/SIGTERM handling.
//!
//! A run is not cancellable from the inside: the caller races the run against
//! [`wait_for_signal`] and drops the run future when a signal wins, which
//! releases the run lock and kills child processes.

use tokio::signal;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
        }
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn wait_for_signal() -> std::io::Result<Signal> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let received = tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            Signal::Interrupt
        }
        _ = terminate.recv() => Signal::Terminate,
    };

    info!(signal = received.as_str(), "Signal received, aborting run");
    Ok(received)
}
