//! Signal-driven control source for foreground and daemonized runs.
//!
//! SIGTERM maps to `Shutdown`, SIGINT to `Stop`. Both end the run the same
//! way. Status reports only go to the log; there is no manager to tell.

use std::io;

use async_trait::async_trait;
use tracing::{info, warn};

use super::control::{ControlSource, ServiceStatus};
use super::state::ControlRequest;

pub struct SignalControlSource {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
}

impl SignalControlSource {
    /// Installs the signal handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler cannot be registered.
    #[cfg(unix)]
    pub fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    #[cfg(not(unix))]
    pub fn new() -> io::Result<Self> {
        Ok(Self {})
    }
}

#[async_trait]
impl ControlSource for SignalControlSource {
    #[cfg(unix)]
    async fn next_request(&mut self) -> Option<ControlRequest> {
        tokio::select! {
            _ = self.terminate.recv() => {
                info!("Received SIGTERM");
                Some(ControlRequest::Shutdown)
            }
            _ = self.interrupt.recv() => {
                info!("Received SIGINT");
                Some(ControlRequest::Stop)
            }
        }
    }

    #[cfg(not(unix))]
    async fn next_request(&mut self) -> Option<ControlRequest> {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C");
                Some(ControlRequest::Stop)
            }
            Err(e) => {
                warn!(error = %e, "Ctrl-C handler failed");
                None
            }
        }
    }

    fn report(&mut self, status: ServiceStatus) {
        match status.reason {
            Some(reason) if status.exit_code != 0 => {
                warn!(
                    state = %status.state,
                    exit_code = status.exit_code,
                    reason = %reason,
                    "Service state"
                );
            }
            _ => info!(state = %status.state, "Service state"),
        }
    }
}
