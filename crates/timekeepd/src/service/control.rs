//! Control sources: where requests come from and where status goes.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::state::{ControlRequest, ServiceState};

/// Status reported back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// Zero on success; non-zero only with `Stopped` after a failure
    pub exit_code: u32,
    pub reason: Option<String>,
}

impl ServiceStatus {
    pub fn new(state: ServiceState) -> Self {
        Self {
            state,
            exit_code: 0,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: ServiceState::Stopped,
            exit_code: 1,
            reason: Some(reason.into()),
        }
    }
}

/// Host binding the orchestrator is driven by.
///
/// A source that returns `None` from `next_request` has gone away; the
/// orchestrator treats that as a shutdown.
#[async_trait]
pub trait ControlSource: Send {
    async fn next_request(&mut self) -> Option<ControlRequest>;

    fn report(&mut self, status: ServiceStatus);
}

/// Channel-backed source, used by service-manager adapters and tests.
pub struct ChannelControlSource {
    requests: mpsc::Receiver<ControlRequest>,
    statuses: mpsc::UnboundedSender<ServiceStatus>,
}

/// The host side of a [`ChannelControlSource`].
pub struct ControlHandle {
    requests: mpsc::Sender<ControlRequest>,
    statuses: mpsc::UnboundedReceiver<ServiceStatus>,
}

impl ChannelControlSource {
    /// Creates a connected source and handle.
    pub fn pair(buffer: usize) -> (Self, ControlHandle) {
        let (req_tx, req_rx) = mpsc::channel(buffer.max(1));
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        (
            Self {
                requests: req_rx,
                statuses: status_tx,
            },
            ControlHandle {
                requests: req_tx,
                statuses: status_rx,
            },
        )
    }
}

#[async_trait]
impl ControlSource for ChannelControlSource {
    async fn next_request(&mut self) -> Option<ControlRequest> {
        self.requests.recv().await
    }

    fn report(&mut self, status: ServiceStatus) {
        if self.statuses.send(status).is_err() {
            debug!("Status receiver dropped");
        }
    }
}

impl ControlHandle {
    /// Sends a request. Returns false once the service stopped listening.
    pub async fn send(&self, request: ControlRequest) -> bool {
        self.requests.send(request).await.is_ok()
    }

    /// Non-async send for callbacks on foreign threads.
    pub fn try_send(&self, request: ControlRequest) -> bool {
        self.requests.try_send(request).is_ok()
    }

    pub async fn next_status(&mut self) -> Option<ServiceStatus> {
        self.statuses.recv().await
    }

    /// Waits until `state` is reported, returning every status seen.
    pub async fn wait_for(&mut self, state: ServiceState) -> Vec<ServiceStatus> {
        let mut seen = Vec::new();
        while let Some(status) = self.statuses.recv().await {
            let done = status.state == state;
            seen.push(status);
            if done {
                break;
            }
        }
        seen
    }
}
