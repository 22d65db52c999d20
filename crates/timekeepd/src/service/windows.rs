//! Windows Service Control Manager binding.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use windows_service::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState as ScmState,
    ServiceStatus as ScmStatus, ServiceType,
};
use windows_service::service_control_handler::{
    self, ServiceControlHandlerResult, ServiceStatusHandle,
};

use super::control::{ControlSource, ServiceStatus};
use super::state::{ControlRequest, ServiceState};

const PENDING_WAIT_HINT: Duration = Duration::from_secs(10);

/// Control source fed by the SCM control handler.
pub struct ScmControlSource {
    requests: mpsc::Receiver<ControlRequest>,
    status_handle: ServiceStatusHandle,
    checkpoint: u32,
}

impl ScmControlSource {
    /// Registers the control handler for `service_name`.
    ///
    /// Must be called from the service main function.
    pub fn register(service_name: &str) -> windows_service::Result<Self> {
        let (tx, rx) = mpsc::channel(16);

        let handler = move |control: ServiceControl| -> ServiceControlHandlerResult {
            let request = control_request(&control);
            // The handler runs on an SCM thread; never block it
            if tx.try_send(request).is_err() {
                warn!(?request, "Control request dropped, queue full");
            }
            match request {
                // Still forwarded so the service logs it
                ControlRequest::Other(code) => {
                    debug!(code, "Unsupported service control");
                    ServiceControlHandlerResult::NotImplemented
                }
                _ => ServiceControlHandlerResult::NoError,
            }
        };

        let status_handle = service_control_handler::register(service_name, handler)?;
        Ok(Self {
            requests: rx,
            status_handle,
            checkpoint: 0,
        })
    }
}

fn control_request(control: &ServiceControl) -> ControlRequest {
    match control {
        ServiceControl::Interrogate => ControlRequest::Interrogate,
        ServiceControl::Stop => ControlRequest::Stop,
        ServiceControl::Shutdown => ControlRequest::Shutdown,
        ServiceControl::Pause => ControlRequest::Pause,
        ServiceControl::Continue => ControlRequest::Continue,
        other => ControlRequest::Other(other.raw_service_control_type()),
    }
}

#[async_trait]
impl ControlSource for ScmControlSource {
    async fn next_request(&mut self) -> Option<ControlRequest> {
        self.requests.recv().await
    }

    fn report(&mut self, status: ServiceStatus) {
        let (current_state, pending) = match status.state {
            ServiceState::Initializing => (ScmState::StartPending, true),
            ServiceState::Running => (ScmState::Running, false),
            ServiceState::Paused => (ScmState::Paused, false),
            ServiceState::Stopping => (ScmState::StopPending, true),
            ServiceState::Stopped => (ScmState::Stopped, false),
        };

        let controls_accepted = match status.state {
            ServiceState::Running | ServiceState::Paused => {
                ServiceControlAccept::STOP
                    | ServiceControlAccept::SHUTDOWN
                    | ServiceControlAccept::PAUSE_CONTINUE
            }
            _ => ServiceControlAccept::empty(),
        };

        self.checkpoint = if pending { self.checkpoint + 1 } else { 0 };

        let result = self.status_handle.set_service_status(ScmStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state,
            controls_accepted,
            exit_code: ServiceExitCode::Win32(status.exit_code),
            checkpoint: self.checkpoint,
            wait_hint: if pending {
                PENDING_WAIT_HINT
            } else {
                Duration::default()
            },
            process_id: None,
        });

        match result {
            Ok(()) => debug!(state = %status.state, "Reported status to SCM"),
            Err(e) => warn!(state = %status.state, error = %e, "Failed to report status to SCM"),
        }
    }
}
