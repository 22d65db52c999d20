//! Service orchestration: one lifecycle routine driven by a control source.
//!
//! ```text
//!  Initializing ──seed ok──▶ Running ◀──Continue── Paused
//!       │                     │  └─────Pause──────▶  │
//!   seed failed          Stop/Shutdown          Stop/Shutdown
//!       ▼                     ▼                      │
//!    Stopped ◀───────────  Stopping ◀────────────────┘
//! ```
//!
//! The same [`Service::run`] serves the Windows service manager and the
//! signal-driven Unix daemon; only the [`ControlSource`] differs.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Background task failures are logged at the task boundary

mod control;
mod signal;
mod state;
#[cfg(windows)]
mod windows;

pub use control::{ChannelControlSource, ControlHandle, ControlSource, ServiceStatus};
pub use signal::SignalControlSource;
pub use state::{transition, Action, ControlRequest, ServiceState, Step};
#[cfg(windows)]
pub use windows::ScmControlSource;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use timekeep_core::{ProgramName, StoreError};

use crate::heartbeat::HeartbeatEmitter;
use crate::monitor::ProcessMonitor;
use crate::probe::ProcessProbe;
use crate::server::DaemonServer;
use crate::sessions::SessionManager;
use crate::store::StoreLifecycle;
use crate::sweeper::Sweeper;

/// Errors that end a service run.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The program catalog could not be read during initialization
    #[error("Startup failed: {0}")]
    Startup(#[source] StoreError),
}

/// The session-tracking service and its background tasks.
pub struct Service {
    sessions: Arc<SessionManager>,
    store: Arc<dyn StoreLifecycle>,
    monitor: Arc<dyn ProcessMonitor>,
    heartbeat: Option<Arc<dyn HeartbeatEmitter>>,
    probe: Arc<dyn ProcessProbe>,
    sweep_interval: Duration,
    server: Option<Arc<DaemonServer>>,
    cancel: CancellationToken,
    state: ServiceState,
}

impl Service {
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Arc<dyn StoreLifecycle>,
        monitor: Arc<dyn ProcessMonitor>,
        probe: Arc<dyn ProcessProbe>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            sessions,
            store,
            monitor,
            heartbeat: None,
            probe,
            sweep_interval,
            server: None,
            cancel: CancellationToken::new(),
            state: ServiceState::Initializing,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn HeartbeatEmitter>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_server(mut self, server: DaemonServer) -> Self {
        self.server = Some(Arc::new(server));
        self
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Token cancelled when the service shuts down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Runs the service until a stop request arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Startup`] if initialization fails; the
    /// source has already been told `Stopped` with a non-zero exit code.
    pub async fn run<S>(&mut self, source: &mut S) -> Result<(), ServiceError>
    where
        S: ControlSource + ?Sized,
    {
        self.enter(source, ServiceState::Initializing);

        let programs = match self.initialize().await {
            Ok(programs) => programs,
            Err(e) => {
                error!(error = %e, "Service initialization failed");
                self.state = ServiceState::Stopped;
                source.report(ServiceStatus::failed(e.to_string()));
                return Err(ServiceError::Startup(e));
            }
        };

        let tasks = self.start_tasks(programs);
        self.enter(source, ServiceState::Running);

        loop {
            let request = match source.next_request().await {
                Some(request) => request,
                None => {
                    info!("Control source closed, shutting down");
                    ControlRequest::Shutdown
                }
            };

            let step = transition(self.state, request);
            debug!(state = %self.state, ?request, action = ?step.action, "Control request");

            match step.action {
                Action::Report => source.report(ServiceStatus::new(self.state)),
                Action::Suspend => self.suspend().await,
                Action::Resume => self.resume().await,
                Action::Shutdown => {
                    self.enter(source, ServiceState::Stopping);
                    break;
                }
                Action::Ignore => {
                    info!(state = %self.state, ?request, "Ignoring control request");
                }
            }

            if step.next != self.state {
                self.enter(source, step.next);
            }
        }

        self.shutdown(tasks).await;
        self.enter(source, ServiceState::Stopped);
        Ok(())
    }

    fn enter<S>(&mut self, source: &mut S, state: ServiceState)
    where
        S: ControlSource + ?Sized,
    {
        self.state = state;
        info!(state = %state, "Service state changed");
        source.report(ServiceStatus::new(state));
    }

    /// Seeds the table from the catalog and opens sessions for programs
    /// already running.
    async fn initialize(&self) -> Result<Vec<ProgramName>, StoreError> {
        let programs = self.sessions.load_catalog().await?;
        info!(programs = programs.len(), "Loaded program catalog");

        let orphans = self.sessions.discard_orphaned_sessions().await;
        if orphans > 0 {
            warn!(orphans, "Discarded sessions left open by a previous run");
        }

        self.monitor.start_initial(&programs).await;
        Ok(programs)
    }

    fn start_tasks(&self, programs: Vec<ProgramName>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        self.monitor.start_continuous(self.cancel.clone(), programs);

        let sweeper = Sweeper::new(
            Arc::clone(&self.sessions),
            Arc::clone(&self.probe),
            self.sweep_interval,
        );
        tasks.push(sweeper.spawn(self.cancel.clone()));

        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.start(self.cancel.clone());
        }

        if let Some(server) = &self.server {
            let server = Arc::clone(server);
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.run(cancel).await {
                    error!(error = %e, "Request listener failed");
                }
            }));
        }

        tasks
    }

    /// Stops producing events; tracked sessions stay as they are.
    async fn suspend(&self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.stop().await;
        }
        self.monitor.stop().await;
        info!("Monitoring paused");
    }

    async fn resume(&self) {
        let programs = self.sessions.lock().configured_names();
        self.monitor.resume(programs).await;
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.start(self.cancel.clone());
        }
        info!("Monitoring resumed");
    }

    async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        self.cancel.cancel();

        self.monitor.stop().await;
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.stop().await;
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.store.close().await;
        info!("Service stopped");
    }
}
