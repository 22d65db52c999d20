//! timekeep daemon - tracks how long catalogued programs run
//!
//! # Usage
//!
//! ```bash
//! # Run in the foreground
//! timekeepd run
//!
//! # Run in the background (fork, PID file, log file)
//! timekeepd run -d
//!
//! # Manage the installed service (systemd user unit, else PID file)
//! timekeepd install | remove | start | stop | status
//!
//! # Enable debug logging
//! RUST_LOG=timekeepd=debug timekeepd run
//! ```
//!
//! On Windows `run` hands control to the Service Control Manager;
//! `run --debug` runs in the console with Ctrl-C as the stop request.
//!
//! # Signal Handling
//!
//! - SIGTERM: Shutdown
//! - SIGINT: Stop

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use timekeep_core::DaemonConfig;
use timekeepd::daemon_manager::{DaemonManager, PidFile, PidFileManager, SystemdManager};
use timekeepd::heartbeat::WakaTimeEmitter;
use timekeepd::monitor::{PollingMonitor, ProcessMonitor};
use timekeepd::probe::SystemProbe;
use timekeepd::server::{DaemonServer, ListenAddr, RequestContext};
use timekeepd::service::{Service, SignalControlSource};
use timekeepd::sessions::SessionManager;
use timekeepd::store::SqliteStore;

/// timekeep daemon - program activity tracker
#[derive(Parser, Debug)]
#[command(name = "timekeepd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the service
    Run {
        /// Fork to the background with a PID file
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Run in the console instead of under the service manager
        #[arg(long)]
        debug: bool,
    },
    /// Install the service definition
    Install,
    /// Remove the service definition
    Remove,
    /// Start the installed service
    Start,
    /// Stop the running service
    Stop,
    /// Show service status
    Status,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Run {
        daemon: false,
        debug: false,
    });

    match command {
        Command::Run { daemon, debug } => run(daemon, debug),
        command => {
            let manager = daemon_manager()?;
            let outcome = match command {
                Command::Install => manager.install(),
                Command::Remove => manager.remove(),
                Command::Start => manager.start(),
                Command::Stop => manager.stop(),
                Command::Status => manager.status(),
                Command::Run { .. } => return Ok(()),
            };
            match outcome {
                Ok(message) => {
                    println!("{message}");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("{e}");
                    process::exit(1);
                }
            }
        }
    }
}

fn daemon_manager() -> Result<Box<dyn DaemonManager>> {
    let exe = env::current_exe().context("Failed to locate timekeepd executable")?;
    if SystemdManager::available() {
        Ok(Box::new(SystemdManager::user(exe)))
    } else {
        Ok(Box::new(PidFileManager::new(
            PidFile::new(PidFile::default_path()),
            exe,
        )))
    }
}

#[cfg(unix)]
fn run(daemon: bool, _debug: bool) -> Result<()> {
    let pid_file = PidFile::new(PidFile::default_path());
    if let Some(pid) = pid_file.running_pid(&SystemProbe) {
        eprintln!("Daemon is already running (PID {pid})");
        eprintln!("Use 'timekeepd stop' to stop it first.");
        process::exit(1);
    }

    if daemon {
        daemonize()?;
    }

    pid_file.write(process::id())?;
    let result = run_foreground();
    pid_file.remove();
    result
}

#[cfg(windows)]
fn run(_daemon: bool, debug: bool) -> Result<()> {
    if debug {
        return run_foreground();
    }
    scm::dispatch().context("Failed to connect to the service control manager")
}

#[cfg(unix)]
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;
    use std::fs::{self, File};

    let log_path = timekeepd::daemon_manager::log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("timekeepd=info".parse()?)
                .add_directive("timekeep_core=info".parse()?),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialise logging: {e}"))
}

/// Wires the store, session manager, monitor, heartbeat and listener.
fn build_service(config: &DaemonConfig) -> Result<Service> {
    let db_path: PathBuf = config.database_path();
    let store = Arc::new(SqliteStore::open(&db_path).context("Failed to open session database")?);
    let sessions = Arc::new(SessionManager::with_store(Arc::clone(&store)));

    let monitor: Arc<dyn ProcessMonitor> = Arc::new(PollingMonitor::system(
        Arc::clone(&sessions),
        config.poll_interval(),
        config.poll_grace,
    ));

    let server = DaemonServer::new(
        ListenAddr::from_config(config),
        RequestContext::new(Arc::clone(&sessions), Arc::clone(&monitor)),
    );

    let mut service = Service::new(
        Arc::clone(&sessions),
        store,
        monitor,
        Arc::new(SystemProbe),
        config.sweep_interval(),
    )
    .with_server(server);

    if let Some(emitter) = WakaTimeEmitter::from_config(sessions, config) {
        service = service.with_heartbeat(Arc::new(emitter));
    }

    Ok(service)
}

#[tokio::main]
async fn run_foreground() -> Result<()> {
    init_tracing()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "timekeep daemon starting"
    );

    let config = DaemonConfig::load().context("Failed to load configuration")?;
    let mut service = build_service(&config)?;
    let mut source = SignalControlSource::new().context("Failed to install signal handlers")?;

    service.run(&mut source).await?;

    info!("timekeep daemon stopped");
    Ok(())
}

#[cfg(windows)]
mod scm {
    use std::ffi::OsString;
    use std::fs::{self, OpenOptions};
    use std::sync::Mutex;

    use anyhow::{anyhow, Context, Result};
    use tracing::{error, info};
    use tracing_subscriber::EnvFilter;
    use windows_service::{define_windows_service, service_dispatcher};

    use timekeep_core::DaemonConfig;
    use timekeepd::daemon_manager::{log_file_path, SERVICE_NAME};
    use timekeepd::service::{ControlSource, ScmControlSource, ServiceStatus};

    define_windows_service!(ffi_service_main, service_main);

    pub fn dispatch() -> windows_service::Result<()> {
        service_dispatcher::start(SERVICE_NAME, ffi_service_main)
    }

    fn service_main(_arguments: Vec<OsString>) {
        if let Err(e) = run_under_scm() {
            error!(error = %e, "Service exited with error");
        }
    }

    /// The SCM gives a service no console, so logs go to a file.
    fn init_file_tracing() -> Result<()> {
        let log_path = log_file_path();
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .context("Failed to open log file")?;

        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive("timekeepd=info".parse()?)
                    .add_directive("timekeep_core=info".parse()?),
            )
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
            .map_err(|e| anyhow!("Failed to initialise logging: {e}"))
    }

    #[tokio::main]
    async fn run_under_scm() -> Result<()> {
        init_file_tracing()?;
        let mut source =
            ScmControlSource::register(SERVICE_NAME).context("Failed to register control handler")?;

        let config = match DaemonConfig::load() {
            Ok(config) => config,
            Err(e) => {
                source.report(ServiceStatus::failed(e.to_string()));
                return Err(e.into());
            }
        };

        let mut service = match super::build_service(&config) {
            Ok(service) => service,
            Err(e) => {
                source.report(ServiceStatus::failed(e.to_string()));
                return Err(e);
            }
        };

        info!("Running under the service control manager");
        service.run(&mut source).await?;
        Ok(())
    }
}
