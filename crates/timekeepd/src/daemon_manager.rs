//! Daemon lifecycle commands: `install | remove | start | stop | status`.
//!
//! Two backends:
//! - [`SystemdManager`] - a systemd user unit driven through `systemctl`
//! - [`PidFileManager`] - a PID file and signals, for hosts without systemd
//!
//! Each command returns a human-readable line for the CLI to print.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::probe::{ProcessProbe, SystemProbe};

/// Unit and service name
pub const SERVICE_NAME: &str = "timekeep";

/// How long `stop` waits for the process to exit
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(100);

/// Errors from daemon lifecycle commands.
#[derive(Debug, Error)]
pub enum DaemonManagerError {
    #[error("Failed to {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Daemon is already running (PID {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("Daemon did not stop within {secs} seconds (PID {pid})")]
    StopTimeout { pid: u32, secs: u64 },

    #[error("Failed to signal PID {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl DaemonManagerError {
    fn io(action: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { action, source }
    }
}

pub type ManagerResult = Result<String, DaemonManagerError>;

/// Installs and controls the daemon through the host's service facility.
pub trait DaemonManager {
    fn install(&self) -> ManagerResult;
    fn remove(&self) -> ManagerResult;
    fn start(&self) -> ManagerResult;
    fn stop(&self) -> ManagerResult;
    fn status(&self) -> ManagerResult;
}

// ============================================================================
// PID File
// ============================================================================

/// The daemon's PID file.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<state_dir>/timekeep/timekeepd.pid`
    pub fn default_path() -> PathBuf {
        state_dir().join("timekeepd.pid")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Option<u32> {
        let mut file = File::open(&self.path).ok()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).ok()?;
        contents.trim().parse().ok()
    }

    pub fn write(&self, pid: u32) -> Result<(), DaemonManagerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(DaemonManagerError::io("create state directory"))?;
        }
        let mut file =
            File::create(&self.path).map_err(DaemonManagerError::io("create PID file"))?;
        write!(file, "{pid}").map_err(DaemonManagerError::io("write PID file"))?;
        Ok(())
    }

    pub fn remove(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "Failed to remove PID file");
            }
        }
    }

    /// PID of the running daemon. A stale file is removed.
    pub fn running_pid(&self, probe: &dyn ProcessProbe) -> Option<u32> {
        let pid = self.read()?;
        if probe.is_alive(pid) {
            return Some(pid);
        }
        debug!(pid, "Removing stale PID file");
        self.remove();
        None
    }
}

/// `<state_dir>/timekeep`, falling back to `/tmp/timekeep`.
pub fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(SERVICE_NAME)
}

/// `<state_dir>/timekeep/timekeepd.log`
pub fn log_file_path() -> PathBuf {
    state_dir().join("timekeepd.log")
}

// ============================================================================
// PID File Manager
// ============================================================================

/// Manages a self-daemonizing `timekeepd run --daemon`.
pub struct PidFileManager {
    pid_file: PidFile,
    exe: PathBuf,
    probe: Box<dyn ProcessProbe>,
}

impl PidFileManager {
    pub fn new(pid_file: PidFile, exe: impl Into<PathBuf>) -> Self {
        Self {
            pid_file,
            exe: exe.into(),
            probe: Box::new(SystemProbe),
        }
    }

    pub fn with_probe(mut self, probe: impl ProcessProbe) -> Self {
        self.probe = Box::new(probe);
        self
    }

    fn running_pid(&self) -> Option<u32> {
        self.pid_file.running_pid(self.probe.as_ref())
    }
}

impl DaemonManager for PidFileManager {
    fn install(&self) -> ManagerResult {
        Ok("No service manager in use; nothing to install.".to_string())
    }

    fn remove(&self) -> ManagerResult {
        self.pid_file.remove();
        Ok("No service manager in use; removed PID file if present.".to_string())
    }

    fn start(&self) -> ManagerResult {
        if let Some(pid) = self.running_pid() {
            return Err(DaemonManagerError::AlreadyRunning { pid });
        }

        let status = Command::new(&self.exe)
            .args(["run", "--daemon"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(DaemonManagerError::io("launch daemon"))?;

        if !status.success() {
            return Err(DaemonManagerError::Command {
                command: format!("{} run --daemon", self.exe.display()),
                status: status.to_string(),
                stderr: String::new(),
            });
        }
        info!(exe = %self.exe.display(), "Daemon launched");
        Ok("Daemon started.".to_string())
    }

    fn stop(&self) -> ManagerResult {
        let Some(pid) = self.running_pid() else {
            return Ok("Daemon is not running.".to_string());
        };

        send_terminate(pid)?;

        let attempts = STOP_TIMEOUT.as_millis() / STOP_POLL.as_millis();
        for _ in 0..attempts {
            if !self.probe.is_alive(pid) {
                self.pid_file.remove();
                return Ok(format!("Daemon stopped (PID {pid})."));
            }
            thread::sleep(STOP_POLL);
        }

        Err(DaemonManagerError::StopTimeout {
            pid,
            secs: STOP_TIMEOUT.as_secs(),
        })
    }

    fn status(&self) -> ManagerResult {
        Ok(match self.running_pid() {
            Some(pid) => format!("Daemon is running (PID {pid})"),
            None => "Daemon is not running.".to_string(),
        })
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> Result<(), DaemonManagerError> {
    let raw = i32::try_from(pid).map_err(|e| DaemonManagerError::Signal {
        pid,
        reason: e.to_string(),
    })?;

    // SAFETY: plain kill(2) on a PID read from our own PID file.
    if unsafe { libc::kill(raw, libc::SIGTERM) } != 0 {
        return Err(DaemonManagerError::Signal {
            pid,
            reason: io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> Result<(), DaemonManagerError> {
    Err(DaemonManagerError::Unsupported("Stopping by PID"))
}

// ============================================================================
// systemd
// ============================================================================

/// Manages a systemd user unit.
pub struct SystemdManager {
    unit_dir: PathBuf,
    exe: PathBuf,
}

impl SystemdManager {
    pub fn new(unit_dir: impl Into<PathBuf>, exe: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            exe: exe.into(),
        }
    }

    /// User unit directory (`~/.config/systemd/user`).
    pub fn user(exe: impl Into<PathBuf>) -> Self {
        let unit_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc/xdg"))
            .join("systemd")
            .join("user");
        Self::new(unit_dir, exe)
    }

    /// True if the host booted with systemd.
    pub fn available() -> bool {
        Path::new("/run/systemd/system").exists()
    }

    pub fn unit_name() -> String {
        format!("{SERVICE_NAME}.service")
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(Self::unit_name())
    }

    /// Unit file body for running `exe` in the foreground.
    pub fn unit_contents(&self) -> String {
        format!(
            "[Unit]\n\
             Description=timekeep program activity tracker\n\
             After=default.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={} run\n\
             Restart=on-failure\n\
             KillSignal=SIGTERM\n\
             \n\
             [Install]\n\
             WantedBy=default.target\n",
            self.exe.display()
        )
    }

    fn systemctl(&self, args: &[&str]) -> ManagerResult {
        let output = Command::new("systemctl")
            .arg("--user")
            .args(args)
            .output()
            .map_err(DaemonManagerError::io("run systemctl"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            return Err(DaemonManagerError::Command {
                command: format!("systemctl --user {}", args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

impl DaemonManager for SystemdManager {
    fn install(&self) -> ManagerResult {
        fs::create_dir_all(&self.unit_dir).map_err(DaemonManagerError::io("create unit directory"))?;
        fs::write(self.unit_path(), self.unit_contents())
            .map_err(DaemonManagerError::io("write unit file"))?;

        self.systemctl(&["daemon-reload"])?;
        self.systemctl(&["enable", &Self::unit_name()])?;
        info!(unit = %self.unit_path().display(), "Installed systemd unit");
        Ok(format!("Installed {}", self.unit_path().display()))
    }

    fn remove(&self) -> ManagerResult {
        // Disabling a unit that was never enabled fails; removal continues
        if let Err(e) = self.systemctl(&["disable", "--now", &Self::unit_name()]) {
            debug!(error = %e, "Disable failed during remove");
        }

        let path = self.unit_path();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(DaemonManagerError::Io {
                    action: "remove unit file",
                    source: e,
                })
            }
        }
        self.systemctl(&["daemon-reload"])?;
        Ok(format!("Removed {}", path.display()))
    }

    fn start(&self) -> ManagerResult {
        self.systemctl(&["start", &Self::unit_name()])?;
        Ok("Daemon started.".to_string())
    }

    fn stop(&self) -> ManagerResult {
        self.systemctl(&["stop", &Self::unit_name()])?;
        Ok("Daemon stopped.".to_string())
    }

    fn status(&self) -> ManagerResult {
        // is-active exits non-zero for inactive units; that is still an answer
        match self.systemctl(&["is-active", &Self::unit_name()]) {
            Ok(state) => Ok(format!("Daemon is {state}")),
            Err(DaemonManagerError::Command { .. }) => Ok("Daemon is not running.".to_string()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::new(dir.path().join("state").join("timekeepd.pid"));

        assert_eq!(pid_file.read(), None);
        pid_file.write(4242).unwrap();
        assert_eq!(pid_file.read(), Some(4242));
        pid_file.remove();
        assert_eq!(pid_file.read(), None);
    }

    #[test]
    fn test_stale_pid_file_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::new(dir.path().join("timekeepd.pid"));
        pid_file.write(4242).unwrap();

        let dead = |_pid: u32| false;
        assert_eq!(pid_file.running_pid(&dead), None);
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn test_pid_manager_status() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::new(dir.path().join("timekeepd.pid"));
        pid_file.write(77).unwrap();

        let manager =
            PidFileManager::new(pid_file.clone(), "/nonexistent").with_probe(|pid: u32| pid == 77);
        assert_eq!(manager.status().unwrap(), "Daemon is running (PID 77)");

        let manager = PidFileManager::new(pid_file, "/nonexistent").with_probe(|_pid: u32| false);
        assert_eq!(manager.status().unwrap(), "Daemon is not running.");
    }

    #[test]
    fn test_start_refuses_when_running() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::new(dir.path().join("timekeepd.pid"));
        pid_file.write(77).unwrap();

        let manager = PidFileManager::new(pid_file, "/nonexistent").with_probe(|_pid: u32| true);
        assert!(matches!(
            manager.start(),
            Err(DaemonManagerError::AlreadyRunning { pid: 77 })
        ));
    }

    #[test]
    fn test_systemd_unit_contents() {
        let manager = SystemdManager::new("/tmp/units", "/usr/local/bin/timekeepd");
        let unit = manager.unit_contents();
        assert!(unit.contains("ExecStart=/usr/local/bin/timekeepd run"));
        assert!(unit.contains("WantedBy=default.target"));
        assert_eq!(manager.unit_path(), PathBuf::from("/tmp/units/timekeep.service"));
    }
}
