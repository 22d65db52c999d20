//! Activity heartbeats for WakaTime-compatible backends.
//!
//! While a categorised program has an open session, the emitter runs
//! `wakatime-cli` once per interval on its behalf. Wakapi is the same CLI
//! pointed at a different `--api-url`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use timekeep_core::DaemonConfig;

use crate::sessions::{SessionManager, SessionSnapshot};

const DEFAULT_CLI: &str = "wakatime-cli";

/// Sends periodic activity heartbeats for open sessions.
#[async_trait]
pub trait HeartbeatEmitter: Send + Sync {
    /// Starts the emit loop; it ends when `cancel` fires or on [`Self::stop`].
    fn start(&self, cancel: CancellationToken);

    async fn stop(&self);
}

/// One backend the CLI reports to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatTarget {
    pub label: &'static str,
    pub cli_path: PathBuf,
    pub api_key: String,
    pub api_url: Option<String>,
}

impl HeartbeatTarget {
    /// Builds the targets enabled in `config`.
    pub fn from_config(config: &DaemonConfig) -> Vec<Self> {
        let mut targets = Vec::new();

        if config.wakatime.enabled {
            if let Some(key) = &config.wakatime.api_key {
                targets.push(Self {
                    label: "wakatime",
                    cli_path: cli_or_default(config.wakatime.cli_path.as_ref()),
                    api_key: key.clone(),
                    api_url: None,
                });
            }
        }

        if config.wakapi.enabled {
            if let (Some(key), Some(server)) = (&config.wakapi.api_key, &config.wakapi.server) {
                targets.push(Self {
                    label: "wakapi",
                    cli_path: cli_or_default(config.wakapi.cli_path.as_ref()),
                    api_key: key.clone(),
                    api_url: Some(server.clone()),
                });
            }
        }

        targets
    }

    /// CLI arguments for one heartbeat, or `None` if the program has no
    /// category and should not be reported.
    pub fn build_args(
        &self,
        session: &SessionSnapshot,
        global_project: Option<&str>,
    ) -> Option<Vec<String>> {
        let category = session.category.as_deref()?;
        let project = session.project.as_deref().or(global_project);

        let mut args = vec![
            "--key".to_string(),
            self.api_key.clone(),
            "--entity".to_string(),
            session.program.to_string(),
            "--entity-type".to_string(),
            "app".to_string(),
            "--category".to_string(),
            category.to_string(),
        ];
        if let Some(project) = project {
            args.push("--project".to_string());
            args.push(project.to_string());
        }
        args.push("--plugin".to_string());
        args.push(format!("timekeep/{}", env!("CARGO_PKG_VERSION")));
        if let Some(url) = &self.api_url {
            args.push("--api-url".to_string());
            args.push(url.clone());
        }
        Some(args)
    }
}

fn cli_or_default(path: Option<&PathBuf>) -> PathBuf {
    path.cloned().unwrap_or_else(|| PathBuf::from(DEFAULT_CLI))
}

#[derive(Default)]
struct EmitLoop {
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// [`HeartbeatEmitter`] that shells out to `wakatime-cli`.
pub struct WakaTimeEmitter {
    sessions: Arc<SessionManager>,
    targets: Arc<Vec<HeartbeatTarget>>,
    global_project: Option<String>,
    interval: Duration,
    running: Mutex<EmitLoop>,
}

impl WakaTimeEmitter {
    pub fn new(
        sessions: Arc<SessionManager>,
        targets: Vec<HeartbeatTarget>,
        global_project: Option<String>,
        interval: Duration,
    ) -> Self {
        Self {
            sessions,
            targets: Arc::new(targets),
            global_project,
            interval,
            running: Mutex::new(EmitLoop::default()),
        }
    }

    /// Emitter for the integrations enabled in `config`, or `None` if
    /// there are none.
    pub fn from_config(sessions: Arc<SessionManager>, config: &DaemonConfig) -> Option<Self> {
        let targets = HeartbeatTarget::from_config(config);
        if targets.is_empty() {
            return None;
        }
        Some(Self::new(
            sessions,
            targets,
            config.global_project.clone(),
            config.heartbeat_interval(),
        ))
    }

    fn running(&self) -> MutexGuard<'_, EmitLoop> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn send_heartbeat(target: &HeartbeatTarget, args: Vec<String>, program: &str) {
    let output = Command::new(&target.cli_path)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            debug!(backend = target.label, program, "Heartbeat sent");
        }
        Ok(out) => {
            warn!(
                backend = target.label,
                program,
                status = %out.status,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "Heartbeat rejected"
            );
        }
        Err(e) => {
            warn!(
                backend = target.label,
                cli = %target.cli_path.display(),
                error = %e,
                "Failed to run heartbeat CLI"
            );
        }
    }
}

#[async_trait]
impl HeartbeatEmitter for WakaTimeEmitter {
    fn start(&self, cancel: CancellationToken) {
        let mut running = self.running();
        if let Some(old) = running.token.take() {
            old.cancel();
        }

        let token = cancel.child_token();
        let loop_token = token.clone();
        let sessions = Arc::clone(&self.sessions);
        let targets = Arc::clone(&self.targets);
        let global_project = self.global_project.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                targets = targets.len(),
                interval_secs = period.as_secs(),
                "Heartbeat emitter started"
            );

            loop {
                tokio::select! {
                    biased;

                    _ = loop_token.cancelled() => {
                        debug!("Heartbeat emitter stopped");
                        break;
                    }

                    _ = tick.tick() => {
                        for session in sessions.open_sessions() {
                            for target in targets.iter() {
                                let Some(args) =
                                    target.build_args(&session, global_project.as_deref())
                                else {
                                    continue;
                                };
                                send_heartbeat(target, args, session.program.as_str()).await;
                            }
                        }
                    }
                }
            }
        });

        running.token = Some(token);
        running.handle = Some(handle);
    }

    async fn stop(&self) {
        let (token, handle) = {
            let mut running = self.running();
            (running.token.take(), running.handle.take())
        };

        if let Some(token) = token {
            token.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Heartbeat task ended abnormally");
            }
        }
    }
}
