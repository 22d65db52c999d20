//! Reconciliation sweeper.
//!
//! Stop notifications can be lost (the monitor was paused, the daemon was
//! busy, the OS never told us). On every tick the sweeper probes each
//! tracked PID and commits programs whose PIDs are all gone.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failed probe task counts every PID in that batch as alive

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use timekeep_core::ProgramName;

use crate::probe::ProcessProbe;
use crate::sessions::{CommitOutcome, SessionManager};

/// Result of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Programs with at least one live PID at snapshot time
    pub inspected: usize,
    /// Programs whose session was committed by this pass
    pub committed: Vec<ProgramName>,
}

/// Periodically commits sessions whose processes have all exited.
pub struct Sweeper {
    sessions: Arc<SessionManager>,
    probe: Arc<dyn ProcessProbe>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        sessions: Arc<SessionManager>,
        probe: Arc<dyn ProcessProbe>,
        interval: Duration,
    ) -> Self {
        Self {
            sessions,
            probe,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs a single pass.
    ///
    /// PIDs are copied out under the lock and probed with the lock
    /// released. Only PIDs proven dead are discarded, so a PID recorded
    /// between the snapshot and the commit keeps its session open.
    pub async fn sweep(&self) -> SweepReport {
        let candidates = self.sessions.live_pid_sets();
        let inspected = candidates.len();
        if candidates.is_empty() {
            return SweepReport::default();
        }

        let probe = Arc::clone(&self.probe);
        let probed = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .filter_map(|(name, pids)| {
                    let dead: Vec<u32> = pids
                        .iter()
                        .copied()
                        .filter(|pid| !probe.is_alive(*pid))
                        .collect();
                    // Any survivor keeps the whole program open
                    (dead.len() == pids.len()).then_some((name, dead))
                })
                .collect::<Vec<_>>()
        })
        .await;

        let all_dead = match probed {
            Ok(all_dead) => all_dead,
            Err(e) => {
                warn!(error = %e, "Probe task failed, skipping sweep");
                return SweepReport {
                    inspected,
                    committed: Vec::new(),
                };
            }
        };

        let mut committed = Vec::new();
        for (name, dead) in all_dead {
            let Some(closed) = self.sessions.discard_dead_pids(&name, &dead) else {
                debug!(program = %name, "New PID appeared during sweep, keeping session");
                continue;
            };
            info!(program = %name, pids = ?dead, "All PIDs dead, committing session");
            match self.sessions.commit_closed(&name, closed).await {
                CommitOutcome::Committed(_) | CommitOutcome::NoActiveSession => {
                    committed.push(name);
                }
                CommitOutcome::LookupFailed => {}
            }
        }

        SweepReport {
            inspected,
            committed,
        }
    }

    /// Spawns the periodic sweep task.
    ///
    /// The first pass runs one interval after spawning.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + self.interval, self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_secs = self.interval.as_secs(), "Sweeper started");

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        info!("Sweeper shutting down");
                        break;
                    }

                    _ = tick.tick() => {
                        let report = self.sweep().await;
                        if !report.committed.is_empty() {
                            info!(
                                inspected = report.inspected,
                                committed = report.committed.len(),
                                "Sweep committed stale sessions"
                            );
                        }
                    }
                }
            }

            debug!("Sweeper task completed");
        })
    }
}
