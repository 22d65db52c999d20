//! Process monitoring: turns the OS process list into start/stop events.
//!
//! The monitor polls the process table, matches executable names against
//! the tracked programs and feeds the [`SessionManager`]. A PID must be
//! missing for `grace` consecutive polls before it is reported stopped,
//! which hides short gaps in the process listing.
//!
//! # Async Safety
//!
//! Process table scans run via `spawn_blocking`.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failed scan is logged and the poll is skipped

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use timekeep_core::ProgramName;

use crate::sessions::SessionManager;

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Source of start/stop notifications for tracked programs.
#[async_trait]
pub trait ProcessMonitor: Send + Sync {
    /// Scans once and opens sessions for programs already running.
    async fn start_initial(&self, programs: &[ProgramName]);

    /// Starts the polling loop, stopped by `cancel` or [`Self::stop`].
    fn start_continuous(&self, cancel: CancellationToken, programs: Vec<ProgramName>);

    /// Stops producing events until [`Self::resume`] or
    /// [`Self::start_continuous`]. Tracked state is left alone.
    async fn stop(&self);

    /// Reconciles tracked PIDs with the processes running now and
    /// restarts the polling loop unless it was stopped.
    async fn resync(&self, programs: Vec<ProgramName>);

    /// Clears a stop and resyncs, restarting the polling loop.
    async fn resume(&self, programs: Vec<ProgramName>) {
        self.resync(programs).await;
    }

    /// True while events are being produced.
    fn is_active(&self) -> bool;
}

/// Lists running processes as `(program, pid)` pairs.
pub trait ProcessScanner: Send + Sync + 'static {
    fn scan(&self) -> Vec<(ProgramName, u32)>;
}

impl<F> ProcessScanner for F
where
    F: Fn() -> Vec<(ProgramName, u32)> + Send + Sync + 'static,
{
    fn scan(&self) -> Vec<(ProgramName, u32)> {
        self()
    }
}

/// Scanner backed by `sysinfo`.
pub struct SystemScanner {
    system: Mutex<System>,
}

impl SystemScanner {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessScanner for SystemScanner {
    fn scan(&self) -> Vec<(ProgramName, u32)> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_all();

        system
            .processes()
            .iter()
            .map(|(pid, process)| {
                let raw: &OsStr = process.name().as_ref();
                (
                    ProgramName::from_process_name(&raw.to_string_lossy()),
                    pid.as_u32(),
                )
            })
            .collect()
    }
}

// ============================================================================
// Poll State
// ============================================================================

/// Kind of a process event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEventKind {
    Started,
    Stopped,
}

/// One start or stop of a tracked program's process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub program: ProgramName,
    pub pid: u32,
    pub kind: ProcessEventKind,
}

impl ProcessEvent {
    fn started(program: ProgramName, pid: u32) -> Self {
        Self {
            program,
            pid,
            kind: ProcessEventKind::Started,
        }
    }

    fn stopped(program: ProgramName, pid: u32) -> Self {
        Self {
            program,
            pid,
            kind: ProcessEventKind::Stopped,
        }
    }
}

/// Diffs successive scans into events, with a miss counter per PID.
#[derive(Debug, Clone)]
pub struct PollState {
    grace: u32,
    seen: HashMap<(ProgramName, u32), u32>,
}

impl PollState {
    /// `grace` of zero behaves like one: a single miss reports a stop.
    pub fn new(grace: u32) -> Self {
        Self {
            grace: grace.max(1),
            seen: HashMap::new(),
        }
    }

    /// Replaces the known set without emitting events.
    pub fn seed(&mut self, running: &[(ProgramName, u32)]) {
        self.seen = running.iter().cloned().map(|key| (key, 0)).collect();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Applies one scan and returns the resulting events.
    ///
    /// Stops are emitted before starts so a recycled PID closes its old
    /// session first.
    pub fn observe(&mut self, running: &[(ProgramName, u32)]) -> Vec<ProcessEvent> {
        let current: HashSet<&(ProgramName, u32)> = running.iter().collect();
        let mut events = Vec::new();

        let mut gone = Vec::new();
        for (key, misses) in self.seen.iter_mut() {
            if current.contains(key) {
                *misses = 0;
                continue;
            }
            *misses += 1;
            if *misses >= self.grace {
                gone.push(key.clone());
            }
        }
        gone.sort();
        for key in gone {
            self.seen.remove(&key);
            events.push(ProcessEvent::stopped(key.0, key.1));
        }

        for key in running {
            if !self.seen.contains_key(key) {
                self.seen.insert(key.clone(), 0);
                events.push(ProcessEvent::started(key.0.clone(), key.1));
            }
        }

        events
    }
}

// ============================================================================
// Polling Monitor
// ============================================================================

#[derive(Default)]
struct LoopState {
    parent: Option<CancellationToken>,
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// [`ProcessMonitor`] that polls a [`ProcessScanner`] on an interval.
///
/// `stop`, `resync` and `resume` run one at a time under `control`.
/// `paused` is raised by `stop` before it queues for the lock, so a
/// resync already in flight sees it and leaves the loop down.
pub struct PollingMonitor {
    sessions: Arc<SessionManager>,
    scanner: Arc<dyn ProcessScanner>,
    interval: Duration,
    state: Arc<Mutex<PollState>>,
    looping: Mutex<LoopState>,
    control: tokio::sync::Mutex<()>,
    paused: AtomicBool,
}

impl PollingMonitor {
    pub fn new(
        sessions: Arc<SessionManager>,
        scanner: Arc<dyn ProcessScanner>,
        interval: Duration,
        grace: u32,
    ) -> Self {
        Self {
            sessions,
            scanner,
            interval,
            state: Arc::new(Mutex::new(PollState::new(grace))),
            looping: Mutex::new(LoopState::default()),
            control: tokio::sync::Mutex::new(()),
            paused: AtomicBool::new(false),
        }
    }

    /// Monitor over the live process table.
    pub fn system(sessions: Arc<SessionManager>, interval: Duration, grace: u32) -> Self {
        Self::new(sessions, Arc::new(SystemScanner::new()), interval, grace)
    }

    fn loop_state(&self) -> MutexGuard<'_, LoopState> {
        self.looping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_state(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_loop(&self, cancel: CancellationToken, programs: Vec<ProgramName>) {
        let mut looping = self.loop_state();
        if let Some(old) = looping.token.take() {
            old.cancel();
        }

        let token = cancel.child_token();
        let wanted: HashSet<ProgramName> = programs.into_iter().collect();
        let sessions = Arc::clone(&self.sessions);
        let scanner = Arc::clone(&self.scanner);
        let state = Arc::clone(&self.state);
        let period = self.interval;
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                programs = wanted.len(),
                interval_ms = period.as_millis() as u64,
                "Process polling started"
            );

            loop {
                tokio::select! {
                    biased;

                    _ = loop_token.cancelled() => {
                        debug!("Process polling stopped");
                        break;
                    }

                    _ = tick.tick() => {
                        let Some(running) = scan_matching(&scanner, &wanted).await else {
                            continue;
                        };
                        let events = state
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .observe(&running);
                        apply_events(&sessions, events).await;
                    }
                }
            }
        });

        looping.parent = Some(cancel);
        looping.token = Some(token);
        looping.handle = Some(handle);
    }

    /// Cancels the loop and waits for it to finish. Callers hold `control`.
    async fn halt(&self) {
        let (token, handle) = {
            let mut looping = self.loop_state();
            (looping.token.take(), looping.handle.take())
        };

        if let Some(token) = token {
            token.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Polling task ended abnormally");
            }
        }
    }
}

/// Scans on the blocking pool and keeps only the requested programs.
async fn scan_matching(
    scanner: &Arc<dyn ProcessScanner>,
    programs: &HashSet<ProgramName>,
) -> Option<Vec<(ProgramName, u32)>> {
    let scanner = Arc::clone(scanner);
    match tokio::task::spawn_blocking(move || scanner.scan()).await {
        Ok(all) => {
            let mut matched: Vec<(ProgramName, u32)> = all
                .into_iter()
                .filter(|(name, _)| programs.contains(name))
                .collect();
            matched.sort();
            Some(matched)
        }
        Err(e) => {
            warn!(error = %e, "Process scan failed");
            None
        }
    }
}

async fn apply_events(sessions: &SessionManager, events: Vec<ProcessEvent>) {
    for event in events {
        match event.kind {
            ProcessEventKind::Started => {
                sessions.create_session(&event.program, event.pid).await;
            }
            ProcessEventKind::Stopped => {
                sessions.end_session(&event.program, event.pid).await;
            }
        }
    }
}

#[async_trait]
impl ProcessMonitor for PollingMonitor {
    async fn start_initial(&self, programs: &[ProgramName]) {
        let wanted: HashSet<ProgramName> = programs.iter().cloned().collect();
        let Some(running) = scan_matching(&self.scanner, &wanted).await else {
            return;
        };

        let events = {
            let mut state = self.poll_state();
            state.seed(&[]);
            state.observe(&running)
        };
        info!(
            programs = wanted.len(),
            running = events.len(),
            "Initial process scan complete"
        );
        apply_events(&self.sessions, events).await;
    }

    fn start_continuous(&self, cancel: CancellationToken, programs: Vec<ProgramName>) {
        self.paused.store(false, Ordering::SeqCst);
        self.spawn_loop(cancel, programs);
    }

    async fn stop(&self) {
        self.paused.store(true, Ordering::SeqCst);
        let _control = self.control.lock().await;
        self.halt().await;
    }

    async fn resync(&self, programs: Vec<ProgramName>) {
        let _control = self.control.lock().await;
        self.halt().await;

        let wanted: HashSet<ProgramName> = programs.iter().cloned().collect();
        if let Some(running) = scan_matching(&self.scanner, &wanted).await {
            let mut events = Vec::new();
            for name in &programs {
                let now: HashSet<u32> = running
                    .iter()
                    .filter(|(n, _)| n == name)
                    .map(|(_, pid)| *pid)
                    .collect();
                let tracked: HashSet<u32> = self.sessions.live_pids(name).into_iter().collect();

                let mut stopped: Vec<u32> = tracked.difference(&now).copied().collect();
                stopped.sort_unstable();
                events.extend(
                    stopped
                        .into_iter()
                        .map(|pid| ProcessEvent::stopped(name.clone(), pid)),
                );

                let mut started: Vec<u32> = now.difference(&tracked).copied().collect();
                started.sort_unstable();
                events.extend(
                    started
                        .into_iter()
                        .map(|pid| ProcessEvent::started(name.clone(), pid)),
                );
            }

            self.poll_state().seed(&running);
            info!(events = events.len(), "Resynchronised with running processes");
            apply_events(&self.sessions, events).await;
        }

        if self.paused.load(Ordering::SeqCst) {
            debug!("Polling stopped, resync only");
            return;
        }

        let parent = self.loop_state().parent.clone();
        match parent {
            Some(parent) if !parent.is_cancelled() => self.spawn_loop(parent, programs),
            Some(_) => debug!("Shutdown in progress, not restarting polling"),
            None => debug!("Polling was never started, resync only"),
        }
    }

    async fn resume(&self, programs: Vec<ProgramName>) {
        self.paused.store(false, Ordering::SeqCst);
        self.resync(programs).await;
    }

    fn is_active(&self) -> bool {
        self.loop_state()
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
