//! Session manager: multiplexes process instances into program sessions.
//!
//! # Locking
//!
//! ```text
//!   create_session / end_session / sweep
//!          │
//!          ▼
//!   ┌──────────────┐  copy out   ┌──────────────────────────┐
//!   │ Mutex<Table> │────────────▶│ repository I/O (no lock) │
//!   └──────────────┘             └──────────────────────────┘
//! ```
//!
//! The table lock is held only for map and set bookkeeping. Guards are
//! dropped before any `.await`, so a slow disk write for one program never
//! stalls notifications for another.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A poisoned lock is recovered; the table holds no invariants that a
//!   panicking writer could leave half-applied
//! - Repository failures are logged and never propagated to callers

mod table;

pub use table::{ProgramTable, SessionSnapshot, TrackedProgram};

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use timekeep_core::{
    ActiveSessionRepository, HistoryRepository, ProgramName, ProgramRepository, SessionRecord,
    StoreResult,
};

pub(crate) use table::ClosedSession;
use table::{StartOutcome, StopOutcome};

/// What a call to [`SessionManager::commit_session`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// History row written (individual persistence steps may still have failed)
    Committed(SessionRecord),
    /// No open active-session record; already committed by a racing path
    NoActiveSession,
    /// The active-session record could not be read
    LookupFailed,
}

/// Owns the in-memory program table and commits finished sessions.
pub struct SessionManager {
    table: Mutex<ProgramTable>,
    programs: Arc<dyn ProgramRepository>,
    active: Arc<dyn ActiveSessionRepository>,
    history: Arc<dyn HistoryRepository>,
}

impl SessionManager {
    pub fn new(
        programs: Arc<dyn ProgramRepository>,
        active: Arc<dyn ActiveSessionRepository>,
        history: Arc<dyn HistoryRepository>,
    ) -> Self {
        Self {
            table: Mutex::new(ProgramTable::default()),
            programs,
            active,
            history,
        }
    }

    /// Builds a manager whose three repositories are one store.
    pub fn with_store<S>(store: Arc<S>) -> Self
    where
        S: ProgramRepository + ActiveSessionRepository + HistoryRepository + 'static,
    {
        Self::new(store.clone(), store.clone(), store)
    }

    /// Acquires the table lock.
    ///
    /// Never hold the returned guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, ProgramTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn program_repository(&self) -> &Arc<dyn ProgramRepository> {
        &self.programs
    }

    pub fn active_repository(&self) -> &Arc<dyn ActiveSessionRepository> {
        &self.active
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Records `pid` as live for `name`.
    ///
    /// The first live PID opens a session and persists its start marker
    /// outside the lock. A failed write is logged; the session stays open
    /// in memory regardless.
    pub async fn create_session(&self, name: &ProgramName, pid: u32) {
        let now = Utc::now();
        let outcome = {
            let mut table = self.lock();
            table.record_start(name, pid, now)
        };

        match outcome {
            StartOutcome::AlreadyTracked => {
                info!(program = %name, pid, "PID already tracked");
            }
            StartOutcome::Joined { live } => {
                info!(program = %name, pid, live, "Added PID to existing session");
            }
            StartOutcome::Opened => {
                if let Err(e) = self.active.create_active_session(name, now).await {
                    error!(program = %name, error = %e, "Failed to persist active session");
                    return;
                }
                info!(program = %name, pid, started_at = %now, "Created new session");
            }
        }
    }

    /// Removes `pid` from the live set and commits when it was the last one.
    pub async fn end_session(&self, name: &ProgramName, pid: u32) {
        let outcome = {
            let mut table = self.lock();
            table.record_stop(name, pid, Utc::now())
        };

        match outcome {
            StopOutcome::UnknownProgram => {
                info!(program = %name, pid, "No active session for program");
            }
            StopOutcome::UnknownPid => {
                info!(program = %name, pid, "PID not tracked for program");
            }
            StopOutcome::Remaining { live } => {
                debug!(program = %name, pid, live, "PID ended, session continues");
            }
            StopOutcome::Emptied(closed) => {
                self.commit_closed(name, closed).await;
            }
        }
    }

    /// Closes the open session for `name`.
    ///
    /// Reads the start marker, appends history, bumps the lifetime and
    /// deletes the marker. Each step is independent: one failing is logged
    /// and the rest still run. Finding no marker is a no-op, which makes
    /// this safe to call twice when the sweeper and a stop notification
    /// race for the same program.
    pub async fn commit_session(&self, name: &ProgramName) -> CommitOutcome {
        self.commit(name, None).await
    }

    /// Commits a session whose live set was emptied under the lock.
    pub(crate) async fn commit_closed(
        &self,
        name: &ProgramName,
        closed: ClosedSession,
    ) -> CommitOutcome {
        self.commit(name, closed.started_at).await
    }

    /// `closing_start` is the in-memory start of the session being closed.
    /// A marker later than that was written by a session opened since the
    /// live set emptied: history is written from `closing_start` and the
    /// marker is left for its owner.
    async fn commit(
        &self,
        name: &ProgramName,
        closing_start: Option<DateTime<Utc>>,
    ) -> CommitOutcome {
        let outcome = match self.active.get_active_session(name).await {
            Ok(Some(marker)) => {
                let superseded = closing_start.filter(|start| marker > *start);
                let started_at = superseded.unwrap_or(marker);
                let record = SessionRecord::closing(name.clone(), started_at, Utc::now());

                let owned_marker = match superseded {
                    Some(_) => None,
                    None => Some(marker),
                };
                self.persist_commit(&record, owned_marker).await;
                info!(
                    program = %name,
                    duration_secs = record.duration_seconds,
                    superseded = superseded.is_some(),
                    "Moved session to history"
                );
                CommitOutcome::Committed(record)
            }
            Ok(None) => {
                info!(program = %name, "No open session record, already committed");
                CommitOutcome::NoActiveSession
            }
            Err(e) => {
                error!(program = %name, error = %e, "Failed to read active session");
                CommitOutcome::LookupFailed
            }
        };

        let removed = self.lock().remove_if_idle(name);
        if !removed {
            debug!(program = %name, "Entry kept after commit (PIDs came back or already gone)");
        }

        outcome
    }

    /// `marker` is the start marker to delete, `None` if it belongs to a
    /// newer session.
    async fn persist_commit(&self, record: &SessionRecord, marker: Option<DateTime<Utc>>) {
        let name = &record.program;

        if let Err(e) = self.history.append_history(record.clone()).await {
            error!(program = %name, error = %e, "Failed to append session history");
        }

        if let Err(e) = self
            .programs
            .update_lifetime(name, record.duration_seconds)
            .await
        {
            error!(program = %name, error = %e, "Failed to update lifetime");
        }

        let Some(marker) = marker else {
            debug!(program = %name, "Start marker belongs to a newer session, keeping it");
            return;
        };
        match self.active.remove_active_session_if_started(name, marker).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(program = %name, "Start marker replaced by a newer session, keeping it");
            }
            Err(e) => {
                error!(program = %name, error = %e, "Failed to remove active session");
            }
        }
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Reads the program catalog and applies it to the table.
    ///
    /// All upserts happen under one lock acquisition. Programs no longer
    /// catalogued lose their idle entries. Returns the catalogued names.
    ///
    /// # Errors
    ///
    /// Returns the store error if the catalog cannot be read.
    pub async fn load_catalog(&self) -> StoreResult<Vec<ProgramName>> {
        let records = self.programs.get_all_programs().await?;
        let keep: HashSet<ProgramName> = records.iter().map(|r| r.name.clone()).collect();

        let removed = {
            let mut table = self.lock();
            for record in records {
                table.ensure_program(&record.name, record.category, record.project);
            }
            table.retain_configured(&keep)
        };

        for name in &removed {
            info!(program = %name, "Stopped tracking program removed from catalog");
        }

        let mut names: Vec<ProgramName> = keep.into_iter().collect();
        names.sort();
        Ok(names)
    }

    /// Discards active-session rows that have no in-memory counterpart.
    ///
    /// Called once at startup, before the monitor reports anything, so
    /// every row present is left over from an unclean shutdown. The real
    /// end time is unknown; crediting the downtime would inflate lifetimes.
    pub async fn discard_orphaned_sessions(&self) -> usize {
        let rows = match self.active.list_active_sessions().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Could not list active sessions for orphan check");
                return 0;
            }
        };

        let mut discarded = 0;
        for row in rows {
            if self
                .lock()
                .get(&row.program)
                .is_some_and(TrackedProgram::has_open_session)
            {
                continue;
            }
            match self.active.remove_active_session(&row.program).await {
                Ok(()) => {
                    warn!(
                        program = %row.program,
                        started_at = %row.started_at,
                        "Discarded orphaned active session"
                    );
                    discarded += 1;
                }
                Err(e) => {
                    error!(program = %row.program, error = %e, "Failed to discard orphaned session");
                }
            }
        }
        discarded
    }

    // ========================================================================
    // Read Access
    // ========================================================================

    /// Copies out every tracked program.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.lock().snapshot()
    }

    /// Copies out only programs with an open session.
    pub fn open_sessions(&self) -> Vec<SessionSnapshot> {
        self.snapshot().into_iter().filter(SessionSnapshot::is_open).collect()
    }

    pub fn tracked(&self, name: &ProgramName) -> Option<TrackedProgram> {
        self.lock().get(name).cloned()
    }

    pub fn live_pids(&self, name: &ProgramName) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .lock()
            .get(name)
            .map(|t| t.live_pids().iter().copied().collect())
            .unwrap_or_default();
        pids.sort_unstable();
        pids
    }

    pub(crate) fn live_pid_sets(&self) -> Vec<(ProgramName, Vec<u32>)> {
        self.lock().live_pid_sets()
    }

    pub(crate) fn discard_dead_pids(
        &self,
        name: &ProgramName,
        dead: &[u32],
    ) -> Option<ClosedSession> {
        self.lock().discard_pids(name, dead)
    }
}
