//! The lock-guarded program table.
//!
//! Everything in here is pure in-memory bookkeeping. The `SessionManager`
//! holds a `ProgramTable` behind its mutex; code that needs the table gets
//! `&mut ProgramTable` only through the guard, which is how the "caller
//! holds the lock" precondition of [`ProgramTable::ensure_program`] is
//! enforced.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use timekeep_core::ProgramName;

// ============================================================================
// Tracked Program
// ============================================================================

/// In-memory session state for one program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedProgram {
    pub category: Option<String>,
    pub project: Option<String>,
    live_pids: HashSet<u32>,
    started_at: Option<DateTime<Utc>>,
    last_seen_at: Option<DateTime<Utc>>,
}

impl TrackedProgram {
    fn with_meta(meta: Option<&ProgramMeta>) -> Self {
        Self {
            category: meta.and_then(|m| m.category.clone()),
            project: meta.and_then(|m| m.project.clone()),
            ..Self::default()
        }
    }

    pub fn live_pids(&self) -> &HashSet<u32> {
        &self.live_pids
    }

    /// Start of the open session, `None` while no PID is live.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        self.last_seen_at
    }

    pub fn has_open_session(&self) -> bool {
        !self.live_pids.is_empty()
    }

    fn sorted_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.live_pids.iter().copied().collect();
        pids.sort_unstable();
        pids
    }
}

/// Configured metadata, kept across commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ProgramMeta {
    category: Option<String>,
    project: Option<String>,
}

// ============================================================================
// Transition Outcomes
// ============================================================================

/// Result of recording a started process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartOutcome {
    /// PID was already live; only `last_seen_at` moved
    AlreadyTracked,
    /// PID joined a session that was already open
    Joined { live: usize },
    /// First live PID; a new session opened at this instant
    Opened,
}

/// Result of recording a stopped process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopOutcome {
    UnknownProgram,
    UnknownPid,
    Remaining { live: usize },
    /// Last live PID is gone; the session must commit
    Emptied(ClosedSession),
}

/// A session whose live set just emptied.
///
/// `started_at` is taken from the entry under the lock, so it names this
/// session even if a newer one opens before the commit runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClosedSession {
    pub started_at: Option<DateTime<Utc>>,
}

/// Read-only copy of one tracked program, safe to use after the lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub program: ProgramName,
    pub category: Option<String>,
    pub project: Option<String>,
    /// Sorted ascending
    pub live_pids: Vec<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn is_open(&self) -> bool {
        !self.live_pids.is_empty()
    }
}

// ============================================================================
// Program Table
// ============================================================================

#[derive(Debug, Default)]
pub struct ProgramTable {
    programs: HashMap<ProgramName, TrackedProgram>,
    catalog: HashMap<ProgramName, ProgramMeta>,
}

impl ProgramTable {
    /// Idempotent upsert of tracking metadata.
    ///
    /// Only reachable through the manager's lock guard. Seeding calls this
    /// for every catalog row inside one critical section.
    pub fn ensure_program(
        &mut self,
        name: &ProgramName,
        category: Option<String>,
        project: Option<String>,
    ) {
        let meta = ProgramMeta { category, project };

        let tracked = self.programs.entry(name.clone()).or_default();
        if tracked.category != meta.category {
            tracked.category.clone_from(&meta.category);
        }
        if tracked.project != meta.project {
            tracked.project.clone_from(&meta.project);
        }

        self.catalog.insert(name.clone(), meta);
    }

    /// Drops configuration for programs not in `keep`.
    ///
    /// Entries with live PIDs stay until their session commits. Returns the
    /// names whose in-memory entry was removed.
    pub fn retain_configured(&mut self, keep: &HashSet<ProgramName>) -> Vec<ProgramName> {
        self.catalog.retain(|name, _| keep.contains(name));

        let removed: Vec<ProgramName> = self
            .programs
            .iter()
            .filter(|(name, tracked)| !keep.contains(*name) && !tracked.has_open_session())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removed {
            self.programs.remove(name);
        }
        removed
    }

    pub fn get(&self, name: &ProgramName) -> Option<&TrackedProgram> {
        self.programs.get(name)
    }

    pub fn contains(&self, name: &ProgramName) -> bool {
        self.programs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Names of every configured program, sorted.
    pub fn configured_names(&self) -> Vec<ProgramName> {
        let mut names: Vec<ProgramName> = self.catalog.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut out: Vec<SessionSnapshot> = self
            .programs
            .iter()
            .map(|(name, tracked)| SessionSnapshot {
                program: name.clone(),
                category: tracked.category.clone(),
                project: tracked.project.clone(),
                live_pids: tracked.sorted_pids(),
                started_at: tracked.started_at,
                last_seen_at: tracked.last_seen_at,
            })
            .collect();
        out.sort_by(|a, b| a.program.cmp(&b.program));
        out
    }

    pub(crate) fn record_start(
        &mut self,
        name: &ProgramName,
        pid: u32,
        now: DateTime<Utc>,
    ) -> StartOutcome {
        let meta = self.catalog.get(name);
        let tracked = self
            .programs
            .entry(name.clone())
            .or_insert_with(|| TrackedProgram::with_meta(meta));

        tracked.last_seen_at = Some(now);

        if !tracked.live_pids.insert(pid) {
            return StartOutcome::AlreadyTracked;
        }

        if tracked.live_pids.len() == 1 {
            tracked.started_at = Some(now);
            StartOutcome::Opened
        } else {
            StartOutcome::Joined {
                live: tracked.live_pids.len(),
            }
        }
    }

    pub(crate) fn record_stop(
        &mut self,
        name: &ProgramName,
        pid: u32,
        now: DateTime<Utc>,
    ) -> StopOutcome {
        let Some(tracked) = self.programs.get_mut(name) else {
            return StopOutcome::UnknownProgram;
        };

        if !tracked.live_pids.contains(&pid) {
            return StopOutcome::UnknownPid;
        }

        tracked.last_seen_at = Some(now);
        tracked.live_pids.remove(&pid);

        if tracked.live_pids.is_empty() {
            StopOutcome::Emptied(ClosedSession {
                started_at: tracked.started_at.take(),
            })
        } else {
            StopOutcome::Remaining {
                live: tracked.live_pids.len(),
            }
        }
    }

    /// Copies out every program with at least one live PID.
    pub(crate) fn live_pid_sets(&self) -> Vec<(ProgramName, Vec<u32>)> {
        let mut out: Vec<(ProgramName, Vec<u32>)> = self
            .programs
            .iter()
            .filter(|(_, tracked)| tracked.has_open_session())
            .map(|(name, tracked)| (name.clone(), tracked.sorted_pids()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Removes PIDs proven dead.
    ///
    /// Returns the closed session if this emptied the live set. PIDs added
    /// after the probe snapshot are left alone, so a program restarted
    /// mid-sweep keeps its session.
    pub(crate) fn discard_pids(&mut self, name: &ProgramName, dead: &[u32]) -> Option<ClosedSession> {
        let tracked = self.programs.get_mut(name)?;
        if !tracked.has_open_session() {
            return None;
        }
        for pid in dead {
            tracked.live_pids.remove(pid);
        }
        if tracked.has_open_session() {
            return None;
        }
        Some(ClosedSession {
            started_at: tracked.started_at.take(),
        })
    }

    /// Removes the entry after a commit if no PID came back in the meantime.
    pub(crate) fn remove_if_idle(&mut self, name: &ProgramName) -> bool {
        match self.programs.get(name) {
            Some(tracked) if !tracked.has_open_session() => {
                self.programs.remove(name);
                true
            }
            _ => false,
        }
    }
}
