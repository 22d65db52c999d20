use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use timekeep_core::{
    ActiveSession, ActiveSessionRepository, HistoryRepository, ProgramName, ProgramRecord,
    ProgramRepository, SessionRecord, StoreError, StoreResult,
};

use super::StoreLifecycle;

#[derive(Debug, Default)]
struct MemoryState {
    programs: BTreeMap<ProgramName, ProgramRecord>,
    active: BTreeMap<ProgramName, DateTime<Utc>>,
    history: Vec<SessionRecord>,
    failing: HashSet<&'static str>,
    closed: bool,
}

/// Repository implementation backed by plain collections.
///
/// Operations named with [`MemoryStore::fail_operation`] return a query
/// error every time, which lets tests exercise partial-failure paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, operation: &'static str) -> StoreResult<MutexGuard<'_, MemoryState>> {
        let state = self.state();
        if state.closed {
            return Err(StoreError::Closed);
        }
        if state.failing.contains(operation) {
            return Err(StoreError::query(operation, "injected failure"));
        }
        Ok(state)
    }

    /// Makes every future call of `operation` fail.
    pub fn fail_operation(&self, operation: &'static str) {
        self.state().failing.insert(operation);
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    pub fn add_program_sync(&self, program: ProgramRecord) {
        self.state().programs.insert(program.name.clone(), program);
    }

    /// Moves an open session's start `secs` seconds into the past.
    pub fn backdate_active(&self, name: &ProgramName, secs: i64) {
        if let Some(start) = self.state().active.get_mut(name) {
            *start -= Duration::seconds(secs);
        }
    }

    pub fn program(&self, name: &ProgramName) -> Option<ProgramRecord> {
        self.state().programs.get(name).cloned()
    }

    pub fn history(&self) -> Vec<SessionRecord> {
        self.state().history.clone()
    }

    pub fn active_count(&self) -> usize {
        self.state().active.len()
    }

    pub fn active_start(&self, name: &ProgramName) -> Option<DateTime<Utc>> {
        self.state().active.get(name).copied()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl ProgramRepository for MemoryStore {
    async fn get_all_programs(&self) -> StoreResult<Vec<ProgramRecord>> {
        let state = self.check("get_all_programs")?;
        Ok(state.programs.values().cloned().collect())
    }

    async fn update_lifetime(&self, name: &ProgramName, delta_seconds: i64) -> StoreResult<()> {
        let mut state = self.check("update_lifetime")?;
        let program = state
            .programs
            .get_mut(name)
            .ok_or_else(|| StoreError::ProgramNotFound { name: name.clone() })?;
        program.lifetime_seconds += delta_seconds;
        Ok(())
    }

    async fn add_program(&self, program: ProgramRecord) -> StoreResult<()> {
        let mut state = self.check("add_program")?;
        match state.programs.get_mut(&program.name) {
            Some(existing) => {
                existing.category = program.category;
                existing.project = program.project;
            }
            None => {
                state.programs.insert(program.name.clone(), program);
            }
        }
        Ok(())
    }

    async fn remove_program(&self, name: &ProgramName) -> StoreResult<()> {
        self.check("remove_program")?.programs.remove(name);
        Ok(())
    }

    async fn reset_lifetime(&self, name: &ProgramName) -> StoreResult<()> {
        let mut state = self.check("reset_lifetime")?;
        if let Some(program) = state.programs.get_mut(name) {
            program.lifetime_seconds = 0;
        }
        Ok(())
    }
}

#[async_trait]
impl ActiveSessionRepository for MemoryStore {
    async fn create_active_session(
        &self,
        name: &ProgramName,
        started_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check("create_active_session")?
            .active
            .insert(name.clone(), started_at);
        Ok(())
    }

    async fn get_active_session(&self, name: &ProgramName) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.check("get_active_session")?.active.get(name).copied())
    }

    async fn remove_active_session(&self, name: &ProgramName) -> StoreResult<()> {
        self.check("remove_active_session")?.active.remove(name);
        Ok(())
    }

    async fn remove_active_session_if_started(
        &self,
        name: &ProgramName,
        started_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.check("remove_active_session")?;
        if state.active.get(name) != Some(&started_at) {
            return Ok(false);
        }
        state.active.remove(name);
        Ok(true)
    }

    async fn list_active_sessions(&self) -> StoreResult<Vec<ActiveSession>> {
        let state = self.check("list_active_sessions")?;
        let mut sessions: Vec<ActiveSession> = state
            .active
            .iter()
            .map(|(program, started_at)| ActiveSession {
                program: program.clone(),
                started_at: *started_at,
            })
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }
}

#[async_trait]
impl HistoryRepository for MemoryStore {
    async fn append_history(&self, record: SessionRecord) -> StoreResult<()> {
        self.check("append_history")?.history.push(record);
        Ok(())
    }
}

#[async_trait]
impl StoreLifecycle for MemoryStore {
    async fn close(&self) {
        self.state().closed = true;
    }
}
