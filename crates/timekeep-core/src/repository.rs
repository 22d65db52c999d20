//! Repository contracts consumed by the session engine.
//!
//! The engine never sees a schema. It talks to persistence only through
//! these three narrow traits, each call being an independent, fallible
//! operation that the caller may log and abandon.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{ActiveSession, ProgramName, ProgramRecord, SessionRecord, StoreResult};

/// Durable catalog of tracked programs and their cumulative lifetimes.
#[async_trait]
pub trait ProgramRepository: Send + Sync {
    /// Returns every program in the catalog.
    async fn get_all_programs(&self) -> StoreResult<Vec<ProgramRecord>>;

    /// Adds `delta_seconds` to the program's lifetime.
    ///
    /// # Errors
    /// - `StoreError::ProgramNotFound` if the program is not catalogued
    async fn update_lifetime(&self, name: &ProgramName, delta_seconds: i64) -> StoreResult<()>;

    /// Inserts a program, or updates category/project if it already exists.
    async fn add_program(&self, program: ProgramRecord) -> StoreResult<()>;

    /// Removes a program from the catalog. Missing programs are not an error.
    async fn remove_program(&self, name: &ProgramName) -> StoreResult<()>;

    /// Sets the program's lifetime back to zero.
    async fn reset_lifetime(&self, name: &ProgramName) -> StoreResult<()>;
}

/// One open-session marker per program.
#[async_trait]
pub trait ActiveSessionRepository: Send + Sync {
    async fn create_active_session(
        &self,
        name: &ProgramName,
        started_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Returns the start time of the open session, or `None` if there is none.
    async fn get_active_session(&self, name: &ProgramName) -> StoreResult<Option<DateTime<Utc>>>;

    async fn remove_active_session(&self, name: &ProgramName) -> StoreResult<()>;

    /// Removes the marker only if it still records `started_at`.
    ///
    /// Returns false when the marker is gone or was replaced by a newer
    /// session's start.
    async fn remove_active_session_if_started(
        &self,
        name: &ProgramName,
        started_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Lists all open sessions, oldest first.
    async fn list_active_sessions(&self) -> StoreResult<Vec<ActiveSession>>;
}

/// Append-only session history.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn append_history(&self, record: SessionRecord) -> StoreResult<()>;
}
