//! SQLite persistence for timekeepd.
//!
//! Three tables: the `programs` catalog, one `active_sessions` row per open
//! session, and the append-only `session_history`. Timestamps are stored
//! as RFC 3339 text. Every call runs on the blocking pool so the async
//! runtime never waits on disk.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use timekeep_core::{
    ActiveSession, ActiveSessionRepository, HistoryRepository, ProgramName, ProgramRecord,
    ProgramRepository, SessionRecord, StoreError, StoreResult,
};

use super::StoreLifecycle;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS programs (
        name TEXT PRIMARY KEY,
        category TEXT,
        project TEXT,
        lifetime_seconds INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS active_sessions (
        program_name TEXT PRIMARY KEY,
        start_time TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS session_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        program_name TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT NOT NULL,
        duration_seconds INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_history_program
        ON session_history (program_name, start_time);
";

/// Durable store backed by a single SQLite connection.
///
/// The connection slot becomes `None` after [`StoreLifecycle::close`];
/// later calls fail with `StoreError::Closed`.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let open_err = |reason: String| StoreError::Open {
            path: path.clone(),
            reason,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| open_err(e.to_string()))?;
            }
        }

        let conn = Connection::open(&path).map_err(|e| open_err(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| open_err(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| open_err(e.to_string()))?;

        info!(path = %path.display(), "Opened session database");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        let path = PathBuf::from(":memory:");
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        conn.execute_batch(SCHEMA).map_err(|e| StoreError::Open {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_connection<T, F>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard.as_ref().ok_or(StoreError::Closed)?;
            f(conn).map_err(|e| StoreError::query(operation, e))
        })
        .await
        .map_err(|e| StoreError::query(operation, e))?
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

#[async_trait]
impl ProgramRepository for SqliteStore {
    async fn get_all_programs(&self) -> StoreResult<Vec<ProgramRecord>> {
        self.with_connection("get_all_programs", |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, category, project, lifetime_seconds FROM programs ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ProgramRecord {
                    name: ProgramName::new(row.get::<_, String>(0)?),
                    category: row.get(1)?,
                    project: row.get(2)?,
                    lifetime_seconds: row.get(3)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn update_lifetime(&self, name: &ProgramName, delta_seconds: i64) -> StoreResult<()> {
        let key = name.as_str().to_string();
        let changed = self
            .with_connection("update_lifetime", move |conn| {
                conn.execute(
                    "UPDATE programs SET lifetime_seconds = lifetime_seconds + ?1 WHERE name = ?2",
                    params![delta_seconds, key],
                )
            })
            .await?;

        if changed == 0 {
            return Err(StoreError::ProgramNotFound { name: name.clone() });
        }
        Ok(())
    }

    async fn add_program(&self, program: ProgramRecord) -> StoreResult<()> {
        self.with_connection("add_program", move |conn| {
            conn.execute(
                "INSERT INTO programs (name, category, project, lifetime_seconds) \
                 VALUES (?1, ?2, ?3, 0) \
                 ON CONFLICT(name) DO UPDATE SET category = excluded.category, project = excluded.project",
                params![program.name.as_str(), program.category, program.project],
            )
            .map(|_| ())
        })
        .await
    }

    async fn remove_program(&self, name: &ProgramName) -> StoreResult<()> {
        let key = name.as_str().to_string();
        self.with_connection("remove_program", move |conn| {
            conn.execute("DELETE FROM programs WHERE name = ?1", params![key])
                .map(|_| ())
        })
        .await
    }

    async fn reset_lifetime(&self, name: &ProgramName) -> StoreResult<()> {
        let key = name.as_str().to_string();
        self.with_connection("reset_lifetime", move |conn| {
            conn.execute(
                "UPDATE programs SET lifetime_seconds = 0 WHERE name = ?1",
                params![key],
            )
            .map(|_| ())
        })
        .await
    }
}

#[async_trait]
impl ActiveSessionRepository for SqliteStore {
    async fn create_active_session(
        &self,
        name: &ProgramName,
        started_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let key = name.as_str().to_string();
        let start = format_time(&started_at);
        self.with_connection("create_active_session", move |conn| {
            conn.execute(
                "INSERT INTO active_sessions (program_name, start_time) VALUES (?1, ?2) \
                 ON CONFLICT(program_name) DO UPDATE SET start_time = excluded.start_time",
                params![key, start],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_active_session(&self, name: &ProgramName) -> StoreResult<Option<DateTime<Utc>>> {
        let key = name.as_str().to_string();
        self.with_connection("get_active_session", move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT start_time FROM active_sessions WHERE program_name = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|s| parse_time(&s, 0)).transpose()
        })
        .await
    }

    async fn remove_active_session(&self, name: &ProgramName) -> StoreResult<()> {
        let key = name.as_str().to_string();
        self.with_connection("remove_active_session", move |conn| {
            conn.execute(
                "DELETE FROM active_sessions WHERE program_name = ?1",
                params![key],
            )
            .map(|_| ())
        })
        .await
    }

    async fn remove_active_session_if_started(
        &self,
        name: &ProgramName,
        started_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let key = name.as_str().to_string();
        let start = format_time(&started_at);
        self.with_connection("remove_active_session", move |conn| {
            conn.execute(
                "DELETE FROM active_sessions WHERE program_name = ?1 AND start_time = ?2",
                params![key, start],
            )
            .map(|changed| changed > 0)
        })
        .await
    }

    async fn list_active_sessions(&self) -> StoreResult<Vec<ActiveSession>> {
        self.with_connection("list_active_sessions", |conn| {
            let mut stmt = conn.prepare(
                "SELECT program_name, start_time FROM active_sessions ORDER BY start_time",
            )?;
            let rows = stmt.query_map([], |row| {
                let start: String = row.get(1)?;
                Ok(ActiveSession {
                    program: ProgramName::new(row.get::<_, String>(0)?),
                    started_at: parse_time(&start, 1)?,
                })
            })?;
            rows.collect()
        })
        .await
    }
}

#[async_trait]
impl HistoryRepository for SqliteStore {
    async fn append_history(&self, record: SessionRecord) -> StoreResult<()> {
        self.with_connection("append_history", move |conn| {
            conn.execute(
                "INSERT INTO session_history \
                    (program_name, start_time, end_time, duration_seconds) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.program.as_str(),
                    format_time(&record.started_at),
                    format_time(&record.ended_at),
                    record.duration_seconds
                ],
            )
            .map(|_| ())
        })
        .await
    }
}

#[async_trait]
impl StoreLifecycle for SqliteStore {
    async fn close(&self) {
        let conn = Arc::clone(&self.conn);
        let closed = tokio::task::spawn_blocking(move || {
            let taken = conn.lock().unwrap_or_else(PoisonError::into_inner).take();
            match taken {
                Some(conn) => conn.close().map_err(|(_, e)| e.to_string()),
                None => Ok(()),
            }
        })
        .await;

        match closed {
            Ok(Ok(())) => debug!(path = %self.path.display(), "Session database closed"),
            Ok(Err(e)) => warn!(error = %e, "Error closing session database"),
            Err(e) => warn!(error = %e, "Close task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn name(s: &str) -> ProgramName {
        ProgramName::new(s)
    }

    #[tokio::test]
    async fn test_program_catalog_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .add_program(ProgramRecord::new("Code").with_category("coding"))
            .await
            .unwrap();
        store.add_program(ProgramRecord::new("blender")).await.unwrap();

        let programs = store.get_all_programs().await.unwrap();
        assert_eq!(programs.len(), 2);
        assert_eq!(programs[0].name, name("blender"));
        assert_eq!(programs[1].category.as_deref(), Some("coding"));
    }

    #[tokio::test]
    async fn test_add_program_updates_metadata_not_lifetime() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add_program(ProgramRecord::new("code")).await.unwrap();
        store.update_lifetime(&name("code"), 300).await.unwrap();
        store
            .add_program(ProgramRecord::new("code").with_project("timekeep"))
            .await
            .unwrap();

        let programs = store.get_all_programs().await.unwrap();
        assert_eq!(programs[0].lifetime_seconds, 300);
        assert_eq!(programs[0].project.as_deref(), Some("timekeep"));
    }

    #[tokio::test]
    async fn test_update_lifetime_unknown_program() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.update_lifetime(&name("ghost"), 10).await.unwrap_err();
        assert!(matches!(err, StoreError::ProgramNotFound { .. }));
    }

    #[tokio::test]
    async fn test_reset_and_remove() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add_program(ProgramRecord::new("code")).await.unwrap();
        store.update_lifetime(&name("code"), 42).await.unwrap();
        store.reset_lifetime(&name("code")).await.unwrap();
        assert_eq!(store.get_all_programs().await.unwrap()[0].lifetime_seconds, 0);

        store.remove_program(&name("code")).await.unwrap();
        assert!(store.get_all_programs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_session_lifecycle() {
        let store = SqliteStore::open_in_memory().unwrap();
        let start = Utc::now() - Duration::seconds(30);

        assert_eq!(store.get_active_session(&name("code")).await.unwrap(), None);
        store.create_active_session(&name("code"), start).await.unwrap();

        let stored = store.get_active_session(&name("code")).await.unwrap().unwrap();
        assert_eq!(stored.timestamp_millis(), start.timestamp_millis());
        assert_eq!(store.list_active_sessions().await.unwrap().len(), 1);

        store.remove_active_session(&name("code")).await.unwrap();
        assert!(store.list_active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conditional_remove_keeps_newer_marker() {
        let store = SqliteStore::open_in_memory().unwrap();
        let old = Utc::now() - Duration::seconds(600);
        let new = Utc::now();

        store.create_active_session(&name("code"), new).await.unwrap();
        let stale = store
            .remove_active_session_if_started(&name("code"), old)
            .await
            .unwrap();
        assert!(!stale);
        assert_eq!(store.list_active_sessions().await.unwrap().len(), 1);

        let stored = store.get_active_session(&name("code")).await.unwrap().unwrap();
        let removed = store
            .remove_active_session_if_started(&name("code"), stored)
            .await
            .unwrap();
        assert!(removed);
        assert!(store.list_active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_history_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("timekeep.db");
        let start = Utc::now() - Duration::seconds(120);

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .append_history(SessionRecord::closing(name("code"), start, Utc::now()))
                .await
                .unwrap();
            store.close().await;
        }

        let store = SqliteStore::open(&path).unwrap();
        let count = store
            .with_connection("count", |conn| {
                conn.query_row("SELECT COUNT(*) FROM session_history", [], |row| {
                    row.get::<_, i64>(0)
                })
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.close().await;
        let err = store.get_all_programs().await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }
}
