//! Integration tests for the session manager against both stores.

use std::sync::Arc;

use chrono::{Duration, Utc};
use timekeep_core::{
    ActiveSessionRepository, ProgramName, ProgramRecord, ProgramRepository,
};
use timekeepd::sessions::SessionManager;
use timekeepd::store::{MemoryStore, SqliteStore, StoreLifecycle};

// ============================================================================
// Test Helpers
// ============================================================================

fn name(s: &str) -> ProgramName {
    ProgramName::new(s)
}

fn memory_manager() -> (Arc<MemoryStore>, SessionManager) {
    let store = Arc::new(MemoryStore::new());
    store.add_program_sync(ProgramRecord::new("editor"));
    store.add_program_sync(ProgramRecord::new("browser"));
    let manager = SessionManager::with_store(Arc::clone(&store));
    (store, manager)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn duplicate_create_is_a_noop() {
    let (store, sessions) = memory_manager();

    sessions.create_session(&name("editor"), 100).await;
    let started = store.active_start(&name("editor"));
    sessions.create_session(&name("editor"), 100).await;

    assert_eq!(store.active_count(), 1);
    assert_eq!(store.active_start(&name("editor")), started);
    assert_eq!(sessions.live_pids(&name("editor")), vec![100]);
}

#[tokio::test]
async fn partial_stop_keeps_session_open() {
    let (store, sessions) = memory_manager();

    sessions.create_session(&name("editor"), 100).await;
    sessions.create_session(&name("editor"), 200).await;
    sessions.end_session(&name("editor"), 100).await;

    assert_eq!(sessions.live_pids(&name("editor")), vec![200]);
    assert!(store.history().is_empty());
    assert_eq!(store.active_count(), 1);
}

#[tokio::test]
async fn last_stop_commits_two_minute_session() {
    let (store, sessions) = memory_manager();

    sessions.create_session(&name("browser"), 5).await;
    store.backdate_active(&name("browser"), 120);
    sessions.end_session(&name("browser"), 5).await;

    let history = store.history();
    assert_eq!(history.len(), 1);
    assert!((119..=121).contains(&history[0].duration_seconds));
    assert_eq!(
        store.program(&name("browser")).unwrap().lifetime_seconds,
        history[0].duration_seconds
    );
    assert_eq!(store.active_count(), 0);
    assert!(sessions.tracked(&name("browser")).is_none());
}

#[tokio::test]
async fn live_set_is_started_minus_stopped() {
    let (_store, sessions) = memory_manager();
    let editor = name("editor");

    for pid in [1, 2, 3, 4] {
        sessions.create_session(&editor, pid).await;
    }
    sessions.end_session(&editor, 2).await;
    sessions.end_session(&editor, 9).await;
    sessions.create_session(&editor, 5).await;
    sessions.end_session(&editor, 4).await;

    assert_eq!(sessions.live_pids(&editor), vec![1, 3, 5]);
}

#[tokio::test]
async fn reopened_program_gets_a_fresh_session() {
    let (store, sessions) = memory_manager();

    sessions.create_session(&name("browser"), 5).await;
    sessions.end_session(&name("browser"), 5).await;
    sessions.create_session(&name("browser"), 6).await;

    assert_eq!(store.history().len(), 1);
    assert_eq!(store.active_count(), 1);
    let tracked = sessions.tracked(&name("browser")).unwrap();
    assert!(tracked.has_open_session());
    assert!(tracked.started_at().is_some());
}

#[tokio::test]
async fn category_survives_commit() {
    let (store, sessions) = memory_manager();
    store.add_program_sync(ProgramRecord::new("code").with_category("coding"));
    sessions.load_catalog().await.unwrap();

    sessions.create_session(&name("code"), 1).await;
    sessions.end_session(&name("code"), 1).await;
    sessions.create_session(&name("code"), 2).await;

    let tracked = sessions.tracked(&name("code")).unwrap();
    assert_eq!(tracked.category.as_deref(), Some("coding"));
}

#[tokio::test]
async fn catalog_removal_drops_only_idle_entries() {
    let (store, sessions) = memory_manager();
    sessions.load_catalog().await.unwrap();
    sessions.create_session(&name("editor"), 100).await;

    store.remove_program(&name("editor")).await.unwrap();
    store.remove_program(&name("browser")).await.unwrap();
    let names = sessions.load_catalog().await.unwrap();

    assert!(names.is_empty());
    assert!(sessions.tracked(&name("browser")).is_none());
    assert_eq!(sessions.live_pids(&name("editor")), vec![100]);
}

// ============================================================================
// SQLite
// ============================================================================

#[tokio::test]
async fn sqlite_store_commits_session() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("timekeep.db")).unwrap());
    store
        .add_program(ProgramRecord::new("browser").with_category("browsing"))
        .await
        .unwrap();
    let sessions = SessionManager::with_store(Arc::clone(&store));

    sessions.create_session(&name("browser"), 5).await;
    // Move the persisted start two minutes back
    store
        .create_active_session(&name("browser"), Utc::now() - Duration::seconds(120))
        .await
        .unwrap();
    sessions.end_session(&name("browser"), 5).await;

    let programs = store.get_all_programs().await.unwrap();
    assert!((119..=121).contains(&programs[0].lifetime_seconds));
    assert!(store.list_active_sessions().await.unwrap().is_empty());
    assert!(sessions.tracked(&name("browser")).is_none());

    store.close().await;
}

#[tokio::test]
async fn orphaned_rows_are_discarded_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("timekeep.db");

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        store.add_program(ProgramRecord::new("editor")).await.unwrap();
        let sessions = SessionManager::with_store(Arc::clone(&store));
        sessions.create_session(&name("editor"), 100).await;
        // Simulated crash: no end_session
        store.close().await;
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let sessions = SessionManager::with_store(Arc::clone(&store));
    sessions.load_catalog().await.unwrap();

    assert_eq!(sessions.discard_orphaned_sessions().await, 1);
    assert!(store.list_active_sessions().await.unwrap().is_empty());
    assert_eq!(store.get_all_programs().await.unwrap()[0].lifetime_seconds, 0);
}
