//! Integration tests for the polling monitor over a scripted process table.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use timekeep_core::{ProgramName, ProgramRecord};
use timekeepd::monitor::{PollingMonitor, ProcessMonitor, ProcessScanner};
use timekeepd::sessions::SessionManager;
use timekeepd::store::MemoryStore;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(10);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

/// Process table the test edits between polls.
#[derive(Clone, Default)]
struct ProcessTable(Arc<Mutex<Vec<(ProgramName, u32)>>>);

impl ProcessTable {
    fn set(&self, entries: &[(&str, u32)]) {
        *self.0.lock().unwrap() = entries
            .iter()
            .map(|(name, pid)| (ProgramName::new(name), *pid))
            .collect();
    }

    fn scanner(&self) -> Arc<dyn ProcessScanner> {
        let table = self.0.clone();
        Arc::new(move || table.lock().unwrap().clone())
    }
}

/// Scanner that can hold one scan on a blocking thread until released.
struct HeldScan {
    table: ProcessTable,
    scans: AtomicUsize,
    armed: AtomicBool,
    reached: Notify,
    release: Mutex<mpsc::Receiver<()>>,
}

impl HeldScan {
    fn new(table: ProcessTable) -> (Arc<Self>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let scan = Arc::new(Self {
            table,
            scans: AtomicUsize::new(0),
            armed: AtomicBool::new(false),
            reached: Notify::new(),
            release: Mutex::new(rx),
        });
        (scan, tx)
    }
}

impl ProcessScanner for HeldScan {
    fn scan(&self) -> Vec<(ProgramName, u32)> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            let _ = self.release.lock().unwrap().recv();
        }
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.table.0.lock().unwrap().clone()
    }
}

fn setup(grace: u32) -> (Arc<MemoryStore>, Arc<SessionManager>, ProcessTable, PollingMonitor) {
    let store = Arc::new(MemoryStore::new());
    store.add_program_sync(ProgramRecord::new("editor"));
    let sessions = Arc::new(SessionManager::with_store(Arc::clone(&store)));
    let table = ProcessTable::default();
    let monitor = PollingMonitor::new(Arc::clone(&sessions), table.scanner(), POLL, grace);
    (store, sessions, table, monitor)
}

async fn until(mut check: impl FnMut() -> bool) {
    timeout(SETTLE_TIMEOUT, async {
        while !check() {
            sleep(POLL).await;
        }
    })
    .await
    .expect("condition should hold in time");
}

fn programs() -> Vec<ProgramName> {
    vec![ProgramName::new("editor")]
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn initial_scan_opens_sessions_for_running_programs() {
    let (store, sessions, table, monitor) = setup(2);
    table.set(&[("editor", 10), ("editor", 11), ("shell", 12)]);

    monitor.start_initial(&programs()).await;

    assert_eq!(sessions.live_pids(&ProgramName::new("editor")), vec![10, 11]);
    assert!(sessions.tracked(&ProgramName::new("shell")).is_none());
    assert_eq!(store.active_count(), 1);
    assert!(!monitor.is_active());
}

#[tokio::test]
async fn continuous_polling_commits_after_grace() {
    let (store, sessions, table, monitor) = setup(2);
    let editor = ProgramName::new("editor");
    let cancel = CancellationToken::new();

    monitor.start_continuous(cancel.clone(), programs());
    assert!(monitor.is_active());

    table.set(&[("editor", 10)]);
    until(|| sessions.live_pids(&editor) == vec![10]).await;

    table.set(&[]);
    until(|| !store.history().is_empty()).await;
    assert!(sessions.tracked(&editor).is_none());

    cancel.cancel();
    monitor.stop().await;
    assert!(!monitor.is_active());
}

#[tokio::test]
async fn stop_leaves_tracked_sessions_alone() {
    let (store, sessions, table, monitor) = setup(1);
    let editor = ProgramName::new("editor");
    table.set(&[("editor", 10)]);
    monitor.start_initial(&programs()).await;
    monitor.start_continuous(CancellationToken::new(), programs());

    monitor.stop().await;
    table.set(&[]);
    sleep(POLL * 5).await;

    assert_eq!(sessions.live_pids(&editor), vec![10]);
    assert!(store.history().is_empty());
}

#[tokio::test]
async fn resync_reconciles_changes_made_while_stopped() {
    let (store, sessions, table, monitor) = setup(3);
    let editor = ProgramName::new("editor");
    let cancel = CancellationToken::new();

    table.set(&[("editor", 10), ("editor", 11)]);
    monitor.start_initial(&programs()).await;
    monitor.start_continuous(cancel.clone(), programs());
    monitor.stop().await;

    // One process exited and a new one started while paused
    table.set(&[("editor", 11), ("editor", 12)]);
    monitor.resume(programs()).await;

    assert_eq!(sessions.live_pids(&editor), vec![11, 12]);
    assert!(store.history().is_empty());
    assert!(monitor.is_active());

    cancel.cancel();
    monitor.stop().await;
}

#[tokio::test]
async fn resume_after_shutdown_does_not_restart_polling() {
    let (_store, _sessions, table, monitor) = setup(1);
    let cancel = CancellationToken::new();
    table.set(&[("editor", 10)]);

    monitor.start_continuous(cancel.clone(), programs());
    cancel.cancel();
    monitor.stop().await;

    monitor.resume(programs()).await;
    assert!(!monitor.is_active());
}

#[tokio::test]
async fn resync_while_stopped_reconciles_without_restarting() {
    let (_store, sessions, table, monitor) = setup(1);
    let editor = ProgramName::new("editor");
    monitor.start_continuous(CancellationToken::new(), programs());
    monitor.stop().await;

    table.set(&[("editor", 10)]);
    monitor.resync(programs()).await;

    assert_eq!(sessions.live_pids(&editor), vec![10]);
    assert!(!monitor.is_active());
}

#[tokio::test]
async fn stop_during_resync_keeps_polling_stopped() {
    let store = Arc::new(MemoryStore::new());
    store.add_program_sync(ProgramRecord::new("editor"));
    let sessions = Arc::new(SessionManager::with_store(Arc::clone(&store)));
    let table = ProcessTable::default();
    table.set(&[("editor", 10)]);
    let (scan, release) = HeldScan::new(table.clone());
    let monitor = Arc::new(PollingMonitor::new(
        Arc::clone(&sessions),
        scan.clone(),
        Duration::from_secs(60),
        1,
    ));

    monitor.start_continuous(CancellationToken::new(), programs());
    until(|| scan.scans.load(Ordering::SeqCst) >= 1).await;

    // Hold the resync's scan, then stop while it is parked
    scan.armed.store(true, Ordering::SeqCst);
    let resyncing = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move { monitor.resync(programs()).await })
    };
    timeout(SETTLE_TIMEOUT, scan.reached.notified())
        .await
        .expect("resync should reach the scan");

    let stopping = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move { monitor.stop().await })
    };
    sleep(POLL).await;
    release.send(()).unwrap();

    timeout(SETTLE_TIMEOUT, resyncing).await.unwrap().unwrap();
    timeout(SETTLE_TIMEOUT, stopping).await.unwrap().unwrap();

    assert!(!monitor.is_active());
    assert_eq!(sessions.live_pids(&ProgramName::new("editor")), vec![10]);
}
