//! Integration tests for the service control loop.
//!
//! The service runs against an in-memory store and a recording monitor so
//! every control request can be checked for its effect on session state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use timekeep_core::{ProgramName, ProgramRecord};
use timekeepd::monitor::ProcessMonitor;
use timekeepd::service::{
    ChannelControlSource, ControlHandle, ControlRequest, Service, ServiceError, ServiceState,
};
use timekeepd::sessions::SessionManager;
use timekeepd::store::MemoryStore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const STEP_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

/// Monitor that records calls instead of polling.
#[derive(Default)]
struct RecordingMonitor {
    calls: Mutex<Vec<String>>,
    active: Mutex<bool>,
}

impl RecordingMonitor {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessMonitor for RecordingMonitor {
    async fn start_initial(&self, programs: &[ProgramName]) {
        self.record(format!("start_initial:{}", programs.len()));
    }

    fn start_continuous(&self, _cancel: CancellationToken, programs: Vec<ProgramName>) {
        *self.active.lock().unwrap() = true;
        self.record(format!("start_continuous:{}", programs.len()));
    }

    async fn stop(&self) {
        *self.active.lock().unwrap() = false;
        self.record("stop");
    }

    async fn resync(&self, programs: Vec<ProgramName>) {
        *self.active.lock().unwrap() = true;
        self.record(format!("resync:{}", programs.len()));
    }

    fn is_active(&self) -> bool {
        *self.active.lock().unwrap()
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    sessions: Arc<SessionManager>,
    monitor: Arc<RecordingMonitor>,
    control: ControlHandle,
    task: JoinHandle<Result<(), ServiceError>>,
}

fn spawn_service(store: Arc<MemoryStore>) -> Harness {
    let sessions = Arc::new(SessionManager::with_store(Arc::clone(&store)));
    let monitor = Arc::new(RecordingMonitor::default());
    let mut service = Service::new(
        Arc::clone(&sessions),
        store.clone(),
        monitor.clone(),
        Arc::new(|_pid: u32| true),
        Duration::from_secs(60),
    );

    let (mut source, control) = ChannelControlSource::pair(8);
    let task = tokio::spawn(async move { service.run(&mut source).await });

    Harness {
        store,
        sessions,
        monitor,
        control,
        task,
    }
}

fn catalog_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_program_sync(ProgramRecord::new("editor"));
    store.add_program_sync(ProgramRecord::new("browser").with_category("browsing"));
    store
}

async fn wait_for(control: &mut ControlHandle, state: ServiceState) {
    let seen = timeout(STEP_TIMEOUT, control.wait_for(state))
        .await
        .expect("service should reach state in time");
    assert_eq!(seen.last().map(|s| s.state), Some(state));
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn startup_reports_initializing_then_running() {
    let mut h = spawn_service(catalog_store());

    let first = timeout(STEP_TIMEOUT, h.control.next_status()).await.unwrap();
    assert_eq!(first.map(|s| s.state), Some(ServiceState::Initializing));
    wait_for(&mut h.control, ServiceState::Running).await;

    assert_eq!(h.monitor.calls(), vec!["start_initial:2", "start_continuous:2"]);
    assert!(h.sessions.lock().contains(&ProgramName::new("browser")));

    assert!(h.control.send(ControlRequest::Stop).await);
    wait_for(&mut h.control, ServiceState::Stopped).await;
    assert!(h.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn pause_continue_round_trip_keeps_sessions() {
    let mut h = spawn_service(catalog_store());
    wait_for(&mut h.control, ServiceState::Running).await;

    h.sessions.create_session(&ProgramName::new("editor"), 100).await;
    h.sessions.create_session(&ProgramName::new("editor"), 200).await;
    let before = h.sessions.snapshot();

    assert!(h.control.send(ControlRequest::Pause).await);
    wait_for(&mut h.control, ServiceState::Paused).await;
    assert!(!h.monitor.is_active());

    assert!(h.control.send(ControlRequest::Continue).await);
    wait_for(&mut h.control, ServiceState::Running).await;

    assert_eq!(h.sessions.snapshot(), before);
    assert!(h.store.history().is_empty());
    assert!(h.monitor.calls().contains(&"resync:2".to_string()));

    assert!(h.control.send(ControlRequest::Shutdown).await);
    wait_for(&mut h.control, ServiceState::Stopped).await;
}

#[tokio::test]
async fn interrogate_reports_current_state() {
    let mut h = spawn_service(catalog_store());
    wait_for(&mut h.control, ServiceState::Running).await;

    assert!(h.control.send(ControlRequest::Interrogate).await);
    let status = timeout(STEP_TIMEOUT, h.control.next_status()).await.unwrap();
    assert_eq!(status.map(|s| s.state), Some(ServiceState::Running));

    assert!(h.control.send(ControlRequest::Stop).await);
    wait_for(&mut h.control, ServiceState::Stopped).await;
}

#[tokio::test]
async fn unrecognized_request_is_ignored() {
    let mut h = spawn_service(catalog_store());
    wait_for(&mut h.control, ServiceState::Running).await;

    assert!(h.control.send(ControlRequest::Other(0x80)).await);
    assert!(h.control.send(ControlRequest::Continue).await);
    assert!(h.control.send(ControlRequest::Interrogate).await);

    // Only the interrogate produces a status
    let status = timeout(STEP_TIMEOUT, h.control.next_status()).await.unwrap();
    assert_eq!(status.map(|s| s.state), Some(ServiceState::Running));

    assert!(h.control.send(ControlRequest::Stop).await);
    wait_for(&mut h.control, ServiceState::Stopped).await;
}

#[tokio::test]
async fn shutdown_closes_store_and_keeps_open_sessions() {
    let mut h = spawn_service(catalog_store());
    wait_for(&mut h.control, ServiceState::Running).await;
    h.sessions.create_session(&ProgramName::new("editor"), 100).await;

    assert!(h.control.send(ControlRequest::Shutdown).await);
    wait_for(&mut h.control, ServiceState::Stopped).await;
    timeout(STEP_TIMEOUT, h.task).await.unwrap().unwrap().unwrap();

    assert!(h.store.is_closed());
    assert!(h.store.history().is_empty());
    assert!(h.monitor.calls().contains(&"stop".to_string()));
}

#[tokio::test]
async fn dropped_control_handle_shuts_down() {
    let h = spawn_service(catalog_store());
    let Harness { store, control, task, .. } = h;
    drop(control);

    let result = timeout(STEP_TIMEOUT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(store.is_closed());
}

#[tokio::test]
async fn unreadable_catalog_fails_startup() {
    let store = catalog_store();
    store.fail_operation("get_all_programs");
    let mut h = spawn_service(store);

    let seen = timeout(STEP_TIMEOUT, h.control.wait_for(ServiceState::Stopped))
        .await
        .unwrap();
    let last = seen.last().unwrap();
    assert_eq!(last.exit_code, 1);
    assert!(last.reason.is_some());
    assert!(!seen.iter().any(|s| s.state == ServiceState::Running));

    let result = timeout(STEP_TIMEOUT, h.task).await.unwrap().unwrap();
    assert!(matches!(result, Err(ServiceError::Startup(_))));
    assert!(h.monitor.calls().is_empty());
}
