//! timekeep daemon - program session engine and service lifecycle
//!
//! This crate provides the moving parts of the `timekeepd` daemon:
//! - `sessions` - session manager multiplexing process instances into sessions
//! - `sweeper` - periodic reconciliation against the process-existence probe
//! - `monitor` - process polling that feeds start/stop events
//! - `heartbeat` - WakaTime/Wakapi activity heartbeats
//! - `service` - control state machine and OS control bindings
//! - `server` - request listener for clients
//! - `store` - SQLite and in-memory repositories
//! - `daemon_manager` - install/remove/start/stop/status backends
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       timekeepd                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐  events  ┌─────────────────────────┐   │
//! │  │ PollingMonitor  │─────────▶│     SessionManager      │   │
//! │  └─────────────────┘          │ (Mutex<ProgramTable>)   │   │
//! │  ┌─────────────────┐  commit  │                         │   │
//! │  │    Sweeper      │─────────▶│                         │   │
//! │  └────────┬────────┘          └────────────┬────────────┘   │
//! │           │ probe                          │ repositories   │
//! │           ▼                                ▼                │
//! │  ┌─────────────────┐          ┌─────────────────────────┐   │
//! │  │  ProcessProbe   │          │      SqliteStore        │   │
//! │  └─────────────────┘          └─────────────────────────┘   │
//! │                                                             │
//! │  Service::run(ControlSource) owns the task lifecycle        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Mutex poisoning is recovered, never propagated

pub mod daemon_manager;
pub mod heartbeat;
pub mod monitor;
pub mod probe;
pub mod server;
pub mod service;
pub mod sessions;
pub mod store;
pub mod sweeper;
