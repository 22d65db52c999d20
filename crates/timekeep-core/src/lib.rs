//! timekeep core - shared types for the program activity tracker
//!
//! This crate provides the domain types and collaborator contracts shared
//! between the daemon (`timekeepd`) and anything that reads its data.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod program;
pub mod repository;

// Re-exports for convenience
pub use config::{DaemonConfig, WakaTimeConfig, WakapiConfig};
pub use error::{ConfigError, StoreError, StoreResult};
pub use program::{ActiveSession, ProgramName, ProgramRecord, SessionRecord};
pub use repository::{ActiveSessionRepository, HistoryRepository, ProgramRepository};
