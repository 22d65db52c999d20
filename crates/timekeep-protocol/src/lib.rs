//! timekeep protocol - request messages for the daemon listener
//!
//! Clients (the `timekeep` CLI, scripts) connect to the daemon socket and
//! exchange newline-delimited JSON: one [`ClientMessage`] per line in, one
//! [`DaemonMessage`] per line out.

pub mod message;

pub use message::{decode_line, ActiveSessionView, ClientMessage, DaemonMessage, DecodeError, MAX_MESSAGE_SIZE};
