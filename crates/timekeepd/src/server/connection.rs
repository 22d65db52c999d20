//! Connection handler for individual client connections.
//!
//! Each request is one JSON line and gets exactly one JSON line back.
//! A bad line is answered with an `Error` message and the connection
//! stays open.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use timekeep_protocol::{decode_line, ActiveSessionView, ClientMessage, DaemonMessage, DecodeError};

use crate::monitor::ProcessMonitor;
use crate::sessions::SessionManager;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a request handler can reach.
pub struct RequestContext {
    pub sessions: Arc<SessionManager>,
    pub monitor: Arc<dyn ProcessMonitor>,
}

impl RequestContext {
    pub fn new(sessions: Arc<SessionManager>, monitor: Arc<dyn ProcessMonitor>) -> Self {
        Self { sessions, monitor }
    }

    /// Reloads the catalog. A paused monitor is left paused; it picks up
    /// the new program list when the service continues.
    async fn refresh(&self) -> DaemonMessage {
        match self.sessions.load_catalog().await {
            Ok(names) => {
                let tracked = names.len();
                if self.monitor.is_active() {
                    self.monitor.resync(names).await;
                }
                info!(tracked, "Catalog refreshed");
                DaemonMessage::Refreshed { tracked }
            }
            Err(e) => {
                warn!(error = %e, "Catalog refresh failed");
                DaemonMessage::error(format!("refresh failed: {e}"))
            }
        }
    }

    async fn list_active(&self) -> DaemonMessage {
        match self.sessions.active_repository().list_active_sessions().await {
            Ok(rows) => {
                let now = Utc::now();
                DaemonMessage::ActiveSessions {
                    sessions: rows
                        .iter()
                        .map(|row| ActiveSessionView::from_active(row, now))
                        .collect(),
                }
            }
            Err(e) => DaemonMessage::error(format!("could not list sessions: {e}")),
        }
    }

    pub async fn handle(&self, msg: ClientMessage) -> DaemonMessage {
        match msg {
            ClientMessage::Ping { seq } => DaemonMessage::pong(seq),
            ClientMessage::Refresh => self.refresh().await,
            ClientMessage::ListActive => self.list_active().await,
        }
    }
}

/// Connection handler for a single client.
pub struct ConnectionHandler<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    context: Arc<RequestContext>,
    connection_number: u64,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, context: Arc<RequestContext>, connection_number: u64) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            context,
            connection_number,
        }
    }

    /// Serves requests until the client disconnects or goes idle.
    pub async fn run(mut self) {
        debug!(connection = self.connection_number, "Client connected");

        if let Err(e) = self.process_messages().await {
            debug!(
                connection = self.connection_number,
                error = %e,
                "Connection closed"
            );
        }

        debug!(connection = self.connection_number, "Client disconnected");
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let line = match timeout(READ_TIMEOUT, self.read_line()).await {
                Ok(Ok(line)) => line,
                Ok(Err(ConnectionError::Eof)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ConnectionError::Timeout),
            };

            let reply = match decode_line(&line) {
                Ok(msg) => {
                    debug!(connection = self.connection_number, request = ?msg, "Received request");
                    self.context.handle(msg).await
                }
                Err(e @ DecodeError::TooLarge { .. }) => {
                    self.send_message(&DaemonMessage::error(e.to_string())).await?;
                    return Err(ConnectionError::from(e));
                }
                Err(e) => DaemonMessage::error(e.to_string()),
            };

            self.send_message(&reply).await?;
        }
    }

    async fn read_line(&mut self) -> Result<String, ConnectionError> {
        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }
        Ok(line)
    }

    async fn send_message(&mut self, msg: &DaemonMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(msg).map_err(|e| ConnectionError::Encode(e.to_string()))?;
        let writer = &mut self.writer;

        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,
}
