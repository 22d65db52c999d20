//! Request listener for the timekeep daemon.
//!
//! The server:
//! - Listens on a Unix socket (TCP loopback where Unix sockets are missing)
//! - Spawns a ConnectionHandler for each client
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│ SessionManager  │
//! │   (per client)  │     │ ProcessMonitor  │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, RequestContext};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use timekeep_core::DaemonConfig;

/// Where the listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl ListenAddr {
    /// Unix socket on Unix, `127.0.0.1:<listen_port>` elsewhere.
    pub fn from_config(config: &DaemonConfig) -> Self {
        if cfg!(unix) {
            Self::Unix(config.socket_path())
        } else {
            Self::Tcp(SocketAddr::from(([127, 0, 0, 1], config.listen_port)))
        }
    }
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{}", path.display()),
            Self::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

/// Accepts client connections and answers requests.
pub struct DaemonServer {
    addr: ListenAddr,
    context: Arc<RequestContext>,
    connection_counter: AtomicU64,
}

impl DaemonServer {
    pub fn new(addr: ListenAddr, context: RequestContext) -> Self {
        Self {
            addr,
            context: Arc::new(context),
            connection_counter: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> &ListenAddr {
        &self.addr
    }

    /// Runs the server.
    ///
    /// Listens for connections until `cancel` is triggered.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ServerError> {
        match &self.addr {
            #[cfg(unix)]
            ListenAddr::Unix(path) => self.run_unix(path, cancel).await,
            #[cfg(not(unix))]
            ListenAddr::Unix(path) => Err(ServerError::SocketSetup {
                addr: path.display().to_string(),
                error: "Unix sockets are not supported on this platform".to_string(),
            }),
            ListenAddr::Tcp(addr) => self.run_tcp(*addr, cancel).await,
        }
    }

    #[cfg(unix)]
    async fn run_unix(
        &self,
        path: &std::path::Path,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        use tokio::net::UnixListener;

        let setup_err = |e: std::io::Error| ServerError::SocketSetup {
            addr: path.display().to_string(),
            error: e.to_string(),
        };

        // Remove a stale socket left by a crashed run
        if path.exists() {
            std::fs::remove_file(path).map_err(setup_err)?;
        }
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_err)?;
            }
        }

        let listener = UnixListener::bind(path).map_err(setup_err)?;
        info!(socket = %path.display(), "Request listener started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Request listener shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let (reader, writer) = stream.into_split();
                            self.spawn_handler(reader, writer);
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }

        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
        Ok(())
    }

    async fn run_tcp(&self, addr: SocketAddr, cancel: CancellationToken) -> Result<(), ServerError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::SocketSetup {
                addr: addr.to_string(),
                error: e.to_string(),
            })?;
        info!(%addr, "Request listener started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Request listener shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _peer)) => {
                            let (reader, writer) = stream.into_split();
                            self.spawn_handler(reader, writer);
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_handler<R, W>(&self, reader: R, writer: W)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
        let handler = ConnectionHandler::new(reader, writer, Arc::clone(&self.context), conn_num);
        tokio::spawn(handler.run());
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup listener at {addr}: {error}")]
    SocketSetup { addr: String, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            addr: "/tmp/test.sock".to_string(),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/tmp/test.sock"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_listen_addr_from_config() {
        let mut config = DaemonConfig::default();
        config.socket_path = Some(PathBuf::from("/run/timekeep/test.sock"));
        config.listen_port = 4000;

        let addr = ListenAddr::from_config(&config);
        if cfg!(unix) && std::env::var("TIMEKEEP_SOCKET").is_err() {
            assert_eq!(addr, ListenAddr::Unix(PathBuf::from("/run/timekeep/test.sock")));
        } else if !cfg!(unix) {
            assert_eq!(addr.to_string(), "127.0.0.1:4000");
        }
    }
}
