//! Connection management for the collector endpoint.
//!
//! [`ConnectionManager`] owns at most one live connection (TCP or Unix domain
//! socket), dials it with the configured timeout, and re-dials it through the
//! bounded reconnect sequence in [`crate::backoff`].

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

use crate::backoff::{reconnect_with, ReconnectState, RetryPolicy};
use crate::config::{Config, TransportKind};

/// Errors that can occur while connecting or writing.
#[derive(Debug)]
pub enum ConnectionError {
    /// The configured network kind is not supported
    UnsupportedTransport(String),

    /// Dialing the endpoint failed
    Connect { endpoint: String, source: io::Error },

    /// Dialing the endpoint did not finish in time
    Timeout { endpoint: String, timeout: Duration },

    /// Writing to an established connection failed
    Write(io::Error),

    /// A reconnect sequence used up its attempts
    Exhausted {
        attempts: u32,
        last_error: Box<ConnectionError>,
    },

    /// Retries were exhausted earlier; the manager no longer sends
    Failed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::UnsupportedTransport(kind) => {
                write!(f, "Unsupported transport: {}", kind)
            }
            ConnectionError::Connect { endpoint, source } => {
                write!(f, "Failed to connect to {}: {}", endpoint, source)
            }
            ConnectionError::Timeout { endpoint, timeout } => {
                write!(f, "Connecting to {} timed out after {:?}", endpoint, timeout)
            }
            ConnectionError::Write(e) => write!(f, "Write failed: {}", e),
            ConnectionError::Exhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "All {} reconnect attempts exhausted. Last error: {}",
                attempts, last_error
            ),
            ConnectionError::Failed => write!(f, "Connection permanently failed"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Connect { source, .. } => Some(source),
            ConnectionError::Write(e) => Some(e),
            ConnectionError::Exhausted { last_error, .. } => Some(last_error.as_ref()),
            _ => None,
        }
    }
}

/// An open duplex stream to the collector.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Connection {
    /// Write the whole buffer and flush it.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Connection::Tcp(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await
            }
            #[cfg(unix)]
            Connection::Unix(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await
            }
        }
    }

    /// Shut down the write half so the peer sees end of stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Connection::Tcp(stream) => stream.shutdown().await,
            #[cfg(unix)]
            Connection::Unix(stream) => stream.shutdown().await,
        }
    }
}

/// Dial the endpoint described by `config`, bounded by its connect timeout.
pub async fn dial(config: &Config) -> Result<Connection, ConnectionError> {
    let endpoint = config.endpoint();

    match &config.network {
        TransportKind::Tcp => {
            let connect = TcpStream::connect((config.host.as_str(), config.port));
            let stream = with_timeout(&endpoint, config.timeout, connect).await?;
            // Envelopes are written in whole batches; no need to wait for more.
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY");
            }
            Ok(Connection::Tcp(stream))
        }
        TransportKind::Unix => dial_unix(&endpoint, &config.socket_path, config.timeout).await,
        TransportKind::Other(kind) => Err(ConnectionError::UnsupportedTransport(kind.clone())),
    }
}

#[cfg(unix)]
async fn dial_unix(
    endpoint: &str,
    path: &Path,
    connect_timeout: Duration,
) -> Result<Connection, ConnectionError> {
    let stream = with_timeout(endpoint, connect_timeout, UnixStream::connect(path)).await?;
    Ok(Connection::Unix(stream))
}

#[cfg(not(unix))]
async fn dial_unix(
    _endpoint: &str,
    _path: &Path,
    _connect_timeout: Duration,
) -> Result<Connection, ConnectionError> {
    Err(ConnectionError::UnsupportedTransport(
        "unix (not available on this platform)".to_string(),
    ))
}

async fn with_timeout<T>(
    endpoint: &str,
    limit: Duration,
    connect: impl std::future::Future<Output = io::Result<T>>,
) -> Result<T, ConnectionError> {
    match timeout(limit, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ConnectionError::Connect {
            endpoint: endpoint.to_string(),
            source,
        }),
        Err(_) => Err(ConnectionError::Timeout {
            endpoint: endpoint.to_string(),
            timeout: limit,
        }),
    }
}

/// Owns the single connection to the collector.
///
/// The manager is shared by the sender task, the spooler's final flush and
/// synchronous posts behind an async mutex, so writes never interleave.
pub struct ConnectionManager {
    config: Arc<Config>,
    policy: RetryPolicy,
    connection: Option<Connection>,
    state: watch::Sender<ReconnectState>,
}

impl ConnectionManager {
    /// Create a manager with no connection yet.
    pub fn new(config: Arc<Config>) -> Self {
        let (state, _) = watch::channel(ReconnectState::Reconnecting(0));
        Self {
            policy: RetryPolicy::from_config(&config),
            config,
            connection: None,
            state,
        }
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ReconnectState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> ReconnectState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Dial once. On failure the connection stays absent.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.state().is_failed() {
            return Err(ConnectionError::Failed);
        }
        let connection = dial(&self.config).await?;
        info!(endpoint = %self.config.endpoint(), "Connected to collector");
        self.connection = Some(connection);
        self.state.send_replace(ReconnectState::Connected);
        Ok(())
    }

    /// Close and drop the connection if one is present.
    pub async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.shutdown().await {
                debug!(error = %e, "Error while shutting down connection");
            }
            debug!(endpoint = %self.config.endpoint(), "Disconnected from collector");
            if !self.state().is_failed() {
                self.state.send_replace(ReconnectState::Reconnecting(0));
            }
        }
    }

    /// Drop any connection and dial through the bounded reconnect sequence.
    ///
    /// Exhausting the attempts moves the manager into the terminal `Failed`
    /// state.
    pub async fn reconnect(&mut self) -> Result<(), ConnectionError> {
        if self.state().is_failed() {
            return Err(ConnectionError::Failed);
        }
        self.disconnect().await;

        let config = Arc::clone(&self.config);
        let state = &self.state;
        let result = reconnect_with(
            &self.policy,
            || {
                let config = Arc::clone(&config);
                async move { dial(&config).await }
            },
            |next| {
                state.send_replace(next);
            },
        )
        .await;

        match result {
            Ok(connection) => {
                info!(endpoint = %self.config.endpoint(), "Reconnected to collector");
                self.connection = Some(connection);
                Ok(())
            }
            Err(exhausted) => Err(ConnectionError::Exhausted {
                attempts: exhausted.attempts,
                last_error: Box::new(exhausted.last_error),
            }),
        }
    }

    /// Write `bytes`, running the reconnect sequence first when no
    /// connection is present. A failed write is not retried.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if self.state().is_failed() {
            return Err(ConnectionError::Failed);
        }
        if self.connection.is_none() {
            self.reconnect().await?;
        }
        self.write_connected(bytes).await
    }

    /// Write `bytes`, dialing at most once when no connection is present.
    pub async fn write_once(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if self.state().is_failed() {
            return Err(ConnectionError::Failed);
        }
        if self.connection.is_none() {
            self.connect().await?;
        }
        self.write_connected(bytes).await
    }

    async fn write_connected(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(ConnectionError::Write(io::Error::new(
                io::ErrorKind::NotConnected,
                "no connection to collector",
            )));
        };

        match connection.write_all(bytes).await {
            Ok(()) => {
                debug!(bytes = bytes.len(), "Wrote to collector");
                Ok(())
            }
            Err(e) => {
                warn!(
                    bytes = bytes.len(),
                    error = %e,
                    "Write to collector failed; dropping connection"
                );
                self.connection = None;
                self.state.send_replace(ReconnectState::Reconnecting(0));
                Err(ConnectionError::Write(e))
            }
        }
    }
}
