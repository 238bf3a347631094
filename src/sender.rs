//! Background sender task.
//!
//! The sender repeatedly asks the spooler for the next batch, then writes it
//! through the [`ConnectionManager`], which reconnects with backoff when no
//! connection is present. Exhausted retries end the task for good.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::connection::{ConnectionError, ConnectionManager};

/// A request for the next batch; the spooler answers on the enclosed channel.
pub(crate) type BatchRequest = oneshot::Sender<Vec<u8>>;

/// Why the sender task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderExit {
    /// Shutdown was requested or the spooler went away
    Shutdown,

    /// Reconnect attempts were exhausted; nothing more can be sent
    Failed,
}

/// Run the sender loop until shutdown or a fatal connection failure.
pub(crate) async fn run_sender(
    requests: mpsc::Sender<BatchRequest>,
    manager: Arc<Mutex<ConnectionManager>>,
    shutdown: CancellationToken,
) -> SenderExit {
    loop {
        let (reply_tx, reply_rx) = oneshot::channel();
        if requests.send(reply_tx).await.is_err() {
            debug!("Spooler stopped, sender exiting");
            return SenderExit::Shutdown;
        }

        // A batch already handed over wins over a concurrent shutdown.
        let batch = tokio::select! {
            biased;

            batch = reply_rx => match batch {
                Ok(batch) => batch,
                Err(_) => return SenderExit::Shutdown,
            },

            _ = shutdown.cancelled() => return SenderExit::Shutdown,
        };

        if batch.is_empty() {
            continue;
        }

        let result = manager.lock().await.write(&batch).await;
        match result {
            Ok(()) => debug!(bytes = batch.len(), "Sent batch to collector"),
            Err(e @ (ConnectionError::Exhausted { .. } | ConnectionError::Failed)) => {
                error!(
                    bytes = batch.len(),
                    error = %e,
                    "Collector unreachable, sender giving up"
                );
                return SenderExit::Failed;
            }
            Err(e) => {
                warn!(
                    bytes = batch.len(),
                    error = %e,
                    "Failed to send batch; events dropped"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectState;
    use crate::config::Config;
    use crate::test_support::{closed_port, tcp_config, CaptureServer};
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_sender(
        config: Config,
    ) -> (
        mpsc::Receiver<BatchRequest>,
        Arc<Mutex<ConnectionManager>>,
        CancellationToken,
        tokio::task::JoinHandle<SenderExit>,
    ) {
        let (tx, rx) = mpsc::channel(1);
        let manager = Arc::new(Mutex::new(ConnectionManager::new(Arc::new(config))));
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_sender(tx, manager.clone(), token.clone()));
        (rx, manager, token, handle)
    }

    #[tokio::test]
    async fn test_sender_writes_each_batch() {
        let server = CaptureServer::start().await;
        let (mut requests, manager, token, handle) = spawn_sender(tcp_config(server.port()));

        for batch in [b"first-".to_vec(), Vec::new(), b"second".to_vec()] {
            let reply = requests.recv().await.expect("sender asks for a batch");
            reply.send(batch).unwrap();
        }

        // The next request proves the previous batch was written.
        let _pending = requests.recv().await.expect("sender asks again");
        token.cancel();
        assert_eq!(handle.await.unwrap(), SenderExit::Shutdown);

        manager.lock().await.disconnect().await;
        assert_eq!(server.received().await, b"first-second");
    }

    #[tokio::test]
    async fn test_sender_stops_when_spooler_drops() {
        let (requests, _manager, _token, handle) = spawn_sender(Config::default());

        drop(requests);
        let exit = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(exit, SenderExit::Shutdown);
    }

    #[tokio::test]
    async fn test_sender_fails_after_retries_exhausted() {
        let config = Config {
            retry_wait: Duration::from_millis(1),
            max_retry: 2,
            ..tcp_config(closed_port().await)
        };
        let (mut requests, manager, _token, handle) = spawn_sender(config);

        let reply = requests.recv().await.unwrap();
        reply.send(b"undeliverable".to_vec()).unwrap();

        let exit = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(exit, SenderExit::Failed);
        assert_eq!(manager.lock().await.state(), ReconnectState::Failed);
    }
}
