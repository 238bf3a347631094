//! Buffer module holding encoded events until the sender drains them.
//!
//! The [`Spooler`] is the only owner of the pending bytes. It reacts to one
//! event at a time using tokio mpsc channels and `select!`:
//! - encoded envelopes posted by the client are appended,
//! - a batch request from the sender task drains the whole buffer,
//! - shutdown performs one final flush and stops.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, OverflowPolicy};
use crate::connection::ConnectionManager;
use crate::sender::{run_sender, BatchRequest, SenderExit};

/// Capacity of the post channel; posting waits while the spooler is busy.
const POST_CHANNEL_CAPACITY: usize = 1;

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Total number of envelopes received
    pub envelopes_received: u64,

    /// Total number of bytes received
    pub bytes_received: u64,

    /// Number of batches handed to the sender
    pub drains: u64,

    /// Total number of bytes handed to the sender
    pub bytes_drained: u64,

    /// Number of times the buffer limit was hit
    pub overflows: u64,

    /// Total number of bytes dropped due to overflow
    pub bytes_dropped: u64,
}

/// Result of appending one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The envelope was appended
    Stored,

    /// The limit was hit and `dropped` bytes were thrown away
    Overflowed { dropped: usize },

    /// The buffer must be handed to the sender before appending
    FlushRequired,
}

/// Append-only byte accumulator bounded by a size limit.
#[derive(Debug)]
pub struct PendingBuffer {
    data: Vec<u8>,
    limit: usize,
    policy: OverflowPolicy,
    stats: BufferStats,
}

impl PendingBuffer {
    pub fn new(limit: usize, policy: OverflowPolicy) -> Self {
        Self {
            data: Vec::new(),
            limit,
            policy,
            stats: BufferStats::default(),
        }
    }

    /// Append an envelope, applying the overflow policy.
    ///
    /// The buffer never holds more than `limit` bytes afterwards.
    pub fn append(&mut self, chunk: &[u8]) -> AppendOutcome {
        let overflow = self.data.len() + chunk.len() > self.limit;

        let outcome = match (overflow, self.policy) {
            (false, _) => {
                self.data.extend_from_slice(chunk);
                AppendOutcome::Stored
            }
            (true, OverflowPolicy::Flush) if !self.data.is_empty() => {
                return AppendOutcome::FlushRequired;
            }
            (true, OverflowPolicy::Discard) => {
                let dropped = self.data.len() + chunk.len();
                self.data.clear();
                AppendOutcome::Overflowed { dropped }
            }
            (true, _) => AppendOutcome::Overflowed {
                dropped: chunk.len(),
            },
        };

        self.stats.envelopes_received += 1;
        self.stats.bytes_received += chunk.len() as u64;
        if let AppendOutcome::Overflowed { dropped } = outcome {
            self.stats.overflows += 1;
            self.stats.bytes_dropped += dropped as u64;
        }
        outcome
    }

    /// Take the whole contents, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        let batch = std::mem::take(&mut self.data);
        if !batch.is_empty() {
            self.stats.drains += 1;
            self.stats.bytes_drained += batch.len() as u64;
        }
        batch
    }

    /// Put back a batch that could not be handed over.
    fn restore(&mut self, batch: Vec<u8>) {
        self.stats.drains -= 1;
        self.stats.bytes_drained -= batch.len() as u64;
        let mut restored = batch;
        restored.extend_from_slice(&self.data);
        self.data = restored;
    }

    /// Drop the whole contents, returning how many bytes were lost.
    fn discard(&mut self) -> usize {
        let dropped = self.data.len();
        self.data.clear();
        if dropped > 0 {
            self.stats.overflows += 1;
            self.stats.bytes_dropped += dropped as u64;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }
}

/// Errors that can occur when posting to the spooler.
#[derive(Debug)]
pub enum BufferError {
    /// The spooler has stopped and is no longer accepting envelopes
    Closed,
}

impl std::fmt::Display for BufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferError::Closed => write!(f, "Spooler has been closed"),
        }
    }
}

impl std::error::Error for BufferError {}

/// A handle for posting encoded envelopes to the spooler.
///
/// This can be cloned and shared across producer tasks.
#[derive(Clone)]
pub struct SpoolHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

impl SpoolHandle {
    /// Hand encoded bytes to the spooler.
    ///
    /// Waits until the spooler accepts them.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), BufferError> {
        self.tx.send(data).await.map_err(|_| BufferError::Closed)
    }
}

/// The sender side of the spooler, seen from the spooler loop.
struct SenderLink {
    requests: mpsc::Receiver<BatchRequest>,
    waiting: Option<BatchRequest>,
    alive: bool,
}

impl SenderLink {
    /// Wait for the sender to ask for a batch.
    ///
    /// Returns `None` once the sender has stopped. A sender that sees
    /// shutdown exits and drops its end, so this never outlives it.
    async fn next_request(&mut self) -> Option<BatchRequest> {
        if let Some(request) = self.waiting.take() {
            return Some(request);
        }
        if !self.alive {
            return None;
        }
        let request = self.requests.recv().await;
        if request.is_none() {
            self.alive = false;
        }
        request
    }
}

/// Coordinating loop owning the pending bytes.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use fluent_forwarder::buffer::Spooler;
/// use fluent_forwarder::config::Config;
/// use fluent_forwarder::connection::ConnectionManager;
/// use tokio::sync::Mutex;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Arc::new(Config::default());
///     let manager = Arc::new(Mutex::new(ConnectionManager::new(config.clone())));
///     let shutdown = CancellationToken::new();
///
///     let (handle, spooler) = Spooler::new(&config);
///     let task = tokio::spawn(spooler.run(manager, shutdown.clone()));
///
///     handle.send(vec![0x93]).await.ok();
///     shutdown.cancel();
///     let stats = task.await.unwrap();
///     println!("received {} envelopes", stats.envelopes_received);
/// }
/// ```
pub struct Spooler {
    rx: mpsc::Receiver<Vec<u8>>,
    buffer: PendingBuffer,
}

impl Spooler {
    /// Create a spooler for the given configuration.
    ///
    /// Returns a tuple of (SpoolHandle, Spooler).
    pub fn new(config: &Config) -> (SpoolHandle, Self) {
        let (tx, rx) = mpsc::channel(POST_CHANNEL_CAPACITY);

        let spooler = Self {
            rx,
            buffer: PendingBuffer::new(config.buffer_limit, config.overflow_policy),
        };

        (SpoolHandle { tx }, spooler)
    }

    /// Run the loop until shutdown is requested or every handle is dropped.
    ///
    /// Spawns the sender task, waits for it to finish its current cycle on
    /// shutdown, makes one final attempt to write what is left, and closes
    /// the connection. Returns the buffer statistics.
    pub async fn run(
        mut self,
        manager: Arc<Mutex<ConnectionManager>>,
        shutdown: CancellationToken,
    ) -> BufferStats {
        let (request_tx, request_rx) = mpsc::channel(1);
        let sender = tokio::spawn(run_sender(request_tx, manager.clone(), shutdown.clone()));
        let mut link = SenderLink {
            requests: request_rx,
            waiting: None,
            alive: true,
        };

        info!(
            limit = self.buffer.limit,
            policy = ?self.buffer.policy,
            "Spooler started"
        );

        loop {
            if !self.buffer.is_empty() {
                if let Some(request) = link.waiting.take() {
                    self.hand_off(request);
                }
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested");
                    break;
                }

                maybe_data = self.rx.recv() => match maybe_data {
                    Some(data) => self.accept(data, Some(&mut link), &manager, &shutdown).await,
                    None => {
                        debug!("All spool handles dropped");
                        break;
                    }
                },

                request = link.requests.recv(), if link.alive && link.waiting.is_none() => {
                    match request {
                        Some(request) => link.waiting = Some(request),
                        None => {
                            link.alive = false;
                            warn!(
                                pending_bytes = self.buffer.len(),
                                "Sender task stopped; pending events wait for the final flush"
                            );
                        }
                    }
                }
            }
        }

        // Draining: the sender finishes its cycle before anything else is
        // written, then posts already queued are kept.
        self.rx.close();
        drop(link);
        match sender.await {
            Ok(SenderExit::Shutdown) => debug!("Sender task finished"),
            Ok(SenderExit::Failed) => warn!("Sender task had already failed"),
            Err(e) => warn!(error = %e, "Sender task ended abnormally"),
        }
        while let Ok(data) = self.rx.try_recv() {
            self.accept(data, None, &manager, &shutdown).await;
        }

        let remaining = self.buffer.take();
        let mut manager = manager.lock().await;
        if !remaining.is_empty() {
            match manager.write_once(&remaining).await {
                Ok(()) => info!(bytes = remaining.len(), "Final flush sent pending events"),
                Err(e) => warn!(
                    bytes = remaining.len(),
                    error = %e,
                    "Final flush failed; pending events dropped"
                ),
            }
        }
        manager.disconnect().await;

        let stats = self.buffer.stats().clone();
        info!(
            envelopes_received = stats.envelopes_received,
            bytes_drained = stats.bytes_drained,
            bytes_dropped = stats.bytes_dropped,
            "Spooler stopped"
        );
        stats
    }

    /// Append one envelope, draining the buffer first if the policy asks
    /// for it.
    ///
    /// `link` is `None` once the sender has been joined. A sender that is
    /// gone while the spooler is stopping leaves the write to the spooler
    /// itself; while running, the buffer is discarded instead.
    async fn accept(
        &mut self,
        data: Vec<u8>,
        link: Option<&mut SenderLink>,
        manager: &Mutex<ConnectionManager>,
        shutdown: &CancellationToken,
    ) {
        let mut outcome = self.buffer.append(&data);

        if outcome == AppendOutcome::FlushRequired {
            let joined = link.is_none();
            let handed_off = match link {
                Some(link) => self.hand_off_next(link).await,
                None => false,
            };
            if !handed_off {
                if joined || shutdown.is_cancelled() {
                    self.write_direct(manager).await;
                } else {
                    let dropped = self.buffer.discard();
                    warn!(
                        dropped_bytes = dropped,
                        "Buffer limit exceeded with no sender available; discarding pending bytes"
                    );
                }
            }
            outcome = self.buffer.append(&data);
        }

        if let AppendOutcome::Overflowed { dropped } = outcome {
            warn!(
                dropped_bytes = dropped,
                limit = self.buffer.limit,
                policy = ?self.buffer.policy,
                "Buffer overflow: dropping events"
            );
        }
    }

    /// Wait for the sender and give it the whole buffer. Returns false if
    /// the sender is gone.
    async fn hand_off_next(&mut self, link: &mut SenderLink) -> bool {
        while let Some(request) = link.next_request().await {
            if self.hand_off(request) {
                return true;
            }
        }
        false
    }

    /// Give the whole buffer to the sender. Returns false, keeping the
    /// bytes, if the sender dropped its request.
    fn hand_off(&mut self, request: BatchRequest) -> bool {
        let batch = self.buffer.take();
        debug!(bytes = batch.len(), "Handing batch to sender");
        match request.send(batch) {
            Ok(()) => true,
            Err(batch) => {
                debug!("Sender went away before taking the batch");
                self.buffer.restore(batch);
                false
            }
        }
    }

    /// Write the whole buffer on the spooler's own task. Only called once
    /// the sender task has finished.
    async fn write_direct(&mut self, manager: &Mutex<ConnectionManager>) {
        let batch = self.buffer.take();
        if let Err(e) = manager.lock().await.write_once(&batch).await {
            warn!(
                bytes = batch.len(),
                error = %e,
                "Flush while draining failed; pending events dropped"
            );
        }
    }
}

/// Spawn a spooler task; returns its handle and the task's join handle.
pub fn spawn_spooler(
    config: &Config,
    manager: Arc<Mutex<ConnectionManager>>,
    shutdown: CancellationToken,
) -> (SpoolHandle, JoinHandle<BufferStats>) {
    let (handle, spooler) = Spooler::new(config);
    let task = tokio::spawn(spooler.run(manager, shutdown));
    (handle, task)
}
