//! Client facade for posting events to a forward-protocol collector.
//!
//! [`FluentClient`] adapts caller values into records, encodes them and
//! either writes them immediately (synchronous mode) or hands them to the
//! background spooler. Asynchronous callers are never told whether a
//! particular event was delivered; they only learn about the terminal
//! transport failure through [`ClientError::TransportFailed`].

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectState;
use crate::buffer::{spawn_spooler, BufferStats, SpoolHandle};
use crate::config::{Config, ConfigError, TransportKind};
use crate::connection::{ConnectionError, ConnectionManager};
use crate::encoder::{Encoder, EncodingError, MsgpackEncoder};
use crate::record::{to_record, Record, RecordError};

/// Errors that can occur when using the client.
#[derive(Debug)]
pub enum ClientError {
    /// Connecting to the collector failed
    Connect(ConnectionError),

    /// The configured network kind is not supported
    UnsupportedTransport(String),

    /// An event could not be encoded
    Encoding(EncodingError),

    /// The value is neither a struct nor a string-keyed map
    InvalidRecordShape(String),

    /// Writing to the collector failed
    Write(std::io::Error),

    /// Reconnect attempts were exhausted; no further events can be sent
    TransportFailed,

    /// The client has been closed
    Closed,

    /// The configuration is invalid
    Config(ConfigError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "Connect error: {}", e),
            ClientError::UnsupportedTransport(kind) => {
                write!(f, "Unsupported transport: {}", kind)
            }
            ClientError::Encoding(e) => write!(f, "Encoding error: {}", e),
            ClientError::InvalidRecordShape(msg) => write!(f, "Invalid record shape: {}", msg),
            ClientError::Write(e) => write!(f, "Write error: {}", e),
            ClientError::TransportFailed => {
                write!(f, "Transport failed permanently after exhausting reconnect attempts")
            }
            ClientError::Closed => write!(f, "Client has been closed"),
            ClientError::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Connect(e) => Some(e),
            ClientError::Encoding(e) => Some(e),
            ClientError::Write(e) => Some(e),
            ClientError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for ClientError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::UnsupportedTransport(kind) => ClientError::UnsupportedTransport(kind),
            ConnectionError::Write(e) => ClientError::Write(e),
            ConnectionError::Exhausted { .. } | ConnectionError::Failed => {
                ClientError::TransportFailed
            }
            e @ (ConnectionError::Connect { .. } | ConnectionError::Timeout { .. }) => {
                ClientError::Connect(e)
            }
        }
    }
}

impl From<EncodingError> for ClientError {
    fn from(e: EncodingError) -> Self {
        ClientError::Encoding(e)
    }
}

impl From<ConfigError> for ClientError {
    fn from(e: ConfigError) -> Self {
        ClientError::Config(e)
    }
}

/// Client forwarding events to a collector.
///
/// Must be created inside a tokio runtime; it spawns the spooler and sender
/// tasks. Dropping the client requests shutdown without waiting for the
/// final flush; call [`FluentClient::shutdown`] to wait for it.
///
/// # Example
///
/// ```no_run
/// use fluent_forwarder::client::FluentClient;
/// use fluent_forwarder::config::Config;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Access {
///     #[serde(rename = "status")]
///     code: u16,
///     path: String,
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let client = FluentClient::new(Config::default())
///         .await
///         .expect("Failed to connect");
///
///     let event = Access { code: 200, path: "/".to_string() };
///     client.post("app.access", &event).await.ok();
///
///     client.shutdown().await;
/// }
/// ```
pub struct FluentClient {
    config: Arc<Config>,
    encoder: Arc<dyn Encoder>,
    manager: Arc<Mutex<ConnectionManager>>,
    spool: SpoolHandle,
    state: watch::Receiver<ReconnectState>,
    shutdown: CancellationToken,
    spooler: Mutex<Option<JoinHandle<BufferStats>>>,
}

impl FluentClient {
    /// Create a client using the MessagePack forward encoder.
    ///
    /// Unset fields of `config` take their defaults. Unless `defer_connect`
    /// is set, the collector is dialed once before returning.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::UnsupportedTransport` or `ClientError::Config`
    /// for an unusable configuration, and `ClientError::Connect` if the
    /// initial connect fails.
    pub async fn new(config: Config) -> Result<Self, ClientError> {
        Self::with_encoder(config, Arc::new(MsgpackEncoder)).await
    }

    /// Create a client with a custom encoder.
    pub async fn with_encoder(
        config: Config,
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self, ClientError> {
        let config = Arc::new(validate(config.with_defaults())?);

        let mut manager = ConnectionManager::new(Arc::clone(&config));
        if !config.defer_connect {
            manager.connect().await?;
        }
        let state = manager.subscribe();
        let manager = Arc::new(Mutex::new(manager));

        let shutdown = CancellationToken::new();
        let (spool, task) = spawn_spooler(&config, Arc::clone(&manager), shutdown.clone());

        info!(
            endpoint = %config.endpoint(),
            network = %config.network,
            sync_post = config.sync_post,
            "Fluent client initialized"
        );

        Ok(Self {
            config,
            encoder,
            manager,
            spool,
            state,
            shutdown,
            spooler: Mutex::new(Some(task)),
        })
    }

    /// Post `value` with the current time.
    pub async fn post<T>(&self, tag: &str, value: &T) -> Result<(), ClientError>
    where
        T: Serialize + ?Sized,
    {
        self.post_with_time(tag, Utc::now(), value).await
    }

    /// Post `value` with an explicit timestamp.
    ///
    /// The configured tag prefix is prepended as `prefix.tag`.
    pub async fn post_with_time<T>(
        &self,
        tag: &str,
        time: DateTime<Utc>,
        value: &T,
    ) -> Result<(), ClientError>
    where
        T: Serialize + ?Sized,
    {
        let tag = self.prefixed(tag);
        let record = to_record(value).map_err(|e| match e {
            RecordError::InvalidShape(msg) => ClientError::InvalidRecordShape(msg),
            RecordError::Value { field, source } => ClientError::Encoding(EncodingError::new(
                &tag,
                format!("field '{}' of {}", field, type_name::<T>()),
                source,
            )),
            other => ClientError::Encoding(EncodingError::new(&tag, type_name::<T>(), other)),
        })?;
        self.encode_and_post(&tag, time, &record).await
    }

    /// Encode a ready-made record and post it. The tag is used as given.
    pub async fn encode_and_post(
        &self,
        tag: &str,
        time: DateTime<Utc>,
        record: &Record,
    ) -> Result<(), ClientError> {
        let data = self.encode_data(tag, time, record)?;
        if self.config.sync_post {
            self.write_sync(&data).await
        } else {
            self.post_raw_data(data).await
        }
    }

    /// Encode a record without posting it.
    pub fn encode_data(
        &self,
        tag: &str,
        time: DateTime<Utc>,
        record: &Record,
    ) -> Result<Vec<u8>, ClientError> {
        Ok(self.encoder.encode(tag, time.timestamp(), record)?)
    }

    /// Hand already-encoded bytes to the spooler.
    ///
    /// Always buffered, whatever `sync_post` says. Waits until the spooler
    /// accepts the bytes.
    pub async fn post_raw_data(&self, data: Vec<u8>) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        if self.transport_state().is_failed() {
            return Err(ClientError::TransportFailed);
        }
        self.spool
            .send(data)
            .await
            .map_err(|_| ClientError::Closed)
    }

    async fn write_sync(&self, data: &[u8]) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let result = self.manager.lock().await.write_once(data).await;
        result.map_err(ClientError::from)
    }

    /// Request shutdown. Returns immediately; the spooler performs its
    /// final flush in the background. Calling it again does nothing.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Closing fluent client");
            self.shutdown.cancel();
        }
    }

    /// Close and wait for the final flush.
    ///
    /// Returns the buffer statistics the first time it is called, `None`
    /// afterwards.
    pub async fn shutdown(&self) -> Option<BufferStats> {
        self.close();

        let task = self.spooler.lock().await.take()?;
        match task.await {
            Ok(stats) => {
                debug!(?stats, "Spooler finished");
                Some(stats)
            }
            Err(e) => {
                warn!(error = %e, "Spooler task ended abnormally");
                None
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Current state of the transport.
    pub fn transport_state(&self) -> ReconnectState {
        *self.state.borrow()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn prefixed(&self, tag: &str) -> String {
        if self.config.tag_prefix.is_empty() {
            tag.to_string()
        } else {
            format!("{}.{}", self.config.tag_prefix, tag)
        }
    }
}

impl Drop for FluentClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn validate(config: Config) -> Result<Config, ClientError> {
    match &config.network {
        TransportKind::Other(kind) => {
            return Err(ClientError::UnsupportedTransport(kind.clone()));
        }
        TransportKind::Unix if config.socket_path.as_os_str().is_empty() => {
            return Err(ClientError::Config(ConfigError {
                message: "unix transport requires a socket path".to_string(),
                env_var: Some("FLUENT_FORWARDER_SOCKET_PATH".to_string()),
            }));
        }
        _ => {}
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        closed_port, decode_envelopes, tcp_config, CaptureServer, DropFirstServer,
    };
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Serialize)]
    struct Access {
        #[serde(rename = "status")]
        code: u16,
        path: &'static str,
    }

    struct FailingEncoder;

    impl Encoder for FailingEncoder {
        fn encode(
            &self,
            tag: &str,
            _timestamp: i64,
            record: &Record,
        ) -> Result<Vec<u8>, EncodingError> {
            Err(EncodingError::new(tag, format!("{:?}", record), "encoder offline"))
        }
    }

    fn deferred(port: u16) -> Config {
        Config {
            defer_connect: true,
            ..tcp_config(port)
        }
    }

    #[tokio::test]
    async fn test_sync_post_applies_prefix_and_aliases() {
        let server = CaptureServer::start().await;
        let config = Config {
            sync_post: true,
            tag_prefix: "app".to_string(),
            ..tcp_config(server.port())
        };
        let client = FluentClient::new(config).await.unwrap();
        let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        client
            .post_with_time("access", time, &Access { code: 200, path: "/" })
            .await
            .unwrap();
        client.shutdown().await;

        let envelopes = decode_envelopes(&server.received().await);
        assert_eq!(envelopes.len(), 1);
        let (tag, timestamp, record) = &envelopes[0];
        assert_eq!(tag, "app.access");
        assert_eq!(*timestamp, 1_700_000_000);
        assert_eq!(record, &json!({"status": 200, "path": "/"}));
    }

    #[tokio::test]
    async fn test_new_fails_when_collector_down() {
        let result = FluentClient::new(tcp_config(closed_port().await)).await;
        assert!(matches!(result, Err(ClientError::Connect(_))));
    }

    #[tokio::test]
    async fn test_new_rejects_unsupported_transport() {
        let config = Config {
            network: TransportKind::Other("udp".to_string()),
            ..Config::default()
        };

        let result = FluentClient::new(config).await;
        assert!(matches!(result, Err(ClientError::UnsupportedTransport(ref kind)) if kind == "udp"));
    }

    #[tokio::test]
    async fn test_new_rejects_unix_without_path() {
        let config = Config {
            network: TransportKind::Unix,
            socket_path: Default::default(),
            ..Config::default()
        };

        let result = FluentClient::new(config).await;
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_sync_post_to_refused_port_is_connect_error() {
        let config = Config {
            sync_post: true,
            ..deferred(closed_port().await)
        };
        let client = FluentClient::new(config).await.unwrap();

        let result = client.post("app.access", &json!({"code": 200})).await;
        assert!(matches!(result, Err(ClientError::Connect(_))));
        assert!(!client.transport_state().is_failed());
    }

    #[tokio::test]
    async fn test_async_posts_arrive_in_order() {
        let server = CaptureServer::start().await;
        let client = FluentClient::new(tcp_config(server.port())).await.unwrap();

        for a in 1..=3 {
            client.post("t", &json!({"a": a})).await.unwrap();
        }
        let stats = client.shutdown().await.expect("first shutdown reports stats");
        assert_eq!(stats.envelopes_received, 3);

        // Order only: the sender may take the first envelope before close,
        // so the three are not guaranteed to share one write.

        let envelopes = decode_envelopes(&server.received().await);
        let records: Vec<_> = envelopes.iter().map(|(_, _, record)| record.clone()).collect();
        assert_eq!(records, vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 3})]);
        assert!(envelopes.iter().all(|(tag, _, _)| tag == "t"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = FluentClient::new(deferred(closed_port().await)).await.unwrap();

        client.close();
        client.close();
        assert!(client.is_closed());

        assert!(client.shutdown().await.is_some());
        assert!(client.shutdown().await.is_none());
    }

    #[tokio::test]
    async fn test_post_after_close_is_rejected() {
        let client = FluentClient::new(deferred(closed_port().await)).await.unwrap();
        client.close();

        let result = client.post("t", &json!({"a": 1})).await;
        assert!(matches!(result, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_invalid_record_shapes() {
        let client = FluentClient::new(deferred(closed_port().await)).await.unwrap();

        let scalar = client.post("t", &42).await;
        assert!(matches!(scalar, Err(ClientError::InvalidRecordShape(_))));

        let sequence = client.post("t", &vec![1, 2, 3]).await;
        assert!(matches!(sequence, Err(ClientError::InvalidRecordShape(_))));

        let mut numeric_keys = HashMap::new();
        numeric_keys.insert(1, "one");
        let map = client.post("t", &numeric_keys).await;
        assert!(matches!(map, Err(ClientError::InvalidRecordShape(_))));

        let stats = client.shutdown().await.unwrap();
        assert_eq!(stats.envelopes_received, 0);
    }

    #[tokio::test]
    async fn test_encoder_failure_posts_nothing() {
        let client = FluentClient::with_encoder(
            deferred(closed_port().await),
            Arc::new(FailingEncoder),
        )
        .await
        .unwrap();

        let result = client.post("t", &json!({"a": 1})).await;
        match result {
            Err(ClientError::Encoding(e)) => assert_eq!(e.tag, "t"),
            other => panic!("unexpected result: {other:?}"),
        }

        let stats = client.shutdown().await.unwrap();
        assert_eq!(stats.envelopes_received, 0);
    }

    #[tokio::test]
    async fn test_unconvertible_field_names_the_field() {
        #[derive(Serialize)]
        struct Grid {
            cells: BTreeMap<(i32, i32), u8>,
        }

        let client = FluentClient::new(deferred(closed_port().await)).await.unwrap();
        let mut cells = BTreeMap::new();
        cells.insert((0, 1), 9);

        match client.post("grid", &Grid { cells }).await {
            Err(ClientError::Encoding(e)) => {
                assert_eq!(e.tag, "grid");
                assert!(e.value.contains("cells"), "value was {}", e.value);
                assert!(e.value.contains("Grid"), "value was {}", e.value);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recovers_after_connection_loss() {
        let mut server = DropFirstServer::start().await;
        let config = Config {
            retry_wait: Duration::from_millis(1),
            ..tcp_config(server.port())
        };
        let client = FluentClient::new(config).await.unwrap();
        assert_eq!(client.transport_state(), ReconnectState::Connected);

        // Writes to the dropped connection fail; later batches re-dial.
        let mut seq = 0;
        loop {
            client
                .post("t", &json!({"phase": "lost", "seq": seq}))
                .await
                .unwrap();
            seq += 1;
            if timeout(Duration::from_millis(20), &mut server.reconnected)
                .await
                .is_ok()
            {
                break;
            }
            assert!(seq < 250, "client never reconnected");
        }

        let mut state = client.state.clone();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ReconnectState::Connected),
        )
        .await
        .expect("transport returns to connected")
        .unwrap();
        assert_eq!(client.transport_state(), ReconnectState::Connected);

        for seq in 0..3 {
            client
                .post("t", &json!({"phase": "recovered", "seq": seq}))
                .await
                .unwrap();
        }
        client.shutdown().await;

        let envelopes = decode_envelopes(&server.received().await);
        let recovered: Vec<_> = envelopes
            .iter()
            .filter(|(_, _, record)| record["phase"] == "recovered")
            .map(|(_, _, record)| record["seq"].clone())
            .collect();
        assert_eq!(recovered, vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_encode_data_uses_epoch_seconds() {
        let client = FluentClient::new(deferred(closed_port().await)).await.unwrap();
        let mut record = Record::new();
        record.insert("k".to_string(), json!("v"));
        let time = Utc.timestamp_opt(1_234, 999_000_000).unwrap();

        let bytes = client.encode_data("raw", time, &record).unwrap();
        let envelopes = decode_envelopes(&bytes);
        assert_eq!(envelopes, vec![("raw".to_string(), 1_234, json!({"k": "v"}))]);
    }

    #[tokio::test]
    async fn test_post_raw_data_is_forwarded_verbatim() {
        let server = CaptureServer::start().await;
        let client = FluentClient::new(tcp_config(server.port())).await.unwrap();
        let mut record = Record::new();
        record.insert("k".to_string(), json!(1));
        let bytes = client.encode_data("raw", Utc::now(), &record).unwrap();

        client.post_raw_data(bytes.clone()).await.unwrap();
        client.shutdown().await;

        assert_eq!(server.received().await, bytes);
    }

    #[tokio::test]
    async fn test_posts_fail_after_transport_failure() {
        let config = Config {
            retry_wait: Duration::from_millis(1),
            max_retry: 2,
            ..deferred(closed_port().await)
        };
        let client = FluentClient::new(config).await.unwrap();

        client.post("t", &json!({"a": 1})).await.unwrap();

        let mut state = client.state.clone();
        timeout(Duration::from_secs(5), state.wait_for(|s| s.is_failed()))
            .await
            .expect("sender reaches failed state")
            .unwrap();
        assert_eq!(client.transport_state(), ReconnectState::Failed);

        let result = client.post("t", &json!({"a": 2})).await;
        assert!(matches!(result, Err(ClientError::TransportFailed)));

        assert!(client.shutdown().await.is_some());
    }

    #[test]
    fn test_connection_error_mapping() {
        let err: ClientError = ConnectionError::Failed.into();
        assert!(matches!(err, ClientError::TransportFailed));

        let err: ClientError = ConnectionError::UnsupportedTransport("udp".to_string()).into();
        assert!(matches!(err, ClientError::UnsupportedTransport(_)));

        let err: ClientError = ConnectionError::Timeout {
            endpoint: "127.0.0.1:24224".to_string(),
            timeout: Duration::from_secs(3),
        }
        .into();
        assert!(matches!(err, ClientError::Connect(_)));
        assert!(err.to_string().contains("timed out"));
    }
}
