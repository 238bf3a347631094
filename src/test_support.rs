//! Fake collector endpoints and wire decoding shared by the unit tests.

use std::io::Cursor;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::config::Config;

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// One decoded `[tag, time, record]` envelope.
pub(crate) type DecodedEnvelope = (String, i64, Value);

/// Split a byte stream of concatenated envelopes.
pub(crate) fn decode_envelopes(bytes: &[u8]) -> Vec<DecodedEnvelope> {
    let mut cursor = Cursor::new(bytes);
    let mut envelopes = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        let mut de = rmp_serde::Deserializer::new(&mut cursor);
        envelopes.push(<DecodedEnvelope as Deserialize>::deserialize(&mut de).expect("decode envelope"));
    }
    envelopes
}

/// Config pointing at a local TCP port.
pub(crate) fn tcp_config(port: u16) -> Config {
    Config {
        port,
        ..Config::default()
    }
}

/// A local port with nothing listening on it.
pub(crate) async fn closed_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind ephemeral listener");
    let port = listener.local_addr().expect("listener has address").port();
    drop(listener);
    port
}

/// Accepts one TCP connection and captures everything written to it until
/// the client closes its side.
pub(crate) struct CaptureServer {
    port: u16,
    bytes: oneshot::Receiver<Vec<u8>>,
}

impl CaptureServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind ephemeral listener");
        let port = listener.local_addr().expect("listener has address").port();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept connection");
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
            let _ = tx.send(buf);
        });

        Self { port, bytes: rx }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Everything the client wrote, available once it disconnects.
    pub(crate) async fn received(self) -> Vec<u8> {
        timeout(CAPTURE_TIMEOUT, self.bytes)
            .await
            .expect("capture server timed out")
            .expect("capture server stopped")
    }
}

/// Drops the first TCP connection it accepts, then captures everything
/// written to the second one.
pub(crate) struct DropFirstServer {
    port: u16,
    /// Resolves once the second connection has been accepted
    pub(crate) reconnected: oneshot::Receiver<()>,
    bytes: oneshot::Receiver<Vec<u8>>,
}

impl DropFirstServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind ephemeral listener");
        let port = listener.local_addr().expect("listener has address").port();
        let (reconnected_tx, reconnected) = oneshot::channel();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (first, _) = listener.accept().await.expect("accept first connection");
            drop(first);

            let (mut second, _) = listener.accept().await.expect("accept second connection");
            let _ = reconnected_tx.send(());
            let mut buf = Vec::new();
            let _ = second.read_to_end(&mut buf).await;
            let _ = tx.send(buf);
        });

        Self {
            port,
            reconnected,
            bytes: rx,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Everything written to the second connection.
    pub(crate) async fn received(self) -> Vec<u8> {
        timeout(CAPTURE_TIMEOUT, self.bytes)
            .await
            .expect("capture server timed out")
            .expect("capture server stopped")
    }
}

/// Unix domain socket counterpart of [`CaptureServer`].
#[cfg(unix)]
pub(crate) struct UnixCaptureServer {
    bytes: oneshot::Receiver<Vec<u8>>,
}

#[cfg(unix)]
impl UnixCaptureServer {
    pub(crate) fn start(path: &std::path::Path) -> Self {
        let listener = tokio::net::UnixListener::bind(path).expect("bind unix listener");
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept connection");
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
            let _ = tx.send(buf);
        });

        Self { bytes: rx }
    }

    pub(crate) async fn received(self) -> Vec<u8> {
        timeout(CAPTURE_TIMEOUT, self.bytes)
            .await
            .expect("capture server timed out")
            .expect("capture server stopped")
    }
}
