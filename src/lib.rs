//! Fluent Forwarder Library
//!
//! This library forwards structured events to a Fluentd-compatible collector
//! over the forward protocol:
//!
//! - **config**: Environment-based configuration with defaults
//! - **record**: Adapting structs and string-keyed maps into records
//! - **encoder**: MessagePack `[tag, time, record]` envelopes
//! - **backoff**: Bounded reconnect state machine with exponential backoff
//! - **connection**: TCP and Unix socket connection management
//! - **buffer**: The spooler owning pending bytes
//! - **sender**: Background task draining the spooler to the collector
//! - **client**: Public facade for posting events
//!
//! # Example
//!
//! ```no_run
//! use fluent_forwarder::client::FluentClient;
//! use fluent_forwarder::config::Config;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Connect to the collector
//!     let client = FluentClient::new(config).await.expect("Failed to connect");
//!
//!     // Post an event; delivery happens in the background
//!     client.post("app.access", &json!({"status": 200})).await.ok();
//!
//!     // Flush what is pending and close the connection
//!     client.shutdown().await;
//! }
//! ```

// Module declarations
pub mod backoff;
pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod encoder;
pub mod record;
pub mod sender;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root for convenience
pub use backoff::{ReconnectState, RetryPolicy};
pub use buffer::{BufferError, BufferStats, SpoolHandle, Spooler};
pub use client::{ClientError, FluentClient};
pub use config::{Config, ConfigError, OverflowPolicy, TransportKind};
pub use connection::{ConnectionError, ConnectionManager};
pub use encoder::{Encoder, EncodingError, MsgpackEncoder};
pub use record::{to_record, Record, RecordError};
