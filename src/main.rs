//! Fluent Forwarder - forwards JSON lines from stdin to a Fluentd collector
//!
//! Every line read from standard input must be a JSON object; it is posted
//! as one event under the configured tag. Other lines are skipped with a
//! warning.
//!
//! ## Usage
//!
//! ```text
//! tail -F app.log.json | fluent-forwarder app.access
//! ```
//!
//! The tag is taken from the first argument, then `FLUENT_FORWARDER_TAG`,
//! and defaults to `forwarder`.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `FLUENT_FORWARDER_NETWORK`: `tcp` or `unix` (default: tcp)
//! - `FLUENT_FORWARDER_HOST`: Collector host (default: 127.0.0.1)
//! - `FLUENT_FORWARDER_PORT`: Collector port (default: 24224)
//! - `FLUENT_FORWARDER_SOCKET_PATH`: Socket path for the unix transport
//! - `FLUENT_FORWARDER_TIMEOUT_MS`: Connect timeout (default: 3000)
//! - `FLUENT_FORWARDER_BUFFER_LIMIT`: Pending byte limit (default: 8 MiB)
//! - `FLUENT_FORWARDER_RETRY_WAIT_MS`: Base reconnect wait (default: 500)
//! - `FLUENT_FORWARDER_MAX_RETRY`: Reconnect attempts (default: 13)
//! - `FLUENT_FORWARDER_TAG_PREFIX`: Prefix joined to every tag with `.`
//! - `FLUENT_FORWARDER_SYNC_POST`: Write each event immediately (default: false)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fluent_forwarder::client::{ClientError, FluentClient};
use fluent_forwarder::config::Config;

/// Tag used when neither an argument nor `FLUENT_FORWARDER_TAG` is given
const DEFAULT_TAG: &str = "forwarder";

/// How long shutdown may take to flush pending events
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Fluent Forwarder...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                endpoint = %config.endpoint(),
                network = %config.network,
                buffer_limit = config.buffer_limit,
                max_retry = config.max_retry,
                sync_post = config.sync_post,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let client = match FluentClient::new(config).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to create fluent client");
            std::process::exit(1);
        }
    };

    let tag = resolve_tag(std::env::args().nth(1), std::env::var("FLUENT_FORWARDER_TAG").ok());
    info!(tag = %tag, "Forwarding stdin. Press Ctrl+C to stop.");

    let mut exit_code = 0;
    tokio::select! {
        result = forward_lines(&client, &tag) => match result {
            Ok(forwarded) => info!(forwarded = forwarded, "Input finished"),
            Err(e) => {
                error!(error = %e, "Forwarding stopped");
                exit_code = 1;
            }
        },
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
    }

    info!("Initiating graceful shutdown...");
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, client.shutdown()).await {
        Ok(Some(stats)) => info!(
            envelopes = stats.envelopes_received,
            bytes_dropped = stats.bytes_dropped,
            "Spooler shut down gracefully"
        ),
        Ok(None) => warn!("Spooler did not report statistics"),
        Err(_) => warn!("Shutdown timed out after {:?}", SHUTDOWN_TIMEOUT),
    }

    info!("Fluent Forwarder stopped");
    std::process::exit(exit_code);
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn resolve_tag(arg: Option<String>, env: Option<String>) -> String {
    arg.into_iter()
        .chain(env)
        .map(|tag| tag.trim().to_string())
        .find(|tag| !tag.is_empty())
        .unwrap_or_else(|| DEFAULT_TAG.to_string())
}

/// Post every JSON object read from stdin until end of input.
///
/// Returns the number of events posted. Only a fatal client error stops the
/// loop early.
async fn forward_lines(client: &FluentClient, tag: &str) -> Result<u64, ClientError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut forwarded: u64 = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Skipping line that is not valid JSON");
                continue;
            }
        };

        match client.post(tag, &value).await {
            Ok(()) => forwarded += 1,
            Err(e @ (ClientError::InvalidRecordShape(_) | ClientError::Encoding(_))) => {
                warn!(error = %e, "Skipping line that is not a JSON object");
            }
            Err(e @ (ClientError::Write(_) | ClientError::Connect(_))) => {
                warn!(error = %e, "Failed to deliver event");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_from_argument_first() {
        let tag = resolve_tag(Some("app.access".to_string()), Some("env.tag".to_string()));
        assert_eq!(tag, "app.access");
    }

    #[test]
    fn test_tag_falls_back_to_env_then_default() {
        assert_eq!(resolve_tag(None, Some("env.tag".to_string())), "env.tag");
        assert_eq!(resolve_tag(Some("  ".to_string()), None), DEFAULT_TAG);
        assert_eq!(resolve_tag(None, None), DEFAULT_TAG);
    }
}
