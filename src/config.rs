//! Configuration module for the forwarding client.
//!
//! This module provides the client configuration, its defaults, and
//! environment-based loading for the forwarder binary.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default collector host
const DEFAULT_HOST: &str = "127.0.0.1";

/// Default collector port (Fluentd forward input)
const DEFAULT_PORT: u16 = 24224;

/// Default connect timeout in milliseconds
const DEFAULT_TIMEOUT_MS: u64 = 3_000;

/// Default buffer limit in bytes (8 MiB)
const DEFAULT_BUFFER_LIMIT: usize = 8 * 1024 * 1024;

/// Default base wait between reconnect attempts in milliseconds
const DEFAULT_RETRY_WAIT_MS: u64 = 500;

/// Default number of reconnect attempts before giving up
const DEFAULT_MAX_RETRY: u32 = 13;

/// Default growth rate of the reconnect wait
const DEFAULT_RETRY_GROWTH: f64 = 1.5;

/// Upper bound on the jitter fraction added to reconnect waits
const MAX_RETRY_JITTER: f64 = 1.0;

/// Network transport used to reach the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// Stream socket over host and port
    Tcp,

    /// Local domain socket over a filesystem path
    Unix,

    /// Anything else; rejected when the client is created
    Other(String),
}

impl TransportKind {
    /// Parse a transport name (`tcp` or `unix`). Unknown names are kept so the
    /// client can report them as unsupported.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => TransportKind::Tcp,
            "unix" => TransportKind::Unix,
            _ => TransportKind::Other(value.trim().to_string()),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Unix => write!(f, "unix"),
            TransportKind::Other(name) => write!(f, "{}", name),
        }
    }
}

/// What the spooler does when an incoming envelope would push the buffer past
/// its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Append, then clear the whole buffer if it exceeds the limit
    #[default]
    Discard,

    /// Keep the buffer and drop the incoming envelope
    DropNewest,

    /// Hand the buffer to the sender first, then append
    Flush,
}

impl OverflowPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "discard" => Some(OverflowPolicy::Discard),
            "drop-newest" | "drop_newest" => Some(OverflowPolicy::DropNewest),
            "flush" => Some(OverflowPolicy::Flush),
            _ => None,
        }
    }
}

/// Configuration for the forwarding client.
///
/// Zero values are treated as "unset" and replaced by defaults when the
/// client is created (see [`Config::with_defaults`]).
///
/// All settings can be configured via environment variables:
/// - `FLUENT_FORWARDER_NETWORK`: `tcp` or `unix` (default: tcp)
/// - `FLUENT_FORWARDER_HOST`: collector host (default: 127.0.0.1)
/// - `FLUENT_FORWARDER_PORT`: collector port (default: 24224)
/// - `FLUENT_FORWARDER_SOCKET_PATH`: domain socket path for `unix`
/// - `FLUENT_FORWARDER_TIMEOUT_MS`: connect timeout (default: 3000)
/// - `FLUENT_FORWARDER_BUFFER_LIMIT`: pending bytes limit (default: 8 MiB)
/// - `FLUENT_FORWARDER_RETRY_WAIT_MS`: base reconnect wait (default: 500)
/// - `FLUENT_FORWARDER_MAX_RETRY`: reconnect attempts (default: 13)
/// - `FLUENT_FORWARDER_RETRY_GROWTH`: backoff growth rate (default: 1.5)
/// - `FLUENT_FORWARDER_RETRY_JITTER`: extra random wait fraction (default: 0)
/// - `FLUENT_FORWARDER_TAG_PREFIX`: prefix joined to every tag with `.`
/// - `FLUENT_FORWARDER_SYNC_POST`: send on the calling task (default: false)
/// - `FLUENT_FORWARDER_DEFER_CONNECT`: skip the connect in `new` (default: false)
/// - `FLUENT_FORWARDER_OVERFLOW_POLICY`: `discard`, `drop-newest` or `flush`
#[derive(Debug, Clone)]
pub struct Config {
    /// Transport used to reach the collector
    pub network: TransportKind,

    /// Collector host for the `tcp` transport
    pub host: String,

    /// Collector port for the `tcp` transport
    pub port: u16,

    /// Socket path for the `unix` transport
    pub socket_path: PathBuf,

    /// Timeout applied to each connect attempt
    pub timeout: Duration,

    /// Maximum number of pending bytes held by the spooler
    pub buffer_limit: usize,

    /// Base wait between reconnect attempts
    pub retry_wait: Duration,

    /// Consecutive failed reconnect attempts before the sender gives up
    pub max_retry: u32,

    /// Multiplier applied to the wait after each failed attempt
    pub retry_growth: f64,

    /// Fraction of the computed wait added as random jitter
    pub retry_jitter: f64,

    /// Prefix prepended to every tag as `prefix.tag`
    pub tag_prefix: String,

    /// Write each post on the calling task instead of buffering it
    pub sync_post: bool,

    /// Do not dial in `new`; the first write connects instead
    pub defer_connect: bool,

    /// Behaviour when the buffer limit would be exceeded
    pub overflow_policy: OverflowPolicy,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but cannot be parsed or is
    /// out of range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fluent_forwarder::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Collector: {}:{}", config.host, config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(network) = env::var("FLUENT_FORWARDER_NETWORK") {
            config.network = TransportKind::parse(&network);
        }
        if let Ok(host) = env::var("FLUENT_FORWARDER_HOST") {
            if !host.trim().is_empty() {
                config.host = host.trim().to_string();
            }
        }
        if let Some(port) = parse_var::<u16>("FLUENT_FORWARDER_PORT")? {
            config.port = port;
        }
        if let Ok(path) = env::var("FLUENT_FORWARDER_SOCKET_PATH") {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(ms) = parse_var::<u64>("FLUENT_FORWARDER_TIMEOUT_MS")? {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_var::<usize>("FLUENT_FORWARDER_BUFFER_LIMIT")? {
            config.buffer_limit = limit;
        }
        if let Some(ms) = parse_var::<u64>("FLUENT_FORWARDER_RETRY_WAIT_MS")? {
            config.retry_wait = Duration::from_millis(ms);
        }
        if let Some(max_retry) = parse_var::<u32>("FLUENT_FORWARDER_MAX_RETRY")? {
            config.max_retry = max_retry;
        }
        config.retry_growth = Self::parse_growth()?;
        config.retry_jitter = Self::parse_jitter()?;
        if let Ok(prefix) = env::var("FLUENT_FORWARDER_TAG_PREFIX") {
            config.tag_prefix = prefix.trim().to_string();
        }
        if let Some(sync_post) = parse_bool("FLUENT_FORWARDER_SYNC_POST")? {
            config.sync_post = sync_post;
        }
        if let Some(defer) = parse_bool("FLUENT_FORWARDER_DEFER_CONNECT")? {
            config.defer_connect = defer;
        }
        if let Ok(value) = env::var("FLUENT_FORWARDER_OVERFLOW_POLICY") {
            config.overflow_policy = OverflowPolicy::parse(&value).ok_or_else(|| {
                ConfigError::for_var(
                    "FLUENT_FORWARDER_OVERFLOW_POLICY",
                    format!("'{}' is not one of discard, drop-newest, flush", value),
                )
            })?;
        }

        Ok(config.with_defaults())
    }

    /// Replace unset (zero or empty) fields with their defaults.
    pub fn with_defaults(mut self) -> Self {
        if self.host.is_empty() {
            self.host = DEFAULT_HOST.to_string();
        }
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        if self.timeout.is_zero() {
            self.timeout = Duration::from_millis(DEFAULT_TIMEOUT_MS);
        }
        if self.buffer_limit == 0 {
            self.buffer_limit = DEFAULT_BUFFER_LIMIT;
        }
        if self.retry_wait.is_zero() {
            self.retry_wait = Duration::from_millis(DEFAULT_RETRY_WAIT_MS);
        }
        if self.max_retry == 0 {
            self.max_retry = DEFAULT_MAX_RETRY;
        }
        if !(self.retry_growth.is_finite() && self.retry_growth > 0.0) {
            self.retry_growth = DEFAULT_RETRY_GROWTH;
        }
        if !(self.retry_jitter.is_finite() && self.retry_jitter >= 0.0) {
            self.retry_jitter = 0.0;
        }
        self.retry_jitter = self.retry_jitter.min(MAX_RETRY_JITTER);
        self
    }

    /// Human readable address of the collector, used in logs.
    pub fn endpoint(&self) -> String {
        match self.network {
            TransportKind::Unix => self.socket_path.display().to_string(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    fn parse_growth() -> Result<f64, ConfigError> {
        let env_var = "FLUENT_FORWARDER_RETRY_GROWTH";

        match parse_var::<f64>(env_var)? {
            Some(growth) if !growth.is_finite() || growth < 1.0 => Err(ConfigError::for_var(
                env_var,
                format!("growth rate {} must be a finite number >= 1.0", growth),
            )),
            Some(growth) => Ok(growth),
            None => Ok(DEFAULT_RETRY_GROWTH),
        }
    }

    fn parse_jitter() -> Result<f64, ConfigError> {
        let env_var = "FLUENT_FORWARDER_RETRY_JITTER";

        match parse_var::<f64>(env_var)? {
            Some(jitter) if !(0.0..=MAX_RETRY_JITTER).contains(&jitter) => {
                Err(ConfigError::for_var(
                    env_var,
                    format!("jitter {} must be between 0 and {}", jitter, MAX_RETRY_JITTER),
                ))
            }
            Some(jitter) => Ok(jitter),
            None => Ok(0.0),
        }
    }
}

fn parse_var<T: std::str::FromStr>(env_var: &str) -> Result<Option<T>, ConfigError> {
    match env::var(env_var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))),
        Err(_) => Ok(None),
    }
}

fn parse_bool(env_var: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(env_var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(ConfigError::for_var(
                env_var,
                format!("'{}' is not a valid boolean", value),
            )),
        },
        Err(_) => Ok(None),
    }
}

impl Default for Config {
    /// Create a configuration with every field at its default.
    fn default() -> Self {
        Self {
            network: TransportKind::Tcp,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            socket_path: PathBuf::new(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            retry_wait: Duration::from_millis(DEFAULT_RETRY_WAIT_MS),
            max_retry: DEFAULT_MAX_RETRY,
            retry_growth: DEFAULT_RETRY_GROWTH,
            retry_jitter: 0.0,
            tag_prefix: String::new(),
            sync_post: false,
            defer_connect: false,
            overflow_policy: OverflowPolicy::Discard,
        }
    }
}
