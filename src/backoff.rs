//! Bounded reconnect state machine with exponential backoff.
//!
//! Attempt `n` of a reconnect sequence (0-indexed) starts immediately for
//! `n = 0` and otherwise waits `retry_wait * growth^(n-1)`, plus optional
//! jitter. After `max_retry` consecutive failures the sequence ends in the
//! terminal [`ReconnectState::Failed`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// Connection state as seen by the reconnect machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    /// A live connection exists
    Connected,

    /// No connection; the value counts consecutive failed dial attempts
    Reconnecting(u32),

    /// Retries exhausted; terminal
    Failed,
}

impl ReconnectState {
    pub fn is_failed(&self) -> bool {
        matches!(self, ReconnectState::Failed)
    }
}

impl fmt::Display for ReconnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectState::Connected => write!(f, "connected"),
            ReconnectState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {})", attempt),
            ReconnectState::Failed => write!(f, "failed"),
        }
    }
}

/// Retry settings driving the reconnect sequence.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Wait before the second attempt
    pub retry_wait: Duration,

    /// Consecutive failures allowed before giving up
    pub max_retry: u32,

    /// Multiplier applied to the wait for each further attempt
    pub growth: f64,

    /// Fraction of the wait added as random jitter
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry_wait: config.retry_wait,
            max_retry: config.max_retry,
            growth: config.retry_growth,
            jitter: config.retry_jitter,
        }
    }

    /// Minimum wait before attempt `attempt` (0-indexed).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.retry_wait.as_secs_f64() * self.growth.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Wait before attempt `attempt`, including jitter.
    ///
    /// Never shorter than [`RetryPolicy::base_delay`].
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() || self.jitter <= 0.0 {
            return base;
        }
        let fraction = rand::thread_rng().gen_range(0.0..=self.jitter);
        let extra = Duration::try_from_secs_f64(base.as_secs_f64() * fraction).unwrap_or(Duration::MAX);
        base.saturating_add(extra)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Milliseconds in `delay` for log fields, saturating at `u64::MAX`.
fn whole_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Returned when every attempt of a reconnect sequence failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run a reconnect sequence, calling `dial` until it succeeds or the policy
/// gives up.
///
/// `observe` receives every state the sequence passes through, ending with
/// `Connected` or `Failed`.
pub async fn reconnect_with<T, E, F, Fut, O>(
    policy: &RetryPolicy,
    mut dial: F,
    mut observe: O,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    O: FnMut(ReconnectState),
{
    let mut attempt: u32 = 0;
    observe(ReconnectState::Reconnecting(attempt));

    loop {
        let delay = policy.delay(attempt);
        if !delay.is_zero() {
            debug!(
                attempt = attempt,
                delay_ms = whole_millis(delay),
                "Waiting before reconnect attempt"
            );
            tokio::time::sleep(delay).await;
        }

        match dial().await {
            Ok(connection) => {
                if attempt > 0 {
                    info!(failed_attempts = attempt, "Reconnected after failures");
                }
                observe(ReconnectState::Connected);
                return Ok(connection);
            }
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_retry {
                    error!(
                        attempts = attempt,
                        error = %e,
                        "Reconnect attempts exhausted"
                    );
                    observe(ReconnectState::Failed);
                    return Err(Exhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                warn!(
                    attempt = attempt,
                    max_retry = policy.max_retry,
                    error = %e,
                    "Reconnect attempt failed"
                );
                observe(ReconnectState::Reconnecting(attempt));
            }
        }
    }
}
