//! Bounded polling primitives.
//!
//! Components that converge on state owned by someone else (a controller
//! writing annotations, an API server eventually listing a node) have no
//! notification channel to wait on. They poll. This library provides the one
//! polling loop they all share:
//!
//! - **Check**: an async probe returning [`Poll::Ready`], [`Poll::Pending`],
//!   or an error classified as transient or fatal.
//! - **Interval**: time between probes. The first probe runs immediately.
//! - **Timeout**: total time budget. Expiry without readiness is the only
//!   way a poll fails, apart from a fatal check error.
//!
//! # Invariants
//!
//! - Transient errors never surface; they are logged at debug level
//! - A timeout always names what was being awaited
//! - The check is never invoked after it has reported ready

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Default interval between probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default total time budget for a poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Polling errors.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The timeout elapsed before the check reported ready.
    #[error("timeout after {elapsed:?} waiting for {awaiting}")]
    Timeout { awaiting: String, elapsed: Duration },

    /// The check reported an error that must not be retried.
    #[error("fatal error while waiting for {awaiting}")]
    Fatal {
        awaiting: String,
        #[source]
        source: E,
    },
}

impl<E> PollError<E> {
    /// Returns true if the poll ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Description of what was being awaited.
    pub fn awaiting(&self) -> &str {
        match self {
            Self::Timeout { awaiting, .. } | Self::Fatal { awaiting, .. } => awaiting,
        }
    }
}

/// Outcome of a single successful probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    /// The awaited condition holds; stop polling.
    Ready(T),

    /// Not there yet; probe again after the interval.
    Pending,
}

/// Classification of a failed probe.
#[derive(Debug)]
pub enum CheckError<E> {
    /// Swallowed and logged; polling continues.
    Transient(E),

    /// Ends the poll immediately.
    Fatal(E),
}

/// Interval and timeout for a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Time between probes.
    pub interval: Duration,

    /// Total time budget.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl PollConfig {
    /// Create a poll configuration.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Repeatedly invoke `check` until it reports ready or `config.timeout`
/// elapses.
///
/// The check runs once immediately and then once per interval. The final
/// sleep is clamped so that one last probe happens at the deadline.
pub async fn poll_until<T, E, F, Fut>(
    config: PollConfig,
    awaiting: impl Into<String>,
    mut check: F,
) -> Result<T, PollError<E>>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>, CheckError<E>>>,
{
    let awaiting = awaiting.into();
    let start = Instant::now();
    // A timeout too large to represent never expires.
    let deadline = start.checked_add(config.timeout);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match check().await {
            Ok(Poll::Ready(value)) => {
                debug!(awaiting = %awaiting, attempt, "Poll condition met");
                return Ok(value);
            }
            Ok(Poll::Pending) => {
                debug!(awaiting = %awaiting, attempt, "Poll condition not yet met");
            }
            Err(CheckError::Transient(e)) => {
                debug!(awaiting = %awaiting, attempt, error = %e, "Poll check failed, retrying");
            }
            Err(CheckError::Fatal(source)) => {
                return Err(PollError::Fatal { awaiting, source });
            }
        }

        let now = Instant::now();
        let pause = match deadline {
            Some(deadline) if now >= deadline => {
                return Err(PollError::Timeout {
                    awaiting,
                    elapsed: now.duration_since(start),
                });
            }
            Some(deadline) => config.interval.min(deadline - now),
            None => config.interval,
        };

        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn config() -> PollConfig {
        PollConfig::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_first_probe() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result: Result<&str, PollError<String>> = poll_until(config(), "thing", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Poll::Ready("done"))
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_pending_probes() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<u32, PollError<String>> = poll_until(config(), "thing", || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 4 {
                    Ok(Poll::Ready(n))
                } else {
                    Ok(Poll::Pending)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_swallowed() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = poll_until(config(), "thing", || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CheckError::Transient("listing failed".to_string()))
                } else {
                    Ok(Poll::Ready(()))
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_awaited_thing() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result: Result<(), PollError<String>> =
            poll_until(config(), "annotation foo on node bar", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(CheckError::Transient("still broken".to_string()))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.awaiting(), "annotation foo on node bar");
        assert!(err.to_string().contains("annotation foo on node bar"));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        // One probe at t=0 plus one per second up to and including the deadline.
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_polling() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), PollError<String>> = poll_until(config(), "thing", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CheckError::Fatal("malformed".to_string()))
            }
        })
        .await;

        match result.unwrap_err() {
            PollError::Fatal { source, .. } => assert_eq!(source, "malformed"),
            other => panic!("expected fatal error, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_timeout_polls_without_deadline() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = PollConfig::new(Duration::from_secs(1), Duration::from_secs(u64::MAX));

        let result: Result<u32, PollError<String>> = poll_until(config, "thing", || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 3 {
                    Ok(Poll::Ready(n))
                } else {
                    Ok(Poll::Pending)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_poll_config_default() {
        let config = PollConfig::default();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(300));
    }
}
