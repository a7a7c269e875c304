//! Generic readiness polling.
//!
//! Every wait loop in the workspace goes through [`poll_until`]: probe,
//! check the deadline, sleep the fixed interval, repeat. Timeouts are fixed
//! per operation class rather than adaptive.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// A readiness condition was not observed within its window.
#[derive(Debug, Error)]
#[error("timed out after {}s waiting for {what}", waited.as_secs())]
pub struct PollTimeout {
    /// Human description of the awaited condition.
    pub what: String,
    /// How long the loop actually waited.
    pub waited: Duration,
}

/// Poll `probe` at a fixed `interval` until it yields a value or `timeout`
/// elapses.
///
/// The probe runs immediately, then once more after the final interval, so
/// the timeout error is returned no earlier than `timeout` and no later than
/// `timeout + interval` (plus the cost of the last probe).
///
/// # Errors
///
/// Returns [`PollTimeout`] if the probe never yields a value in the window.
pub fn poll_until<T>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut probe: impl FnMut() -> Option<T>,
) -> Result<T, PollTimeout> {
    let start = Instant::now();

    loop {
        if let Some(value) = probe() {
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(PollTimeout {
                what: what.to_string(),
                waited: elapsed,
            });
        }

        debug!(
            what,
            elapsed_secs = elapsed.as_secs(),
            "condition not met, waiting"
        );
        std::thread::sleep(interval.min(timeout - elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_success_does_not_sleep() {
        let start = Instant::now();
        let value = poll_until(
            "instant",
            Duration::from_secs(5),
            Duration::from_secs(5),
            || Some(42),
        )
        .unwrap();
        assert_eq!(value, 42);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_eventual_success() {
        let mut calls = 0;
        let value = poll_until(
            "third try",
            Duration::from_secs(5),
            Duration::from_millis(10),
            || {
                calls += 1;
                (calls >= 3).then_some(calls)
            },
        )
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_timeout_bounds() {
        let timeout = Duration::from_millis(200);
        let interval = Duration::from_millis(50);

        let start = Instant::now();
        let err = poll_until("never", timeout, interval, || None::<()>).unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.waited >= timeout);
        // No later than timeout + interval, with scheduling slack.
        assert!(elapsed < timeout + interval + Duration::from_millis(100));
        assert!(err.to_string().contains("never"));
    }
}
