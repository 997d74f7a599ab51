//! Polling until a condition holds or time runs out.

use crate::errors::{Error, Result};
use std::{future::Future, time::Duration};
use tokio::time::{Instant, MissedTickBehavior};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);

// roughly 30 years
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + after`, saturating to a far-future instant on overflow.
fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug, Clone, Default)]
pub struct PollParams {
    /// Override how often the condition is checked. Default is 1 second.
    pub interval: Option<Duration>,
    /// Override how long to poll before giving up. Default is 60 seconds.
    pub timeout: Option<Duration>,
}

impl PollParams {
    pub fn interval(&self) -> Duration {
        self.interval.unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_POLL_TIMEOUT)
    }
}

/// Checks `condition` every `interval` until it returns `true`, fails, or
/// `timeout` passes. With `immediate` the first check happens right away,
/// otherwise after one interval.
///
/// Errors from the condition end polling and are returned as is. Running
/// out of time gives [`Error::DeadlineExceeded`], even while a check is in
/// flight.
pub async fn poll_until_timeout<F, Fut>(
    interval: Duration,
    timeout: Duration,
    immediate: bool,
    mut condition: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    // tokio intervals must be non-zero
    let interval = interval.max(Duration::from_millis(1));
    let now = Instant::now();
    let first = match immediate {
        true => now,
        false => deadline(now, interval),
    };
    let mut ticker = tokio::time::interval_at(first, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let polling = async {
        let mut attempt = 0u32;
        loop {
            ticker.tick().await;
            attempt += 1;
            if condition().await? {
                return Ok(());
            }
            tracing::debug!(attempt, "condition not met yet");
        }
    };
    match tokio::time::timeout_at(deadline(now, timeout), polling).await {
        Ok(result) => result,
        Err(_) => Err(Error::DeadlineExceeded(timeout)),
    }
}
