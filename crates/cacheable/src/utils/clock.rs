//! Timestamps for cache entries.
//!
//! Entry timestamps are wall-clock values so they survive a round-trip through a persistence
//! store, but they advance with [`Instant`] so that tests running on a paused tokio clock observe
//! virtual time.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::time::Instant;

static ANCHOR: LazyLock<(Instant, DateTime<Utc>)> = LazyLock::new(|| (Instant::now(), Utc::now()));

/// Returns the current time.
pub fn now() -> DateTime<Utc> {
    let (instant, wall) = *ANCHOR;
    wall + TimeDelta::from_std(instant.elapsed()).unwrap_or(TimeDelta::zero())
}

/// Returns the time passed since `timestamp`.
///
/// Timestamps in the future (for example read from a store written by a host with a skewed
/// clock) have an age of zero.
pub fn age(timestamp: DateTime<Utc>) -> Duration {
    (now() - timestamp).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_age_follows_paused_clock() {
        let created = now();
        assert_eq!(age(created), Duration::ZERO);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(age(created), Duration::from_millis(1500));
    }

    #[test]
    fn test_future_timestamp_has_no_age() {
        let created = now() + TimeDelta::seconds(60);
        assert_eq!(age(created), Duration::ZERO);
    }
}
