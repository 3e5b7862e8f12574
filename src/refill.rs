//! Token refill arithmetic.
//!
//! Pure and synchronous: refill is computed lazily from elapsed wall-clock
//! time at call sites, never by a ticking background task.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use std::time::Duration;

/// Compute the refilled token count and the new reference timestamp.
///
/// One token accrues per full `interval` elapsed since `refilled_at`, clamped
/// to `capacity`. The returned timestamp advances by the intervals actually
/// credited, so fractional progress toward the next token survives. When the
/// bucket fills it re-anchors to `now` instead, so leftover elapsed time
/// cannot grant a free token later.
///
/// A `refilled_at` in the future (clock skew between processes) credits
/// nothing and leaves the record unchanged, keeping the stored timestamp
/// monotonic.
pub fn refill(
    tokens: u32,
    refilled_at: DateTime<Utc>,
    now: DateTime<Utc>,
    capacity: u32,
    interval: Duration,
) -> (u32, DateTime<Utc>) {
    if tokens >= capacity {
        return (tokens, refilled_at);
    }
    // A zero interval accrues instantly.
    if interval.is_zero() {
        return (capacity, now);
    }
    let elapsed = match now.signed_duration_since(refilled_at).to_std() {
        Ok(elapsed) => elapsed,
        Err(_) => return (tokens, refilled_at),
    };
    if elapsed < interval {
        return (tokens, refilled_at);
    }
    let earned = (elapsed.as_nanos() / interval.as_nanos()).min(u128::from(capacity - tokens)) as u32;
    let tokens = tokens + earned;
    if tokens == capacity {
        (tokens, now)
    } else {
        let spent = interval.saturating_mul(earned);
        let refilled_at = match TimeDelta::from_std(spent) {
            Ok(delta) => refilled_at + delta,
            Err(_) => now,
        };
        (tokens, refilled_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const INTERVAL: Duration = Duration::from_secs(10);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn credits_one_token_per_interval() {
        let t0 = at(1_000);
        for k in 0..8u32 {
            let now = t0 + TimeDelta::seconds(i64::from(k) * 10);
            let (tokens, _) = refill(1, t0, now, 5, INTERVAL);
            assert_eq!(tokens, (1 + k).min(5), "k={k}");
        }
    }

    #[test]
    fn clamps_to_capacity() {
        let t0 = at(1_000);
        let (tokens, refilled_at) = refill(0, t0, t0 + TimeDelta::seconds(1_000), 3, INTERVAL);
        assert_eq!(tokens, 3);
        // Full bucket re-anchors to now, discarding the leftover elapsed time.
        assert_eq!(refilled_at, t0 + TimeDelta::seconds(1_000));
    }

    #[test]
    fn preserves_fractional_progress_when_not_full() {
        let t0 = at(1_000);
        // 25s = 2 full intervals + 5s progress toward the third.
        let (tokens, refilled_at) = refill(0, t0, t0 + TimeDelta::seconds(25), 5, INTERVAL);
        assert_eq!(tokens, 2);
        assert_eq!(refilled_at, t0 + TimeDelta::seconds(20));
    }

    #[test]
    fn under_one_interval_changes_nothing() {
        let t0 = at(1_000);
        let (tokens, refilled_at) = refill(2, t0, t0 + TimeDelta::seconds(9), 5, INTERVAL);
        assert_eq!((tokens, refilled_at), (2, t0));
    }

    #[test]
    fn full_bucket_changes_nothing() {
        let t0 = at(1_000);
        let (tokens, refilled_at) = refill(5, t0, t0 + TimeDelta::seconds(1_000), 5, INTERVAL);
        assert_eq!((tokens, refilled_at), (5, t0));
    }

    #[test]
    fn future_timestamp_changes_nothing() {
        let t0 = at(1_000);
        let (tokens, refilled_at) = refill(2, t0, t0 - TimeDelta::seconds(30), 5, INTERVAL);
        assert_eq!((tokens, refilled_at), (2, t0));
    }

    #[test]
    fn exact_fill_reanchors_to_now() {
        let t0 = at(1_000);
        let now = t0 + TimeDelta::seconds(30);
        let (tokens, refilled_at) = refill(2, t0, now, 5, INTERVAL);
        assert_eq!(tokens, 5);
        assert_eq!(refilled_at, now);
    }

    #[test]
    fn zero_interval_fills_immediately() {
        let t0 = at(1_000);
        let (tokens, refilled_at) = refill(1, t0, t0, 5, Duration::ZERO);
        assert_eq!((tokens, refilled_at), (5, t0));
    }
}
