//! Calls-per-minute budget shared by every upstream request.
//!
//! Uses the `governor` crate (GCRA) so waiting callers are parked on a timer
//! rather than spinning. One [`RateLimiter`] is built per process and handed to
//! the fetcher (and through it, the ranking refresh) behind an `Arc`.

use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota};
use nonzero_ext::nonzero;
use tracing::trace;

/// Rate limiter for upstream calls.
pub struct RateLimiter {
    inner: DefaultDirectRateLimiter,
    calls_per_minute: NonZeroU32,
}

impl RateLimiter {
    /// Ceiling of `calls_per_minute`, with the whole minute's budget usable as a burst.
    pub fn per_minute(calls_per_minute: NonZeroU32) -> Self {
        Self::with_burst(calls_per_minute, calls_per_minute)
    }

    /// Ceiling of `calls_per_minute`, allowing at most `burst` back-to-back calls.
    pub fn with_burst(calls_per_minute: NonZeroU32, burst: NonZeroU32) -> Self {
        let quota = Quota::per_minute(calls_per_minute).allow_burst(burst);
        Self {
            inner: governor::RateLimiter::direct(quota),
            calls_per_minute,
        }
    }

    /// Strictly paced: one call every `60s / calls_per_minute`.
    pub fn paced(calls_per_minute: NonZeroU32) -> Self {
        Self::with_burst(calls_per_minute, nonzero!(1u32))
    }

    /// Waits until one call of budget is available, then consumes it.
    pub async fn acquire(&self) {
        trace!("waiting for upstream call budget");
        self.inner.until_ready().await;
    }

    /// Consumes one call of budget if available right now.
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }

    /// Configured ceiling.
    pub fn calls_per_minute(&self) -> NonZeroU32 {
        self.calls_per_minute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_bounded_by_quota() {
        let rl = RateLimiter::with_burst(nonzero!(60u32), nonzero!(3u32));
        assert!(rl.try_acquire());
        assert!(rl.try_acquire());
        assert!(rl.try_acquire());
        assert!(!rl.try_acquire(), "fourth immediate call must be refused");
        assert_eq!(rl.calls_per_minute().get(), 60);
    }

    #[test]
    fn paced_limiter_allows_a_single_call() {
        let rl = RateLimiter::paced(nonzero!(30u32));
        assert!(rl.try_acquire());
        assert!(!rl.try_acquire());
    }

    #[tokio::test]
    async fn acquire_returns_immediately_with_budget() {
        let rl = RateLimiter::per_minute(nonzero!(120u32));
        for _ in 0..10 {
            rl.acquire().await;
        }
    }
}
