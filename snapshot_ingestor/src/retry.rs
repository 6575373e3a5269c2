//! Error classification, exponential backoff and the retry loop.
//!
//! Policy:
//! - `Throttled`, `Server`, `Network` are retried up to the attempt budget.
//! - `Auth` propagates immediately; credentials do not heal by waiting.
//! - `Unknown` gets exactly one retry, then surfaces.
//! - `Rejected` (local precondition failures) is never retried.

use std::{future::Future, time::Duration};

use rand::Rng;
use thiserror::Error;
use tracing::warn;

use crate::providers::ProviderError;

/// Coarse failure classes that drive the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Upstream rate-limit signal.
    Throttled,
    /// Upstream-side failure (5xx).
    Server,
    /// Transport failure, timeout, connection reset.
    Network,
    /// Invalid or missing credentials.
    Auth,
    /// Anything else (unexpected 4xx, malformed payload).
    Unknown,
    /// Refused before or outside the upstream call; repeating it cannot help.
    Rejected,
}

impl ErrorClass {
    /// How many attempts in total this class may consume, given the caller's budget.
    fn attempt_budget(self, max_attempts: u32) -> u32 {
        match self {
            ErrorClass::Throttled | ErrorClass::Server | ErrorClass::Network => max_attempts,
            ErrorClass::Unknown => max_attempts.min(2),
            ErrorClass::Auth | ErrorClass::Rejected => 1,
        }
    }
}

/// Maps a provider error onto an [`ErrorClass`].
pub fn classify(err: &ProviderError) -> ErrorClass {
    match err {
        ProviderError::Throttled { .. } => ErrorClass::Throttled,
        ProviderError::Server { .. } => ErrorClass::Server,
        ProviderError::Auth { .. } => ErrorClass::Auth,
        ProviderError::Network { .. } => ErrorClass::Network,
        ProviderError::Reqwest { source, .. } => match source.status() {
            Some(s) if s.as_u16() == 429 => ErrorClass::Throttled,
            Some(s) if s.as_u16() == 401 || s.as_u16() == 403 => ErrorClass::Auth,
            Some(s) if s.is_server_error() => ErrorClass::Server,
            _ if source.is_timeout() || source.is_connect() || source.is_request() => {
                ErrorClass::Network
            }
            _ => ErrorClass::Unknown,
        },
        ProviderError::Validation { .. } | ProviderError::Init { .. } => ErrorClass::Rejected,
        ProviderError::Api { .. } | ProviderError::Decode { .. } => ErrorClass::Unknown,
    }
}

/// Exponential backoff: `base * multiplier^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct BackoffStrategy {
    /// Delay after the first failed attempt.
    pub base: Duration,
    /// Growth factor per attempt (>= 1).
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Add random jitter. Jitter never lets a delay drop below the previous
    /// attempt's delay.
    pub jitter: bool,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl BackoffStrategy {
    /// Un-jittered, capped delay for `attempt` (1-based; 0 is treated as 1).
    fn capped(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        let factor = self.multiplier.max(1.0).powi(exp.min(i32::MAX as u32) as i32);
        let secs = self.base.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay to wait after failed attempt number `attempt`.
    ///
    /// Non-decreasing in `attempt` and never above `max`. With jitter enabled
    /// the extra is drawn from `[0, capped(attempt+1) - capped(attempt)]`, so
    /// it stays at or below the next attempt's floor.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let floor = self.capped(attempt);
        if !self.jitter {
            return floor;
        }
        let headroom = self.capped(attempt.saturating_add(1)).saturating_sub(floor);
        if headroom.is_zero() {
            return floor;
        }
        let extra_ms = rand::rng().random_range(0..=headroom.as_millis() as u64);
        floor + Duration::from_millis(extra_ms)
    }
}

/// Failure after the retry policy has been applied.
#[derive(Debug, Error)]
pub enum RetryError {
    /// Non-retryable credentials failure; callers must halt the run.
    #[error("upstream rejected credentials: {0}")]
    Auth(#[source] ProviderError),

    /// Attempt budget spent (or the class allowed no further retries).
    #[error("gave up after {attempts} attempt(s) [{class:?}]: {source}")]
    Exhausted {
        attempts: u32,
        class: ErrorClass,
        #[source]
        source: ProviderError,
    },
}

impl RetryError {
    /// Class of the last underlying error.
    pub fn class(&self) -> ErrorClass {
        match self {
            RetryError::Auth(_) => ErrorClass::Auth,
            RetryError::Exhausted { class, .. } => *class,
        }
    }

    /// `true` when the whole run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RetryError::Auth(_))
    }
}

/// Attempt budget + backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts for retryable classes, including the first.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds or the policy gives up.
    ///
    /// `op` receives the 1-based attempt number. A `Retry-After` hint from the
    /// upstream lengthens (never shortens) the wait, still capped at `backoff.max`.
    /// Waits never shrink from one attempt to the next, hinted or not.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1u32;
        let mut prev_delay = Duration::ZERO;
        loop {
            let err = match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            let class = classify(&err);
            if class == ErrorClass::Auth {
                return Err(RetryError::Auth(err));
            }
            if attempt >= class.attempt_budget(max_attempts) {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    class,
                    source: err,
                });
            }

            let mut delay = self.backoff.next_delay(attempt).max(prev_delay);
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint.min(self.backoff.max));
            }
            prev_delay = delay;
            warn!(
                attempt,
                ?class,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "upstream call failed, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
