//! Upstream side of the collector: a rate-limited, retrying client for a
//! ranked-asset price source.
//!
//! The crate is split the same way a request flows:
//! - [`providers`]: the [`providers::SnapshotProvider`] trait and the REST
//!   implementation that speaks the upstream wire format.
//! - [`rate_limit`]: the single calls-per-minute budget shared by every call.
//! - [`retry`]: error classification, exponential backoff and
//!   [`retry::RetryPolicy::execute_with_retry`].
//! - [`validation`]: plausibility checks on returned quotes.
//! - [`fetcher`]: [`fetcher::SnapshotFetcher`], which ties the above together
//!   and reports partial batch failures explicitly.

pub mod fetcher;
pub mod models;
pub mod providers;
pub mod rate_limit;
pub mod retry;
pub mod validation;
