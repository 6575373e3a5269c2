//! Rate-limited, validating batch fetcher.
//!
//! [`SnapshotFetcher::fetch`] issues exactly one upstream call per batch and
//! splits the answer into accepted snapshots and explicitly failed IDs; a
//! subset failure never fails the batch. For every input ID exactly one of the
//! two lists holds it.

use std::{collections::HashSet, sync::Arc};

use chrono::Duration;
use shared_utils::clock::Clock;
use tracing::{debug, instrument};

use crate::{
    models::{ranking::RankedAsset, snapshot::PriceSnapshot},
    providers::{ProviderError, SnapshotProvider, ValidationSnafu},
    rate_limit::RateLimiter,
    retry::{RetryError, RetryPolicy},
    validation::{ValidationError, validate_quote},
};

/// Fetcher limits.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Hard upstream cap on IDs per quote call.
    pub max_ids_per_call: usize,
    /// Allowed distance between a quote's timestamp and now.
    pub clock_skew_tolerance: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_ids_per_call: 250,
            clock_skew_tolerance: Duration::minutes(5),
        }
    }
}

/// Why an ID in a batch produced no snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// The upstream response did not contain the ID.
    Missing,
    /// The upstream returned a quote that failed validation.
    Invalid(ValidationError),
}

impl FailureReason {
    /// Worth asking the upstream again. Bad data is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::Missing)
    }
}

/// One asset that failed inside an otherwise successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedAsset {
    pub asset_id: String,
    pub reason: FailureReason,
}

/// Result of one batch call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    /// Validated snapshots, in request order.
    pub snapshots: Vec<PriceSnapshot>,
    /// IDs without a snapshot, in request order.
    pub failed: Vec<FailedAsset>,
}

impl FetchOutcome {
    /// IDs whose failure is worth a follow-up call.
    pub fn retryable_ids(&self) -> Vec<String> {
        self.failed
            .iter()
            .filter(|f| f.reason.is_retryable())
            .map(|f| f.asset_id.clone())
            .collect()
    }

    /// Folds in the result of a follow-up call for some of this batch's
    /// failed IDs. Recovered IDs move from `failed` to `snapshots`; IDs that
    /// failed again keep their slot with the newer reason.
    pub fn absorb(&mut self, follow_up: FetchOutcome) {
        let recovered: HashSet<String> = follow_up
            .snapshots
            .iter()
            .map(|s| s.asset_id.clone())
            .collect();
        self.failed.retain(|f| !recovered.contains(&f.asset_id));
        for again in follow_up.failed {
            if let Some(slot) = self.failed.iter_mut().find(|f| f.asset_id == again.asset_id) {
                slot.reason = again.reason;
            }
        }
        self.snapshots.extend(follow_up.snapshots);
    }
}

/// Wraps a [`SnapshotProvider`] with the shared rate limiter, retry policy and validation.
pub struct SnapshotFetcher {
    provider: Arc<dyn SnapshotProvider>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    cfg: FetcherConfig,
}

impl SnapshotFetcher {
    pub fn new(
        provider: Arc<dyn SnapshotProvider>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        cfg: FetcherConfig,
    ) -> Self {
        Self {
            provider,
            limiter,
            retry,
            clock,
            cfg,
        }
    }

    /// Upper bound on a batch.
    pub fn max_ids_per_call(&self) -> usize {
        self.cfg.max_ids_per_call
    }

    /// Retry policy used by the `*_with_retry` helpers.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// One rate-limited quote call for `batch`.
    ///
    /// Duplicate IDs are collapsed. Batches above `max_ids_per_call` are
    /// refused with [`ProviderError::Validation`] before any budget is spent.
    #[instrument(skip_all, fields(batch_len = batch.len()))]
    pub async fn fetch(&self, batch: &[String]) -> Result<FetchOutcome, ProviderError> {
        let mut seen = HashSet::with_capacity(batch.len());
        let ids: Vec<String> = batch
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        if ids.len() > self.cfg.max_ids_per_call {
            return ValidationSnafu {
                message: format!(
                    "batch of {} ids exceeds the per-call maximum of {}",
                    ids.len(),
                    self.cfg.max_ids_per_call
                ),
            }
            .fail();
        }
        if ids.is_empty() {
            return Ok(FetchOutcome::default());
        }

        self.limiter.acquire().await;
        let mut quotes = self.provider.fetch_quotes(&ids).await?;
        let now = self.clock.now();

        let mut out = FetchOutcome::default();
        for id in ids {
            match quotes.swap_remove(&id) {
                None => out.failed.push(FailedAsset {
                    asset_id: id,
                    reason: FailureReason::Missing,
                }),
                Some(raw) => {
                    match validate_quote(&id, &raw, now, self.cfg.clock_skew_tolerance) {
                        Ok(snap) => out.snapshots.push(snap),
                        Err(e) => {
                            debug!(asset_id = %id, error = %e, "quote rejected");
                            out.failed.push(FailedAsset {
                                asset_id: id,
                                reason: FailureReason::Invalid(e),
                            })
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// [`Self::fetch`] under the retry policy.
    pub async fn fetch_with_retry(&self, batch: &[String]) -> Result<FetchOutcome, RetryError> {
        self.retry.execute_with_retry(|_| self.fetch(batch)).await
    }

    /// One rate-limited ranking page call.
    pub async fn fetch_ranking_page(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RankedAsset>, ProviderError> {
        self.limiter.acquire().await;
        self.provider.fetch_ranking_page(page, per_page).await
    }

    /// [`Self::fetch_ranking_page`] under the retry policy.
    pub async fn fetch_ranking_page_with_retry(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RankedAsset>, RetryError> {
        self.retry
            .execute_with_retry(|_| self.fetch_ranking_page(page, per_page))
            .await
    }
}
