//! CollectionRun: one complete pass over the tracked assets for one minute bucket.
//!
//! Batches are fetched strictly one after another through the shared rate
//! limiter. Asset-level failures never abort a batch and batch-level
//! failures never abort a run; only an `Auth` rejection, exhausted
//! persistence retries, cancellation or a panic end a run early. The run
//! record is finalized exactly once in every case.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use shared_utils::clock::Clock;
use snapshot_ingestor::{
    fetcher::SnapshotFetcher, models::snapshot::PriceSnapshot, retry::BackoffStrategy,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    bucket,
    db::Db,
    granularity::Granularity,
    priority::{CollectionMode, PriorityStore, Ranking, batching},
    runs::{self, RunKind, RunRecord, RunStatus, RunTally},
    snapshots::{self, SnapshotRecord},
};

/// Knobs of a collection run.
#[derive(Debug, Clone)]
pub struct CollectionSettings {
    /// Assets per upstream call; clamped to the fetcher's per-call maximum.
    pub batch_size: usize,
    /// Pause between consecutive batches.
    pub inter_batch_delay: Duration,
    /// Largest `failed / attempted` ratio that still counts as completed.
    pub failure_tolerance: f64,
    /// Write attempts per batch before the run is aborted.
    pub persist_attempts: u32,
    /// Re-request IDs missing from a response once per batch.
    pub resume_failed_subset: bool,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            batch_size: 250,
            inter_batch_delay: Duration::ZERO,
            failure_tolerance: 0.05,
            persist_attempts: 3,
            resume_failed_subset: true,
        }
    }
}

/// Failures of the run bookkeeping itself. Everything else is recorded in
/// the returned [`RunRecord`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not open run record: {0}")]
    Open(#[source] anyhow::Error),

    #[error("could not finalize run {run_id}: {source}")]
    Finalize {
        run_id: i32,
        #[source]
        source: anyhow::Error,
    },
}

/// How the run body ended.
#[derive(Debug)]
enum RunEnd {
    Finished,
    Cancelled,
    Aborted(String),
}

#[derive(Default)]
struct Progress {
    attempted: AtomicU32,
    succeeded: AtomicU32,
    failed: AtomicU32,
}

impl Progress {
    fn attempt(&self, n: usize) {
        self.attempted.fetch_add(n as u32, Ordering::Relaxed);
    }
    fn succeed(&self, n: usize) {
        self.succeeded.fetch_add(n as u32, Ordering::Relaxed);
    }
    fn fail(&self, n: usize) {
        self.failed.fetch_add(n as u32, Ordering::Relaxed);
    }
    fn tally(&self) -> RunTally {
        RunTally {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Executes collection runs against the store.
pub struct CollectionRunner {
    db: Arc<Db>,
    fetcher: Arc<SnapshotFetcher>,
    priorities: Arc<PriorityStore>,
    clock: Arc<dyn Clock>,
    settings: CollectionSettings,
}

impl CollectionRunner {
    pub fn new(
        db: Arc<Db>,
        fetcher: Arc<SnapshotFetcher>,
        priorities: Arc<PriorityStore>,
        clock: Arc<dyn Clock>,
        settings: CollectionSettings,
    ) -> Self {
        Self {
            db,
            fetcher,
            priorities,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &CollectionSettings {
        &self.settings
    }

    /// Runs one pass of `kind` over `mode`'s assets for the minute bucket
    /// containing `target`, and returns the finalized record.
    #[instrument(skip_all, fields(kind = kind.as_str(), %mode, bucket = %target))]
    pub async fn execute(
        &self,
        kind: RunKind,
        mode: CollectionMode,
        target: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunRecord, RunError> {
        let target = bucket::floor(target, Granularity::Minute);
        let started = self.clock.now();
        let record = self
            .db
            .with_conn(|c| runs::open(c, kind, Some(target), started))
            .map_err(RunError::Open)?;
        let run_id = record.run_id;
        debug!(run_id, bucket = %target, "run opened");

        let progress = Progress::default();
        let body = AssertUnwindSafe(self.run_body(run_id, mode, target, cancel, &progress))
            .catch_unwind()
            .await;

        let tally = progress.tally();
        let (status, detail) = match body {
            Ok(RunEnd::Finished) if tally.failure_ratio() <= self.settings.failure_tolerance => {
                (RunStatus::Completed, None)
            }
            Ok(RunEnd::Finished) => (
                RunStatus::Failed,
                Some(format!(
                    "{} of {} assets failed, above tolerance {}",
                    tally.failed, tally.attempted, self.settings.failure_tolerance
                )),
            ),
            Ok(RunEnd::Cancelled) => (RunStatus::Cancelled, Some("cancelled".to_string())),
            Ok(RunEnd::Aborted(detail)) => (RunStatus::Failed, Some(detail)),
            Err(panic) => (
                RunStatus::Failed,
                Some(format!("run panicked: {}", panic_message(&*panic))),
            ),
        };

        let ended = self.clock.now();
        self.finalize(run_id, status, tally, ended, detail.as_deref())
            .await?;

        if status == RunStatus::Completed {
            info!(run_id, bucket = %target, attempted = tally.attempted,
                succeeded = tally.succeeded, failed = tally.failed, "run completed");
        } else {
            warn!(run_id, bucket = %target, %status, attempted = tally.attempted,
                succeeded = tally.succeeded, failed = tally.failed,
                detail = detail.as_deref().unwrap_or(""), "run did not complete");
        }

        Ok(RunRecord {
            ended_at: Some(ended),
            tally,
            status,
            failure_detail: detail,
            ..record
        })
    }

    async fn run_body(
        &self,
        run_id: i32,
        mode: CollectionMode,
        target: DateTime<Utc>,
        cancel: &CancellationToken,
        progress: &Progress,
    ) -> RunEnd {
        let state = self.priorities.state();
        if state.is_stale() {
            warn!(run_id, "collecting with a stale ranking");
        }
        let ranking = state.ranking().cloned();
        let batch_size = self
            .settings
            .batch_size
            .clamp(1, self.fetcher.max_ids_per_call().max(1));
        let batches =
            batching::partition(ranking.as_deref(), self.priorities.pinned(), mode, batch_size);
        if batches.is_empty() {
            return RunEnd::Aborted("no assets to collect: ranking is empty".to_string());
        }

        let total = batches.len();
        for (i, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                return RunEnd::Cancelled;
            }
            if i > 0 && !self.settings.inter_batch_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return RunEnd::Cancelled,
                    _ = tokio::time::sleep(self.settings.inter_batch_delay) => {}
                }
            }

            progress.attempt(batch.len());
            let first = tokio::select! {
                _ = cancel.cancelled() => {
                    progress.fail(batch.len());
                    return RunEnd::Cancelled;
                }
                r = self.fetcher.fetch_with_retry(batch) => r,
            };
            let mut outcome = match first {
                Ok(o) => o,
                Err(e) if e.is_fatal() => {
                    progress.fail(batch.len());
                    return RunEnd::Aborted(format!("upstream auth failure: {e}"));
                }
                Err(e) => {
                    warn!(run_id, batch = i, size = batch.len(), error = %e, "batch gave up");
                    progress.fail(batch.len());
                    continue;
                }
            };

            let mut fatal = None;
            let retry_ids = outcome.retryable_ids();
            if self.settings.resume_failed_subset && !retry_ids.is_empty() {
                debug!(run_id, batch = i, missing = retry_ids.len(), "re-requesting failed subset");
                let follow_up = tokio::select! {
                    _ = cancel.cancelled() => None,
                    r = self.fetcher.fetch_with_retry(&retry_ids) => Some(r),
                };
                match follow_up {
                    Some(Ok(second)) => outcome.absorb(second),
                    Some(Err(e)) if e.is_fatal() => fatal = Some(e),
                    Some(Err(e)) => {
                        warn!(run_id, batch = i, error = %e, "follow-up for failed subset gave up")
                    }
                    None => {}
                }
            }

            if let Err(detail) = self
                .persist(&outcome.snapshots, target, ranking.as_deref())
                .await
            {
                progress.fail(batch.len());
                return RunEnd::Aborted(detail);
            }
            progress.succeed(outcome.snapshots.len());
            progress.fail(outcome.failed.len());
            debug!(run_id, batch = i, of = total, ok = outcome.snapshots.len(),
                failed = outcome.failed.len(), "batch stored");

            if let Some(e) = fatal {
                return RunEnd::Aborted(format!("upstream auth failure: {e}"));
            }
        }
        RunEnd::Finished
    }

    /// Upserts one batch into the minute table, retrying the write.
    async fn persist(
        &self,
        batch: &[PriceSnapshot],
        target: DateTime<Utc>,
        ranking: Option<&Ranking>,
    ) -> Result<usize, String> {
        if batch.is_empty() {
            return Ok(0);
        }
        let records: Vec<SnapshotRecord> = batch
            .iter()
            .map(|s| {
                let rank = ranking.and_then(|r| r.rank_of(&s.asset_id));
                SnapshotRecord::from_snapshot(s, Granularity::Minute, target, rank)
            })
            .collect();

        let attempts = self.settings.persist_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .db
                .transaction(|c| snapshots::upsert(c, Granularity::Minute, &records))
            {
                Ok(n) => return Ok(n),
                Err(e) if attempt >= attempts => {
                    return Err(format!("persistence failed after {attempt} attempt(s): {e}"));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "snapshot write failed, retrying");
                    tokio::time::sleep(store_backoff().next_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn finalize(
        &self,
        run_id: i32,
        status: RunStatus,
        tally: RunTally,
        ended: DateTime<Utc>,
        detail: Option<&str>,
    ) -> Result<(), RunError> {
        let attempts = self.settings.persist_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .db
                .with_conn(|c| runs::finalize(c, run_id, status, tally, ended, detail))
            {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    warn!(run_id, "run record was already terminal");
                    return Ok(());
                }
                Err(source) if attempt >= attempts => {
                    return Err(RunError::Finalize { run_id, source });
                }
                Err(e) => {
                    warn!(run_id, attempt, error = %e, "finalize failed, retrying");
                    tokio::time::sleep(store_backoff().next_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn store_backoff() -> BackoffStrategy {
    BackoffStrategy {
        base: Duration::from_millis(100),
        multiplier: 2.0,
        max: Duration::from_secs(2),
        jitter: false,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*p), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*p), "bang");
        let p: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*p), "non-string panic payload");
    }

    #[test]
    fn tolerance_default_is_five_percent() {
        let s = CollectionSettings::default();
        assert_eq!(s.failure_tolerance, 0.05);
        assert!(s.resume_failed_subset);
    }
}
