//! GapRecoveryQueue: durable backlog of minute buckets without full coverage.
//!
//! Entries come from three places: buckets whose run fell short
//! (`partial-failure`), ticks skipped because a run was still executing
//! (`overlap`), and buckets found uncovered at startup (`missed`). Draining
//! runs one `gap-recovery` collection per due entry. An entry leaves the
//! queue only when a run fully covers its bucket; otherwise it is retried
//! with backoff and finally marked `failed`, where it stays visible.

use std::{fmt, str::FromStr, sync::Arc, time::Duration as StdDuration};

use anyhow::bail;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use roaring::RoaringBitmap;
use serde::Serialize;
use shared_utils::clock::Clock;
use snapshot_ingestor::retry::BackoffStrategy;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    aggregation::AggregationCascade,
    bucket::{bucket_id, bucket_start_utc, floor},
    collection::{CollectionRunner, RunError},
    db::Db,
    granularity::Granularity,
    models::GapQueueRow,
    priority::CollectionMode,
    runs::{self, RunKind, RunStatus},
    schema::gap_queue::dsl as gq,
    tz,
};

/// Why a bucket was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GapReason {
    Missed,
    Overlap,
    PartialFailure,
}

impl GapReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            GapReason::Missed => "missed",
            GapReason::Overlap => "overlap",
            GapReason::PartialFailure => "partial-failure",
        }
    }
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GapReason {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "missed" => GapReason::Missed,
            "overlap" => GapReason::Overlap,
            "partial-failure" => GapReason::PartialFailure,
            _ => bail!("unknown gap reason: {s}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Queued,
    /// Permanently failed; kept for operators.
    Failed,
}

impl QueueState {
    pub const fn as_str(self) -> &'static str {
        match self {
            QueueState::Queued => "queued",
            QueueState::Failed => "failed",
        }
    }
}

impl FromStr for QueueState {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => QueueState::Queued,
            "failed" => QueueState::Failed,
            _ => bail!("unknown queue state: {s}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub target_bucket: DateTime<Utc>,
    pub reason: GapReason,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub state: QueueState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<GapQueueRow> for QueueEntry {
    type Error = anyhow::Error;

    fn try_from(row: GapQueueRow) -> anyhow::Result<Self> {
        Ok(Self {
            target_bucket: tz::parse_ts_to_utc(&row.target_bucket)?,
            reason: row.reason.parse()?,
            attempts: row.attempts.max(0) as u32,
            next_retry_at: tz::parse_ts_to_utc(&row.next_retry_at)?,
            state: row.state.parse()?,
            last_error: row.last_error,
            created_at: tz::parse_ts_to_utc(&row.created_at)?,
        })
    }
}

/// Minute buckets after `last_good` and before `now`'s bucket that are not
/// in `covered`, limited to the `lookback` window before `now`. Oldest first.
pub fn detect_gaps(
    covered: impl IntoIterator<Item = DateTime<Utc>>,
    last_good: DateTime<Utc>,
    now: DateTime<Utc>,
    lookback: Duration,
) -> Vec<DateTime<Utc>> {
    let g = Granularity::Minute;
    let after_good = bucket_id(last_good, g) + 1;
    let window_start = bucket_id(now - lookback, g);
    let lo = after_good.max(window_start);
    let hi = bucket_id(now, g);
    let (Ok(lo), Ok(hi)) = (u32::try_from(lo), u32::try_from(hi)) else {
        return Vec::new();
    };
    if lo >= hi {
        return Vec::new();
    }

    let mut expected = RoaringBitmap::new();
    expected.insert_range(lo..hi);
    let covered: RoaringBitmap = covered
        .into_iter()
        .filter_map(|t| u32::try_from(bucket_id(t, g)).ok())
        .collect();
    expected -= &covered;
    expected
        .iter()
        .map(|id| bucket_start_utc(u64::from(id), g))
        .collect()
}

/// Queue repository.
pub mod repo {
    use super::*;

    /// Inserts `bucket` unless it is already queued or failed. Returns `true` if inserted.
    pub fn enqueue(
        conn: &mut SqliteConnection,
        bucket: DateTime<Utc>,
        reason: GapReason,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let stamp = tz::to_rfc3339_millis(now);
        let n = diesel::insert_into(gq::gap_queue)
            .values(&GapQueueRow {
                target_bucket: tz::to_rfc3339_millis(bucket),
                reason: reason.as_str().to_string(),
                attempts: 0,
                next_retry_at: stamp.clone(),
                state: QueueState::Queued.as_str().to_string(),
                last_error: None,
                created_at: stamp.clone(),
                updated_at: stamp,
            })
            .on_conflict(gq::target_bucket)
            .do_nothing()
            .execute(conn)?;
        Ok(n == 1)
    }

    /// Queued entries with `next_retry_at <= now`, oldest bucket first.
    pub fn due(
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<QueueEntry>> {
        gq::gap_queue
            .filter(gq::state.eq(QueueState::Queued.as_str()))
            .filter(gq::next_retry_at.le(tz::to_rfc3339_millis(now)))
            .order(gq::target_bucket.asc())
            .limit(limit)
            .select(GapQueueRow::as_select())
            .load::<GapQueueRow>(conn)?
            .into_iter()
            .map(QueueEntry::try_from)
            .collect()
    }

    /// All entries, oldest bucket first.
    pub fn list(conn: &mut SqliteConnection) -> anyhow::Result<Vec<QueueEntry>> {
        gq::gap_queue
            .order(gq::target_bucket.asc())
            .select(GapQueueRow::as_select())
            .load::<GapQueueRow>(conn)?
            .into_iter()
            .map(QueueEntry::try_from)
            .collect()
    }

    pub fn remove(conn: &mut SqliteConnection, bucket: DateTime<Utc>) -> anyhow::Result<bool> {
        let n = diesel::delete(gq::gap_queue.find(tz::to_rfc3339_millis(bucket))).execute(conn)?;
        Ok(n == 1)
    }

    /// Stores a failed attempt and when to try again.
    pub fn record_attempt(
        conn: &mut SqliteConnection,
        bucket: DateTime<Utc>,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        diesel::update(gq::gap_queue.find(tz::to_rfc3339_millis(bucket)))
            .set((
                gq::attempts.eq(attempts as i32),
                gq::next_retry_at.eq(tz::to_rfc3339_millis(next_retry_at)),
                gq::last_error.eq(error),
                gq::updated_at.eq(tz::to_rfc3339_millis(now)),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn mark_failed(
        conn: &mut SqliteConnection,
        bucket: DateTime<Utc>,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        diesel::update(gq::gap_queue.find(tz::to_rfc3339_millis(bucket)))
            .set((
                gq::state.eq(QueueState::Failed.as_str()),
                gq::attempts.eq(attempts as i32),
                gq::last_error.eq(error),
                gq::updated_at.eq(tz::to_rfc3339_millis(now)),
            ))
            .execute(conn)?;
        Ok(())
    }

    /// `(queued, failed)` counts.
    pub fn counts(conn: &mut SqliteConnection) -> anyhow::Result<(i64, i64)> {
        let queued = gq::gap_queue
            .filter(gq::state.eq(QueueState::Queued.as_str()))
            .count()
            .get_result::<i64>(conn)?;
        let failed = gq::gap_queue
            .filter(gq::state.eq(QueueState::Failed.as_str()))
            .count()
            .get_result::<i64>(conn)?;
        Ok((queued, failed))
    }
}

#[derive(Debug, Error)]
pub enum GapError {
    #[error("gap queue store: {0}")]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Run(#[from] RunError),
}

/// Retry policy of queue entries.
#[derive(Debug, Clone)]
pub struct DrainSettings {
    /// Recovery runs per entry before it is marked failed.
    pub max_attempts: u32,
    /// Wait before the next recovery attempt of an entry.
    pub backoff: BackoffStrategy,
    /// Entries handled per drain call.
    pub limit: usize,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy {
                base: StdDuration::from_secs(60),
                multiplier: 2.0,
                max: StdDuration::from_secs(30 * 60),
                jitter: false,
            },
            limit: 5,
        }
    }
}

/// What one drain did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries removed after a fully covering recovery run.
    pub recovered: usize,
    /// Entries removed because some other run had already covered the bucket.
    pub already_covered: usize,
    /// Entries rescheduled after another shortfall.
    pub retried: usize,
    /// Entries moved to `failed`.
    pub failed_permanently: usize,
}

pub struct GapRecoveryQueue {
    db: Arc<Db>,
    clock: Arc<dyn Clock>,
    settings: DrainSettings,
    /// Buckets older than this cannot be recovered; `None` means no limit.
    minute_retention: Option<Duration>,
}

impl GapRecoveryQueue {
    pub fn new(
        db: Arc<Db>,
        clock: Arc<dyn Clock>,
        settings: DrainSettings,
        minute_retention: Option<Duration>,
    ) -> Self {
        Self {
            db,
            clock,
            settings,
            minute_retention,
        }
    }

    /// Queues the minute bucket containing `bucket`. Returns `true` if it was new.
    pub fn enqueue(&self, bucket: DateTime<Utc>, reason: GapReason) -> anyhow::Result<bool> {
        let bucket = floor(bucket, Granularity::Minute);
        let now = self.clock.now();
        let inserted = self
            .db
            .with_conn(|c| repo::enqueue(c, bucket, reason, now))?;
        if inserted {
            info!(bucket = %bucket, %reason, "bucket queued for recovery");
        }
        Ok(inserted)
    }

    /// Uncovered buckets since the last fully covered one, within `lookback`.
    ///
    /// A store with no covered bucket yet has no gaps.
    pub fn detect(&self, lookback: Duration) -> anyhow::Result<Vec<DateTime<Utc>>> {
        let now = self.clock.now();
        let Some(last_good) = self.db.with_conn(runs::last_good_bucket)? else {
            return Ok(Vec::new());
        };
        let from = floor(now - lookback, Granularity::Minute);
        let covered = self.db.with_conn(|c| runs::covered_buckets(c, from, now))?;
        Ok(detect_gaps(covered, last_good, now, lookback))
    }

    /// [`Self::detect`] and queue every result as `missed`. Returns how many were new.
    #[instrument(skip(self))]
    pub fn detect_and_enqueue(&self, lookback: Duration) -> anyhow::Result<usize> {
        let gaps = self.detect(lookback)?;
        let mut added = 0;
        for bucket in &gaps {
            if self.enqueue(*bucket, GapReason::Missed)? {
                added += 1;
            }
        }
        if !gaps.is_empty() {
            info!(found = gaps.len(), added, "uncovered minutes detected");
        }
        Ok(added)
    }

    pub fn entries(&self) -> anyhow::Result<Vec<QueueEntry>> {
        self.db.with_conn(repo::list)
    }

    /// Runs one recovery per due entry, oldest first.
    #[instrument(skip_all)]
    pub async fn drain(
        &self,
        runner: &CollectionRunner,
        cascade: &AggregationCascade,
        mode: CollectionMode,
        cancel: &CancellationToken,
    ) -> Result<DrainReport, GapError> {
        let now = self.clock.now();
        let limit = self.settings.limit.max(1) as i64;
        let due = self.db.with_conn(|c| repo::due(c, now, limit))?;
        let mut report = DrainReport::default();

        for entry in due {
            if cancel.is_cancelled() {
                break;
            }
            let bucket = entry.target_bucket;
            let now = self.clock.now();

            if self.db.with_conn(|c| runs::is_covered(c, bucket))? {
                self.db.with_conn(|c| repo::remove(c, bucket))?;
                report.already_covered += 1;
                continue;
            }

            let aged_out = self
                .minute_retention
                .is_some_and(|keep| bucket < floor(now - keep, Granularity::Minute));
            if aged_out {
                self.give_up(bucket, entry.attempts, "bucket fell out of minute retention", now)?;
                report.failed_permanently += 1;
                continue;
            }

            let run = runner
                .execute(RunKind::GapRecovery, mode, bucket, cancel)
                .await?;
            let now = self.clock.now();
            if run.status == RunStatus::Cancelled {
                break;
            }
            if run.is_full_coverage() {
                self.db.with_conn(|c| repo::remove(c, bucket))?;
                if let Err(e) = cascade.refresh_for(bucket, now) {
                    warn!(bucket = %bucket, error = %e, "could not refresh aggregates after recovery");
                }
                info!(bucket = %bucket, run_id = run.run_id, "gap recovered");
                report.recovered += 1;
                continue;
            }

            let attempts = entry.attempts + 1;
            let error = run.failure_detail.clone().unwrap_or_else(|| {
                format!("{} of {} assets failed", run.tally.failed, run.tally.attempted)
            });
            if attempts >= self.settings.max_attempts {
                let detail = format!("{attempts} attempt(s): {error}");
                self.give_up(bucket, attempts, &detail, now)?;
                report.failed_permanently += 1;
            } else {
                let wait = self.settings.backoff.next_delay(attempts);
                let next = now + Duration::from_std(wait).unwrap_or(Duration::zero());
                self.db
                    .with_conn(|c| repo::record_attempt(c, bucket, attempts, next, &error, now))?;
                warn!(bucket = %bucket, attempts, next_retry_at = %next, "gap recovery fell short");
                report.retried += 1;
            }
        }
        Ok(report)
    }

    fn give_up(
        &self,
        bucket: DateTime<Utc>,
        attempts: u32,
        detail: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.db.transaction(|c| {
            repo::mark_failed(c, bucket, attempts, detail, now)?;
            runs::record_permanent_failure(c, bucket, now, detail)?;
            Ok(())
        })?;
        warn!(bucket = %bucket, attempts, detail, "gap permanently failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, h, m, 0).unwrap()
    }

    #[test]
    fn three_missed_ticks_are_three_gaps() {
        let now = at(10, 4) + Duration::seconds(10);
        let gaps = detect_gaps([at(10, 0)], at(10, 0), now, Duration::minutes(60));
        assert_eq!(gaps, vec![at(10, 1), at(10, 2), at(10, 3)]);
    }

    #[test]
    fn covered_buckets_are_not_gaps() {
        let now = at(10, 6);
        let gaps = detect_gaps([at(10, 2), at(10, 4)], at(10, 0), now, Duration::minutes(60));
        assert_eq!(gaps, vec![at(10, 1), at(10, 3), at(10, 5)]);
    }

    #[test]
    fn lookback_bounds_the_window() {
        let now = at(12, 0);
        let gaps = detect_gaps([], at(8, 0), now, Duration::minutes(5));
        assert_eq!(gaps.first(), Some(&at(11, 55)));
        assert_eq!(gaps.len(), 5);
    }

    #[test]
    fn nothing_between_adjacent_buckets() {
        assert!(detect_gaps([], at(10, 0), at(10, 1), Duration::minutes(60)).is_empty());
        assert!(detect_gaps([], at(10, 0), at(10, 0), Duration::minutes(60)).is_empty());
    }

    #[test]
    fn reasons_round_trip_through_text() {
        for r in [GapReason::Missed, GapReason::Overlap, GapReason::PartialFailure] {
            assert_eq!(r.as_str().parse::<GapReason>().unwrap(), r);
        }
    }
}
