//! AggregationCascade: derives coarser granularities and enforces retention.
//!
//! Roll-ups use closing-value semantics: the target row for a bucket is the
//! latest source row inside `[start, end)`. Only closed buckets are rolled,
//! and every write is an idempotent upsert, so re-rolling is always safe.
//! Nothing here runs on the write path; the scheduler calls it once per tick.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    bucket,
    db::Db,
    granularity::Granularity,
    snapshots::{self, SnapshotRecord},
};

/// Per-granularity retention horizons. `None` keeps rows forever.
///
/// Month has no horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub minute: Option<Duration>,
    pub hour: Option<Duration>,
    pub day: Option<Duration>,
    pub week: Option<Duration>,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            minute: Some(Duration::minutes(60)),
            hour: Some(Duration::hours(24)),
            day: Some(Duration::days(7)),
            week: Some(Duration::weeks(52)),
        }
    }
}

impl Retention {
    pub fn horizon(&self, g: Granularity) -> Option<Duration> {
        match g {
            Granularity::Minute => self.minute,
            Granularity::Hour => self.hour,
            Granularity::Day => self.day,
            Granularity::Week => self.week,
            Granularity::Month => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("{granularity} bucket starting {start} is still open")]
    BucketOpen {
        granularity: Granularity,
        start: DateTime<Utc>,
    },

    #[error("{0} is written directly and has no source granularity")]
    NoSource(Granularity),

    #[error("aggregation store: {0}")]
    Store(#[from] anyhow::Error),
}

/// Rows written per target granularity during one cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CascadeReport {
    pub hour: usize,
    pub day: usize,
    pub week: usize,
    pub month: usize,
}

impl CascadeReport {
    fn add(&mut self, g: Granularity, n: usize) {
        match g {
            Granularity::Hour => self.hour += n,
            Granularity::Day => self.day += n,
            Granularity::Week => self.week += n,
            Granularity::Month => self.month += n,
            Granularity::Minute => {}
        }
    }

    pub fn total(&self) -> usize {
        self.hour + self.day + self.week + self.month
    }
}

/// Rows deleted per granularity during one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub minute: usize,
    pub hour: usize,
    pub day: usize,
    pub week: usize,
}

pub struct AggregationCascade {
    db: Arc<Db>,
    retention: Retention,
}

impl AggregationCascade {
    pub fn new(db: Arc<Db>, retention: Retention) -> Self {
        Self { db, retention }
    }

    pub fn retention(&self) -> &Retention {
        &self.retention
    }

    /// Rolls the closed `target` bucket containing `bucket_start` up from its
    /// source granularity. Returns rows written.
    pub fn roll_up(
        &self,
        target: Granularity,
        bucket_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, AggregationError> {
        let source = target.source().ok_or(AggregationError::NoSource(target))?;
        let (start, end) = bucket::bounds(bucket_start, target);
        if end > now {
            return Err(AggregationError::BucketOpen {
                granularity: target,
                start,
            });
        }

        let n = self.db.transaction(|c| {
            let closing = snapshots::latest_per_asset(c, source, start, end)?;
            let rows: Vec<SnapshotRecord> = closing
                .into_iter()
                .map(|r| SnapshotRecord {
                    granularity: target,
                    bucket: start,
                    ..r
                })
                .collect();
            snapshots::upsert(c, target, &rows)
        })?;
        debug!(%target, %source, bucket = %start, rows = n, "rolled up");
        Ok(n)
    }

    /// Rolls up the most recently closed bucket of every derived granularity,
    /// finest first.
    #[instrument(skip(self))]
    pub fn cascade(&self, now: DateTime<Utc>) -> Result<CascadeReport, AggregationError> {
        let mut report = CascadeReport::default();
        for g in Granularity::CASCADE {
            let n = self.roll_up(g, bucket::last_closed(now, g), now)?;
            report.add(g, n);
        }
        Ok(report)
    }

    /// Re-rolls every closed coarser bucket containing `minute_bucket`.
    ///
    /// Used after a gap-recovery run wrote into a past minute.
    pub fn refresh_for(
        &self,
        minute_bucket: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CascadeReport, AggregationError> {
        let mut report = CascadeReport::default();
        for g in Granularity::CASCADE {
            let start = bucket::floor(minute_bucket, g);
            if !bucket::is_closed(start, g, now) {
                // coarser buckets contain this one, so they are open too
                break;
            }
            report.add(g, self.roll_up(g, start, now)?);
        }
        Ok(report)
    }

    /// Deletes rows of `g` older than its horizon. Month is never swept.
    pub fn retention_sweep(
        &self,
        g: Granularity,
        now: DateTime<Utc>,
    ) -> Result<usize, AggregationError> {
        let Some(horizon) = self.retention.horizon(g) else {
            return Ok(0);
        };
        let cutoff = now - horizon;
        let n = self
            .db
            .with_conn(|c| snapshots::delete_older_than(c, g, cutoff))?;
        if n > 0 {
            debug!(granularity = %g, %cutoff, deleted = n, "retention sweep");
        }
        Ok(n)
    }

    /// Sweeps every bounded granularity.
    #[instrument(skip(self))]
    pub fn sweep_all(&self, now: DateTime<Utc>) -> Result<SweepReport, AggregationError> {
        Ok(SweepReport {
            minute: self.retention_sweep(Granularity::Minute, now)?,
            hour: self.retention_sweep(Granularity::Hour, now)?,
            day: self.retention_sweep(Granularity::Day, now)?,
            week: self.retention_sweep(Granularity::Week, now)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use snapshot_ingestor::models::snapshot::SecondaryMetrics;

    fn cascade() -> (tempfile::NamedTempFile, AggregationCascade) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let db = Db::open(&tmp.path().to_string_lossy()).unwrap();
        (tmp, AggregationCascade::new(Arc::new(db), Retention::default()))
    }

    fn minute(id: &str, at: DateTime<Utc>, price: f64) -> SnapshotRecord {
        SnapshotRecord {
            asset_id: id.into(),
            granularity: Granularity::Minute,
            bucket: at,
            price,
            metrics: SecondaryMetrics::default(),
            rank_at_capture: None,
            captured_at: at,
        }
    }

    #[test]
    fn open_buckets_are_refused() {
        let (_tmp, agg) = cascade();
        let now = Utc.with_ymd_and_hms(2025, 4, 1, 10, 30, 0).unwrap();
        let err = agg.roll_up(Granularity::Hour, now, now).unwrap_err();
        assert!(matches!(err, AggregationError::BucketOpen { .. }));
        assert!(matches!(
            agg.roll_up(Granularity::Minute, now, now).unwrap_err(),
            AggregationError::NoSource(Granularity::Minute)
        ));
    }

    #[test]
    fn refresh_for_stops_at_the_first_open_bucket() {
        let (_tmp, agg) = cascade();
        let at = Utc.with_ymd_and_hms(2025, 4, 1, 9, 15, 0).unwrap();
        agg.db
            .with_conn(|c| snapshots::upsert(c, Granularity::Minute, &[minute("x", at, 5.0)]))
            .unwrap();

        let now = Utc.with_ymd_and_hms(2025, 4, 1, 10, 2, 0).unwrap();
        let report = agg.refresh_for(at, now).unwrap();
        assert_eq!(report, CascadeReport { hour: 1, ..Default::default() });
    }

    #[test]
    fn month_is_never_swept() {
        let (_tmp, agg) = cascade();
        assert_eq!(agg.retention().horizon(Granularity::Month), None);
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(agg.retention_sweep(Granularity::Month, now).unwrap(), 0);
    }
}
