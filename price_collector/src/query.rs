//! Read-only access for the query layer and the `status` command.
//!
//! Nothing here writes to the store.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    db::Db,
    gaps::{self, QueueEntry},
    granularity::Granularity,
    priority::{PriorityEntry, repo as priority_repo},
    runs::{self, RunRecord},
    snapshots::{self, SnapshotRecord},
};

/// Stored observations of one asset with `from <= bucket < to`, oldest first.
pub fn snapshots(
    db: &Db,
    granularity: Granularity,
    asset_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> anyhow::Result<Vec<SnapshotRecord>> {
    db.with_conn(|c| snapshots::range(c, granularity, asset_id, from, to))
}

/// Stored ranking by ascending rank.
pub fn priorities(db: &Db) -> anyhow::Result<Vec<PriorityEntry>> {
    Ok(db.with_conn(priority_repo::load_all)?.0)
}

/// Newest runs first.
pub fn recent_runs(db: &Db, limit: i64) -> anyhow::Result<Vec<RunRecord>> {
    db.with_conn(|c| runs::recent(c, limit))
}

/// Every gap-queue entry, queued and failed.
pub fn queue_entries(db: &Db) -> anyhow::Result<Vec<QueueEntry>> {
    db.with_conn(gaps::repo::list)
}

/// Row count and oldest bucket of one granularity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStats {
    pub granularity: Granularity,
    pub rows: i64,
    pub oldest_bucket: Option<DateTime<Utc>>,
}

/// Collector health at a glance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub last_run: Option<RunRecord>,
    pub last_good_bucket: Option<DateTime<Utc>>,
    /// Minutes between the last fully covered bucket and `generated_at`.
    pub minutes_since_good: Option<i64>,
    pub tracked_assets: usize,
    pub priorities_refreshed_at: Option<DateTime<Utc>>,
    pub queued_gaps: i64,
    /// Gaps that will not be recovered.
    pub failed_gaps: i64,
    pub tables: Vec<TableStats>,
}

impl HealthReport {
    /// Nothing failed permanently and the last run completed.
    pub fn is_healthy(&self) -> bool {
        self.failed_gaps == 0
            && self
                .last_run
                .as_ref()
                .is_some_and(|r| r.status == runs::RunStatus::Completed)
    }
}

/// Builds a [`HealthReport`] as of `now`.
pub fn health(db: &Db, now: DateTime<Utc>) -> anyhow::Result<HealthReport> {
    db.with_conn(|c| {
        let last_run = runs::recent(c, 1)?.into_iter().next();
        let last_good_bucket = runs::last_good_bucket(c)?;
        let (entries, priorities_refreshed_at) = priority_repo::load_all(c)?;
        let (queued_gaps, failed_gaps) = gaps::repo::counts(c)?;
        let mut tables = Vec::with_capacity(Granularity::ALL.len());
        for g in Granularity::ALL {
            tables.push(TableStats {
                granularity: g,
                rows: snapshots::count(c, g)?,
                oldest_bucket: snapshots::oldest_bucket(c, g)?,
            });
        }
        Ok(HealthReport {
            generated_at: now,
            last_run,
            minutes_since_good: last_good_bucket.map(|b| (now - b).num_minutes()),
            last_good_bucket,
            tracked_assets: entries.len(),
            priorities_refreshed_at,
            queued_gaps,
            failed_gaps,
            tables,
        })
    })
}
