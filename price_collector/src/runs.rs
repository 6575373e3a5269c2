//! Run bookkeeping over [`crate::schema::run_record`].
//!
//! A record is opened `running` when a run starts and finalized exactly once.
//! Finalization is a guarded update (`WHERE terminal_status = 'running'`), and
//! a trigger rejects any later update, so terminal rows never change.

use std::{fmt, str::FromStr};

use anyhow::bail;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::{
    models::{NewRunRecord, RunRecordRow},
    schema::run_record::{self, dsl as rr},
    tz,
};

/// What a run was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunKind {
    Scheduled,
    GapRecovery,
    PriorityRefresh,
}

impl RunKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            RunKind::Scheduled => "scheduled",
            RunKind::GapRecovery => "gap-recovery",
            RunKind::PriorityRefresh => "priority-refresh",
        }
    }
}

impl FromStr for RunKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "scheduled" => RunKind::Scheduled,
            "gap-recovery" => RunKind::GapRecovery,
            "priority-refresh" => RunKind::PriorityRefresh,
            _ => bail!("unknown run kind: {s}"),
        })
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            _ => bail!("unknown run status: {s}"),
        })
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-asset counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTally {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
}

impl RunTally {
    /// `failed / attempted`, 0 for an empty run.
    pub fn failure_ratio(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.failed as f64 / self.attempted as f64
        }
    }

    /// Every attempted asset landed.
    pub fn is_full_coverage(&self) -> bool {
        self.attempted > 0 && self.failed == 0 && self.succeeded == self.attempted
    }
}

/// One run with parsed fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_id: i32,
    pub kind: RunKind,
    pub target_bucket: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tally: RunTally,
    pub status: RunStatus,
    pub failure_detail: Option<String>,
}

impl RunRecord {
    /// Terminal, completed and nothing failed.
    pub fn is_full_coverage(&self) -> bool {
        self.status == RunStatus::Completed && self.tally.is_full_coverage()
    }
}

impl TryFrom<RunRecordRow> for RunRecord {
    type Error = anyhow::Error;

    fn try_from(row: RunRecordRow) -> anyhow::Result<Self> {
        Ok(Self {
            run_id: row.id,
            kind: row.kind.parse()?,
            target_bucket: row.target_bucket.as_deref().map(tz::parse_ts_to_utc).transpose()?,
            started_at: tz::parse_ts_to_utc(&row.started_at)?,
            ended_at: row.ended_at.as_deref().map(tz::parse_ts_to_utc).transpose()?,
            tally: RunTally {
                attempted: row.assets_attempted.max(0) as u32,
                succeeded: row.assets_succeeded.max(0) as u32,
                failed: row.assets_failed.max(0) as u32,
            },
            status: row.terminal_status.parse()?,
            failure_detail: row.failure_detail,
        })
    }
}

/// Opens a `running` record and returns it.
pub fn open(
    conn: &mut SqliteConnection,
    kind: RunKind,
    target_bucket: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
) -> anyhow::Result<RunRecord> {
    let bucket = target_bucket.map(tz::to_rfc3339_millis);
    let started = tz::to_rfc3339_millis(started_at);
    let row: RunRecordRow = diesel::insert_into(rr::run_record)
        .values(&NewRunRecord {
            kind: kind.as_str(),
            target_bucket: bucket.as_deref(),
            started_at: &started,
        })
        .returning(RunRecordRow::as_returning())
        .get_result(conn)?;
    row.try_into()
}

/// Moves a running record to `status` with its final counters.
///
/// Returns `false` when the record was already terminal (nothing changed).
pub fn finalize(
    conn: &mut SqliteConnection,
    run_id: i32,
    status: RunStatus,
    tally: RunTally,
    ended_at: DateTime<Utc>,
    detail: Option<&str>,
) -> anyhow::Result<bool> {
    if !status.is_terminal() {
        bail!("cannot finalize run {run_id} as running");
    }
    let n = diesel::update(
        rr::run_record
            .filter(rr::id.eq(run_id))
            .filter(rr::terminal_status.eq(RunStatus::Running.as_str())),
    )
    .set((
        rr::terminal_status.eq(status.as_str()),
        rr::ended_at.eq(tz::to_rfc3339_millis(ended_at)),
        rr::assets_attempted.eq(tally.attempted as i32),
        rr::assets_succeeded.eq(tally.succeeded as i32),
        rr::assets_failed.eq(tally.failed as i32),
        rr::failure_detail.eq(detail),
    ))
    .execute(conn)?;
    Ok(n == 1)
}

/// Writes an already-terminal `gap-recovery` record announcing that `bucket`
/// will not be recovered.
pub fn record_permanent_failure(
    conn: &mut SqliteConnection,
    bucket: DateTime<Utc>,
    now: DateTime<Utc>,
    detail: &str,
) -> anyhow::Result<RunRecord> {
    let rec = open(conn, RunKind::GapRecovery, Some(bucket), now)?;
    let detail = format!("permanently failed: {detail}");
    finalize(conn, rec.run_id, RunStatus::Failed, RunTally::default(), now, Some(&detail))?;
    get(conn, rec.run_id)
}

/// Loads one record.
pub fn get(conn: &mut SqliteConnection, run_id: i32) -> anyhow::Result<RunRecord> {
    rr::run_record
        .find(run_id)
        .select(RunRecordRow::as_select())
        .first::<RunRecordRow>(conn)?
        .try_into()
}

/// Newest records first.
pub fn recent(conn: &mut SqliteConnection, limit: i64) -> anyhow::Result<Vec<RunRecord>> {
    rr::run_record
        .order(rr::id.desc())
        .limit(limit)
        .select(RunRecordRow::as_select())
        .load::<RunRecordRow>(conn)?
        .into_iter()
        .map(RunRecord::try_from)
        .collect()
}

/// Collection runs (scheduled or gap-recovery) with full coverage whose
/// bucket lies in `[from, to)`.
pub fn covered_buckets(
    conn: &mut SqliteConnection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> anyhow::Result<Vec<DateTime<Utc>>> {
    let rows: Vec<Option<String>> = full_coverage_runs()
        .filter(rr::target_bucket.ge(tz::to_rfc3339_millis(from)))
        .filter(rr::target_bucket.lt(tz::to_rfc3339_millis(to)))
        .select(rr::target_bucket)
        .distinct()
        .load(conn)?;
    rows.iter()
        .flatten()
        .map(|s| tz::parse_ts_to_utc(s))
        .collect()
}

/// Newest bucket with full coverage, if any.
pub fn last_good_bucket(conn: &mut SqliteConnection) -> anyhow::Result<Option<DateTime<Utc>>> {
    let ts: Option<String> = full_coverage_runs()
        .select(diesel::dsl::max(rr::target_bucket))
        .first(conn)?;
    ts.as_deref().map(tz::parse_ts_to_utc).transpose()
}

/// `true` if some completed run fully covered `bucket`.
pub fn is_covered(conn: &mut SqliteConnection, bucket: DateTime<Utc>) -> anyhow::Result<bool> {
    let n: i64 = full_coverage_runs()
        .filter(rr::target_bucket.eq(tz::to_rfc3339_millis(bucket)))
        .count()
        .get_result(conn)?;
    Ok(n > 0)
}

/// Records left `running` (by a crash); the collector never has more than one.
pub fn dangling(conn: &mut SqliteConnection) -> anyhow::Result<Vec<RunRecord>> {
    rr::run_record
        .filter(rr::terminal_status.eq(RunStatus::Running.as_str()))
        .select(RunRecordRow::as_select())
        .load::<RunRecordRow>(conn)?
        .into_iter()
        .map(RunRecord::try_from)
        .collect()
}

fn full_coverage_runs() -> run_record::BoxedQuery<'static, diesel::sqlite::Sqlite> {
    rr::run_record
        .filter(rr::kind.eq_any([RunKind::Scheduled.as_str(), RunKind::GapRecovery.as_str()]))
        .filter(rr::terminal_status.eq(RunStatus::Completed.as_str()))
        .filter(rr::assets_failed.eq(0))
        .filter(rr::assets_attempted.gt(0))
        .into_boxed()
}
