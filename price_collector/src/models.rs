//! Diesel models mapping to the database schema.
//!
//! These types mirror the tables defined in the embedded migrations and in
//! [`crate::schema`]:
//! - `snapshot_minute|hour|day|week|month`: one price observation per (asset, bucket)
//! - [`crate::schema::asset_priority`]: the current ranked asset list
//! - [`crate::schema::run_record`]: one row per collection or refresh run
//! - [`crate::schema::gap_queue`]: durable backlog of buckets awaiting recovery
//!
//! Timestamps are RFC-3339 UTC strings (see [`crate::tz::to_rfc3339_millis`]);
//! the domain types in the component modules parse them back into `DateTime<Utc>`.

use diesel::prelude::*;

use crate::schema::*;

/// A row of any `snapshot_*` table.
///
/// The five tables share one column layout, so this is loaded through an
/// explicit tuple select rather than `Selectable`.
#[derive(Debug, Clone, PartialEq, Queryable)]
pub struct SnapshotRow {
    /// Upstream asset identifier (e.g. "bitcoin").
    pub asset_id: String,
    /// Aligned bucket start, RFC-3339 UTC.
    pub bucket_ts: String,
    /// Closing price; always > 0.
    pub price: f64,
    /// Market capitalisation at capture, if reported.
    pub market_cap: Option<f64>,
    /// 24h traded volume at capture, if reported.
    pub volume_24h: Option<f64>,
    /// 24h change in percent, if reported.
    pub change_24h_pct: Option<f64>,
    /// Rank when captured; NULL for unranked (pinned) assets.
    pub rank_at_capture: Option<i32>,
    /// When the upstream observed the price, RFC-3339 UTC.
    pub captured_at: String,
}

/// A row in [`crate::schema::asset_priority`].
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = asset_priority, check_for_backend(diesel::sqlite::Sqlite))]
pub struct AssetPriorityRow {
    /// Upstream asset identifier; primary key.
    pub asset_id: String,
    /// Positive rank, lower = larger market value.
    pub rank: i32,
    /// Market cap used for ranking.
    pub weight_metric: Option<f64>,
    /// Ticker for display.
    pub symbol: Option<String>,
    /// Human-readable name.
    pub name: Option<String>,
    /// When the refresh that wrote this row ran.
    pub last_refreshed: String,
}

/// A row in [`crate::schema::run_record`].
#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = run_record, check_for_backend(diesel::sqlite::Sqlite))]
pub struct RunRecordRow {
    /// Database primary key, assigned on insert.
    pub id: i32,
    /// `scheduled`, `gap-recovery` or `priority-refresh`.
    pub kind: String,
    /// Minute bucket the run covers; NULL for priority refreshes.
    pub target_bucket: Option<String>,
    pub started_at: String,
    /// NULL while the run is in flight.
    pub ended_at: Option<String>,
    pub assets_attempted: i32,
    pub assets_succeeded: i32,
    pub assets_failed: i32,
    /// `running`, `completed`, `failed` or `cancelled`.
    pub terminal_status: String,
    pub failure_detail: Option<String>,
}

/// Insertable form of [`RunRecordRow`]; counters and status take their defaults.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = run_record)]
pub struct NewRunRecord<'a> {
    pub kind: &'a str,
    pub target_bucket: Option<&'a str>,
    pub started_at: &'a str,
}

/// A row in [`crate::schema::gap_queue`].
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = gap_queue, check_for_backend(diesel::sqlite::Sqlite))]
pub struct GapQueueRow {
    /// Minute bucket awaiting recovery; primary key.
    pub target_bucket: String,
    /// `missed`, `overlap` or `partial-failure`.
    pub reason: String,
    pub attempts: i32,
    pub next_retry_at: String,
    /// `queued` or `failed` (permanent).
    pub state: String,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
