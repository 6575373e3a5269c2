//! Snapshot repository over the five `snapshot_*` tables.
//!
//! Every write is an upsert keyed by (asset_id, bucket_ts): writing the same
//! identity twice leaves one row holding the later values.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use snapshot_ingestor::models::snapshot::{PriceSnapshot, SecondaryMetrics};

use crate::{granularity::Granularity, models::SnapshotRow, tz};

/// Binds `$t` to the schema module of `$g`'s table and evaluates `$body`.
macro_rules! with_snapshot_table {
    ($g:expr, $t:ident => $body:expr) => {
        match $g {
            Granularity::Minute => {
                use crate::schema::snapshot_minute as $t;
                $body
            }
            Granularity::Hour => {
                use crate::schema::snapshot_hour as $t;
                $body
            }
            Granularity::Day => {
                use crate::schema::snapshot_day as $t;
                $body
            }
            Granularity::Week => {
                use crate::schema::snapshot_week as $t;
                $body
            }
            Granularity::Month => {
                use crate::schema::snapshot_month as $t;
                $body
            }
        }
    };
}

/// A stored observation with parsed timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRecord {
    pub asset_id: String,
    pub granularity: Granularity,
    pub bucket: DateTime<Utc>,
    pub price: f64,
    pub metrics: SecondaryMetrics,
    pub rank_at_capture: Option<u32>,
    pub captured_at: DateTime<Utc>,
}

impl SnapshotRecord {
    /// Places a fetched snapshot into `bucket` of `granularity`.
    pub fn from_snapshot(
        snap: &PriceSnapshot,
        granularity: Granularity,
        bucket: DateTime<Utc>,
        rank_at_capture: Option<u32>,
    ) -> Self {
        Self {
            asset_id: snap.asset_id.clone(),
            granularity,
            bucket,
            price: snap.price,
            metrics: snap.metrics,
            rank_at_capture,
            captured_at: snap.captured_at,
        }
    }

    fn from_row(row: SnapshotRow, granularity: Granularity) -> anyhow::Result<Self> {
        Ok(Self {
            bucket: tz::parse_ts_to_utc(&row.bucket_ts)?,
            captured_at: tz::parse_ts_to_utc(&row.captured_at)?,
            asset_id: row.asset_id,
            granularity,
            price: row.price,
            metrics: SecondaryMetrics {
                market_cap: row.market_cap,
                volume_24h: row.volume_24h,
                change_24h_pct: row.change_24h_pct,
            },
            rank_at_capture: row.rank_at_capture.and_then(|r| u32::try_from(r).ok()),
        })
    }
}

/// Upserts `records` into the table of `g`. Returns rows written.
///
/// Run this inside a transaction when the batch must land atomically.
pub fn upsert(
    conn: &mut SqliteConnection,
    g: Granularity,
    records: &[SnapshotRecord],
) -> anyhow::Result<usize> {
    let mut written = 0;
    for r in records {
        let bucket_ts = tz::to_rfc3339_millis(r.bucket);
        let captured_at = tz::to_rfc3339_millis(r.captured_at);
        let rank = r.rank_at_capture.and_then(|v| i32::try_from(v).ok());
        written += with_snapshot_table!(g, t => {
            diesel::insert_into(t::table)
                .values((
                    t::asset_id.eq(&r.asset_id),
                    t::bucket_ts.eq(&bucket_ts),
                    t::price.eq(r.price),
                    t::market_cap.eq(r.metrics.market_cap),
                    t::volume_24h.eq(r.metrics.volume_24h),
                    t::change_24h_pct.eq(r.metrics.change_24h_pct),
                    t::rank_at_capture.eq(rank),
                    t::captured_at.eq(&captured_at),
                ))
                .on_conflict((t::asset_id, t::bucket_ts))
                .do_update()
                .set((
                    t::price.eq(r.price),
                    t::market_cap.eq(r.metrics.market_cap),
                    t::volume_24h.eq(r.metrics.volume_24h),
                    t::change_24h_pct.eq(r.metrics.change_24h_pct),
                    t::rank_at_capture.eq(rank),
                    t::captured_at.eq(&captured_at),
                ))
                .execute(conn)?
        });
    }
    Ok(written)
}

/// Rows of one asset with `from <= bucket < to`, oldest first.
pub fn range(
    conn: &mut SqliteConnection,
    g: Granularity,
    asset_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> anyhow::Result<Vec<SnapshotRecord>> {
    let from = tz::to_rfc3339_millis(from);
    let to = tz::to_rfc3339_millis(to);
    let rows: Vec<SnapshotRow> = with_snapshot_table!(g, t => {
        t::table
            .filter(t::asset_id.eq(asset_id))
            .filter(t::bucket_ts.ge(&from))
            .filter(t::bucket_ts.lt(&to))
            .order(t::bucket_ts.asc())
            .select((
                t::asset_id,
                t::bucket_ts,
                t::price,
                t::market_cap,
                t::volume_24h,
                t::change_24h_pct,
                t::rank_at_capture,
                t::captured_at,
            ))
            .load(conn)?
    });
    rows.into_iter()
        .map(|r| SnapshotRecord::from_row(r, g))
        .collect()
}

/// Latest row per asset with `from <= bucket < to` (closing values).
///
/// Assets are returned in ascending asset_id order.
pub fn latest_per_asset(
    conn: &mut SqliteConnection,
    g: Granularity,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> anyhow::Result<Vec<SnapshotRecord>> {
    let from = tz::to_rfc3339_millis(from);
    let to = tz::to_rfc3339_millis(to);
    let rows: Vec<SnapshotRow> = with_snapshot_table!(g, t => {
        t::table
            .filter(t::bucket_ts.ge(&from))
            .filter(t::bucket_ts.lt(&to))
            .order((t::asset_id.asc(), t::bucket_ts.desc()))
            .select((
                t::asset_id,
                t::bucket_ts,
                t::price,
                t::market_cap,
                t::volume_24h,
                t::change_24h_pct,
                t::rank_at_capture,
                t::captured_at,
            ))
            .load(conn)?
    });

    let mut out: Vec<SnapshotRecord> = Vec::new();
    for row in rows {
        // rows are grouped by asset with the newest bucket first
        if out.last().is_some_and(|prev| prev.asset_id == row.asset_id) {
            continue;
        }
        out.push(SnapshotRecord::from_row(row, g)?);
    }
    Ok(out)
}

/// Deletes rows with `bucket < cutoff`. Returns rows deleted.
pub fn delete_older_than(
    conn: &mut SqliteConnection,
    g: Granularity,
    cutoff: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let cutoff = tz::to_rfc3339_millis(cutoff);
    let n = with_snapshot_table!(g, t => {
        diesel::delete(t::table.filter(t::bucket_ts.lt(&cutoff))).execute(conn)?
    });
    Ok(n)
}

/// Row count of the table of `g`.
pub fn count(conn: &mut SqliteConnection, g: Granularity) -> anyhow::Result<i64> {
    let n = with_snapshot_table!(g, t => { t::table.count().get_result::<i64>(conn)? });
    Ok(n)
}

/// Oldest bucket in the table of `g`, if any.
pub fn oldest_bucket(
    conn: &mut SqliteConnection,
    g: Granularity,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    let ts: Option<String> = with_snapshot_table!(g, t => {
        t::table.select(diesel::dsl::min(t::bucket_ts)).first(conn)?
    });
    ts.as_deref().map(tz::parse_ts_to_utc).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connection::connect_sqlite, migrate};
    use chrono::TimeZone;

    fn conn() -> (tempfile::NamedTempFile, SqliteConnection) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_string_lossy().to_string();
        migrate::run_sqlite(&path).unwrap();
        (tmp, connect_sqlite(&path).unwrap())
    }

    fn rec(id: &str, g: Granularity, bucket: DateTime<Utc>, price: f64) -> SnapshotRecord {
        SnapshotRecord {
            asset_id: id.into(),
            granularity: g,
            bucket,
            price,
            metrics: SecondaryMetrics::default(),
            rank_at_capture: Some(1),
            captured_at: bucket,
        }
    }

    #[test]
    fn every_granularity_has_its_own_table() {
        let (_tmp, mut c) = conn();
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        for g in Granularity::ALL {
            upsert(&mut c, g, &[rec("btc", g, t, 1.0)]).unwrap();
        }
        for g in Granularity::ALL {
            assert_eq!(count(&mut c, g).unwrap(), 1, "{g}");
        }
    }

    #[test]
    fn latest_per_asset_picks_newest_bucket() {
        let (_tmp, mut c) = conn();
        let g = Granularity::Minute;
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let rows: Vec<_> = (0..3)
            .flat_map(|i| {
                let b = t0 + chrono::Duration::minutes(i);
                [rec("a", g, b, 10.0 + i as f64), rec("b", g, b, 20.0 + i as f64)]
            })
            .collect();
        upsert(&mut c, g, &rows).unwrap();

        let latest =
            latest_per_asset(&mut c, g, t0, t0 + chrono::Duration::minutes(2)).unwrap();
        let got: Vec<_> = latest.iter().map(|r| (r.asset_id.as_str(), r.price)).collect();
        assert_eq!(got, [("a", 11.0), ("b", 21.0)]);
        assert_eq!(oldest_bucket(&mut c, g).unwrap(), Some(t0));
    }
}
