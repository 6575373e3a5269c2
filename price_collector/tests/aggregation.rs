use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use price_collector::aggregation::{AggregationCascade, Retention};
use price_collector::db::Db;
use price_collector::granularity::Granularity;
use price_collector::snapshots::{self, SnapshotRecord};
use snapshot_ingestor::models::snapshot::SecondaryMetrics;

mod common;
use common::at;

fn row(g: Granularity, asset: &str, bucket: chrono::DateTime<Utc>, price: f64) -> SnapshotRecord {
    SnapshotRecord {
        asset_id: asset.into(),
        granularity: g,
        bucket,
        price,
        metrics: SecondaryMetrics::default(),
        rank_at_capture: Some(1),
        captured_at: bucket,
    }
}

fn setup(retention: Retention) -> (common::TestDb, Arc<Db>, AggregationCascade) {
    let (file, conn) = common::setup_db();
    let db = Arc::new(Db::from_connection(conn));
    let cascade = AggregationCascade::new(db.clone(), retention);
    (file, db, cascade)
}

#[test]
fn hourly_bucket_takes_the_last_minute_close() {
    let (_f, db, cascade) = setup(Retention::default());
    db.transaction(|c| {
        snapshots::upsert(
            c,
            Granularity::Minute,
            &[
                row(Granularity::Minute, "bitcoin", at(10, 5, 0), 100.0),
                row(Granularity::Minute, "bitcoin", at(10, 55, 0), 110.0),
                row(Granularity::Minute, "bitcoin", at(11, 0, 0), 120.0),
            ],
        )
    })
    .unwrap();

    let now = at(11, 0, 5);
    let report = cascade.cascade(now).unwrap();
    assert_eq!(report.hour, 1);

    let hours = db
        .with_conn(|c| snapshots::range(c, Granularity::Hour, "bitcoin", at(0, 0, 0), at(23, 0, 0)))
        .unwrap();
    assert_eq!(hours.len(), 1);
    assert_eq!(hours[0].bucket, at(10, 0, 0));
    assert_eq!(hours[0].price, 110.0);
    assert_eq!(hours[0].granularity, Granularity::Hour);
}

#[test]
fn rolling_up_twice_is_harmless() {
    let (_f, db, cascade) = setup(Retention::default());
    db.with_conn(|c| {
        snapshots::upsert(c, Granularity::Minute, &[row(Granularity::Minute, "eth", at(10, 30, 0), 5.0)])
    })
    .unwrap();
    let now = at(11, 0, 1);
    cascade.roll_up(Granularity::Hour, at(10, 0, 0), now).unwrap();
    cascade.roll_up(Granularity::Hour, at(10, 0, 0), now).unwrap();
    assert_eq!(db.with_conn(|c| snapshots::count(c, Granularity::Hour)).unwrap(), 1);
}

#[test]
fn day_closes_from_hourly_rows() {
    let (_f, db, cascade) = setup(Retention::default());
    db.with_conn(|c| {
        snapshots::upsert(
            c,
            Granularity::Hour,
            &[
                row(Granularity::Hour, "bitcoin", at(8, 0, 0), 50.0),
                row(Granularity::Hour, "bitcoin", at(23, 0, 0), 60.0),
            ],
        )
    })
    .unwrap();

    let now = Utc.with_ymd_and_hms(2025, 7, 2, 0, 0, 5).unwrap();
    let report = cascade.cascade(now).unwrap();
    assert_eq!(report.day, 1);

    let days = db
        .with_conn(|c| {
            snapshots::range(c, Granularity::Day, "bitcoin", at(0, 0, 0), now + Duration::days(1))
        })
        .unwrap();
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].bucket, at(0, 0, 0));
    assert_eq!(days[0].price, 60.0);
}

#[test]
fn hourly_sweep_drops_only_rows_past_the_horizon() {
    let (_f, db, cascade) = setup(Retention::default());
    let now = Utc.with_ymd_and_hms(2025, 7, 3, 12, 0, 0).unwrap();
    let buckets = [30, 25, 23, 1].map(|h| now - Duration::hours(h));
    let rows: Vec<_> = buckets
        .iter()
        .map(|b| row(Granularity::Hour, "bitcoin", *b, 10.0))
        .collect();
    db.with_conn(|c| snapshots::upsert(c, Granularity::Hour, &rows)).unwrap();

    let deleted = cascade.retention_sweep(Granularity::Hour, now).unwrap();
    assert_eq!(deleted, 2);

    let left = db
        .with_conn(|c| {
            snapshots::range(c, Granularity::Hour, "bitcoin", now - Duration::days(7), now)
        })
        .unwrap();
    let left: Vec<_> = left.iter().map(|r| r.bucket).collect();
    assert_eq!(left, vec![buckets[2], buckets[3]]);
    assert!(left.iter().all(|b| *b >= now - Duration::hours(24)));
}

#[test]
fn monthly_rows_are_never_swept() {
    let (_f, db, cascade) = setup(Retention::default());
    let old = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
    db.with_conn(|c| {
        snapshots::upsert(c, Granularity::Month, &[row(Granularity::Month, "bitcoin", old, 300.0)])
    })
    .unwrap();
    assert_eq!(cascade.retention_sweep(Granularity::Month, at(12, 0, 0)).unwrap(), 0);
    assert_eq!(db.with_conn(|c| snapshots::count(c, Granularity::Month)).unwrap(), 1);
}
