use chrono::Duration;
use diesel::prelude::*;
use diesel::sql_query;
use price_collector::db::{Db, connection::connect_sqlite, migrate};
use price_collector::granularity::Granularity;
use price_collector::runs::{self, RunKind, RunStatus, RunTally};
use price_collector::snapshots::{self, SnapshotRecord};
use snapshot_ingestor::models::snapshot::SecondaryMetrics;

mod common;
use common::at;

fn minute_row(asset: &str, price: f64, captured_secs: u32) -> SnapshotRecord {
    SnapshotRecord {
        asset_id: asset.into(),
        granularity: Granularity::Minute,
        bucket: at(10, 5, 0),
        price,
        metrics: SecondaryMetrics {
            market_cap: Some(price * 1e6),
            ..Default::default()
        },
        rank_at_capture: Some(1),
        captured_at: at(10, 5, captured_secs),
    }
}

#[test]
fn sqlite_connection_applies_pragmas() {
    let (db, mut conn) = common::setup_db();
    common::assert_sqlite_pragmas(&mut conn);

    let mut second = connect_sqlite(&db.path).expect("connect second");
    common::assert_sqlite_pragmas(&mut second);
}

#[test]
fn migrations_apply_once() {
    let (_db, mut conn) = common::setup_db();
    assert_eq!(migrate::run_on(&mut conn).unwrap(), 0, "already migrated");
}

#[test]
fn read_only_open_neither_creates_nor_migrates() {
    let (_dir, path) = common::temp_db_path();
    assert!(Db::open_existing(&path).is_err());
    assert!(!std::path::Path::new(&path).exists(), "no empty file left behind");

    // a bare database without the schema stays bare
    drop(connect_sqlite(&path).expect("create bare file"));
    let db = Db::open_existing(&path).expect("open existing");
    let tables: i64 = db
        .with_conn(|c| {
            Ok(diesel::select(diesel::dsl::sql::<diesel::sql_types::BigInt>(
                "(SELECT COUNT(*) FROM sqlite_master WHERE type = 'table')",
            ))
            .get_result(c)?)
        })
        .unwrap();
    assert_eq!(tables, 0);
}

#[test]
fn writing_the_same_snapshot_twice_keeps_one_row_with_the_latest_values() {
    let (_db, mut conn) = common::setup_db();

    snapshots::upsert(&mut conn, Granularity::Minute, &[minute_row("bitcoin", 100.0, 10)]).unwrap();
    snapshots::upsert(&mut conn, Granularity::Minute, &[minute_row("bitcoin", 101.5, 40)]).unwrap();

    assert_eq!(snapshots::count(&mut conn, Granularity::Minute).unwrap(), 1);
    let rows = snapshots::range(
        &mut conn,
        Granularity::Minute,
        "bitcoin",
        at(10, 0, 0),
        at(11, 0, 0),
    )
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].price, 101.5);
    assert_eq!(rows[0].metrics.market_cap, Some(101.5e6));
    assert_eq!(rows[0].captured_at, at(10, 5, 40));
    assert_eq!(rows[0].bucket, at(10, 5, 0));
}

#[test]
fn non_positive_prices_are_rejected_by_the_table() {
    let (_db, mut conn) = common::setup_db();
    let err = snapshots::upsert(&mut conn, Granularity::Minute, &[minute_row("bitcoin", 0.0, 0)]);
    assert!(err.is_err());
    assert_eq!(snapshots::count(&mut conn, Granularity::Minute).unwrap(), 0);
}

#[test]
fn run_records_are_finalized_exactly_once() {
    let (_db, mut conn) = common::setup_db();
    let open = runs::open(&mut conn, RunKind::Scheduled, Some(at(10, 0, 0)), at(10, 0, 1)).unwrap();
    assert_eq!(open.status, RunStatus::Running);
    assert_eq!(runs::dangling(&mut conn).unwrap().len(), 1);

    let tally = RunTally {
        attempted: 3,
        succeeded: 3,
        failed: 0,
    };
    assert!(runs::finalize(&mut conn, open.run_id, RunStatus::Completed, tally, at(10, 0, 9), None).unwrap());
    assert!(
        !runs::finalize(&mut conn, open.run_id, RunStatus::Failed, RunTally::default(), at(10, 0, 9), Some("late"))
            .unwrap(),
        "terminal records do not change"
    );

    let stored = runs::get(&mut conn, open.run_id).unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.tally, tally);
    assert!(stored.is_full_coverage());
    assert!(runs::dangling(&mut conn).unwrap().is_empty());
    assert!(runs::is_covered(&mut conn, at(10, 0, 0)).unwrap());
    assert_eq!(runs::last_good_bucket(&mut conn).unwrap(), Some(at(10, 0, 0)));

    // the trigger guards terminal rows against any other writer
    let raw = sql_query("UPDATE run_record SET terminal_status = 'failed'").execute(&mut conn);
    assert!(raw.is_err());
}

#[test]
fn partial_runs_do_not_count_as_coverage() {
    let (_db, mut conn) = common::setup_db();
    let run = runs::open(&mut conn, RunKind::Scheduled, Some(at(10, 1, 0)), at(10, 1, 0)).unwrap();
    let tally = RunTally {
        attempted: 100,
        succeeded: 99,
        failed: 1,
    };
    runs::finalize(&mut conn, run.run_id, RunStatus::Completed, tally, at(10, 1, 5), None).unwrap();

    assert!(!runs::is_covered(&mut conn, at(10, 1, 0)).unwrap());
    assert!(
        runs::covered_buckets(&mut conn, at(10, 0, 0), at(10, 0, 0) + Duration::hours(1))
            .unwrap()
            .is_empty()
    );
}
