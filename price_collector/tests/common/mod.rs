#![allow(dead_code)]

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use diesel::QueryableByName;
use diesel::prelude::*;
use diesel::sql_types::{Integer, Text};
use indexmap::IndexMap;
use price_collector::{
    app::Collector,
    config::load_config_str,
    db::{Db, connection, migrate},
};
use shared_utils::clock::ManualClock;
use snapshot_ingestor::{
    models::{
        ranking::RankedAsset,
        snapshot::{RawQuote, SecondaryMetrics},
    },
    providers::{AuthSnafu, ProviderError, ServerSnafu, SnapshotProvider},
};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

#[derive(QueryableByName)]
struct JournalMode {
    #[diesel(sql_type = Text)]
    journal_mode: String,
}
#[derive(QueryableByName)]
struct ForeignKeys {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}
#[derive(QueryableByName)]
struct BusyTimeout {
    #[diesel(sql_type = Integer, column_name = "timeout")]
    busy_timeout: i32,
}

pub struct TestDb {
    _dir: TempDir,    // keep alive for the life of the test
    pub path: String, // <tmpdir>/test.db
}

pub fn temp_db_path() -> (TempDir, String) {
    let dir = TempDir::new().expect("tempdir");
    let mut p = PathBuf::from(dir.path());
    p.push("test.db");
    let path = p.to_string_lossy().to_string();
    (dir, path)
}

/// Migrated temp database plus a raw connection to it.
pub fn setup_db() -> (TestDb, SqliteConnection) {
    let (dir, path) = temp_db_path();
    migrate::run_sqlite(&path).expect("migrations");
    let conn = connection::connect_sqlite(&path).expect("connect");
    (TestDb { _dir: dir, path }, conn)
}

pub fn assert_sqlite_pragmas(conn: &mut SqliteConnection) {
    use diesel::sql_query;

    let jm: JournalMode = sql_query("PRAGMA journal_mode;").get_result(conn).unwrap();
    assert_eq!(jm.journal_mode.to_lowercase(), "wal");

    let fk: ForeignKeys = sql_query("PRAGMA foreign_keys;").get_result(conn).unwrap();
    assert_eq!(fk.foreign_keys, 1);

    let bt: BusyTimeout = sql_query("PRAGMA busy_timeout;").get_result(conn).unwrap();
    assert_eq!(bt.busy_timeout, 5000);
}

pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 1, h, m, s).unwrap()
}

pub fn ids(xs: &[&str]) -> Vec<String> {
    xs.iter().map(|s| s.to_string()).collect()
}

/// In-memory upstream with a ranking of `a1..=aN` and switchable failures.
pub struct MockProvider {
    universe: u32,
    price: Mutex<f64>,
    missing: Mutex<HashSet<String>>,
    auth_failure: AtomicBool,
    ranking_down: AtomicBool,
    hold_quotes: AtomicBool,
    gate: Semaphore,
    /// Signalled whenever a quote call starts.
    pub entered: Notify,
    pub quote_calls: AtomicU32,
    pub ranking_calls: AtomicU32,
}

impl MockProvider {
    pub fn new(universe: u32) -> Self {
        Self {
            universe,
            price: Mutex::new(100.0),
            missing: Mutex::new(HashSet::new()),
            auth_failure: AtomicBool::new(false),
            ranking_down: AtomicBool::new(false),
            hold_quotes: AtomicBool::new(false),
            gate: Semaphore::new(0),
            entered: Notify::new(),
            quote_calls: AtomicU32::new(0),
            ranking_calls: AtomicU32::new(0),
        }
    }

    pub fn set_price(&self, price: f64) {
        *self.price.lock().unwrap() = price;
    }

    /// IDs left out of every quote response from now on.
    pub fn set_missing(&self, xs: &[&str]) {
        *self.missing.lock().unwrap() = xs.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_auth_failure(&self, on: bool) {
        self.auth_failure.store(on, Ordering::SeqCst);
    }

    pub fn set_ranking_down(&self, on: bool) {
        self.ranking_down.store(on, Ordering::SeqCst);
    }

    /// Parks quote calls until [`Self::release`].
    pub fn hold(&self) {
        self.hold_quotes.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.hold_quotes.store(false, Ordering::SeqCst);
        self.gate.add_permits(1_000);
    }

    pub fn quote_calls(&self) -> u32 {
        self.quote_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotProvider for MockProvider {
    async fn fetch_ranking_page(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RankedAsset>, ProviderError> {
        self.ranking_calls.fetch_add(1, Ordering::SeqCst);
        if self.ranking_down.load(Ordering::SeqCst) {
            return Err(ServerSnafu {
                status: 503u16,
                message: "ranking unavailable",
            }
            .build());
        }
        let start = (page - 1) * per_page + 1;
        let end = (start + per_page).min(self.universe + 1);
        Ok((start..end)
            .map(|i| RankedAsset {
                asset_id: format!("a{i}"),
                symbol: Some(format!("A{i}")),
                name: None,
                rank: Some(i),
                weight_metric: Some(1e12 / f64::from(i)),
            })
            .collect())
    }

    async fn fetch_quotes(
        &self,
        asset_ids: &[String],
    ) -> Result<IndexMap<String, RawQuote>, ProviderError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if self.hold_quotes.load(Ordering::SeqCst) {
            let _permit = self.gate.acquire().await.expect("gate open");
        }
        if self.auth_failure.load(Ordering::SeqCst) {
            return Err(AuthSnafu {
                status: 401u16,
                message: "invalid key",
            }
            .build());
        }
        let price = *self.price.lock().unwrap();
        let missing = self.missing.lock().unwrap().clone();
        Ok(asset_ids
            .iter()
            .filter(|id| !missing.contains(*id))
            .map(|id| {
                (
                    id.clone(),
                    RawQuote {
                        price: Some(price),
                        metrics: SecondaryMetrics {
                            market_cap: Some(1e9),
                            volume_24h: Some(1e6),
                            change_24h_pct: Some(1.5),
                        },
                        last_updated_at: None,
                    },
                )
            })
            .collect())
    }
}

/// Upstream and retry settings fast enough for tests.
const FAST_UPSTREAM: &str = r#"
[upstream]
calls_per_minute = 6000
max_ids_per_call = 50
ranking_page_size = 3

[retry]
max_attempts = 2
base_delay_ms = 1
max_delay_ms = 5
"#;

/// A fully wired collector over a temp database, a mock upstream and a manual clock.
pub struct Harness {
    pub db_file: TestDb,
    pub clock: Arc<ManualClock>,
    pub provider: Arc<MockProvider>,
    pub app: Collector,
}

impl Harness {
    pub fn db(&self) -> &Db {
        &self.app.db
    }
}

/// `top_level` holds top-level config keys; upstream/retry tables are appended.
pub fn harness(top_level: &str, provider: MockProvider, clock: ManualClock) -> Harness {
    let (dir, path) = temp_db_path();
    let cfg = load_config_str(&format!(
        "database_url = {path:?}\n{top_level}\n{FAST_UPSTREAM}"
    ))
    .expect("config");
    let db = Arc::new(Db::open(&path).expect("open db"));
    let clock = Arc::new(clock);
    let provider = Arc::new(provider);
    let app = Collector::build(&cfg, db, provider.clone(), clock.clone()).expect("build collector");
    Harness {
        db_file: TestDb { _dir: dir, path },
        clock,
        provider,
        app,
    }
}
