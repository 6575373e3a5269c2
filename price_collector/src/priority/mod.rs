//! PriorityStore: the ranked list of tracked assets.
//!
//! The ranking is fetched wholesale from the upstream's ranked-list call,
//! written to `asset_priority` in one transaction, then swapped into an
//! in-memory [`cache::PriorityCache`]. A failed refresh never blocks
//! collection: the last good ranking keeps being served, marked stale.

pub mod batching;
pub mod cache;
pub mod repo;

use std::{collections::HashSet, fmt, str::FromStr, sync::Arc};

use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};
use shared_utils::clock::Clock;
use snapshot_ingestor::{fetcher::SnapshotFetcher, retry::RetryError};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{
    db::Db,
    runs::{self, RunKind, RunStatus, RunTally},
};

pub use cache::{PriorityCache, PriorityState, Ranking};

/// Hard stop for paging through an `All` ranking.
const MAX_RANKING_PAGES: u32 = 200;

/// How many ranked assets a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionMode {
    Top100,
    Top500,
    Top1000,
    /// The entire catalog.
    All,
    /// Top `n`.
    Custom(u32),
}

impl CollectionMode {
    /// Number of ranked assets in scope; `None` for the entire catalog.
    pub fn scope(self) -> Option<usize> {
        match self {
            CollectionMode::Top100 => Some(100),
            CollectionMode::Top500 => Some(500),
            CollectionMode::Top1000 => Some(1000),
            CollectionMode::All => None,
            CollectionMode::Custom(n) => Some(n as usize),
        }
    }
}

impl fmt::Display for CollectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionMode::Top100 => f.write_str("top100"),
            CollectionMode::Top500 => f.write_str("top500"),
            CollectionMode::Top1000 => f.write_str("top1000"),
            CollectionMode::All => f.write_str("all"),
            CollectionMode::Custom(n) => write!(f, "custom:{n}"),
        }
    }
}

impl FromStr for CollectionMode {
    type Err = anyhow::Error;

    /// `top100`, `top500`, `top1000`, `all`, or `custom:N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Ok(match s.as_str() {
            "top100" => CollectionMode::Top100,
            "top500" => CollectionMode::Top500,
            "top1000" => CollectionMode::Top1000,
            "all" => CollectionMode::All,
            other => {
                let Some(n) = other.strip_prefix("custom:") else {
                    bail!("unknown collection mode: {other}");
                };
                let n: u32 = n.parse().map_err(|e| anyhow!("bad custom size {n}: {e}"))?;
                if n == 0 {
                    bail!("custom collection mode needs at least one asset");
                }
                CollectionMode::Custom(n)
            }
        })
    }
}

/// One ranked asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorityEntry {
    pub asset_id: String,
    /// Positive, lower = larger market value. Not necessarily contiguous.
    pub rank: u32,
    /// Market cap used for ranking.
    pub weight_metric: Option<f64>,
    pub symbol: Option<String>,
    pub name: Option<String>,
}

/// Refresh failures. None of them clears the cached ranking.
#[derive(Debug, Error)]
pub enum PriorityError {
    #[error("ranking fetch failed: {0}")]
    Upstream(#[from] RetryError),

    #[error("ranking source returned no assets")]
    EmptyRanking,

    #[error("priority store: {0}")]
    Store(#[source] anyhow::Error),
}

/// Refresh paging settings.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// Page size of the ranked-list call.
    pub page_size: u32,
    /// Stop paging once this many assets are known; `None` pages to the end.
    pub scope: Option<usize>,
}

/// Outcome of a successful refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshReport {
    pub run_id: i32,
    pub assets: usize,
    pub pages: u32,
}

/// Ranked asset list with durable backing and a lock-free cache.
pub struct PriorityStore {
    db: Arc<Db>,
    fetcher: Arc<SnapshotFetcher>,
    clock: Arc<dyn Clock>,
    cache: PriorityCache,
    pinned: Vec<String>,
    settings: RefreshSettings,
}

impl PriorityStore {
    pub fn new(
        db: Arc<Db>,
        fetcher: Arc<SnapshotFetcher>,
        clock: Arc<dyn Clock>,
        pinned: Vec<String>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            db,
            fetcher,
            clock,
            cache: PriorityCache::default(),
            pinned,
            settings,
        }
    }

    /// Current state (one atomic load).
    pub fn state(&self) -> Arc<PriorityState> {
        self.cache.load()
    }

    pub fn pinned(&self) -> &[String] {
        &self.pinned
    }

    /// Hydrates the cache from `asset_priority`. Returns the number of entries.
    ///
    /// An empty table leaves the cache untouched.
    pub fn load(&self) -> Result<usize, PriorityError> {
        let (entries, refreshed_at) = self
            .db
            .with_conn(repo::load_all)
            .map_err(PriorityError::Store)?;
        let n = entries.len();
        if n > 0 {
            let at = refreshed_at.unwrap_or_else(|| self.clock.now());
            self.cache.set_fresh(Ranking::new(entries, at));
            info!(assets = n, refreshed_at = %at, "loaded stored ranking");
        }
        Ok(n)
    }

    /// Replaces the ranking with a fresh one from upstream.
    ///
    /// Records a `priority-refresh` run. On failure the previous ranking stays
    /// in place and is marked stale.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RefreshReport, PriorityError> {
        let started = self.clock.now();
        let run = self
            .db
            .with_conn(|c| runs::open(c, RunKind::PriorityRefresh, None, started))
            .map_err(PriorityError::Store)?;

        let result = self.fetch_and_store().await;
        let ended = self.clock.now();
        let (status, tally, detail) = match &result {
            Ok((ranking, _)) => {
                let n = ranking.len() as u32;
                let tally = RunTally {
                    attempted: n,
                    succeeded: n,
                    failed: 0,
                };
                (RunStatus::Completed, tally, None)
            }
            Err(e) => (RunStatus::Failed, RunTally::default(), Some(e.to_string())),
        };
        if let Err(e) = self.db.with_conn(|c| {
            runs::finalize(c, run.run_id, status, tally, ended, detail.as_deref())
        }) {
            warn!(run_id = run.run_id, error = %e, "could not finalize refresh record");
        }

        match result {
            Ok((ranking, pages)) => {
                let assets = ranking.len();
                self.cache.set_fresh(ranking);
                info!(run_id = run.run_id, assets, pages, "priority ranking refreshed");
                Ok(RefreshReport {
                    run_id: run.run_id,
                    assets,
                    pages,
                })
            }
            Err(e) => {
                self.cache.mark_stale(ended);
                warn!(run_id = run.run_id, error = %e, state = self.state().label(),
                    "priority refresh failed, keeping previous ranking");
                Err(e)
            }
        }
    }

    /// Batches for a run in `mode` (see [`batching::partition`]).
    pub fn batches(&self, mode: CollectionMode, batch_size: usize) -> Vec<Vec<String>> {
        let state = self.state();
        batching::partition(state.ranking().map(|r| &**r), &self.pinned, mode, batch_size)
    }

    async fn fetch_and_store(&self) -> Result<(Ranking, u32), PriorityError> {
        let per_page = self.settings.page_size.max(1);
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut pages = 0;

        for page in 1..=MAX_RANKING_PAGES {
            let rows = self.fetcher.fetch_ranking_page_with_retry(page, per_page).await?;
            pages = page;
            let short = rows.len() < per_page as usize;
            for (i, row) in rows.into_iter().enumerate() {
                if !seen.insert(row.asset_id.clone()) {
                    continue;
                }
                // upstream may leave rank empty; fall back to list position
                let position = (page - 1) * per_page + i as u32 + 1;
                entries.push(PriorityEntry {
                    asset_id: row.asset_id,
                    rank: row.rank.filter(|r| *r > 0).unwrap_or(position),
                    weight_metric: row.weight_metric,
                    symbol: row.symbol,
                    name: row.name,
                });
            }
            if short || self.settings.scope.is_some_and(|s| entries.len() >= s) {
                break;
            }
        }

        if entries.is_empty() {
            return Err(PriorityError::EmptyRanking);
        }
        let now = self.clock.now();
        self.db
            .transaction(|c| repo::replace_all(c, &entries, now))
            .map_err(PriorityError::Store)?;
        Ok((Ranking::new(entries, now), pages))
    }
}
