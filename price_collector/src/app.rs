//! Wires the collector's components from a [`CollectorConfig`].

use std::sync::Arc;

use anyhow::Context;
use shared_utils::clock::{Clock, SystemClock};
use snapshot_ingestor::{
    fetcher::SnapshotFetcher,
    providers::{SnapshotProvider, coingecko::CoinGeckoProvider},
    rate_limit::RateLimiter,
};

use crate::{
    aggregation::AggregationCascade,
    collection::CollectionRunner,
    config::CollectorConfig,
    db::Db,
    gaps::GapRecoveryQueue,
    priority::PriorityStore,
    scheduler::Scheduler,
};

/// Every long-lived component, sharing one database handle, one rate limiter
/// and one clock.
pub struct Collector {
    pub db: Arc<Db>,
    pub fetcher: Arc<SnapshotFetcher>,
    pub priorities: Arc<PriorityStore>,
    pub runner: Arc<CollectionRunner>,
    pub cascade: Arc<AggregationCascade>,
    pub queue: Arc<GapRecoveryQueue>,
    pub scheduler: Arc<Scheduler>,
    pub clock: Arc<dyn Clock>,
}

impl Collector {
    /// Opens (and migrates) the configured database and talks to the
    /// configured REST upstream on the system clock.
    pub fn from_config(cfg: &CollectorConfig) -> anyhow::Result<Self> {
        let db = Db::open(&cfg.database_url)
            .with_context(|| format!("opening {}", cfg.database_url))?;
        let provider = cfg
            .upstream_config()
            .and_then(CoinGeckoProvider::new)
            .context("building upstream client")?;
        Self::build(cfg, Arc::new(db), Arc::new(provider), Arc::new(SystemClock))
    }

    /// Assembles the components around an already open database.
    pub fn build(
        cfg: &CollectorConfig,
        db: Arc<Db>,
        provider: Arc<dyn SnapshotProvider>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let limiter = Arc::new(RateLimiter::per_minute(cfg.calls_per_minute()?));
        let fetcher = Arc::new(SnapshotFetcher::new(
            provider,
            limiter,
            cfg.retry_policy(),
            clock.clone(),
            cfg.fetcher_config(),
        ));
        let priorities = Arc::new(PriorityStore::new(
            db.clone(),
            fetcher.clone(),
            clock.clone(),
            cfg.pinned_assets.clone(),
            cfg.refresh_settings(),
        ));
        let runner = Arc::new(CollectionRunner::new(
            db.clone(),
            fetcher.clone(),
            priorities.clone(),
            clock.clone(),
            cfg.collection_settings(),
        ));
        let retention = cfg.retention();
        let cascade = Arc::new(AggregationCascade::new(db.clone(), retention));
        let queue = Arc::new(GapRecoveryQueue::new(
            db.clone(),
            clock.clone(),
            cfg.drain_settings(),
            retention.minute,
        ));
        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            runner.clone(),
            priorities.clone(),
            cascade.clone(),
            queue.clone(),
            clock.clone(),
            cfg.scheduler_settings()?,
        ));

        Ok(Self {
            db,
            fetcher,
            priorities,
            runner,
            cascade,
            queue,
            scheduler,
            clock,
        })
    }
}
