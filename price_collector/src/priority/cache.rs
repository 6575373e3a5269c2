//! Lock-free, read-mostly holder of the current ranking.
//!
//! Readers call [`PriorityCache::load`], one atomic load with no lock
//! contention. The refresh path swaps a whole new state in; readers see
//! either the old or the new state, never a mix.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::PriorityEntry;

/// One complete ranked list, sorted by ascending rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranking {
    entries: Vec<PriorityEntry>,
    refreshed_at: DateTime<Utc>,
    #[serde(skip)]
    index: HashMap<String, u32>,
}

impl Ranking {
    /// Sorts `entries` by (rank, asset_id) and indexes them.
    pub fn new(mut entries: Vec<PriorityEntry>, refreshed_at: DateTime<Utc>) -> Self {
        entries.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.asset_id.cmp(&b.asset_id)));
        let index = entries
            .iter()
            .map(|e| (e.asset_id.clone(), e.rank))
            .collect();
        Self {
            entries,
            refreshed_at,
            index,
        }
    }

    pub fn entries(&self) -> &[PriorityEntry] {
        &self.entries
    }

    pub fn refreshed_at(&self) -> DateTime<Utc> {
        self.refreshed_at
    }

    pub fn rank_of(&self, asset_id: &str) -> Option<u32> {
        self.index.get(asset_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the collector currently knows about priorities.
#[derive(Debug, Clone, PartialEq)]
pub enum PriorityState {
    /// Nothing loaded or fetched yet.
    Empty,
    /// The last refresh succeeded.
    Fresh(Arc<Ranking>),
    /// A refresh failed at `since`; the ranking is the last good one.
    Stale(Arc<Ranking>, DateTime<Utc>),
}

impl PriorityState {
    pub fn ranking(&self) -> Option<&Arc<Ranking>> {
        match self {
            PriorityState::Empty => None,
            PriorityState::Fresh(r) | PriorityState::Stale(r, _) => Some(r),
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, PriorityState::Stale(..))
    }

    /// Short label for logs and the health report.
    pub fn label(&self) -> &'static str {
        match self {
            PriorityState::Empty => "empty",
            PriorityState::Fresh(_) => "fresh",
            PriorityState::Stale(..) => "stale",
        }
    }

    /// Age of the ranking at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.ranking().map(|r| now - r.refreshed_at())
    }
}

/// Atomically swapped [`PriorityState`].
pub struct PriorityCache {
    state: ArcSwap<PriorityState>,
}

impl Default for PriorityCache {
    fn default() -> Self {
        Self {
            state: ArcSwap::from_pointee(PriorityState::Empty),
        }
    }
}

impl PriorityCache {
    pub fn load(&self) -> Arc<PriorityState> {
        self.state.load_full()
    }

    pub fn set_fresh(&self, ranking: Ranking) {
        self.state.store(Arc::new(PriorityState::Fresh(Arc::new(ranking))));
    }

    /// Demotes a fresh ranking to stale. An already stale ranking keeps its
    /// original `since`; an empty cache stays empty.
    pub fn mark_stale(&self, since: DateTime<Utc>) {
        self.state.rcu(|cur| match &**cur {
            PriorityState::Fresh(r) => Arc::new(PriorityState::Stale(r.clone(), since)),
            _ => cur.clone(),
        });
    }

    pub fn clear(&self) {
        self.state.store(Arc::new(PriorityState::Empty));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: &str, rank: u32) -> PriorityEntry {
        PriorityEntry {
            asset_id: id.into(),
            rank,
            weight_metric: None,
            symbol: None,
            name: None,
        }
    }

    #[test]
    fn fresh_then_stale_keeps_serving_data() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::hours(1);
        let t2 = t1 + chrono::Duration::hours(1);
        let cache = PriorityCache::default();
        assert_eq!(*cache.load(), PriorityState::Empty);

        cache.mark_stale(t1);
        assert_eq!(*cache.load(), PriorityState::Empty, "nothing to demote");

        cache.set_fresh(Ranking::new(vec![entry("b", 2), entry("a", 1)], t0));
        let before = cache.load();
        cache.mark_stale(t1);
        cache.mark_stale(t2);

        let now = cache.load();
        assert!(now.is_stale());
        assert!(matches!(&*now, PriorityState::Stale(_, since) if *since == t1));
        assert_eq!(now.ranking(), before.ranking());
        assert_eq!(now.ranking().unwrap().entries()[0].asset_id, "a");
        assert_eq!(now.age(t2), Some(chrono::Duration::hours(2)));
    }
}
