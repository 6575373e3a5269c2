//! Partitioning of the ranking into upstream-sized batches.

use std::collections::HashSet;

use super::{CollectionMode, cache::Ranking};

/// Splits the assets a run should collect into groups of at most `batch_size`.
///
/// Order: pinned assets first (as given, duplicates dropped), then the top
/// `mode.scope()` ranked assets by ascending rank, skipping pinned ones.
/// Pinned assets land in the first batch as long as there are no more of
/// them than `batch_size` (config validation enforces this). They are
/// included even when unranked or ranked outside the scope.
pub fn partition(
    ranking: Option<&Ranking>,
    pinned: &[String],
    mode: CollectionMode,
    batch_size: usize,
) -> Vec<Vec<String>> {
    let batch_size = batch_size.max(1);
    let mut seen: HashSet<&str> = HashSet::new();
    let mut ordered: Vec<String> = Vec::new();

    for id in pinned {
        if seen.insert(id.as_str()) {
            ordered.push(id.clone());
        }
    }

    if let Some(ranking) = ranking {
        let scope = mode.scope().unwrap_or(usize::MAX);
        for e in ranking.entries().iter().take(scope) {
            if seen.insert(e.asset_id.as_str()) {
                ordered.push(e.asset_id.clone());
            }
        }
    }

    ordered.chunks(batch_size).map(<[String]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::PriorityEntry;
    use chrono::Utc;
    use proptest::prelude::*;

    fn ranking(n: u32) -> Ranking {
        Ranking::new(
            (1..=n)
                .map(|i| PriorityEntry {
                    asset_id: format!("a{i}"),
                    rank: i,
                    weight_metric: None,
                    symbol: None,
                    name: None,
                })
                .collect(),
            Utc::now(),
        )
    }

    #[test]
    fn pinned_outside_scope_leads_the_first_batch() {
        let r = ranking(10);
        let pinned = vec!["a9".to_string(), "not-ranked".to_string()];
        let batches = partition(Some(&r), &pinned, CollectionMode::Custom(3), 2);
        assert_eq!(
            batches,
            vec![
                vec!["a9".to_string(), "not-ranked".to_string()],
                vec!["a1".to_string(), "a2".to_string()],
                vec!["a3".to_string()],
            ]
        );
    }

    #[test]
    fn empty_ranking_still_collects_pinned() {
        let pinned = vec!["bitcoin".to_string()];
        let batches = partition(None, &pinned, CollectionMode::Top100, 250);
        assert_eq!(batches, vec![vec!["bitcoin".to_string()]]);
        assert!(partition(None, &[], CollectionMode::All, 10).is_empty());
    }

    proptest! {
        #[test]
        fn partition_invariants(
            n in 0u32..400,
            scope in 1u32..500,
            batch_size in 1usize..60,
            pinned_ranks in proptest::collection::vec(1u32..600, 0..5),
        ) {
            prop_assume!(pinned_ranks.len() <= batch_size);
            let r = ranking(n);
            let pinned: Vec<String> = pinned_ranks.iter().map(|i| format!("a{i}")).collect();
            let batches = partition(Some(&r), &pinned, CollectionMode::Custom(scope), batch_size);

            let flat: Vec<&String> = batches.iter().flatten().collect();
            let unique: HashSet<&String> = flat.iter().copied().collect();
            prop_assert_eq!(unique.len(), flat.len(), "duplicate ids");
            prop_assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= batch_size));
            for p in &pinned {
                prop_assert!(batches[0].contains(p), "{} not in first batch", p);
            }
            let expected = pinned
                .iter()
                .cloned()
                .chain((1..=n.min(scope)).map(|i| format!("a{i}")))
                .collect::<HashSet<_>>();
            prop_assert_eq!(unique.len(), expected.len());
        }
    }
}
