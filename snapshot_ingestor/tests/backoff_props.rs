use std::time::Duration;

use proptest::prelude::*;
use snapshot_ingestor::retry::BackoffStrategy;

proptest! {
    #[test]
    fn next_delay_is_monotonic_and_capped(
        base_ms in 1u64..5_000,
        multiplier in 1.0f64..4.0,
        max_ms in 1u64..120_000,
        jitter in any::<bool>(),
    ) {
        let b = BackoffStrategy {
            base: Duration::from_millis(base_ms),
            multiplier,
            max: Duration::from_millis(max_ms),
            jitter,
        };
        let mut prev = Duration::ZERO;
        for attempt in 1..=20u32 {
            let d = b.next_delay(attempt);
            prop_assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            prop_assert!(d <= b.max.max(b.base), "attempt {attempt}: {d:?} above cap");
            prev = d;
        }
    }
}
