//! Property-based tests for the timing and attribution core
//!
//! Properties covered:
//! 1. Window reads equal the sum of unexpired entries
//! 2. Reads never grow without a new record
//! 3. Any nesting depth yields exactly one completed timing
//! 4. Snapshots are ranked, bounded by top_n and never exceed the window
//! 5. Symbol normalization and binary inspection never panic

use modperf::attribution::{AttributionReader, ShortNames};
use modperf::clock::ManualClock;
use modperf::inspector::{normalize_symbol, symbol_matches, EligibilityInspector};
use modperf::module::ModuleId;
use modperf::selector::is_compiler_generated;
use modperf::timing::{StopOutcome, TimingSessionStore};
use modperf::{MonitorConfig, SlidingWindowAggregator};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const WINDOW_MS: u64 = 10_000;

/// (gap since previous record, duration), both in ms
fn entries() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..3_000, 0u64..500), 0..60)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_window_read_sums_unexpired_entries(entries in entries(), lag in 0u64..20_000) {
        let agg = SlidingWindowAggregator::new(Duration::from_millis(WINDOW_MS));
        let module = ModuleId::in_memory("A");

        let mut ts = 0u64;
        let mut recorded = Vec::new();
        for (gap, dur) in entries {
            ts += gap;
            agg.record(&module, Duration::from_millis(ts), Duration::from_millis(dur));
            recorded.push((ts, dur));
        }

        let now = ts + lag;
        let expected: u64 = recorded
            .iter()
            .filter(|(t, _)| now - t <= WINDOW_MS)
            .map(|(_, d)| d)
            .sum();
        prop_assert_eq!(
            agg.read(&module, Duration::from_millis(now)),
            Duration::from_millis(expected)
        );
    }

    #[test]
    fn prop_reads_are_monotone_without_records(entries in entries(), steps in prop::collection::vec(0u64..4_000, 1..10)) {
        let agg = SlidingWindowAggregator::new(Duration::from_millis(WINDOW_MS));
        let module = ModuleId::in_memory("A");

        let mut ts = 0u64;
        for (gap, dur) in entries {
            ts += gap;
            agg.record(&module, Duration::from_millis(ts), Duration::from_millis(dur));
        }

        let mut now = ts;
        let mut previous = agg.read(&module, Duration::from_millis(now));
        for step in steps {
            now += step;
            let current = agg.read(&module, Duration::from_millis(now));
            prop_assert!(current <= previous);
            previous = current;
        }
    }

    #[test]
    fn prop_any_nesting_depth_completes_once(depth in 1u32..40, start in 0u64..1_000, elapsed in 0u64..1_000) {
        let store = TimingSessionStore::new();
        let module = ModuleId::in_memory("A");
        let begin = Duration::from_millis(start);

        for level in 0..depth {
            prop_assert_eq!(store.start(&module, begin), level == 0);
        }
        for _ in 1..depth {
            prop_assert_eq!(store.stop(&module, begin), StopOutcome::Nested);
        }
        prop_assert_eq!(
            store.stop(&module, begin + Duration::from_millis(elapsed)),
            StopOutcome::Completed(Duration::from_millis(elapsed))
        );
        prop_assert_eq!(store.stop(&module, begin), StopOutcome::Mismatch);
    }

    #[test]
    fn prop_snapshot_ranked_and_bounded(
        totals in prop::collection::vec(0u64..4_000, 0..30),
        top_n in 1usize..25,
    ) {
        let config = MonitorConfig { top_n, ..MonitorConfig::default() };
        let agg = Arc::new(SlidingWindowAggregator::new(config.window()));
        let now = Duration::from_millis(5_000);
        for (i, total) in totals.iter().enumerate() {
            agg.record(
                &ModuleId::in_memory(format!("mod{}", i)),
                now,
                Duration::from_millis(*total),
            );
        }

        let reader = AttributionReader::new(
            Arc::clone(&agg),
            Arc::new(ManualClock::new()),
            Arc::new(ShortNames),
            &config,
        );
        let snap = reader.snapshot_at(now);

        prop_assert!(snap.rows.len() <= top_n);
        let modules: Vec<_> = snap.rows.iter().filter(|r| !r.unattributed).collect();
        for pair in modules.windows(2) {
            prop_assert!(pair[0].total >= pair[1].total);
        }
        for row in &snap.rows {
            prop_assert!(row.percentage >= 0.0);
            if row.unattributed {
                let attributed: u64 = totals.iter().sum();
                let expected = WINDOW_MS.saturating_sub(attributed);
                prop_assert_eq!(row.total, Duration::from_millis(expected));
            }
        }
    }

    #[test]
    fn prop_normalize_symbol_never_panics(raw in ".*") {
        let normalized = normalize_symbol(&raw);
        prop_assert!(!normalized.contains('<'));
        prop_assert!(!normalized.contains('>'));
    }

    #[test]
    fn prop_symbol_matches_own_path_suffix(
        segments in prop::collection::vec("[A-Z][A-Za-z0-9_]{0,8}", 2..5),
    ) {
        let full = segments.join("::");
        let qualified = segments[segments.len() - 2..].join("::");
        prop_assert!(symbol_matches(&full, &qualified));
    }

    #[test]
    fn prop_generated_names_detected(prefix in "[A-Za-z]{0,6}", suffix in "[A-Za-z0-9_]{0,6}") {
        let generated = format!("<{}>{}", prefix, suffix);
        let plain = format!("{}{}", prefix, suffix);
        prop_assert!(is_compiler_generated(&generated));
        prop_assert!(!is_compiler_generated(&plain));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_inspect_bytes_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let inspector = EligibilityInspector::new(&MonitorConfig::default());
        let _ = inspector.inspect_bytes(&data, "WeatherMod::update");
    }
}
