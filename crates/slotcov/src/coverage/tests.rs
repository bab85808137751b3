//! Cross-module tests for the coverage engine
//!
//! Each test states a falsifiable hypothesis about recording, persistence
//! or merge behaviour.

#![allow(clippy::redundant_clone, clippy::float_cmp, clippy::needless_range_loop)]

use super::*;
use std::sync::Arc;
use std::thread;

// ============================================================================
// Fixtures
// ============================================================================

fn method(sig: &str, start: u32, elements: Vec<ElementDescriptor>) -> MethodDescriptor {
    MethodDescriptor {
        signature: sig.into(),
        range: SourceRange::new(start, start + 100),
        elements,
    }
}

fn calc_file(body: &str, methods: Vec<MethodDescriptor>) -> FileDescriptor {
    FileDescriptor {
        path: "src/Calc.java".into(),
        language: "java".into(),
        fingerprint: FileDescriptor::fingerprint_content(body.as_bytes()),
        timestamp: 1_700_000_000_000,
        classes: vec![ClassDescriptor {
            name: "Calc".into(),
            methods,
        }],
    }
}

/// One method (slot 0) with one branch (slots 1, 2)
fn calc_registry() -> Registry {
    Registry::new("calc")
        .apply(
            InstrumentationSession::new()
                .upsert(calc_file("v1", vec![method("int div(int,int)", 0, vec![ElementDescriptor::branch(10, 20)])])),
        )
        .unwrap()
        .registry
}

fn entry(iteration: u32, outcome: Outcome, slots: &[u32]) -> TestEntry {
    TestEntry {
        id: TestId::new(TestName::new("CalcTest", "divides"), iteration),
        start_ms: 1_700_000_000_000,
        duration_us: 100,
        outcome,
        failure_message: None,
        touched: slots.iter().copied().map(SlotIndex::new).collect(),
    }
}

fn point(ts: i64, counters: Vec<u64>, tests: Vec<TestEntry>) -> DataPoint {
    DataPoint {
        registry_version: 1,
        generation_ts_ms: ts,
        counters: CounterSnapshot::from_vec(counters),
        tests,
    }
}

fn merge(registry: &Registry, points: &[DataPoint]) -> MergeOutcome {
    let history = InMemoryHistory::new();
    MergeEngine::new(registry, &history).merge(points).unwrap()
}

fn slots_of(set: &SlotSet) -> Vec<u32> {
    set.iter().map(SlotIndex::as_u32).collect()
}

// ============================================================================
// Counter Store: no lost updates
// ============================================================================

mod counter_tests {
    use super::*;

    /// H₀-CNT-01: two threads × 1000 increments of slot 0 yield exactly 2000
    #[test]
    fn test_two_threads_thousand_increments() {
        let registry = calc_registry();
        let store = Arc::new(CounterStore::with_capacity(registry.slot_count() as usize).unwrap());
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        store.increment(SlotIndex::new(0));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = store.snapshot();
        assert_eq!(snap.get(SlotIndex::new(0)), 2000);
        assert_eq!(snap.get(SlotIndex::new(1)), 0);
        assert_eq!(snap.len(), 3);
    }

    /// H₀-CNT-02: growing while other threads increment loses nothing
    #[test]
    fn test_grow_under_concurrent_increments() {
        let store = Arc::new(CounterStore::with_capacity(8).unwrap());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..5000 {
                        store.increment(SlotIndex::new(7));
                    }
                })
            })
            .collect();
        for step in 1..=4 {
            store.grow_to(8 + step * SEGMENT_SLOTS).unwrap();
        }
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(store.get(SlotIndex::new(7)), 20_000);
        assert_eq!(store.len(), 8 + 4 * SEGMENT_SLOTS);
    }

    /// H₀-CNT-03: snapshots never go backwards per slot
    #[test]
    fn test_snapshots_monotonic() {
        let store = Arc::new(CounterStore::with_capacity(2).unwrap());
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..10_000 {
                    store.increment(SlotIndex::new(1));
                }
            })
        };
        let mut last = 0;
        for _ in 0..100 {
            let now = store.snapshot().get(SlotIndex::new(1));
            assert!(now >= last);
            last = now;
        }
        writer.join().unwrap();
        assert_eq!(store.snapshot().get(SlotIndex::new(1)), 10_000);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// H₀-CNT-04: snapshot equals the exact per-slot sum of all increments
            #[test]
            fn prop_snapshot_is_exact_sum(
                slots in 1usize..64,
                per_thread in prop::collection::vec(prop::collection::vec(0u32..64, 0..200), 1..5)
            ) {
                let store = Arc::new(CounterStore::with_capacity(slots).unwrap());
                let mut expected = vec![0u64; slots];
                for hits in &per_thread {
                    for &h in hits {
                        if (h as usize) < slots {
                            expected[h as usize] += 1;
                        }
                    }
                }
                let handles: Vec<_> = per_thread
                    .into_iter()
                    .map(|hits| {
                        let store = Arc::clone(&store);
                        thread::spawn(move || {
                            for h in hits {
                                store.increment(SlotIndex::new(h));
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
                let snap = store.snapshot();
                prop_assert_eq!(snap.as_slice(), expected.as_slice());
            }
        }
    }
}

// ============================================================================
// Slot allocation: determinism and exclusion
// ============================================================================

mod allocation_tests {
    use super::*;

    /// H₀-ALLOC-01: method entry first, branch takes two consecutive slots
    #[test]
    fn test_scenario_slots() {
        let registry = calc_registry();
        let (_, class) = registry.class("Calc").unwrap();
        let m = class.method("int div(int,int)").unwrap();
        assert_eq!(m.slot, SlotIndex::new(0));
        assert_eq!(m.elements[0].slots, SlotRange::pair(SlotIndex::new(1)));
        assert_eq!(registry.slot_count(), 3);
    }

    /// H₀-ALLOC-02: one malformed file does not block the others
    #[test]
    fn test_malformed_file_excluded_others_proceed() {
        let good = calc_file("v1", vec![method("a()", 0, vec![])]);
        let mut bad = calc_file("bad", vec![method("b()", 0, vec![ElementDescriptor::construct("elvis", 1, 2)])]);
        bad.path = "src/Bad.java".into();
        bad.classes[0].name = "Bad".into();
        let out = Registry::new("calc")
            .apply(InstrumentationSession::new().upsert(bad).upsert(good))
            .unwrap();
        assert_eq!(out.excluded.len(), 1);
        assert_eq!(out.excluded[0].path, "src/Bad.java");
        assert!(matches!(out.excluded[0].error, crate::CoverageError::MalformedSource { .. }));
        assert_eq!(out.registry.file_count(), 1);
        assert_eq!(out.assignments.len(), 1);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn element_strategy() -> impl Strategy<Value = ElementDescriptor> {
            (0u8..3, 0u32..50).prop_map(|(kind, at)| match kind {
                0 => ElementDescriptor::statement(at, at + 1),
                1 => ElementDescriptor::branch(at, at + 2),
                _ => ElementDescriptor::construct("lambda", at, at + 3),
            })
        }

        proptest! {
            /// H₀-ALLOC-03: byte-identical input yields identical slots,
            /// whatever order the files are submitted in
            #[test]
            fn prop_allocation_is_deterministic(
                methods in prop::collection::vec(prop::collection::vec(element_strategy(), 0..6), 1..5),
                base in 0u32..10_000,
                order in Just((0..4usize).collect::<Vec<_>>()).prop_shuffle()
            ) {
                let descriptors: Vec<MethodDescriptor> = methods
                    .into_iter()
                    .enumerate()
                    .map(|(i, elements)| method(&format!("m{i}()"), 0, elements))
                    .collect();
                let file = calc_file("same", descriptors);

                let a = SlotAllocator::new(SlotIndex::new(base)).allocate_file(&file).unwrap();
                let b = SlotAllocator::new(SlotIndex::new(base)).allocate_file(&file).unwrap();
                prop_assert_eq!(&a, &b);

                let files: Vec<FileDescriptor> = (0..4)
                    .map(|i| {
                        let mut f = file.clone();
                        f.path = format!("src/F{i}.java");
                        f.classes[0].name = format!("F{i}");
                        f
                    })
                    .collect();
                let sorted = files
                    .iter()
                    .fold(InstrumentationSession::new(), |s, f| s.upsert(f.clone()));
                let shuffled = order
                    .iter()
                    .fold(InstrumentationSession::new(), |s, &i| s.upsert(files[i].clone()));
                let sorted = Registry::new("calc").apply(sorted).unwrap();
                let shuffled = Registry::new("calc").apply(shuffled).unwrap();
                prop_assert_eq!(&sorted.registry, &shuffled.registry);
                for (pos, &i) in order.iter().enumerate() {
                    prop_assert_eq!(&shuffled.assignments[pos], &sorted.assignments[i]);
                }

                let v1 = Registry::new("calc")
                    .apply(InstrumentationSession::new().upsert(file.clone()))
                    .unwrap()
                    .registry;
                let again = v1.apply(InstrumentationSession::new().upsert(file)).unwrap().registry;
                prop_assert_eq!(again.version(), v1.version());
                prop_assert_eq!(again, v1);
            }
        }
    }
}

// ============================================================================
// Per-test recording
// ============================================================================

mod recorder_tests {
    use super::*;

    /// H₀-REC-01: iterations of one test stay distinct through persistence and merge
    #[test]
    fn test_iterations_distinct_in_aggregate() {
        let registry = calc_registry();
        let counters = Arc::new(CounterStore::with_capacity(3).unwrap());
        let recorder = Arc::new(TestRecorder::new(3));
        let hit = Instrumented::new(Arc::clone(&counters), Some(Arc::clone(&recorder)));
        let name = TestName::new("T1", "run");

        let it0 = recorder.start(name.clone());
        hit.hit(SlotIndex::new(0));
        hit.hit(SlotIndex::new(1));
        let _ = recorder.end(&it0, Outcome::Pass);

        let it1 = recorder.start(name);
        hit.hit(SlotIndex::new(0));
        hit.hit(SlotIndex::new(2));
        let _ = recorder.end_with_message(&it1, Outcome::Fail, Some("boom".into()));

        let dp = DataPoint::write(counters.snapshot(), recorder.drain_completed(), registry.version());
        let decoded = DataPoint::decode(&dp.encode(), "run").unwrap();
        let out = merge(&registry, &[decoded]);

        let first = out.coverage.test(&it0).unwrap();
        let second = out.coverage.test(&it1).unwrap();
        assert_eq!(first.outcome, Outcome::Pass);
        assert_eq!(slots_of(&first.touched), vec![0, 1]);
        assert_eq!(second.outcome, Outcome::Fail);
        assert_eq!(second.failure_message.as_deref(), Some("boom"));
        assert_eq!(slots_of(&second.touched), vec![0, 2]);
        assert_eq!(out.coverage.hit_count(SlotIndex::new(0)), 2);
    }

    /// H₀-REC-02: concurrent tests on different threads never cross-attribute
    #[test]
    fn test_parallel_tests_isolated() {
        let counters = Arc::new(CounterStore::with_capacity(64).unwrap());
        let recorder = Arc::new(TestRecorder::new(64));
        let hit = Instrumented::new(Arc::clone(&counters), Some(Arc::clone(&recorder)));
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let hit = hit.clone();
                let recorder = Arc::clone(&recorder);
                thread::spawn(move || {
                    let id = recorder.start(TestName::new("Par", &format!("case{t}")));
                    for _ in 0..100 {
                        hit.hit(SlotIndex::new(t * 8));
                    }
                    recorder.end(&id, Outcome::Pass).unwrap()
                })
            })
            .collect();
        for (t, h) in handles.into_iter().enumerate() {
            assert_eq!(slots_of(&h.join().unwrap().touched), vec![t as u32 * 8]);
        }
        assert_eq!(counters.snapshot().covered_count(), 8);
    }

    /// H₀-REC-03: hits outside any test are counted but not attributed
    #[test]
    fn test_hits_outside_tests_are_incidental() {
        let registry = calc_registry();
        let counters = Arc::new(CounterStore::with_capacity(3).unwrap());
        let recorder = Arc::new(TestRecorder::new(3));
        let hit = Instrumented::new(Arc::clone(&counters), Some(Arc::clone(&recorder)));
        hit.hit(SlotIndex::new(2));
        let id = recorder.start(TestName::new("A", "b"));
        hit.hit(SlotIndex::new(0));
        let _ = recorder.end(&id, Outcome::Pass);
        let dp = DataPoint::write(counters.snapshot(), recorder.drain_completed(), 1);
        let agg = merge(&registry, &[dp]).coverage;
        assert_eq!(slots_of(&agg.incidental_hits()), vec![2]);
        assert_eq!(slots_of(&agg.pass_only_hits()), vec![0]);
    }
}

// ============================================================================
// Data points and merge
// ============================================================================

mod merge_tests {
    use super::*;

    /// H₀-MERGE-01: merging a data point with itself doubles every counter
    #[test]
    fn test_self_merge_doubles() {
        let registry = calc_registry();
        let dp = point(10, vec![5, 0, 7], vec![entry(0, Outcome::Pass, &[0, 2])]);
        let out = merge(&registry, &[dp.clone(), dp]);
        assert_eq!(out.coverage.counters(), &[10, 0, 14]);
        assert_eq!(out.coverage.test_count(), 1);
        assert!(out.issues.is_empty());
    }

    /// H₀-MERGE-02: a flipped checksum byte skips that input only
    #[test]
    fn test_corrupted_input_skipped() {
        let registry = calc_registry();
        let a = point(10, vec![1, 1, 0], vec![entry(0, Outcome::Pass, &[0, 1])]);
        let b = point(20, vec![2, 0, 3], vec![entry(1, Outcome::Fail, &[0, 2])]);
        let mut bad = point(30, vec![9, 9, 9], Vec::new()).encode();
        bad[HEADER_LEN - 1] ^= 0x01;

        let history = InMemoryHistory::new();
        let engine = MergeEngine::new(&registry, &history);
        let out = engine
            .merge_encoded(&[
                ("a.scdp".to_string(), a.encode()),
                ("bad.scdp".to_string(), bad),
                ("b.scdp".to_string(), b.encode()),
            ])
            .unwrap();

        assert_eq!(out.skipped_count(), 1);
        assert_eq!(out.issues[0].source_name, "bad.scdp");
        assert!(matches!(
            out.issues[0].reason,
            crate::CoverageError::CorruptedDataPoint { .. }
        ));
        assert_eq!(out.coverage, merge(&registry, &[a, b]).coverage);
    }

    /// H₀-MERGE-03: an unsupported format version is reported, not fatal
    #[test]
    fn test_unsupported_version_skipped() {
        let registry = calc_registry();
        let mut bytes = point(1, vec![1, 0, 0], Vec::new()).encode();
        bytes[4..6].copy_from_slice(&7u16.to_le_bytes());
        let out = MergeEngine::new(&registry, &InMemoryHistory::new())
            .merge_encoded(&[("future.scdp".to_string(), bytes)])
            .unwrap();
        assert!(matches!(
            out.issues[0].reason,
            crate::CoverageError::UnsupportedFormat { found: 7, .. }
        ));
    }

    /// H₀-MERGE-04: the same identity with different outcomes resolves to the later run
    #[test]
    fn test_conflicting_outcomes_latest_wins() {
        let registry = calc_registry();
        let early = point(100, vec![1, 0, 0], vec![entry(0, Outcome::Fail, &[0])]);
        let late = point(200, vec![1, 0, 0], vec![entry(0, Outcome::Pass, &[1])]);
        for order in [[early.clone(), late.clone()], [late.clone(), early.clone()]] {
            let agg = merge(&registry, &order).coverage;
            let rec = agg.tests().next().unwrap();
            assert_eq!(rec.outcome, Outcome::Pass);
            assert_eq!(rec.generation_ts_ms, 200);
            assert_eq!(slots_of(&rec.touched), vec![0, 1]);
        }
    }

    /// H₀-MERGE-05: files round-trip through a data point directory
    #[test]
    fn test_merge_dir() {
        let dir = tempfile::tempdir().unwrap();
        let dps = DataPointDir::open(dir.path()).unwrap();
        let registry = calc_registry();
        for ts in [1, 2] {
            point(ts, vec![1, 2, 3], Vec::new())
                .write_to_path(&dps.dir().join(DataPoint::file_name("calc")))
                .unwrap();
        }
        std::fs::write(dps.dir().join("truncated.scdp"), b"SCDP").unwrap();
        let out = MergeEngine::new(&registry, &InMemoryHistory::new())
            .merge_dir(&dps)
            .unwrap();
        assert_eq!(out.coverage.counters(), &[2, 4, 6]);
        assert_eq!(out.skipped_count(), 1);
    }

    /// H₀-MERGE-06: cancellation between inputs aborts the merge
    #[test]
    fn test_cancel_mid_merge() {
        let registry = calc_registry();
        let options = MergeOptions::default();
        let token = options.cancel.clone();
        let history = InMemoryHistory::new();
        let engine = MergeEngine::new(&registry, &history).with_options(options);
        assert!(engine.merge(&[point(1, vec![1], Vec::new())]).is_ok());
        token.cancel();
        assert!(matches!(
            engine.merge(&[point(1, vec![1], Vec::new())]),
            Err(crate::CoverageError::Cancelled)
        ));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn entry_strategy() -> impl Strategy<Value = TestEntry> {
            (0u32..3, 0u8..3, 0i64..4, 0u64..4, prop::collection::vec(0u32..3, 0..3)).prop_map(
                |(iteration, outcome, start, duration, touched)| TestEntry {
                    id: TestId::new(TestName::new("P", "case"), iteration),
                    start_ms: start,
                    duration_us: duration,
                    outcome: Outcome::from_u8(outcome).unwrap_or(Outcome::Pass),
                    failure_message: None,
                    touched: touched.into_iter().map(SlotIndex::new).collect(),
                },
            )
        }

        fn point_strategy() -> impl Strategy<Value = DataPoint> {
            (
                0i64..4,
                prop::collection::vec(0u64..1000, 3),
                prop::collection::vec(entry_strategy(), 0..4),
            )
                .prop_map(|(ts, counters, tests)| point(ts, counters, tests))
        }

        proptest! {
            /// H₀-MERGE-07: merge is commutative and associative
            #[test]
            fn prop_merge_order_free(a in point_strategy(), b in point_strategy(), c in point_strategy()) {
                let registry = calc_registry();
                let abc = merge(&registry, &[a.clone(), b.clone(), c.clone()]).coverage;
                let cab = merge(&registry, &[c.clone(), a.clone(), b.clone()]).coverage;
                let mut nested = merge(&registry, &[a.clone(), b.clone()]).coverage;
                nested.merge_from(&merge(&registry, &[c.clone()]).coverage);
                let mut right = merge(&registry, &[a]).coverage;
                right.merge_from(&merge(&registry, &[b, c]).coverage);
                prop_assert_eq!(&abc, &cab);
                prop_assert_eq!(&abc, &nested);
                prop_assert_eq!(&abc, &right);
            }

            /// H₀-MERGE-08: self merge doubles counters exactly
            #[test]
            fn prop_self_merge_doubles(a in point_strategy()) {
                let registry = calc_registry();
                let once = merge(&registry, &[a.clone()]).coverage;
                let twice = merge(&registry, &[a.clone(), a]).coverage;
                for (x, y) in once.counters().iter().zip(twice.counters()) {
                    prop_assert_eq!(x * 2, *y);
                }
                prop_assert_eq!(once.test_count(), twice.test_count());
            }
        }
    }
}

// ============================================================================
// Structural diff across registry versions
// ============================================================================

mod version_tests {
    use super::*;

    /// V1: div() [branch], old() [statement]
    /// V2: div() [statement, branch] at shifted offsets; old() removed
    fn versions() -> (Registry, Registry) {
        let v1 = Registry::new("calc")
            .apply(InstrumentationSession::new().upsert(calc_file(
                "v1",
                vec![
                    method("int div(int,int)", 0, vec![ElementDescriptor::branch(10, 20)]),
                    method("void old()", 200, vec![ElementDescriptor::statement(210, 220)]),
                ],
            )))
            .unwrap()
            .registry;
        let v2 = v1
            .apply(InstrumentationSession::new().upsert(calc_file(
                "v2",
                vec![method(
                    "int div(int,int)",
                    40,
                    vec![
                        ElementDescriptor::statement(45, 48),
                        ElementDescriptor::branch(50, 60),
                    ],
                )],
            )))
            .unwrap()
            .registry;
        (v1, v2)
    }

    /// H₀-VER-01: historical hits follow unchanged elements; removed ones vanish
    #[test]
    fn test_diff_round_trip() {
        let (v1, v2) = versions();
        assert_eq!((v1.slot_count(), v2.slot_count()), (5, 9));
        let history = InMemoryHistory::new().with(v1.clone());
        let old = DataPoint {
            registry_version: 1,
            generation_ts_ms: 5,
            counters: CounterSnapshot::from_vec(vec![3, 2, 1, 4, 4]),
            tests: vec![entry(0, Outcome::Pass, &[1, 3])],
        };
        let out = MergeEngine::new(&v2, &history).merge(&[old]).unwrap();
        let agg = &out.coverage;

        let div = v2.class("Calc").unwrap().1.method("int div(int,int)").unwrap();
        assert_eq!(agg.hit_count(div.slot), 3);
        assert_eq!(agg.hit_count(div.elements[0].slots.start()), 0);
        let branch = div.elements[1].slots;
        assert_eq!(agg.hit_count(branch.start()), 2);
        assert_eq!(agg.hit_count(SlotIndex::new(branch.start().as_u32() + 1)), 1);
        assert_eq!(agg.counters().iter().sum::<u64>(), 6);

        let rec = agg.tests().next().unwrap();
        assert_eq!(slots_of(&rec.touched), vec![branch.start().as_u32()]);
        assert!(out.issues.is_empty());
    }

    /// H₀-VER-05: a compacted registry still merges data recorded before compaction
    #[test]
    fn test_compaction_keeps_history_mergeable() {
        let (v1, v2) = versions();
        assert_eq!(v2.retired_slots(), 5);
        let v3 = v2.compact().unwrap();
        assert_eq!((v3.version(), v3.slot_count()), (3, 4));
        let history = InMemoryHistory::new().with(v1).with(v2.clone());
        let before = DataPoint {
            registry_version: 2,
            generation_ts_ms: 5,
            counters: CounterSnapshot::from_vec(vec![0, 0, 0, 0, 0, 7, 1, 2, 3]),
            tests: vec![entry(0, Outcome::Pass, &[7])],
        };
        let out = MergeEngine::new(&v3, &history).merge(&[before]).unwrap();
        assert!(out.issues.is_empty());
        assert_eq!(out.coverage.counters(), &[7, 1, 2, 3]);
        let rec = out.coverage.tests().next().unwrap();
        assert_eq!(slots_of(&rec.touched), vec![2]);
    }

    /// H₀-VER-02: no stored registry for an old version degrades the input
    #[test]
    fn test_missing_history_degrades() {
        let (_, v2) = versions();
        let old = DataPoint {
            registry_version: 1,
            generation_ts_ms: 5,
            counters: CounterSnapshot::from_vec(vec![3, 2, 1, 4, 4]),
            tests: vec![entry(0, Outcome::Fail, &[1])],
        };
        let out = MergeEngine::new(&v2, &InMemoryHistory::new()).merge(&[old]).unwrap();
        assert_eq!(out.degraded_count(), 1);
        assert!(out.coverage.counters().iter().all(|&c| c == 0));
        let rec = out.coverage.tests().next().unwrap();
        assert_eq!(rec.outcome, Outcome::Fail);
        assert!(rec.touched.is_empty());
    }

    /// H₀-VER-03: data points beyond the lag window are skipped as stale
    #[test]
    fn test_stale_beyond_lag() {
        let (v1, v2) = versions();
        let history = InMemoryHistory::new().with(v1);
        let options = MergeOptions {
            max_version_lag: Some(0),
            ..MergeOptions::default()
        };
        let old = DataPoint {
            registry_version: 1,
            generation_ts_ms: 5,
            counters: CounterSnapshot::from_vec(vec![1; 5]),
            tests: Vec::new(),
        };
        let out = MergeEngine::new(&v2, &history)
            .with_options(options)
            .merge(&[old])
            .unwrap();
        assert!(matches!(
            out.issues[0].reason,
            crate::CoverageError::StaleDataPoint { max_lag: 0, .. }
        ));
    }

    /// H₀-VER-04: old versions resolve from a registry store on disk
    #[test]
    fn test_history_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        let (v1, v2) = versions();
        let _ = store.save(&v1).unwrap();
        let _ = store.save(&v2).unwrap();
        assert_eq!(store.versions("calc").unwrap(), vec![1, 2]);
        let latest = store.latest("calc").unwrap().unwrap();
        let old = DataPoint {
            registry_version: 1,
            generation_ts_ms: 5,
            counters: CounterSnapshot::from_vec(vec![1, 0, 0, 0, 0]),
            tests: Vec::new(),
        };
        let out = MergeEngine::new(&latest, &store).merge(&[old]).unwrap();
        assert_eq!(out.coverage.counters().iter().sum::<u64>(), 1);
    }
}

// ============================================================================
// Aggregate queries
// ============================================================================

mod aggregate_tests {
    use super::*;

    /// H₀-AGG-01: branches count one element per direction
    #[test]
    fn test_branch_directions_are_elements() {
        let registry = calc_registry();
        let agg = merge(&registry, &[point(1, vec![1, 1, 0], Vec::new())]).coverage;
        let summary = agg.method_coverage(&registry, "Calc", "int div(int,int)").unwrap();
        assert_eq!(summary.total_elements, 3);
        assert_eq!(summary.covered_elements, 2);
        assert!((summary.percent - 66.666).abs() < 0.01);
        assert_eq!(agg.file_coverage(&registry, "src/Calc.java").unwrap(), summary);
        assert_eq!(agg.class_coverage(&registry, "Calc").unwrap(), summary);
        assert_eq!(agg.project_coverage(&registry), summary);
        assert!(agg.file_coverage(&registry, "missing.java").is_none());
    }

    /// H₀-AGG-02: reverse lookup from slot to tests
    #[test]
    fn test_tests_touching() {
        let registry = calc_registry();
        let agg = merge(
            &registry,
            &[point(
                1,
                vec![2, 1, 1],
                vec![entry(0, Outcome::Pass, &[0, 1]), entry(1, Outcome::Pass, &[0, 2])],
            )],
        )
        .coverage;
        assert_eq!(agg.tests_touching(SlotIndex::new(0)).len(), 2);
        assert_eq!(agg.tests_touching(SlotIndex::new(2))[0].iteration, 1);
        assert!(agg.tests_touching(SlotIndex::new(9)).is_empty());
    }

    /// H₀-AGG-03: an empty registry is fully covered
    #[test]
    fn test_empty_project() {
        let registry = Registry::new("empty");
        let agg = merge(&registry, &[]).coverage;
        assert_eq!(agg.project_coverage(&registry).percent, 100.0);
    }
}

// ============================================================================
// End to end through a session
// ============================================================================

mod integration_tests {
    use super::*;
    use crate::config::{CoverageConfig, FlushPolicy};

    /// H₀-INT-01: two sessions' data points merge into one aggregate
    #[test]
    fn test_two_runs_merge() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoverageConfig::builder()
            .project("calc")
            .data_dir(dir.path().join("data"))
            .registry_dir(dir.path().join("registry"))
            .flush_policy(FlushPolicy::Directed)
            .build();

        for outcome in [Outcome::Pass, Outcome::Fail] {
            let session = CoverageSession::init(config.clone(), calc_registry()).unwrap();
            let hit = session.instrumented();
            let id = session.test_started("CalcTest", "divides").unwrap();
            hit.hit(SlotIndex::new(0));
            hit.hit(SlotIndex::new(1));
            let _ = session.test_finished(&id, outcome);
            let _ = session.shutdown().unwrap();
        }

        let store = RegistryStore::open(&config.registry_dir).unwrap();
        let registry = store.latest("calc").unwrap().unwrap();
        let out = MergeEngine::new(&registry, &store)
            .merge_dir(&DataPointDir::open(&config.data_dir).unwrap())
            .unwrap();
        assert!(out.issues.is_empty());
        assert_eq!(out.coverage.counters(), &[2, 2, 0]);
        assert_eq!(out.coverage.test_count(), 1);
        let rec = out.coverage.tests().next().unwrap();
        assert_eq!(slots_of(&rec.touched), vec![0, 1]);
    }
}
