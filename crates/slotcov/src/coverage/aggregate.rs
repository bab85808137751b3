//! Aggregate Coverage
//!
//! The merged, read-only view handed to report generation: per-slot hit
//! counts, per-test records and coverage summaries at method, class, file
//! and project granularity.

use super::registry::{ClassInfo, FileInfo, MethodInfo, Registry};
use super::{Outcome, SlotIndex, SlotSet, TestEntry, TestId};
use std::collections::BTreeMap;

/// Coverage summary statistics
///
/// Every slot is one element: a branch contributes two (true-taken and
/// false-taken), everything else one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageSummary {
    /// Number of coverable elements
    pub total_elements: usize,
    /// Elements hit at least once
    pub covered_elements: usize,
    /// Coverage percentage
    pub percent: f64,
}

impl CoverageSummary {
    /// Build a summary from element counts
    #[must_use]
    pub fn from_counts(total_elements: usize, covered_elements: usize) -> Self {
        let percent = if total_elements == 0 {
            100.0 // Vacuously true
        } else {
            (covered_elements as f64 / total_elements as f64) * 100.0
        };
        Self {
            total_elements,
            covered_elements,
            percent,
        }
    }
}

/// Merged record of one test identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRecord {
    /// Invocation identity
    pub id: TestId,
    /// Outcome of the winning record
    pub outcome: Outcome,
    /// Start of the winning record, ms since the epoch
    pub start_ms: i64,
    /// Duration of the winning record
    pub duration_us: u64,
    /// Failure detail of the winning record
    pub failure_message: Option<String>,
    /// Generation time of the data point the winning record came from
    pub generation_ts_ms: i64,
    /// Union of touched slots across every merged record
    pub touched: SlotSet,
}

impl TestRecord {
    /// Lift a recorder entry out of a data point generated at `generation_ts_ms`
    #[must_use]
    pub fn from_entry(entry: TestEntry, generation_ts_ms: i64) -> Self {
        Self {
            id: entry.id,
            outcome: entry.outcome,
            start_ms: entry.start_ms,
            duration_us: entry.duration_us,
            failure_message: entry.failure_message,
            generation_ts_ms,
            touched: entry.touched,
        }
    }

    /// Precedence when two records share an identity: later generation,
    /// then later start, then more severe outcome, then longer duration,
    /// then message.
    fn precedence(&self) -> (i64, i64, u8, u64, Option<&str>) {
        (
            self.generation_ts_ms,
            self.start_ms,
            self.outcome.severity(),
            self.duration_us,
            self.failure_message.as_deref(),
        )
    }

    /// Fold `other` (same identity) into this record
    pub fn absorb(&mut self, other: &TestRecord) {
        if other.precedence() > self.precedence() {
            self.outcome = other.outcome;
            self.start_ms = other.start_ms;
            self.duration_us = other.duration_us;
            self.failure_message.clone_from(&other.failure_message);
            self.generation_ts_ms = other.generation_ts_ms;
        }
        self.touched.union_with(&other.touched);
    }
}

/// Merged coverage for one registry version
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateCoverage {
    registry_version: u64,
    counters: Vec<u64>,
    tests: BTreeMap<TestId, TestRecord>,
    latest_generation: Option<i64>,
}

impl AggregateCoverage {
    /// Create an empty aggregate for `registry_version`
    #[must_use]
    pub fn new(registry_version: u64, slot_count: usize) -> Self {
        Self {
            registry_version,
            counters: vec![0; slot_count],
            tests: BTreeMap::new(),
            latest_generation: None,
        }
    }

    /// Registry version every slot refers to
    #[must_use]
    pub fn registry_version(&self) -> u64 {
        self.registry_version
    }

    /// Generation time of the newest merged data point
    #[must_use]
    pub fn latest_generation(&self) -> Option<i64> {
        self.latest_generation
    }

    /// Add hits to one slot, saturating at `u64::MAX`
    pub fn add_hits(&mut self, slot: SlotIndex, count: u64) {
        if count == 0 {
            return;
        }
        let idx = slot.as_usize();
        if idx >= self.counters.len() {
            self.counters.resize(idx + 1, 0);
        }
        self.counters[idx] = self.counters[idx].saturating_add(count);
    }

    /// Merge one test record into the aggregate
    pub fn add_test(&mut self, record: TestRecord) {
        match self.tests.get_mut(&record.id) {
            Some(existing) => existing.absorb(&record),
            None => {
                let _ = self.tests.insert(record.id.clone(), record);
            }
        }
    }

    /// Note that a data point generated at `ts` was folded in
    pub fn observe_generation(&mut self, ts: i64) {
        self.latest_generation = Some(self.latest_generation.map_or(ts, |cur| cur.max(ts)));
    }

    /// Fold another aggregate of the same registry version into this one
    ///
    /// Counters add, test records combine by identity. The operation is
    /// commutative and associative.
    pub fn merge_from(&mut self, other: &AggregateCoverage) {
        for (i, &count) in other.counters.iter().enumerate() {
            self.add_hits(SlotIndex::new(i as u32), count);
        }
        if other.counters.len() > self.counters.len() {
            self.counters.resize(other.counters.len(), 0);
        }
        for record in other.tests.values() {
            self.add_test(record.clone());
        }
        if let Some(ts) = other.latest_generation {
            self.observe_generation(ts);
        }
    }

    /// Total hits on one slot
    #[must_use]
    pub fn hit_count(&self, slot: SlotIndex) -> u64 {
        self.counters.get(slot.as_usize()).copied().unwrap_or(0)
    }

    /// Raw hit counts indexed by slot
    #[must_use]
    pub fn counters(&self) -> &[u64] {
        &self.counters
    }

    /// Every test record, ordered by identity
    pub fn tests(&self) -> impl Iterator<Item = &TestRecord> {
        self.tests.values()
    }

    /// Number of distinct test identities
    #[must_use]
    pub fn test_count(&self) -> usize {
        self.tests.len()
    }

    /// Look up one test record
    #[must_use]
    pub fn test(&self, id: &TestId) -> Option<&TestRecord> {
        self.tests.get(id)
    }

    /// Identities of every test that touched `slot`
    #[must_use]
    pub fn tests_touching(&self, slot: SlotIndex) -> Vec<&TestId> {
        self.tests
            .values()
            .filter(|t| t.touched.contains(slot))
            .map(|t| &t.id)
            .collect()
    }

    /// Summary over an arbitrary set of slots
    #[must_use]
    pub fn slot_coverage(&self, slots: impl IntoIterator<Item = SlotIndex>) -> CoverageSummary {
        let (total, covered) = slots.into_iter().fold((0, 0), |(t, c), slot| {
            (t + 1, c + usize::from(self.hit_count(slot) > 0))
        });
        CoverageSummary::from_counts(total, covered)
    }

    /// Summary for one method
    #[must_use]
    pub fn method_summary(&self, method: &MethodInfo) -> CoverageSummary {
        self.slot_coverage(method.slots())
    }

    /// Summary for one class
    #[must_use]
    pub fn class_summary(&self, class: &ClassInfo) -> CoverageSummary {
        self.slot_coverage(class.methods.iter().flat_map(MethodInfo::slots))
    }

    /// Summary for one file
    #[must_use]
    pub fn file_summary(&self, file: &FileInfo) -> CoverageSummary {
        self.slot_coverage(file_slots(file))
    }

    /// Summary for the file at `path`, if the registry has it
    #[must_use]
    pub fn file_coverage(&self, registry: &Registry, path: &str) -> Option<CoverageSummary> {
        registry.file(path).map(|f| self.file_summary(f))
    }

    /// Summary for the class `name`, if the registry has it
    #[must_use]
    pub fn class_coverage(&self, registry: &Registry, name: &str) -> Option<CoverageSummary> {
        registry.class(name).map(|(_, c)| self.class_summary(c))
    }

    /// Summary for one method of a class, if the registry has it
    #[must_use]
    pub fn method_coverage(
        &self,
        registry: &Registry,
        class: &str,
        signature: &str,
    ) -> Option<CoverageSummary> {
        registry
            .class(class)
            .and_then(|(_, c)| c.method(signature))
            .map(|m| self.method_summary(m))
    }

    /// Summary over every file of the registry
    #[must_use]
    pub fn project_coverage(&self, registry: &Registry) -> CoverageSummary {
        self.slot_coverage(registry.files().flat_map(file_slots))
    }

    /// Slots touched by at least one passing test
    #[must_use]
    pub fn pass_only_hits(&self) -> SlotSet {
        let mut set = SlotSet::new();
        for record in self.tests.values().filter(|t| t.outcome.is_pass()) {
            set.union_with(&record.touched);
        }
        set
    }

    /// Slots with hits that no test was attributed with
    ///
    /// Typically static initialisers, or code run between tests.
    #[must_use]
    pub fn incidental_hits(&self) -> SlotSet {
        let mut attributed = SlotSet::new();
        for record in self.tests.values() {
            attributed.union_with(&record.touched);
        }
        self.counters
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(i, _)| SlotIndex::new(i as u32))
            .filter(|slot| !attributed.contains(*slot))
            .collect()
    }
}

fn file_slots(file: &FileInfo) -> impl Iterator<Item = SlotIndex> + '_ {
    file.classes
        .iter()
        .flat_map(|c| &c.methods)
        .flat_map(MethodInfo::slots)
}
