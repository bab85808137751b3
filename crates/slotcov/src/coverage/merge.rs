//! Merge Engine
//!
//! Folds any number of data points into one [`AggregateCoverage`] for a
//! target registry version.
//!
//! - Same version: counters add, test records combine by identity.
//! - Older version: slots are remapped through the structural diff from the
//!   stored registry of that version; counters of removed slots are dropped.
//! - Older version with no stored registry: counters are dropped, test
//!   outcomes are kept without coverage detail (degraded).
//! - Newer version, stale beyond the configured lag, or unreadable input:
//!   the data point is skipped.
//!
//! Nothing short of cancellation or a fatal error aborts the batch; every
//! skipped or degraded input is reported in [`MergeOutcome::issues`].

use super::aggregate::TestRecord;
use super::diff::{RegistryDiff, Remapped, SlotRemap};
use super::{AggregateCoverage, DataPoint, DataPointDir, Registry, RegistryHistory, SlotIndex};
use crate::result::{CoverageError, CoverageResult};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cooperative cancellation flag, checked between data points
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create an uncancelled token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Merge tuning
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Skip data points more than this many versions behind the target
    pub max_version_lag: Option<u64>,
    /// Cancellation flag
    pub cancel: CancellationToken,
}

/// What happened to an input that could not be merged in full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    /// Input contributed nothing
    Skipped,
    /// Test outcomes kept, counters and touched slots dropped
    Degraded,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Skipped => "skipped",
            Self::Degraded => "degraded",
        })
    }
}

/// One skipped or degraded input
#[derive(Debug)]
pub struct MergeIssue {
    /// Label or path of the input
    pub source_name: String,
    /// Skipped or degraded
    pub kind: IssueKind,
    /// Why
    pub reason: CoverageError,
}

/// Result of a merge run
#[derive(Debug)]
pub struct MergeOutcome {
    /// Everything that could be attributed
    pub coverage: AggregateCoverage,
    /// Inputs that were skipped or degraded, in input order
    pub issues: Vec<MergeIssue>,
}

impl MergeOutcome {
    /// Number of skipped inputs
    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.count(IssueKind::Skipped)
    }

    /// Number of degraded inputs
    #[must_use]
    pub fn degraded_count(&self) -> usize {
        self.count(IssueKind::Degraded)
    }

    fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|i| i.kind == kind).count()
    }
}

/// Merges data points against one target registry
pub struct MergeEngine<'a> {
    registry: &'a Registry,
    history: &'a dyn RegistryHistory,
    options: MergeOptions,
}

impl fmt::Debug for MergeEngine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeEngine")
            .field("project", &self.registry.project())
            .field("version", &self.registry.version())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

enum Fold {
    Direct,
    Remap(SlotRemap),
    OutcomesOnly(CoverageError),
}

impl<'a> MergeEngine<'a> {
    /// Create an engine targeting `registry`, resolving older versions from
    /// `history`
    #[must_use]
    pub fn new(registry: &'a Registry, history: &'a dyn RegistryHistory) -> Self {
        Self {
            registry,
            history,
            options: MergeOptions::default(),
        }
    }

    /// Replace the merge options
    #[must_use]
    pub fn with_options(mut self, options: MergeOptions) -> Self {
        self.options = options;
        self
    }

    /// Merge decoded data points
    ///
    /// # Errors
    ///
    /// `Cancelled` if the token fires.
    pub fn merge(&self, points: &[DataPoint]) -> CoverageResult<MergeOutcome> {
        self.run(
            points
                .iter()
                .enumerate()
                .map(|(i, dp)| (format!("data point #{i}"), Ok(dp.clone()))),
        )
    }

    /// Decode and merge framed data points, each labelled for reporting
    ///
    /// # Errors
    ///
    /// `Cancelled` if the token fires.
    pub fn merge_encoded(&self, inputs: &[(String, Vec<u8>)]) -> CoverageResult<MergeOutcome> {
        self.run(
            inputs
                .iter()
                .map(|(label, bytes)| (label.clone(), DataPoint::decode(bytes, label))),
        )
    }

    /// Read and merge data point files
    ///
    /// # Errors
    ///
    /// `Cancelled` if the token fires.
    pub fn merge_files(&self, paths: &[PathBuf]) -> CoverageResult<MergeOutcome> {
        self.run(
            paths
                .iter()
                .map(|p| (p.display().to_string(), DataPoint::read_from_path(p))),
        )
    }

    /// Merge every data point file in a directory
    ///
    /// # Errors
    ///
    /// Directory listing failure or `Cancelled`.
    pub fn merge_dir(&self, dir: &DataPointDir) -> CoverageResult<MergeOutcome> {
        self.merge_files(&dir.list()?)
    }

    fn run(
        &self,
        inputs: impl Iterator<Item = (String, CoverageResult<DataPoint>)>,
    ) -> CoverageResult<MergeOutcome> {
        let mut coverage =
            AggregateCoverage::new(self.registry.version(), self.registry.slot_count() as usize);
        let mut issues = Vec::new();
        let mut remaps: HashMap<u64, Option<SlotRemap>> = HashMap::new();
        let mut merged = 0usize;

        for (source_name, input) in inputs {
            if self.options.cancel.is_cancelled() {
                info!(merged, "merge cancelled");
                return Err(CoverageError::Cancelled);
            }
            let point = match input {
                Ok(point) => point,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    skip(&mut issues, source_name, err);
                    continue;
                }
            };
            match self.plan(&point, &mut remaps) {
                Ok(fold) => {
                    if let Fold::OutcomesOnly(reason) = &fold {
                        warn!(source = %source_name, error = %reason,
                            "counters dropped; test outcomes kept without coverage");
                    }
                    fold_point(&mut coverage, point, &fold);
                    if let Fold::OutcomesOnly(reason) = fold {
                        issues.push(MergeIssue {
                            source_name,
                            kind: IssueKind::Degraded,
                            reason,
                        });
                    }
                    merged += 1;
                }
                Err(err) => skip(&mut issues, source_name, err),
            }
        }

        info!(project = %self.registry.project(), version = self.registry.version(),
            merged, issues = issues.len(), tests = coverage.test_count(), "merge complete");
        Ok(MergeOutcome { coverage, issues })
    }

    fn plan(
        &self,
        point: &DataPoint,
        remaps: &mut HashMap<u64, Option<SlotRemap>>,
    ) -> CoverageResult<Fold> {
        let target = self.registry.version();
        let version = point.registry_version;
        if version == target {
            return Ok(Fold::Direct);
        }
        if version > target {
            return Err(CoverageError::RegistryVersionMismatch {
                data_point_version: version,
                registry_version: target,
            });
        }
        if let Some(max_lag) = self.options.max_version_lag {
            if target - version > max_lag {
                return Err(CoverageError::StaleDataPoint {
                    data_point_version: version,
                    registry_version: target,
                    max_lag,
                });
            }
        }
        let remap = remaps.entry(version).or_insert_with(|| {
            let old = self.history.registry(self.registry.project(), version)?;
            let remap = RegistryDiff::between(&old, self.registry);
            debug!(from = version, to = target, mapped = remap.mapped_count(),
                removed = remap.removed_count(), "slot remap computed");
            Some(remap)
        });
        Ok(match remap {
            Some(remap) => Fold::Remap(remap.clone()),
            None => Fold::OutcomesOnly(CoverageError::RegistryVersionMismatch {
                data_point_version: version,
                registry_version: target,
            }),
        })
    }
}

fn skip(issues: &mut Vec<MergeIssue>, source_name: String, reason: CoverageError) {
    warn!(source = %source_name, error = %reason, "data point skipped");
    issues.push(MergeIssue {
        source_name,
        kind: IssueKind::Skipped,
        reason,
    });
}

fn fold_point(coverage: &mut AggregateCoverage, point: DataPoint, fold: &Fold) {
    let translate = |slot: SlotIndex| match fold {
        Fold::Direct => Some(slot),
        Fold::Remap(remap) => match remap.map(slot) {
            Remapped::To(new) => Some(new),
            Remapped::Removed => None,
        },
        Fold::OutcomesOnly(_) => None,
    };

    for (i, &count) in point.counters.as_slice().iter().enumerate() {
        if let Some(slot) = translate(SlotIndex::new(i as u32)) {
            coverage.add_hits(slot, count);
        }
    }
    for mut entry in point.tests {
        if !matches!(fold, Fold::Direct) {
            entry.touched = entry.touched.iter().filter_map(translate).collect();
        }
        coverage.add_test(TestRecord::from_entry(entry, point.generation_ts_ms));
    }
    coverage.observe_generation(point.generation_ts_ms);
}
