//! Slot-Based Coverage Engine
//!
//! Instrumentation assigns every coverable element a slot; instrumented code
//! increments the slot's counter at run time; counters and per-test touched
//! sets are persisted as data points and merged against the registry.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SLOTCOV ARCHITECTURE                                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  FileDescriptor → SlotAllocator → Registry ──► RegistryStore    │
//! │                                      │                          │
//! │  instrumented code → CounterStore + TestRecorder                │
//! │                                      ↓                          │
//! │                     DataPoint (.scdp) → MergeEngine             │
//! │                                      ↓                          │
//! │                              AggregateCoverage                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Stable slots**: byte-identical files get identical slots; edits
//!   append at the high-water mark and never move other files' slots
//! - **No lost hits**: one relaxed atomic add per hit, no locks
//! - **Isolated attribution**: touches go to the innermost test on the
//!   calling thread only
//! - **Order-free merge**: counters add, test records combine by a total
//!   precedence order, so any merge order gives the same aggregate

mod aggregate;
mod allocator;
mod codec;
mod counters;
mod data_point;
mod diff;
pub mod language;
mod merge;
mod recorder;
mod registry;
mod session;
mod slot;
mod slot_set;
mod store;

pub use aggregate::{AggregateCoverage, CoverageSummary, TestRecord};
pub use allocator::{
    ClassDescriptor, ElementDescriptor, FileAssignment, FileDescriptor, MethodDescriptor,
    SlotAllocator,
};
pub use codec::{FrameHeader, HEADER_LEN};
pub use counters::{CounterSnapshot, CounterStore, MAX_SLOTS, SEGMENT_SLOTS};
pub use data_point::{DataPoint, DATA_POINT_EXTENSION, FORMAT_VERSION, SUPPORTED_VERSIONS};
pub use diff::{RegistryDiff, Remapped, SlotRemap};
pub use language::LanguageDescriptor;
pub use merge::{CancellationToken, IssueKind, MergeEngine, MergeIssue, MergeOptions, MergeOutcome};
pub use recorder::{ContextStack, Instrumented, Outcome, TestEntry, TestId, TestName, TestRecorder, ThreadContexts};
pub use registry::{
    ApplyOutcome, ClassInfo, ElementInfo, ElementKind, ExcludedFile, FileInfo,
    InstrumentationSession, MethodInfo, Registry, SlotOwner, SourceRange,
};
pub use session::CoverageSession;
pub use slot::{SlotIndex, SlotRange};
pub use slot_set::SlotSet;
pub use store::{DataPointDir, InMemoryHistory, RegistryHistory, RegistryStore};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panic while holding one of these locks leaves plain data behind, so the
// guard is recovered rather than propagating the poison.

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
