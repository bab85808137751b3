//! Slotcov: Slot-Based Source Coverage Engine
//!
//! Every coverable element of an instrumented program (method entry,
//! statement, branch direction, language construct) owns a numbered slot.
//! Instrumented code bumps the slot's counter; a test recorder attributes
//! each hit to the test running on the calling thread. Counters and per-test
//! touched sets are persisted as checksummed data points and merged, across
//! runs and across registry versions, into one aggregate.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    SLOTCOV Architecture                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   ┌────────────┐    ┌────────────┐    ┌────────────┐            │
//! │   │ Front-end  │    │ Registry   │    │ Registry   │            │
//! │   │ descriptors│───►│ (versioned)│───►│ Store      │            │
//! │   └────────────┘    └────────────┘    └────────────┘            │
//! │          │                 │                 ▲                  │
//! │          ▼                 ▼                 │                  │
//! │   ┌────────────┐    ┌────────────┐    ┌────────────┐            │
//! │   │ Counters + │───►│ Data Point │───►│ Merge      │            │
//! │   │ Recorder   │    │ (.scdp)    │    │ Engine     │            │
//! │   └────────────┘    └────────────┘    └────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use slotcov::{CoverageConfig, CoverageSession, Outcome, Registry, SlotIndex};
//!
//! # fn main() -> slotcov::CoverageResult<()> {
//! let config = CoverageConfig::builder().project("calc").build();
//! let session = CoverageSession::init(config, Registry::new("calc"))?;
//! if let Some(id) = session.test_started("CalcTest", "divides") {
//!     session.hit(SlotIndex::new(0));
//!     let _ = session.test_finished(&id, Outcome::Pass);
//! }
//! let _ = session.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

/// Session configuration (YAML, environment, builder)
pub mod config;

/// Slot allocation, recording, persistence and merge
#[allow(
    clippy::must_use_candidate,
    clippy::missing_const_for_fn,
    clippy::missing_panics_doc,
    clippy::significant_drop_tightening
)]
pub mod coverage;

/// Tracing subscriber setup
pub mod logging;

/// Error types
pub mod result;

pub use config::{CoverageConfig, CoverageConfigBuilder, FlushPolicy, LoggingConfig};
pub use coverage::{
    AggregateCoverage, CancellationToken, CounterSnapshot, CounterStore, CoverageSession,
    CoverageSummary, DataPoint, DataPointDir, FileDescriptor, InMemoryHistory,
    InstrumentationSession, Instrumented, MergeEngine, MergeOptions, MergeOutcome, Outcome,
    Registry, RegistryDiff, RegistryHistory, RegistryStore, SlotIndex, SlotRange, SlotSet,
    TestId, TestName, TestRecorder,
};
pub use result::{CoverageError, CoverageResult};
