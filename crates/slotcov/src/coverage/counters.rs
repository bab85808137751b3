//! Counter Store
//!
//! One `u64` counter per slot, written by instrumented code from any number
//! of threads. Counters live in fixed-size segments hung off a directory that
//! never moves, so growing the store never relocates a counter that another
//! thread may be incrementing.
//!
//! ```text
//! directory: [seg 0][seg 1][seg 2][ ... ][seg MAX_SEGMENTS-1]
//!               │      │      └─ unset until grow_to reaches it
//!               ▼      ▼
//!           65536 × AtomicU64 per segment
//! ```
//!
//! The hot path is a bounds check plus one relaxed `fetch_add`. Growth is
//! serialized by a mutex that the hot path never touches.

use super::{lock, SlotIndex, SlotSet};
use crate::result::{CoverageError, CoverageResult};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, warn};

/// log2 of the number of counters per segment
pub const SEGMENT_SHIFT: u32 = 16;

/// Counters per segment
pub const SEGMENT_SLOTS: usize = 1 << SEGMENT_SHIFT;

const SEGMENT_MASK: usize = SEGMENT_SLOTS - 1;

/// Segments in the directory
pub const MAX_SEGMENTS: usize = 2048;

/// Largest slot count a store can hold
pub const MAX_SLOTS: usize = SEGMENT_SLOTS * MAX_SEGMENTS;

type Segment = Box<[AtomicU64]>;

/// Growable, concurrently incremented counter array
pub struct CounterStore {
    segments: Box<[OnceLock<Segment>]>,
    /// Published slot count; segments below it are initialised
    len: AtomicUsize,
    grow_lock: Mutex<()>,
    out_of_range: AtomicU64,
}

impl CounterStore {
    /// Create a store holding `slots` zeroed counters
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` above [`MAX_SLOTS`], `AllocationFailed` if segment
    /// memory cannot be reserved.
    pub fn with_capacity(slots: usize) -> CoverageResult<Self> {
        let store = Self {
            segments: (0..MAX_SEGMENTS).map(|_| OnceLock::new()).collect(),
            len: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            out_of_range: AtomicU64::new(0),
        };
        store.grow_to(slots)?;
        Ok(store)
    }

    /// Count one execution of `slot`
    #[inline]
    pub fn increment(&self, slot: SlotIndex) {
        self.add(slot, 1);
    }

    /// Add `count` executions of `slot`
    ///
    /// Never blocks. Hits on slots beyond the current length are tallied
    /// separately and reported at snapshot time.
    #[inline]
    pub fn add(&self, slot: SlotIndex, count: u64) {
        match self.cell(slot.as_usize()) {
            Some(cell) => {
                let _ = cell.fetch_add(count, Ordering::Relaxed);
            }
            None => {
                let _ = self.out_of_range.fetch_add(count, Ordering::Relaxed);
            }
        }
    }

    /// Current value of one counter (zero if out of range)
    #[must_use]
    pub fn get(&self, slot: SlotIndex) -> u64 {
        self.cell(slot.as_usize())
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Number of counters
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the store has no counters
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hits recorded against slots the store did not cover at the time
    #[must_use]
    pub fn out_of_range_hits(&self) -> u64 {
        self.out_of_range.load(Ordering::Relaxed)
    }

    /// Grow to at least `slots` counters
    ///
    /// Existing values stay at their indices, new counters start at zero.
    /// Shrinking is never performed.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` above [`MAX_SLOTS`], `AllocationFailed` if a
    /// segment cannot be reserved. On error the published length is
    /// unchanged.
    pub fn grow_to(&self, slots: usize) -> CoverageResult<()> {
        if slots > MAX_SLOTS {
            return Err(CoverageError::CapacityExceeded {
                requested: slots,
                max: MAX_SLOTS,
            });
        }
        let _guard = lock(&self.grow_lock);
        let current = self.len.load(Ordering::Acquire);
        if slots <= current {
            return Ok(());
        }
        for seg in 0..slots.div_ceil(SEGMENT_SLOTS) {
            if self.segments[seg].get().is_none() {
                let _ = self.segments[seg].set(allocate_segment()?);
            }
        }
        self.len.store(slots, Ordering::Release);
        debug!(from = current, to = slots, "counter store grown");
        Ok(())
    }

    /// Point-in-time copy of every counter
    ///
    /// Each value is read atomically; values of different slots may reflect
    /// slightly different instants.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let len = self.len();
        let mut values = Vec::with_capacity(len);
        for (seg, segment) in self.segments.iter().enumerate() {
            let base = seg << SEGMENT_SHIFT;
            if base >= len {
                break;
            }
            let Some(segment) = segment.get() else {
                break;
            };
            let take = (len - base).min(SEGMENT_SLOTS);
            values.extend(segment[..take].iter().map(|c| c.load(Ordering::Relaxed)));
        }
        let lost = self.out_of_range_hits();
        if lost > 0 {
            warn!(hits = lost, slots = len, "hits recorded against slots beyond the counter store");
        }
        CounterSnapshot { values }
    }

    #[inline]
    fn cell(&self, idx: usize) -> Option<&AtomicU64> {
        if idx >= self.len.load(Ordering::Acquire) {
            return None;
        }
        self.segments
            .get(idx >> SEGMENT_SHIFT)?
            .get()
            .map(|segment| &segment[idx & SEGMENT_MASK])
    }
}

impl fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterStore")
            .field("len", &self.len())
            .field("out_of_range", &self.out_of_range_hits())
            .finish_non_exhaustive()
    }
}

fn allocate_segment() -> CoverageResult<Segment> {
    let mut cells: Vec<AtomicU64> = Vec::new();
    cells
        .try_reserve_exact(SEGMENT_SLOTS)
        .map_err(|_| CoverageError::AllocationFailed {
            slots: SEGMENT_SLOTS,
        })?;
    cells.extend((0..SEGMENT_SLOTS).map(|_| AtomicU64::new(0)));
    Ok(cells.into_boxed_slice())
}

/// Immutable copy of a counter store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    values: Vec<u64>,
}

impl CounterSnapshot {
    /// Wrap raw counter values
    #[must_use]
    pub fn from_vec(values: Vec<u64>) -> Self {
        Self { values }
    }

    /// Unwrap into raw counter values
    #[must_use]
    pub fn into_vec(self) -> Vec<u64> {
        self.values
    }

    /// Value of one counter (zero if out of range)
    #[must_use]
    pub fn get(&self, slot: SlotIndex) -> u64 {
        self.values.get(slot.as_usize()).copied().unwrap_or(0)
    }

    /// Number of counters
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the snapshot has no counters
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw values, indexed by slot
    #[must_use]
    pub fn as_slice(&self) -> &[u64] {
        &self.values
    }

    /// Number of slots hit at least once
    #[must_use]
    pub fn covered_count(&self) -> usize {
        self.values.iter().filter(|&&v| v > 0).count()
    }

    /// Every slot hit at least once
    #[must_use]
    pub fn touched_slots(&self) -> SlotSet {
        self.slots_where(|_, v| v > 0)
    }

    /// Slots whose counter advanced since `earlier`
    ///
    /// Slots beyond `earlier`'s length count as advanced if non-zero.
    #[must_use]
    pub fn diff_since(&self, earlier: &CounterSnapshot) -> SlotSet {
        self.slots_where(|i, v| v > earlier.values.get(i).copied().unwrap_or(0))
    }

    fn slots_where(&self, keep: impl Fn(usize, u64) -> bool) -> SlotSet {
        let mut set = SlotSet::with_capacity(self.values.len());
        for (i, &v) in self.values.iter().enumerate() {
            if keep(i, v) {
                let _ = set.insert(SlotIndex::new(i as u32));
            }
        }
        set
    }
}
