//! Type-Safe Slot Identifiers
//!
//! A slot is the index of one coverage counter. Slots and slot ranges are
//! distinct types so that a range can never be passed where a single counter
//! index is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of one coverage counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(u32);

impl SlotIndex {
    /// Create a new slot index
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the inner value
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get the inner value as a usize for indexing
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Contiguous run of slots owned by one element or file
///
/// Branches own a pair: `start` is the true-taken counter and `start + 1`
/// the false-taken counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    start: SlotIndex,
    len: u32,
}

impl SlotRange {
    /// Create a range of `len` slots starting at `start`
    #[inline]
    #[must_use]
    pub const fn new(start: SlotIndex, len: u32) -> Self {
        Self { start, len }
    }

    /// A range covering exactly one slot
    #[inline]
    #[must_use]
    pub const fn single(slot: SlotIndex) -> Self {
        Self::new(slot, 1)
    }

    /// A branch range: true-taken and false-taken slots
    #[inline]
    #[must_use]
    pub const fn pair(start: SlotIndex) -> Self {
        Self::new(start, 2)
    }

    /// First slot in the range
    #[inline]
    #[must_use]
    pub const fn start(self) -> SlotIndex {
        self.start
    }

    /// Number of slots in the range
    #[inline]
    #[must_use]
    pub const fn len(self) -> u32 {
        self.len
    }

    /// Whether the range is empty
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len == 0
    }

    /// One past the last slot, as a raw index
    #[inline]
    #[must_use]
    pub const fn end(self) -> u32 {
        self.start.0 + self.len
    }

    /// Check whether `slot` lies in the range
    #[inline]
    #[must_use]
    pub const fn contains(self, slot: SlotIndex) -> bool {
        slot.0 >= self.start.0 && slot.0 < self.end()
    }

    /// Iterate every slot in the range
    pub fn iter(self) -> impl Iterator<Item = SlotIndex> {
        (self.start.0..self.end()).map(SlotIndex)
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start.0, self.end())
    }
}
