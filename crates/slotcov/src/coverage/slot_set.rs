//! Compact set of slots, one bit per slot.

use super::SlotIndex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

/// Growable bitset of slot indices
#[derive(Clone, Default)]
pub struct SlotSet {
    words: Vec<u64>,
}

impl SlotSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty set pre-sized for `slots` slots
    #[must_use]
    pub fn with_capacity(slots: usize) -> Self {
        Self {
            words: vec![0; slots.div_ceil(WORD_BITS)],
        }
    }

    /// Add a slot, returning `true` if it was not present
    pub fn insert(&mut self, slot: SlotIndex) -> bool {
        let (word, bit) = locate(slot);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let was_set = self.words[word] & bit != 0;
        self.words[word] |= bit;
        !was_set
    }

    /// Check membership
    #[must_use]
    pub fn contains(&self, slot: SlotIndex) -> bool {
        let (word, bit) = locate(slot);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    /// Number of slots in the set
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Add every slot of `other`
    pub fn union_with(&mut self, other: &SlotSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= *theirs;
        }
    }

    /// Whether the two sets share a slot
    #[must_use]
    pub fn intersects(&self, other: &SlotSet) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .any(|(a, b)| a & b != 0)
    }

    /// Iterate slots in ascending order
    pub fn iter(&self) -> impl Iterator<Item = SlotIndex> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let tz = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(SlotIndex::new((i * WORD_BITS + tz) as u32))
            })
        })
    }
}

impl FromIterator<SlotIndex> for SlotSet {
    fn from_iter<I: IntoIterator<Item = SlotIndex>>(iter: I) -> Self {
        let mut set = Self::new();
        for slot in iter {
            let _ = set.insert(slot);
        }
        set
    }
}

impl SlotSet {
    fn significant_words(&self) -> &[u64] {
        let used = self.words.iter().rposition(|w| *w != 0).map_or(0, |i| i + 1);
        &self.words[..used]
    }
}

impl PartialEq for SlotSet {
    fn eq(&self, other: &Self) -> bool {
        self.significant_words() == other.significant_words()
    }
}

impl Eq for SlotSet {}

impl std::hash::Hash for SlotSet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.significant_words().hash(state);
    }
}

impl fmt::Debug for SlotSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(SlotIndex::as_u32)).finish()
    }
}

/// Fixed-capacity bitset that many threads may set bits in without locking
#[derive(Debug)]
pub(crate) struct AtomicSlotSet {
    words: Box<[AtomicU64]>,
}

impl AtomicSlotSet {
    pub(crate) fn with_capacity(slots: usize) -> Self {
        Self {
            words: (0..slots.div_ceil(WORD_BITS)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Set `slot`; returns `false` if it lies beyond the capacity
    #[inline]
    pub(crate) fn insert(&self, slot: SlotIndex) -> bool {
        let (word, bit) = locate(slot);
        match self.words.get(word) {
            Some(w) => {
                let _ = w.fetch_or(bit, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub(crate) fn to_slot_set(&self) -> SlotSet {
        SlotSet {
            words: self.words.iter().map(|w| w.load(Ordering::Acquire)).collect(),
        }
    }
}

#[inline]
fn locate(slot: SlotIndex) -> (usize, u64) {
    let idx = slot.as_usize();
    (idx / WORD_BITS, 1u64 << (idx % WORD_BITS))
}
