//! Per-Test Recorder
//!
//! Attributes touched slots to the test currently running on the calling
//! thread. Each thread owns a stack of open test contexts held in an
//! explicit [`ThreadContexts`] map; touches always land in the innermost
//! context of the calling thread, so concurrently running tests never
//! cross-attribute coverage.
//!
//! ```text
//! test_started(A) ──► [A]
//! helper_started(B) ─► [A, B]     touch(7) marks B only
//! end(B) ───────────► [A]         B frozen into `completed`
//! end(A) ───────────► []
//! ```
//!
//! When no test is running anywhere, [`TestRecorder::touch`] returns after a
//! single relaxed load. Otherwise it reads a thread-local cache of the
//! calling thread's open frames and sets a bit in the innermost frame's
//! atomic bitset; it never takes the shared context map or a frame lock.
//! The map is only consulted by `start` and `end`.

use super::slot_set::AtomicSlotSet;
use super::{lock, read, write, CounterStore, SlotIndex, SlotSet};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::thread::{self, ThreadId};
use std::time::Instant;
use tracing::{debug, warn};

static NEXT_RECORDER_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Touched-slot sinks of this thread's open frames, per recorder key,
    /// innermost last. Frames closed elsewhere are pruned lazily.
    static OPEN_FRAMES: RefCell<Vec<(u64, Vec<Arc<LiveSlots>>)>> = const { RefCell::new(Vec::new()) };
}

/// Logical identity of a test: class plus method
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestName {
    /// Test class (or suite) name
    pub class_name: String,
    /// Test method (or case) name
    pub method_name: String,
}

impl TestName {
    /// Create a test name
    #[must_use]
    pub fn new(class_name: &str, method_name: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
        }
    }
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class_name, self.method_name)
    }
}

/// Identity of one test invocation
///
/// Repeated or parameterized runs of the same [`TestName`] get increasing
/// iteration numbers, starting at zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestId {
    /// Logical test
    pub name: TestName,
    /// Invocation index of this name within one recorder
    pub iteration: u32,
}

impl TestId {
    /// Create a test identity
    #[must_use]
    pub fn new(name: TestName, iteration: u32) -> Self {
        Self { name, iteration }
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.iteration)
    }
}

/// How a test finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// Assertions held
    Pass,
    /// An assertion failed
    Fail,
    /// The test aborted with an unexpected error
    Error,
}

impl Outcome {
    /// Ordering used to break ties between conflicting records: errors
    /// outrank failures, failures outrank passes.
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
            Self::Error => 2,
        }
    }

    /// Wire tag
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.severity()
    }

    /// Parse a wire tag
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Pass),
            1 => Some(Self::Fail),
            2 => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether this is [`Outcome::Pass`]
    #[must_use]
    pub const fn is_pass(self) -> bool {
        matches!(self, Self::Pass)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
        })
    }
}

/// A closed test invocation and the slots it touched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestEntry {
    /// Invocation identity
    pub id: TestId,
    /// Wall-clock start, ms since the epoch
    pub start_ms: i64,
    /// Elapsed time in microseconds
    pub duration_us: u64,
    /// Final outcome
    pub outcome: Outcome,
    /// Failure or error detail supplied by the runner
    pub failure_message: Option<String>,
    /// Slots touched while this was the innermost context on its thread
    pub touched: SlotSet,
}

/// Slots touched by one open frame
#[derive(Debug)]
struct LiveSlots {
    bits: AtomicSlotSet,
    /// Slots beyond `bits` (the counter store grew while the test ran)
    overflow: Mutex<SlotSet>,
    closed: AtomicBool,
}

impl LiveSlots {
    fn with_capacity(slots: usize) -> Self {
        Self {
            bits: AtomicSlotSet::with_capacity(slots),
            overflow: Mutex::new(SlotSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    fn insert(&self, slot: SlotIndex) {
        if self.bits.insert(slot) {
            return;
        }
        // Contended only by a concurrent close; the touch then lands after it
        match self.overflow.try_lock() {
            Ok(mut extra) => {
                let _ = extra.insert(slot);
            }
            Err(TryLockError::Poisoned(p)) => {
                let _ = p.into_inner().insert(slot);
            }
            Err(TryLockError::WouldBlock) => {}
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) -> SlotSet {
        self.closed.store(true, Ordering::Release);
        let mut touched = self.bits.to_slot_set();
        touched.union_with(&lock(&self.overflow));
        touched
    }
}

#[derive(Debug)]
struct Frame {
    id: TestId,
    start_ms: i64,
    started: Instant,
    slots: Arc<LiveSlots>,
}

impl Frame {
    fn close(self, outcome: Outcome, failure_message: Option<String>) -> TestEntry {
        TestEntry {
            duration_us: u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX),
            touched: self.slots.close(),
            id: self.id,
            start_ms: self.start_ms,
            outcome,
            failure_message,
        }
    }
}

/// Open test contexts of one thread, innermost last
#[derive(Debug, Default)]
pub struct ContextStack {
    frames: Mutex<Vec<Frame>>,
}

impl ContextStack {
    /// Number of open contexts
    #[must_use]
    pub fn depth(&self) -> usize {
        lock(&self.frames).len()
    }

    fn take(&self, mut matches: impl FnMut(&TestId) -> bool) -> Option<(Frame, bool)> {
        let mut frames = lock(&self.frames);
        let pos = frames.iter().rposition(|f| matches(&f.id))?;
        let innermost = pos + 1 == frames.len();
        Some((frames.remove(pos), innermost))
    }
}

/// Mapping from thread identity to that thread's context stack
#[derive(Debug, Default)]
pub struct ThreadContexts {
    stacks: RwLock<HashMap<ThreadId, Arc<ContextStack>>>,
}

impl ThreadContexts {
    /// Stack of `thread`, if it ever opened a context that is still tracked
    #[must_use]
    pub fn get(&self, thread: ThreadId) -> Option<Arc<ContextStack>> {
        read(&self.stacks).get(&thread).cloned()
    }

    fn get_or_insert(&self, thread: ThreadId) -> Arc<ContextStack> {
        if let Some(stack) = self.get(thread) {
            return stack;
        }
        Arc::clone(write(&self.stacks).entry(thread).or_default())
    }

    /// Drop the entry for `thread` if its stack is empty
    ///
    /// Only the owning thread pushes onto a stack, so calling this from that
    /// thread cannot race with a concurrent push.
    fn release(&self, thread: ThreadId) {
        let mut stacks = write(&self.stacks);
        if stacks.get(&thread).is_some_and(|s| s.depth() == 0) {
            let _ = stacks.remove(&thread);
        }
    }

    fn all(&self) -> Vec<(ThreadId, Arc<ContextStack>)> {
        read(&self.stacks)
            .iter()
            .map(|(t, s)| (*t, Arc::clone(s)))
            .collect()
    }

    /// Threads with a tracked stack
    #[must_use]
    pub fn thread_count(&self) -> usize {
        read(&self.stacks).len()
    }
}

/// Records per-test coverage across all threads of a process
#[derive(Debug)]
pub struct TestRecorder {
    key: u64,
    contexts: ThreadContexts,
    running: AtomicUsize,
    capacity: AtomicUsize,
    iterations: Mutex<HashMap<TestName, u32>>,
    completed: Mutex<Vec<TestEntry>>,
}

impl TestRecorder {
    /// Create a recorder whose touched sets are pre-sized for `capacity` slots
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            key: NEXT_RECORDER_KEY.fetch_add(1, Ordering::Relaxed),
            contexts: ThreadContexts::default(),
            running: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity),
            iterations: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Resize future touched sets after the counter store grew
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    /// Open a context for `name` on the calling thread
    ///
    /// A test already running on this thread stays open underneath; touches
    /// go to the new, innermost context until it ends.
    pub fn start(&self, name: TestName) -> TestId {
        let iteration = {
            let mut iterations = lock(&self.iterations);
            let next = iterations.entry(name.clone()).or_insert(0);
            let current = *next;
            *next += 1;
            current
        };
        let id = TestId::new(name, iteration);
        let slots = Arc::new(LiveSlots::with_capacity(self.capacity.load(Ordering::Relaxed)));
        let stack = self.contexts.get_or_insert(thread::current().id());
        let depth = {
            let mut frames = lock(&stack.frames);
            frames.push(Frame {
                id: id.clone(),
                start_ms: chrono::Utc::now().timestamp_millis(),
                started: Instant::now(),
                slots: Arc::clone(&slots),
            });
            frames.len()
        };
        self.with_open_frames(|open| {
            open.retain(|f| !f.is_closed());
            open.push(slots);
        });
        let _ = self.running.fetch_add(1, Ordering::AcqRel);
        debug!(test = %id, depth, "test started");
        id
    }

    /// Close `id` with `outcome`
    ///
    /// Returns `None` (after a warning) if `id` is not running.
    pub fn end(&self, id: &TestId, outcome: Outcome) -> Option<TestEntry> {
        self.end_with_message(id, outcome, None)
    }

    /// Close `id` with `outcome` and a failure detail
    pub fn end_with_message(
        &self,
        id: &TestId,
        outcome: Outcome,
        failure_message: Option<String>,
    ) -> Option<TestEntry> {
        let Some((frame, innermost, owner)) = self.take(|f| f == id) else {
            warn!(test = %id, "test end without matching start; ignored");
            return None;
        };
        Some(self.finish(frame, innermost, owner, outcome, failure_message))
    }

    /// Close the innermost running invocation of `name`
    ///
    /// For runner hooks that report by name rather than by [`TestId`].
    pub fn end_named(&self, name: &TestName, outcome: Outcome) -> Option<TestEntry> {
        let Some((frame, innermost, owner)) = self.take(|f| &f.name == name) else {
            warn!(test = %name, "test end without matching start; ignored");
            return None;
        };
        Some(self.finish(frame, innermost, owner, outcome, None))
    }

    /// Mark `slot` as touched by the innermost test on the calling thread
    #[inline]
    pub fn touch(&self, slot: SlotIndex) {
        if self.running.load(Ordering::Relaxed) == 0 {
            return;
        }
        let _ = OPEN_FRAMES.try_with(|cache| {
            let mut cache = cache.borrow_mut();
            let Some((_, open)) = cache.iter_mut().find(|(key, _)| *key == self.key) else {
                return;
            };
            while open.last().is_some_and(|f| f.is_closed()) {
                let _ = open.pop();
            }
            if let Some(innermost) = open.last() {
                innermost.insert(slot);
            }
        });
    }

    /// Copy of every closed entry not yet drained
    #[must_use]
    pub fn completed(&self) -> Vec<TestEntry> {
        lock(&self.completed).clone()
    }

    /// Take every closed entry, leaving none behind
    #[must_use]
    pub fn drain_completed(&self) -> Vec<TestEntry> {
        std::mem::take(&mut *lock(&self.completed))
    }

    /// Tests open on any thread
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Open contexts on the calling thread
    #[must_use]
    pub fn active_depth(&self) -> usize {
        self.contexts
            .get(thread::current().id())
            .map_or(0, |s| s.depth())
    }

    /// The per-thread context map
    #[must_use]
    pub fn contexts(&self) -> &ThreadContexts {
        &self.contexts
    }

    /// Find and remove a frame, preferring the calling thread's stack
    fn take(&self, mut matches: impl FnMut(&TestId) -> bool) -> Option<(Frame, bool, ThreadId)> {
        let me = thread::current().id();
        if let Some(stack) = self.contexts.get(me) {
            if let Some((frame, innermost)) = stack.take(&mut matches) {
                return Some((frame, innermost, me));
            }
        }
        self.contexts
            .all()
            .into_iter()
            .filter(|(t, _)| *t != me)
            .find_map(|(t, stack)| stack.take(&mut matches).map(|(f, i)| (f, i, t)))
    }

    fn finish(
        &self,
        frame: Frame,
        innermost: bool,
        owner: ThreadId,
        outcome: Outcome,
        failure_message: Option<String>,
    ) -> TestEntry {
        if !innermost {
            warn!(test = %frame.id, "closing a test that is not the innermost on its thread");
        }
        let entry = frame.close(outcome, failure_message);
        let _ = self.running.fetch_sub(1, Ordering::AcqRel);
        if owner == thread::current().id() {
            self.contexts.release(owner);
            self.prune_open_frames();
        }
        debug!(test = %entry.id, outcome = %entry.outcome, touched = entry.touched.len(),
            duration_us = entry.duration_us, "test finished");
        lock(&self.completed).push(entry.clone());
        entry
    }

    /// Run `f` on the calling thread's cached frames for this recorder
    fn with_open_frames(&self, f: impl FnOnce(&mut Vec<Arc<LiveSlots>>)) {
        let _ = OPEN_FRAMES.try_with(|cache| {
            let mut cache = cache.borrow_mut();
            let idx = match cache.iter().position(|(key, _)| *key == self.key) {
                Some(idx) => idx,
                None => {
                    cache.push((self.key, Vec::new()));
                    cache.len() - 1
                }
            };
            f(&mut cache[idx].1);
        });
    }

    /// Drop closed frames from the calling thread's cache, and the cache
    /// entry itself once no frame of this recorder is open here
    fn prune_open_frames(&self) {
        let _ = OPEN_FRAMES.try_with(|cache| {
            let mut cache = cache.borrow_mut();
            for (_, open) in cache.iter_mut().filter(|(key, _)| *key == self.key) {
                open.retain(|f| !f.is_closed());
            }
            cache.retain(|(_, open)| !open.is_empty());
        });
    }
}

/// Hit path of instrumented code: counts the slot and attributes it
#[derive(Debug, Clone)]
pub struct Instrumented {
    /// Shared counter store
    pub counters: Arc<CounterStore>,
    /// Per-test recorder, absent when per-test recording is off
    pub recorder: Option<Arc<TestRecorder>>,
}

impl Instrumented {
    /// Wire a counter store with an optional recorder
    #[must_use]
    pub fn new(counters: Arc<CounterStore>, recorder: Option<Arc<TestRecorder>>) -> Self {
        Self { counters, recorder }
    }

    /// Record one execution of `slot`
    #[inline]
    pub fn hit(&self, slot: SlotIndex) {
        self.counters.increment(slot);
        if let Some(recorder) = &self.recorder {
            recorder.touch(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn slots(entry: &TestEntry) -> Vec<u32> {
        entry.touched.iter().map(SlotIndex::as_u32).collect()
    }

    #[test]
    fn test_iterations_are_distinct() {
        let rec = TestRecorder::new(8);
        let name = TestName::new("Calc", "adds");
        let a = rec.start(name.clone());
        rec.touch(SlotIndex::new(1));
        let _ = rec.end(&a, Outcome::Pass).unwrap();
        let b = rec.start(name);
        rec.touch(SlotIndex::new(2));
        let _ = rec.end(&b, Outcome::Fail).unwrap();
        assert_eq!(a.iteration, 0);
        assert_eq!(b.iteration, 1);
        assert_eq!(b.to_string(), "Calc.adds[1]");
        let done = rec.completed();
        assert_eq!(slots(&done[0]), vec![1]);
        assert_eq!(slots(&done[1]), vec![2]);
    }

    #[test]
    fn test_nested_touches_innermost_only() {
        let rec = TestRecorder::new(8);
        let outer = rec.start(TestName::new("Suite", "setup"));
        rec.touch(SlotIndex::new(0));
        let inner = rec.start(TestName::new("Suite", "case"));
        assert_eq!(rec.active_depth(), 2);
        rec.touch(SlotIndex::new(5));
        let inner_entry = rec.end(&inner, Outcome::Pass).unwrap();
        rec.touch(SlotIndex::new(6));
        let outer_entry = rec.end(&outer, Outcome::Pass).unwrap();
        assert_eq!(slots(&inner_entry), vec![5]);
        assert_eq!(slots(&outer_entry), vec![0, 6]);
        assert_eq!(rec.active_depth(), 0);
        assert_eq!(rec.contexts().thread_count(), 0);
    }

    #[test]
    fn test_unmatched_end_is_noop() {
        let rec = TestRecorder::new(0);
        let ghost = TestId::new(TestName::new("X", "y"), 0);
        assert!(rec.end(&ghost, Outcome::Pass).is_none());
        assert!(rec.completed().is_empty());
    }

    #[test]
    fn test_end_outer_first_keeps_inner_open() {
        let rec = TestRecorder::new(0);
        let outer = rec.start(TestName::new("S", "outer"));
        let inner = rec.start(TestName::new("S", "inner"));
        let _ = rec.end(&outer, Outcome::Error).unwrap();
        assert_eq!(rec.running_count(), 1);
        rec.touch(SlotIndex::new(3));
        let inner_entry = rec.end(&inner, Outcome::Pass).unwrap();
        assert_eq!(slots(&inner_entry), vec![3]);
    }

    #[test]
    fn test_threads_do_not_cross_attribute() {
        let rec = Arc::new(TestRecorder::new(16));
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let rec = Arc::clone(&rec);
                thread::spawn(move || {
                    let id = rec.start(TestName::new("T", &format!("t{t}")));
                    rec.touch(SlotIndex::new(t));
                    rec.end(&id, Outcome::Pass).unwrap()
                })
            })
            .collect();
        for (t, h) in handles.into_iter().enumerate() {
            let entry = h.join().unwrap();
            assert_eq!(slots(&entry), vec![t as u32]);
        }
        assert_eq!(rec.drain_completed().len(), 4);
        assert!(rec.completed().is_empty());
    }

    #[test]
    fn test_end_from_another_thread() {
        let rec = Arc::new(TestRecorder::new(4));
        let id = rec.start(TestName::new("Async", "case"));
        rec.touch(SlotIndex::new(2));
        let other = Arc::clone(&rec);
        let entry = thread::spawn(move || other.end(&id, Outcome::Pass))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(slots(&entry), vec![2]);
        assert_eq!(rec.running_count(), 0);
    }

    #[test]
    fn test_instrumented_hit() {
        let counters = Arc::new(CounterStore::with_capacity(4).unwrap());
        let rec = Arc::new(TestRecorder::new(4));
        let hit = Instrumented::new(Arc::clone(&counters), Some(Arc::clone(&rec)));
        hit.hit(SlotIndex::new(1));
        let id = rec.start(TestName::new("C", "m"));
        hit.hit(SlotIndex::new(1));
        let entry = rec.end_named(&id.name, Outcome::Pass).unwrap();
        assert_eq!(counters.get(SlotIndex::new(1)), 2);
        assert_eq!(slots(&entry), vec![1]);
    }

    #[test]
    fn test_touch_does_not_wait_on_shared_locks() {
        let rec = Arc::new(TestRecorder::new(4));
        let (ready_tx, ready_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();
        let (end_tx, end_rx) = mpsc::channel::<()>();
        let worker = {
            let rec = Arc::clone(&rec);
            thread::spawn(move || {
                let id = rec.start(TestName::new("Lock", "free"));
                ready_tx.send(thread::current().id()).unwrap();
                go_rx.recv().unwrap();
                rec.touch(SlotIndex::new(1));
                done_tx.send(()).unwrap();
                end_rx.recv().unwrap();
                rec.end(&id, Outcome::Pass).unwrap()
            })
        };
        let worker_id = ready_rx.recv().unwrap();
        let stack = rec.contexts().get(worker_id).unwrap();
        {
            let _map = write(&rec.contexts.stacks);
            let _frames = lock(&stack.frames);
            go_tx.send(()).unwrap();
            assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        }
        end_tx.send(()).unwrap();
        let entry = worker.join().unwrap();
        assert_eq!(slots(&entry), vec![1]);
    }

    #[test]
    fn test_touch_beyond_capacity_is_kept() {
        let rec = TestRecorder::new(4);
        let id = rec.start(TestName::new("Grow", "late"));
        rec.touch(SlotIndex::new(2));
        rec.touch(SlotIndex::new(100));
        let entry = rec.end(&id, Outcome::Pass).unwrap();
        assert_eq!(slots(&entry), vec![2, 100]);
    }

    #[test]
    fn test_recorders_on_one_thread_are_separate() {
        let a = TestRecorder::new(8);
        let b = TestRecorder::new(8);
        let ia = a.start(TestName::new("A", "a"));
        let ib = b.start(TestName::new("B", "b"));
        a.touch(SlotIndex::new(1));
        b.touch(SlotIndex::new(2));
        assert_eq!(slots(&a.end(&ia, Outcome::Pass).unwrap()), vec![1]);
        assert_eq!(slots(&b.end(&ib, Outcome::Pass).unwrap()), vec![2]);
    }
}
