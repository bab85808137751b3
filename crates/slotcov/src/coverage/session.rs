//! Coverage Session
//!
//! The explicit process context: one active registry, one counter store,
//! an optional per-test recorder and the flush machinery that turns them
//! into a data point. Create it at process start with
//! [`CoverageSession::init`], hand [`CoverageSession::instrumented`] to
//! instrumented code, and call [`CoverageSession::shutdown`] at exit.
//!
//! A session owns exactly one data point file and rewrites it on every
//! flush, so periodic flushes never double count.

use super::{
    lock, read, write, CounterStore, DataPoint, Instrumented, Outcome, Registry, RegistryStore,
    SlotIndex, TestEntry, TestId, TestName, TestRecorder,
};
use crate::config::{CoverageConfig, FlushPolicy};
use crate::result::{CoverageError, CoverageResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// State shared with the background flusher
#[derive(Debug)]
struct FlushTarget {
    counters: Arc<CounterStore>,
    recorder: Option<Arc<TestRecorder>>,
    registry_version: AtomicU64,
    path: PathBuf,
    /// Every test closed so far in this session; held while writing
    tests: Mutex<Vec<TestEntry>>,
    last_flush: Mutex<Instant>,
}

impl FlushTarget {
    fn flush(&self) -> CoverageResult<DataPoint> {
        let mut tests = lock(&self.tests);
        if let Some(recorder) = &self.recorder {
            tests.extend(recorder.drain_completed());
        }
        let point = DataPoint::write(
            self.counters.snapshot(),
            tests.clone(),
            self.registry_version.load(Ordering::Acquire),
        );
        point.write_to_path(&self.path)?;
        *lock(&self.last_flush) = Instant::now();
        Ok(point)
    }
}

#[derive(Debug)]
struct Flusher {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Flusher {
    fn spawn(target: Arc<FlushTarget>, every: Duration) -> CoverageResult<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("slotcov-flush".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(every) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = target.flush() {
                            warn!(path = %target.path.display(), error = %err, "periodic flush failed");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("flush thread panicked");
        }
    }
}

/// Process-wide coverage context
#[derive(Debug)]
pub struct CoverageSession {
    config: CoverageConfig,
    registry: RwLock<Arc<Registry>>,
    store: RegistryStore,
    target: Arc<FlushTarget>,
    flusher: Mutex<Option<Flusher>>,
}

impl CoverageSession {
    /// Start a session for `registry`
    ///
    /// Sizes the counter store, stores the registry version if it is not
    /// stored yet, picks this session's data point path and starts the
    /// flush thread for [`FlushPolicy::Threaded`].
    ///
    /// # Errors
    ///
    /// `Config` if the registry belongs to another project, fatal counter
    /// store errors, or I/O failure preparing the directories.
    pub fn init(config: CoverageConfig, registry: Registry) -> CoverageResult<Self> {
        if registry.project() != config.project {
            return Err(CoverageError::Config {
                message: format!(
                    "registry project {} does not match configured project {}",
                    registry.project(),
                    config.project
                ),
            });
        }
        let capacity = (registry.slot_count() as usize).max(config.initial_capacity);
        let counters = Arc::new(CounterStore::with_capacity(capacity)?);
        let recorder = config
            .per_test
            .then(|| Arc::new(TestRecorder::new(capacity)));

        let store = RegistryStore::open(&config.registry_dir)?;
        ensure_stored(&store, &registry)?;
        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.data_dir.join(DataPoint::file_name(&config.project));

        let target = Arc::new(FlushTarget {
            counters,
            recorder,
            registry_version: AtomicU64::new(registry.version()),
            path,
            tests: Mutex::new(Vec::new()),
            last_flush: Mutex::new(Instant::now()),
        });
        let flusher = match config.flush_policy {
            FlushPolicy::Threaded { .. } => config
                .flush_policy
                .interval()
                .map(|every| Flusher::spawn(Arc::clone(&target), every))
                .transpose()?,
            FlushPolicy::Directed | FlushPolicy::Interval { .. } => None,
        };

        info!(project = %config.project, version = registry.version(), slots = capacity,
            per_test = config.per_test, path = %target.path.display(), "coverage session started");

        Ok(Self {
            config,
            registry: RwLock::new(Arc::new(registry)),
            store,
            target,
            flusher: Mutex::new(flusher),
        })
    }

    /// Configuration the session was started with
    #[must_use]
    pub fn config(&self) -> &CoverageConfig {
        &self.config
    }

    /// Active registry version
    #[must_use]
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&read(&self.registry))
    }

    /// Counter store
    #[must_use]
    pub fn counters(&self) -> &Arc<CounterStore> {
        &self.target.counters
    }

    /// Per-test recorder, if enabled
    #[must_use]
    pub fn recorder(&self) -> Option<&Arc<TestRecorder>> {
        self.target.recorder.as_ref()
    }

    /// Hit path to hand to instrumented code
    #[must_use]
    pub fn instrumented(&self) -> Instrumented {
        Instrumented::new(Arc::clone(&self.target.counters), self.target.recorder.clone())
    }

    /// Data point file this session writes
    #[must_use]
    pub fn data_point_path(&self) -> &Path {
        &self.target.path
    }

    /// Record one execution of `slot`
    #[inline]
    pub fn hit(&self, slot: SlotIndex) {
        self.target.counters.increment(slot);
        if let Some(recorder) = &self.target.recorder {
            recorder.touch(slot);
        }
    }

    /// Runner hook: a test started on the calling thread
    ///
    /// Returns `None` when per-test recording is off.
    pub fn test_started(&self, class_name: &str, method_name: &str) -> Option<TestId> {
        self.target
            .recorder
            .as_ref()
            .map(|r| r.start(TestName::new(class_name, method_name)))
    }

    /// Runner hook: a test finished
    pub fn test_finished(&self, id: &TestId, outcome: Outcome) -> Option<TestEntry> {
        self.target.recorder.as_ref()?.end(id, outcome)
    }

    /// Runner hook: a test finished with a failure detail
    pub fn test_finished_with_message(
        &self,
        id: &TestId,
        outcome: Outcome,
        message: &str,
    ) -> Option<TestEntry> {
        self.target
            .recorder
            .as_ref()?
            .end_with_message(id, outcome, Some(message.to_string()))
    }

    /// Write the data point now
    ///
    /// # Errors
    ///
    /// I/O failure writing the file.
    pub fn flush(&self) -> CoverageResult<DataPoint> {
        let point = self.target.flush()?;
        debug!(path = %self.target.path.display(), tests = point.tests.len(), "flushed");
        Ok(point)
    }

    /// Flush if the [`FlushPolicy::Interval`] period has elapsed
    ///
    /// Other policies never flush from here.
    ///
    /// # Errors
    ///
    /// I/O failure writing the file.
    pub fn maybe_flush(&self) -> CoverageResult<Option<DataPoint>> {
        let FlushPolicy::Interval { .. } = self.config.flush_policy else {
            return Ok(None);
        };
        let Some(every) = self.config.flush_policy.interval() else {
            return Ok(None);
        };
        if lock(&self.target.last_flush).elapsed() < every {
            return Ok(None);
        }
        self.flush().map(Some)
    }

    /// Switch to a newer registry version while the process keeps running
    ///
    /// Counters grow to the new slot count; recorded values stay where
    /// they are. Older versions are ignored.
    ///
    /// # Errors
    ///
    /// `Config` for a registry of another project or one that moved slots
    /// of unchanged files (a compacted registry), fatal counter store
    /// errors, or failure storing the new version.
    pub fn reload(&self, registry: Registry) -> CoverageResult<()> {
        if registry.project() != self.config.project {
            return Err(CoverageError::Config {
                message: format!(
                    "cannot reload registry of project {} into session for {}",
                    registry.project(),
                    self.config.project
                ),
            });
        }
        let mut active = write(&self.registry);
        if registry.version() <= active.version() {
            debug!(current = active.version(), offered = registry.version(), "stale reload ignored");
            return Ok(());
        }
        if !registry.preserves_layout_of(&active) {
            return Err(CoverageError::Config {
                message: format!(
                    "registry version {} moves slots in use by version {}; restart the session to switch",
                    registry.version(),
                    active.version()
                ),
            });
        }
        let slots = registry.slot_count() as usize;
        self.target.counters.grow_to(slots)?;
        if let Some(recorder) = &self.target.recorder {
            recorder.set_capacity(slots);
        }
        ensure_stored(&self.store, &registry)?;
        self.target
            .registry_version
            .store(registry.version(), Ordering::Release);
        info!(from = active.version(), to = registry.version(), slots, "registry reloaded");
        *active = Arc::new(registry);
        Ok(())
    }

    /// Stop the flush thread and write the final data point
    ///
    /// # Errors
    ///
    /// I/O failure writing the file.
    pub fn shutdown(self) -> CoverageResult<DataPoint> {
        self.stop_flusher();
        let running = self.target.recorder.as_ref().map_or(0, |r| r.running_count());
        if running > 0 {
            warn!(running, "tests still running at shutdown are not recorded");
        }
        let point = self.flush()?;
        info!(path = %self.target.path.display(), slots = point.counters.len(),
            tests = point.tests.len(), "coverage session finished");
        Ok(point)
    }

    fn stop_flusher(&self) {
        if let Some(flusher) = lock(&self.flusher).take() {
            flusher.stop();
        }
    }
}

impl Drop for CoverageSession {
    fn drop(&mut self) {
        self.stop_flusher();
    }
}

/// Store `registry` unless its file already exists
///
/// Two sessions may both miss the file and save; each save writes its own
/// temp file and renames it into place, so the loser only replaces an
/// identical file.
fn ensure_stored(store: &RegistryStore, registry: &Registry) -> CoverageResult<()> {
    if !store.path_for(registry.project(), registry.version()).exists() {
        let _ = store.save(registry)?;
    }
    Ok(())
}
