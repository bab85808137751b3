//! Coverage Registry
//!
//! The versioned structural model of a project: files own classes, classes
//! own methods, methods own statements, branches and language constructs.
//! Every node that carries a counter records its slot (or slot pair for a
//! branch) and its source offsets.
//!
//! A registry value is immutable once built. [`Registry::apply`] produces
//! the next version from an instrumentation session, so older versions can
//! be kept around for structural diffing.

use super::allocator::{FileAssignment, FileDescriptor, SlotAllocator};
use super::{SlotIndex, SlotRange};
use crate::result::{CoverageError, CoverageResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};

/// Half-open byte range `[start, end)` in a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRange {
    /// First byte
    pub start: u32,
    /// One past the last byte
    pub end: u32,
}

impl SourceRange {
    /// Create a new range
    #[must_use]
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Whether `start > end`
    #[must_use]
    pub const fn is_inverted(self) -> bool {
        self.start > self.end
    }

    /// Whether `inner` lies entirely within this range
    #[must_use]
    pub const fn encloses(self, inner: SourceRange) -> bool {
        inner.start >= self.start && inner.end <= self.end
    }
}

impl fmt::Display for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Kind tag for a coverable element below method level
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementKind {
    /// An executable statement
    Statement,
    /// A two-way branch (true-taken / false-taken)
    Branch,
    /// A language-specific construct, named as in the language table
    Construct(String),
}

impl ElementKind {
    /// Number of slots an element of this kind occupies
    #[must_use]
    pub const fn slot_width(&self) -> u32 {
        match self {
            Self::Branch => 2,
            Self::Statement | Self::Construct(_) => 1,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Statement => f.write_str("statement"),
            Self::Branch => f.write_str("branch"),
            Self::Construct(name) => write!(f, "construct:{name}"),
        }
    }
}

/// A statement, branch or construct with its slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInfo {
    /// Kind tag
    pub kind: ElementKind,
    /// Assigned slots (two for branches)
    pub slots: SlotRange,
    /// Source offsets
    pub range: SourceRange,
    /// Position among same-kind siblings in the enclosing method
    pub ordinal: u32,
}

/// A method with its entry slot and elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInfo {
    /// Signature, unique within the class
    pub signature: String,
    /// Source offsets
    pub range: SourceRange,
    /// Method entry counter
    pub slot: SlotIndex,
    /// Elements in traversal order
    pub elements: Vec<ElementInfo>,
}

impl MethodInfo {
    /// Every slot owned by the method, entry first
    pub fn slots(&self) -> impl Iterator<Item = SlotIndex> + '_ {
        std::iter::once(self.slot).chain(self.elements.iter().flat_map(|e| e.slots.iter()))
    }
}

/// A class and its methods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassInfo {
    /// Qualified name
    pub name: String,
    /// Methods in traversal order
    pub methods: Vec<MethodInfo>,
}

impl ClassInfo {
    /// Find a method by signature
    #[must_use]
    pub fn method(&self, signature: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.signature == signature)
    }
}

/// One instrumented source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Project-relative path (unique key)
    pub path: String,
    /// Language name
    pub language: String,
    /// Content fingerprint at instrumentation time
    pub fingerprint: String,
    /// Source modification time, ms since the epoch
    pub timestamp: i64,
    /// Contiguous slot block owned by this file
    pub slots: SlotRange,
    /// Classes in traversal order
    pub classes: Vec<ClassInfo>,
}

impl FileInfo {
    /// Find a class by name
    #[must_use]
    pub fn class(&self, name: &str) -> Option<&ClassInfo> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Number of slot-owning nodes (methods plus elements)
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.classes
            .iter()
            .flat_map(|c| &c.methods)
            .map(|m| 1 + m.elements.len())
            .sum()
    }

    /// Copy with the whole block shifted to start at `base`
    fn relocated(&self, base: SlotIndex) -> Self {
        let from = self.slots.start().as_u32();
        let shift = |slot: SlotIndex| SlotIndex::new(slot.as_u32() - from + base.as_u32());
        let mut moved = self.clone();
        moved.slots = SlotRange::new(base, self.slots.len());
        for method in moved.classes.iter_mut().flat_map(|c| c.methods.iter_mut()) {
            method.slot = shift(method.slot);
            for element in &mut method.elements {
                element.slots = SlotRange::new(shift(element.slots.start()), element.slots.len());
            }
        }
        moved
    }
}

fn duplicate_paths(upserts: &[FileDescriptor]) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    upserts
        .iter()
        .filter(|d| !seen.insert(d.path.as_str()))
        .map(|d| d.path.clone())
        .collect()
}

/// The nodes that own a slot, as found by [`Registry::locate`]
#[derive(Debug, Clone, Copy)]
pub struct SlotOwner<'a> {
    /// Enclosing file
    pub file: &'a FileInfo,
    /// Enclosing class
    pub class: &'a ClassInfo,
    /// Enclosing method
    pub method: &'a MethodInfo,
    /// The element, or `None` if the slot is the method entry counter
    pub element: Option<&'a ElementInfo>,
}

/// Changes reported by the front-end for one instrumentation pass
#[derive(Debug, Clone, Default)]
pub struct InstrumentationSession {
    /// New or possibly changed files
    pub upserts: Vec<FileDescriptor>,
    /// Paths of files that no longer exist
    pub removals: Vec<String>,
}

impl InstrumentationSession {
    /// Create an empty session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file to (re-)instrument
    #[must_use]
    pub fn upsert(mut self, file: FileDescriptor) -> Self {
        self.upserts.push(file);
        self
    }

    /// Mark a file as deleted
    #[must_use]
    pub fn remove(mut self, path: &str) -> Self {
        self.removals.push(path.to_string());
        self
    }
}

/// A file left out of a registry version because it could not be mapped
#[derive(Debug)]
pub struct ExcludedFile {
    /// File path
    pub path: String,
    /// Why it was excluded
    pub error: CoverageError,
}

/// Result of applying an instrumentation session
#[derive(Debug)]
pub struct ApplyOutcome {
    /// The resulting registry (same version if nothing changed)
    pub registry: Registry,
    /// Slot assignments for every accepted upsert, in input order
    pub assignments: Vec<FileAssignment>,
    /// Files excluded from this version
    pub excluded: Vec<ExcludedFile>,
}

/// Versioned structural model of one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    project: String,
    version: u64,
    slot_count: u32,
    files: BTreeMap<String, FileInfo>,
}

impl Registry {
    /// Create an empty registry at version 0
    #[must_use]
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            version: 0,
            slot_count: 0,
            files: BTreeMap::new(),
        }
    }

    /// Project identity
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Logical clock, bumped on every structural change
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Total slots in this version, including slots retired by edits
    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Look up a file by path
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&FileInfo> {
        self.files.get(path)
    }

    /// All files ordered by path
    pub fn files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values()
    }

    /// Number of files
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Number of slot-owning nodes across the project
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.files.values().map(FileInfo::element_count).sum()
    }

    /// Find a class anywhere in the project
    #[must_use]
    pub fn class(&self, name: &str) -> Option<(&FileInfo, &ClassInfo)> {
        self.files
            .values()
            .find_map(|f| f.class(name).map(|c| (f, c)))
    }

    /// Produce the next registry version from an instrumentation session
    ///
    /// Unchanged files (same fingerprint and language) keep their slots.
    /// New and changed files are allocated at the current high-water mark in
    /// path order, so the result does not depend on submission order and
    /// slots of other files never move. Malformed files are excluded and any
    /// previous version of them is retained; a path submitted more than once
    /// counts as malformed. The version is bumped once if anything changed.
    ///
    /// # Errors
    ///
    /// Only fatal errors are returned: slot space exhaustion, or a
    /// duplicate slot detected by the post-apply validation.
    pub fn apply(&self, session: InstrumentationSession) -> CoverageResult<ApplyOutcome> {
        let mut files = self.files.clone();
        let mut next = SlotIndex::new(self.slot_count);
        let mut changed = false;
        let mut excluded = Vec::new();
        let duplicates = duplicate_paths(&session.upserts);
        let mut upserts: Vec<(usize, FileDescriptor)> = session.upserts.into_iter().enumerate().collect();
        upserts.sort_by(|(_, a), (_, b)| a.path.cmp(&b.path));
        let mut accepted: Vec<Option<FileAssignment>> = upserts.iter().map(|_| None).collect();

        for path in &session.removals {
            if files.remove(path).is_some() {
                debug!(project = %self.project, path = %path, "file removed from registry");
                changed = true;
            }
        }

        for (input_pos, descriptor) in upserts {
            let duplicate = duplicates.contains(descriptor.path.as_str());
            if let Some(existing) = files.get(&descriptor.path).filter(|_| !duplicate) {
                if existing.fingerprint == descriptor.fingerprint
                    && existing.language.eq_ignore_ascii_case(&descriptor.language)
                {
                    accepted[input_pos] = Some(FileAssignment::of(existing));
                    continue;
                }
            }

            let mut allocator = SlotAllocator::new(next);
            let allocated = if duplicate {
                Err(CoverageError::malformed(
                    &descriptor.path,
                    "path submitted more than once in one session",
                ))
            } else {
                allocator.allocate_file(&descriptor)
            };
            match allocated {
                Ok(info) => {
                    next = allocator.next_slot();
                    accepted[input_pos] = Some(FileAssignment::of(&info));
                    let _ = files.insert(info.path.clone(), info);
                    changed = true;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(project = %self.project, path = %descriptor.path, error = %err,
                        "file excluded from registry version");
                    excluded.push(ExcludedFile {
                        path: descriptor.path,
                        error: err,
                    });
                }
            }
        }

        let registry = Self {
            project: self.project.clone(),
            version: if changed { self.version + 1 } else { self.version },
            slot_count: next.as_u32(),
            files,
        };
        registry.validate()?;
        if changed {
            debug!(project = %registry.project, version = registry.version,
                slots = registry.slot_count, "registry version bumped");
        }

        Ok(ApplyOutcome {
            registry,
            assignments: accepted.into_iter().flatten().collect(),
            excluded,
        })
    }

    /// Slots below [`Registry::slot_count`] that no file owns any more
    ///
    /// Every edit of a file retires its previous block, so this only grows
    /// until [`Registry::compact`] is run.
    #[must_use]
    pub fn retired_slots(&self) -> u32 {
        let owned: u32 = self.files.values().map(|f| f.slots.len()).sum();
        self.slot_count.saturating_sub(owned)
    }

    /// Renumber every file from slot 0 in path order, dropping retired slots
    ///
    /// The structure is untouched, so a [`RegistryDiff`](super::RegistryDiff)
    /// from an older version maps every live slot across and historical data
    /// still merges. A running session cannot switch to the result (see
    /// [`Registry::preserves_layout_of`]). Returns the registry unchanged if
    /// nothing is retired.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` if the renumbered registry does not validate.
    pub fn compact(&self) -> CoverageResult<Self> {
        let retired = self.retired_slots();
        if retired == 0 {
            return Ok(self.clone());
        }
        let mut next = 0u32;
        let files = self
            .files
            .iter()
            .map(|(path, file)| {
                let moved = file.relocated(SlotIndex::new(next));
                next = moved.slots.end();
                (path.clone(), moved)
            })
            .collect();
        let registry = Self {
            project: self.project.clone(),
            version: self.version + 1,
            slot_count: next,
            files,
        };
        registry.validate()?;
        debug!(project = %registry.project, version = registry.version, retired,
            slots = registry.slot_count, "registry compacted");
        Ok(registry)
    }

    /// Whether every slot a process using `older` may hit still means the
    /// same thing here: the slot space did not shrink and every file with an
    /// unchanged fingerprint kept its block
    #[must_use]
    pub fn preserves_layout_of(&self, older: &Registry) -> bool {
        self.slot_count >= older.slot_count
            && older.files.values().all(|old| {
                self.files
                    .get(&old.path)
                    .filter(|new| new.fingerprint == old.fingerprint)
                    .map_or(true, |new| new.slots == old.slots)
            })
    }

    /// Check that no slot is owned twice and every slot is below `slot_count`
    pub fn validate(&self) -> CoverageResult<()> {
        let mut ranges: Vec<(SlotRange, &str)> = Vec::new();
        for file in self.files.values() {
            if file.slots.end() > self.slot_count {
                return Err(CoverageError::InvariantViolation {
                    message: format!(
                        "file {} owns {} beyond slot count {}",
                        file.path, file.slots, self.slot_count
                    ),
                });
            }
            for class in &file.classes {
                for method in &class.methods {
                    let owned = std::iter::once(SlotRange::single(method.slot))
                        .chain(method.elements.iter().map(|e| e.slots));
                    for range in owned {
                        if range.start().as_u32() < file.slots.start().as_u32()
                            || range.end() > file.slots.end()
                        {
                            return Err(CoverageError::InvariantViolation {
                                message: format!(
                                    "{} in {} lies outside file block {}",
                                    range, file.path, file.slots
                                ),
                            });
                        }
                        ranges.push((range, file.path.as_str()));
                    }
                }
            }
        }
        ranges.sort_by_key(|(r, _)| r.start());
        for pair in ranges.windows(2) {
            let (a, a_path) = pair[0];
            let (b, b_path) = pair[1];
            if b.start().as_u32() < a.end() {
                return Err(CoverageError::InvariantViolation {
                    message: format!(
                        "duplicate slot assignment: {a} ({a_path}) overlaps {b} ({b_path}) in version {}",
                        self.version
                    ),
                });
            }
        }
        Ok(())
    }

    /// Find the file, class, method and element owning `slot`
    #[must_use]
    pub fn locate(&self, slot: SlotIndex) -> Option<SlotOwner<'_>> {
        let file = self.files.values().find(|f| f.slots.contains(slot))?;
        for class in &file.classes {
            for method in &class.methods {
                if method.slot == slot {
                    return Some(SlotOwner {
                        file,
                        class,
                        method,
                        element: None,
                    });
                }
                if let Some(element) = method.elements.iter().find(|e| e.slots.contains(slot)) {
                    return Some(SlotOwner {
                        file,
                        class,
                        method,
                        element: Some(element),
                    });
                }
            }
        }
        None
    }
}
