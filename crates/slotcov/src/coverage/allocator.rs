//! Slot Allocator
//!
//! Turns the front-end's ordered element descriptors for one file into a
//! registry fragment with slot assignments. Traversal is depth-first in
//! descriptor order (class → method entry → method elements) so identical
//! input always yields identical slots. Branches take two consecutive slots
//! (true-taken, false-taken); everything else takes one.
//!
//! Allocation is transactional: a file that fails validation consumes no
//! slots, so the allocator can be reused for the next file.

use super::language;
use super::registry::{
    ClassInfo, ElementInfo, ElementKind, FileInfo, MethodInfo, SourceRange,
};
use super::{SlotIndex, SlotRange};
use crate::result::{CoverageError, CoverageResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// One coverable element inside a method, as reported by the front-end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    /// Construct kind
    pub kind: ElementKind,
    /// Byte offsets in the source file
    pub range: SourceRange,
}

impl ElementDescriptor {
    /// A plain statement
    #[must_use]
    pub fn statement(start: u32, end: u32) -> Self {
        Self {
            kind: ElementKind::Statement,
            range: SourceRange::new(start, end),
        }
    }

    /// A two-way branch
    #[must_use]
    pub fn branch(start: u32, end: u32) -> Self {
        Self {
            kind: ElementKind::Branch,
            range: SourceRange::new(start, end),
        }
    }

    /// A language-specific construct
    #[must_use]
    pub fn construct(name: &str, start: u32, end: u32) -> Self {
        Self {
            kind: ElementKind::Construct(name.to_string()),
            range: SourceRange::new(start, end),
        }
    }
}

/// A method and its elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    /// Signature, unique within the enclosing class
    pub signature: String,
    /// Byte offsets of the whole method
    pub range: SourceRange,
    /// Elements in traversal order
    pub elements: Vec<ElementDescriptor>,
}

/// A class and its methods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDescriptor {
    /// Qualified class name
    pub name: String,
    /// Methods in traversal order
    pub methods: Vec<MethodDescriptor>,
}

/// Everything the front-end reports about one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Project-relative path
    pub path: String,
    /// Language name, resolved through [`language::lookup`]
    pub language: String,
    /// Content fingerprint (see [`FileDescriptor::fingerprint_content`])
    pub fingerprint: String,
    /// Source modification time, milliseconds since the epoch
    pub timestamp: i64,
    /// Classes in traversal order
    pub classes: Vec<ClassDescriptor>,
}

impl FileDescriptor {
    /// Hex SHA-256 of the source bytes
    #[must_use]
    pub fn fingerprint_content(content: &[u8]) -> String {
        let digest = Sha256::digest(content);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Slots handed back to the front-end for one file, in descriptor order:
/// for each method its entry slot followed by one range per element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAssignment {
    /// File path
    pub path: String,
    /// Assigned ranges in depth-first descriptor order
    pub slots: Vec<SlotRange>,
}

impl FileAssignment {
    /// Build the assignment view of an allocated file
    #[must_use]
    pub fn of(file: &FileInfo) -> Self {
        let mut slots = Vec::with_capacity(file.element_count());
        for class in &file.classes {
            for method in &class.methods {
                slots.push(SlotRange::single(method.slot));
                slots.extend(method.elements.iter().map(|e| e.slots));
            }
        }
        Self {
            path: file.path.clone(),
            slots,
        }
    }
}

/// Hands out consecutive slots from a caller-supplied base
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    next: u32,
}

impl SlotAllocator {
    /// Start allocating at `base`
    #[must_use]
    pub fn new(base: SlotIndex) -> Self {
        Self {
            next: base.as_u32(),
        }
    }

    /// The slot the next allocation would start at
    #[must_use]
    pub fn next_slot(&self) -> SlotIndex {
        SlotIndex::new(self.next)
    }

    /// Validate and allocate one file
    ///
    /// Returns `MalformedSource` if the descriptors cannot be mapped (nothing
    /// is consumed in that case) and `CapacityExceeded` if the slot space is
    /// exhausted.
    pub fn allocate_file(&mut self, file: &FileDescriptor) -> CoverageResult<FileInfo> {
        validate(file)?;

        let base = self.next;
        let mut cursor = Cursor { next: base };
        let mut classes = Vec::with_capacity(file.classes.len());
        for class in &file.classes {
            let mut methods = Vec::with_capacity(class.methods.len());
            for method in &class.methods {
                let entry = cursor.take(1)?;
                let mut ordinals: HashMap<&ElementKind, u32> = HashMap::new();
                let mut elements = Vec::with_capacity(method.elements.len());
                for element in &method.elements {
                    let ordinal = ordinals.entry(&element.kind).or_insert(0);
                    let slots = SlotRange::new(cursor.take(element.kind.slot_width())?, element.kind.slot_width());
                    elements.push(ElementInfo {
                        kind: element.kind.clone(),
                        slots,
                        range: element.range,
                        ordinal: *ordinal,
                    });
                    *ordinal += 1;
                }
                methods.push(MethodInfo {
                    signature: method.signature.clone(),
                    range: method.range,
                    slot: entry,
                    elements,
                });
            }
            classes.push(ClassInfo {
                name: class.name.clone(),
                methods,
            });
        }

        self.next = cursor.next;
        Ok(FileInfo {
            path: file.path.clone(),
            language: file.language.to_ascii_lowercase(),
            fingerprint: file.fingerprint.clone(),
            timestamp: file.timestamp,
            slots: SlotRange::new(SlotIndex::new(base), cursor.next - base),
            classes,
        })
    }
}

struct Cursor {
    next: u32,
}

impl Cursor {
    fn take(&mut self, width: u32) -> CoverageResult<SlotIndex> {
        let start = self.next;
        self.next = start
            .checked_add(width)
            .ok_or(CoverageError::CapacityExceeded {
                requested: start as usize + width as usize,
                max: u32::MAX as usize,
            })?;
        Ok(SlotIndex::new(start))
    }
}

fn validate(file: &FileDescriptor) -> CoverageResult<()> {
    let path = file.path.as_str();
    if path.trim().is_empty() {
        return Err(CoverageError::malformed(path, "empty path"));
    }
    let lang = language::lookup(&file.language)
        .ok_or_else(|| CoverageError::malformed(path, format!("unknown language '{}'", file.language)))?;

    let mut class_names = HashSet::new();
    for class in &file.classes {
        if class.name.trim().is_empty() {
            return Err(CoverageError::malformed(path, "class with empty name"));
        }
        if !class_names.insert(class.name.as_str()) {
            return Err(CoverageError::malformed(
                path,
                format!("duplicate class '{}'", class.name),
            ));
        }
        let mut signatures = HashSet::new();
        for method in &class.methods {
            if method.signature.trim().is_empty() {
                return Err(CoverageError::malformed(
                    path,
                    format!("method with empty signature in '{}'", class.name),
                ));
            }
            if !signatures.insert(method.signature.as_str()) {
                return Err(CoverageError::malformed(
                    path,
                    format!("duplicate method '{}' in '{}'", method.signature, class.name),
                ));
            }
            if method.range.is_inverted() {
                return Err(CoverageError::malformed(
                    path,
                    format!("inverted range {} for '{}'", method.range, method.signature),
                ));
            }
            for element in &method.elements {
                if element.range.is_inverted() {
                    return Err(CoverageError::malformed(
                        path,
                        format!("inverted element range {} in '{}'", element.range, method.signature),
                    ));
                }
                if !method.range.encloses(element.range) {
                    return Err(CoverageError::malformed(
                        path,
                        format!(
                            "element {} outside method '{}' {}",
                            element.range, method.signature, method.range
                        ),
                    ));
                }
                if let ElementKind::Construct(name) = &element.kind {
                    if !lang.supports_construct(name) {
                        return Err(CoverageError::malformed(
                            path,
                            format!("construct '{name}' is not a {} construct", lang.name),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}
