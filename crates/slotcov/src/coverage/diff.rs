//! Registry Structural Diff
//!
//! Maps slots of one registry version onto another so that historical hits
//! follow code that did not structurally change. Elements are matched by
//! `(class, method signature, kind, ordinal)` and method entries by
//! `(class, method signature)`; byte offsets are ignored, so an unrelated edit
//! earlier in a file does not break the mapping.
//!
//! The diff never fails. Anything it cannot match is reported as removed.

use super::registry::{ElementKind, Registry};
use super::{SlotIndex, SlotRange};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Where an old slot ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remapped {
    /// Same element, new slot
    To(SlotIndex),
    /// No counterpart in the new version
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeKey<'a> {
    Method {
        class: &'a str,
        signature: &'a str,
    },
    Element {
        class: &'a str,
        signature: &'a str,
        kind: &'a ElementKind,
        ordinal: u32,
    },
}

/// Slot translation table from one registry version to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRemap {
    from_version: u64,
    to_version: u64,
    table: Vec<Option<u32>>,
}

impl SlotRemap {
    /// A remap that leaves every slot of `registry` where it is
    #[must_use]
    pub fn identity(registry: &Registry) -> Self {
        Self {
            from_version: registry.version(),
            to_version: registry.version(),
            table: (0..registry.slot_count()).map(Some).collect(),
        }
    }

    /// Translate an old slot
    #[must_use]
    pub fn map(&self, old: SlotIndex) -> Remapped {
        match self.table.get(old.as_usize()).copied().flatten() {
            Some(new) => Remapped::To(SlotIndex::new(new)),
            None => Remapped::Removed,
        }
    }

    /// Version the remap reads from
    #[must_use]
    pub fn from_version(&self) -> u64 {
        self.from_version
    }

    /// Version the remap writes to
    #[must_use]
    pub fn to_version(&self) -> u64 {
        self.to_version
    }

    /// Old slots with a counterpart
    #[must_use]
    pub fn mapped_count(&self) -> usize {
        self.table.iter().filter(|s| s.is_some()).count()
    }

    /// Old slots without a counterpart
    #[must_use]
    pub fn removed_count(&self) -> usize {
        self.table.len() - self.mapped_count()
    }
}

/// Computes slot remaps between registry versions
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryDiff;

impl RegistryDiff {
    /// Remap every slot of `old` onto `new`
    #[must_use]
    pub fn between(old: &Registry, new: &Registry) -> SlotRemap {
        let mut table = vec![None; old.slot_count() as usize];

        if old.project() != new.project() {
            warn!(old = %old.project(), new = %new.project(),
                "diff between registries of different projects; every slot treated as removed");
            return SlotRemap {
                from_version: old.version(),
                to_version: new.version(),
                table,
            };
        }

        let mut index: HashMap<NodeKey<'_>, SlotRange> = HashMap::new();
        for (key, range) in nodes(new) {
            let _ = index.entry(key).or_insert(range);
        }

        let mut claimed = HashSet::new();
        for (key, old_range) in nodes(old) {
            let Some(new_range) = index.get(&key) else {
                continue;
            };
            if old_range.len() != new_range.len() || !claimed.insert(key) {
                continue;
            }
            for (from, to) in old_range.iter().zip(new_range.iter()) {
                if let Some(cell) = table.get_mut(from.as_usize()) {
                    *cell = Some(to.as_u32());
                }
            }
        }

        SlotRemap {
            from_version: old.version(),
            to_version: new.version(),
            table,
        }
    }
}

fn nodes(registry: &Registry) -> Vec<(NodeKey<'_>, SlotRange)> {
    let mut out = Vec::new();
    for file in registry.files() {
        for class in &file.classes {
            for method in &class.methods {
                out.push((
                    NodeKey::Method {
                        class: &class.name,
                        signature: &method.signature,
                    },
                    SlotRange::single(method.slot),
                ));
                for element in &method.elements {
                    out.push((
                        NodeKey::Element {
                            class: &class.name,
                            signature: &method.signature,
                            kind: &element.kind,
                            ordinal: element.ordinal,
                        },
                        element.slots,
                    ));
                }
            }
        }
    }
    out
}
