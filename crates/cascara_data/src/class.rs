//! Classes for instance pattern matching.
//!
//! A class names a node in a single- or multi-inheritance lattice and
//! carries the slot descriptors the matcher sees on its instances. Slot
//! descriptors are resolved across the superclass chain at definition
//! time (nearest definition in precedence order wins), so matching never
//! walks the hierarchy. Each class also keeps its transitive subclass
//! set current, which is what the alpha network discriminates on.

use crate::template::{SlotId, SlotSpec};
use crate::ModuleId;
use cascara_base::{Arena, ArenaId, AtomId};
use rustc_hash::FxHashSet;

/// Stable handle to a defined class.
pub type ClassId = ArenaId<Class>;

#[derive(Debug)]
pub struct Class {
    pub name: AtomId,
    pub module: ModuleId,
    /// Direct superclasses in declaration order.
    pub supers: Vec<ClassId>,
    /// Linearized precedence list, this class first.
    pub precedence: Vec<ClassId>,
    /// Slot descriptors resolved across the precedence list.
    pub slots: Vec<SlotSpec>,
    /// Non-reactive classes do not feed the pattern network.
    pub reactive: bool,
    /// This class plus every transitive subclass.
    pub subclasses: FxHashSet<ClassId>,
}

impl Class {
    pub fn slot(&self, id: SlotId) -> &SlotSpec {
        &self.slots[id.index()]
    }

    pub fn slot_id(&self, name: AtomId) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|s| s.name == name)
            .map(|i| SlotId(i as u16))
    }
}

/// Builds the precedence list for a new class: the class itself, then a
/// depth-first walk of its superclasses, first visit winning.
pub fn linearize(classes: &Arena<Class>, supers: &[ClassId]) -> Vec<ClassId> {
    let mut order = Vec::new();
    let mut seen = FxHashSet::default();
    for &sup in supers {
        visit(classes, sup, &mut order, &mut seen);
    }
    order
}

fn visit(
    classes: &Arena<Class>,
    class: ClassId,
    order: &mut Vec<ClassId>,
    seen: &mut FxHashSet<ClassId>,
) {
    if !seen.insert(class) {
        return;
    }
    order.push(class);
    let supers = classes[class].supers.clone();
    for sup in supers {
        visit(classes, sup, order, seen);
    }
}

/// Resolves the effective slot array for a class.
///
/// Ancestral positions are stable: inherited slots keep the ordinal
/// they had in the superclass (most distant ancestor first), own slots
/// append after, and a shadowing definition replaces the spec in place.
/// A pattern compiled against a superclass therefore addresses
/// instances of its subclasses by the same slot ordinals.
pub fn resolve_slots(
    classes: &Arena<Class>,
    own: &[SlotSpec],
    precedence: &[ClassId],
) -> Vec<SlotSpec> {
    let mut slots: Vec<SlotSpec> = Vec::new();
    for &ancestor in precedence.iter().rev() {
        for inherited in &classes[ancestor].slots {
            match slots.iter_mut().find(|s| s.name == inherited.name) {
                Some(existing) => *existing = inherited.clone(),
                None => slots.push(inherited.clone()),
            }
        }
    }
    for spec in own {
        match slots.iter_mut().find(|s| s.name == spec.name) {
            Some(existing) => *existing = spec.clone(),
            None => slots.push(spec.clone()),
        }
    }
    slots
}

/// Adds `class` to the subclass set of every ancestor.
pub fn register_subclass(classes: &mut Arena<Class>, class: ClassId) {
    let ancestors: Vec<ClassId> = classes[class].precedence.clone();
    classes[class].subclasses.insert(class);
    for ancestor in ancestors {
        classes[ancestor].subclasses.insert(class);
    }
}
