//! Fact templates.
//!
//! A [`Template`] is the named schema a fact is asserted against: an
//! ordered list of slots, each carrying a name, cardinality, constraint
//! record, default, and access facet. "Ordered" facts use an implied
//! template with a single multifield slot holding the whole field list.

use crate::constraint::ConstraintRecord;
use crate::expr::Expr;
use crate::ModuleId;
use cascara_base::{AtomId, AtomTable, Value};

/// Ordinal slot position within one template or class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SlotId(pub u16);

impl SlotId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The slot position of an implied (ordered) template's field list.
pub const IMPLIED_SLOT: SlotId = SlotId(0);

/// How a slot obtains a value when the assert omits it.
#[derive(Clone, Debug)]
pub enum DefaultSpec {
    /// Omission is an error.
    None,
    /// A fixed value evaluated once at definition.
    Static(Value),
    /// An expression evaluated at each assert.
    Dynamic(Expr),
}

/// Write access facet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotAccess {
    ReadWrite,
    /// The slot can be initialized but not modified.
    ReadOnly,
}

/// One slot's schema.
#[derive(Clone, Debug)]
pub struct SlotSpec {
    pub name: AtomId,
    pub multi: bool,
    pub constraint: ConstraintRecord,
    pub default: DefaultSpec,
    pub access: SlotAccess,
}

impl SlotSpec {
    /// A single-field slot accepting anything, defaulting to `nil`.
    pub fn single(name: AtomId) -> Self {
        SlotSpec {
            name,
            multi: false,
            constraint: ConstraintRecord::any_single(),
            default: DefaultSpec::Static(Value::Atom(cascara_base::NIL_ATOM)),
            access: SlotAccess::ReadWrite,
        }
    }

    /// A multifield slot accepting anything, defaulting to empty.
    pub fn multi(name: AtomId) -> Self {
        SlotSpec {
            name,
            multi: true,
            constraint: ConstraintRecord::any_multi(),
            default: DefaultSpec::Static(Value::Multi(cascara_base::Multifield::empty())),
            access: SlotAccess::ReadWrite,
        }
    }

    pub fn with_constraint(mut self, constraint: ConstraintRecord) -> Self {
        self.constraint = constraint;
        self
    }

    pub fn with_default(mut self, default: DefaultSpec) -> Self {
        self.default = default;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.access = SlotAccess::ReadOnly;
        self
    }
}

/// A named fact schema.
#[derive(Clone, Debug)]
pub struct Template {
    pub name: AtomId,
    pub module: ModuleId,
    pub slots: Vec<SlotSpec>,
    /// True for ordered templates with the one implicit multifield slot.
    pub implied: bool,
}

/// Stable handle to an installed template.
pub type TemplateId = cascara_base::ArenaId<Template>;

impl Template {
    /// A deftemplate-style schema with explicit slots.
    pub fn new(name: AtomId, module: ModuleId, slots: Vec<SlotSpec>) -> Self {
        Template {
            name,
            module,
            slots,
            implied: false,
        }
    }

    /// The implied schema for ordered facts: one unbounded multifield slot.
    pub fn ordered(atoms: &mut AtomTable, name: AtomId, module: ModuleId) -> Self {
        let implied_name = atoms.intern_symbol("__fields");
        let constraint = ConstraintRecord::any_multi();
        Template {
            name,
            module,
            slots: vec![SlotSpec {
                name: implied_name,
                multi: true,
                constraint,
                default: DefaultSpec::Static(Value::Multi(cascara_base::Multifield::empty())),
                access: SlotAccess::ReadWrite,
            }],
            implied: true,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, id: SlotId) -> &SlotSpec {
        &self.slots[id.index()]
    }

    /// Looks a slot up by name atom.
    pub fn slot_id(&self, name: AtomId) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|s| s.name == name)
            .map(|i| SlotId(i as u16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_lookup_by_name() {
        let mut atoms = AtomTable::new();
        let name = atoms.intern_symbol("point");
        let x = atoms.intern_symbol("x");
        let y = atoms.intern_symbol("y");
        let t = Template::new(
            name,
            ModuleId(0),
            vec![SlotSpec::single(x), SlotSpec::single(y)],
        );
        assert_eq!(t.slot_id(x), Some(SlotId(0)));
        assert_eq!(t.slot_id(y), Some(SlotId(1)));
        assert_eq!(t.slot_id(name), None);
    }

    #[test]
    fn ordered_template_has_one_implied_multislot() {
        let mut atoms = AtomTable::new();
        let name = atoms.intern_symbol("signal");
        let t = Template::ordered(&mut atoms, name, ModuleId(0));
        assert!(t.implied);
        assert_eq!(t.slot_count(), 1);
        assert!(t.slot(IMPLIED_SLOT).multi);
    }
}
