//! Working memory: fact and instance stores with template/class indices.
//!
//! The store owns the schema registries (templates, classes) and the
//! entity arenas, assigns the global change timestamp, canonicalizes and
//! constraint-checks incoming values, and detects duplicates. It knows
//! nothing about the match network; the kernel layers propagation on top
//! of these primitives, which is why retraction here only *marks* an
//! entity and release is a separate step taken after propagation
//! completes.

use crate::class::{linearize, register_subclass, resolve_slots, Class, ClassId};
use crate::constraint::ConstraintCheck;
use crate::fact::{Fact, FactId};
use crate::instance::{Instance, InstanceId};
use crate::template::{SlotSpec, Template, TemplateId};
use crate::ModuleId;
use cascara_base::{deinstall_value, install_value, AtomId, AtomTable, Value};
use rustc_hash::FxHashMap;
use std::fmt;

/// Errors raised by assert/modify.
#[derive(Clone, PartialEq, Debug)]
pub enum AssertError {
    /// An identical fact exists and duplicates are disabled.
    Duplicate(FactId),
    ConstraintViolation {
        slot: String,
        violation: ConstraintCheck,
    },
    /// A single-field slot received a multifield or vice versa.
    CardinalityMismatch { slot: String },
    /// A slot with no default was not given a value.
    MissingValue { slot: String },
    /// Modify of a read-only slot.
    ReadOnlySlot { slot: String },
    /// An instance name is already in use.
    NameInUse(String),
    /// The target entity is already retracted.
    Gone,
}

impl fmt::Display for AssertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssertError::Duplicate(id) => {
                write!(f, "an identical fact already exists (f-{})", id.index())
            }
            AssertError::ConstraintViolation { slot, violation } => {
                write!(f, "value for slot '{}' violates its constraints ({:?})", slot, violation)
            }
            AssertError::CardinalityMismatch { slot } => {
                write!(f, "slot '{}' received a value of the wrong cardinality", slot)
            }
            AssertError::MissingValue { slot } => {
                write!(f, "slot '{}' has no default and was not given a value", slot)
            }
            AssertError::ReadOnlySlot { slot } => {
                write!(f, "slot '{}' is read-only", slot)
            }
            AssertError::NameInUse(name) => {
                write!(f, "instance name [{}] is already in use", name)
            }
            AssertError::Gone => write!(f, "the target entity has been retracted"),
        }
    }
}

impl std::error::Error for AssertError {}

/// Errors raised when installing templates or classes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DefineError {
    DuplicateName(String),
    /// Removing a schema still referenced by rules or entities.
    InUse(String),
}

impl fmt::Display for DefineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefineError::DuplicateName(name) => {
                write!(f, "a construct named '{}' already exists", name)
            }
            DefineError::InUse(name) => {
                write!(f, "'{}' is still referenced and cannot be removed", name)
            }
        }
    }
}

impl std::error::Error for DefineError {}

/// Facts, instances, and the schemas they are asserted against.
pub struct WorkingMemory {
    pub templates: cascara_base::Arena<Template>,
    template_names: FxHashMap<(ModuleId, AtomId), TemplateId>,
    pub classes: cascara_base::Arena<Class>,
    class_names: FxHashMap<(ModuleId, AtomId), ClassId>,
    pub facts: cascara_base::Arena<Fact>,
    pub instances: cascara_base::Arena<Instance>,
    instance_names: FxHashMap<AtomId, InstanceId>,
    by_template: FxHashMap<TemplateId, Vec<FactId>>,
    by_class: FxHashMap<ClassId, Vec<InstanceId>>,
    dup_index: FxHashMap<u64, Vec<FactId>>,
    next_time: u64,
}

impl WorkingMemory {
    pub fn new() -> Self {
        WorkingMemory {
            templates: cascara_base::Arena::new(),
            template_names: FxHashMap::default(),
            classes: cascara_base::Arena::new(),
            class_names: FxHashMap::default(),
            facts: cascara_base::Arena::new(),
            instances: cascara_base::Arena::new(),
            instance_names: FxHashMap::default(),
            by_template: FxHashMap::default(),
            by_class: FxHashMap::default(),
            dup_index: FxHashMap::default(),
            next_time: 1,
        }
    }

    /// The next change timestamp; strictly increasing across all
    /// asserts and modifies.
    pub fn next_time_tag(&mut self) -> u64 {
        let t = self.next_time;
        self.next_time += 1;
        t
    }

    pub fn current_time(&self) -> u64 {
        self.next_time
    }

    pub fn reset_time(&mut self) {
        self.next_time = 1;
    }

    // ------------------------------------------------------------------
    // Schemas
    // ------------------------------------------------------------------

    /// Installs a template, installing every atom it references.
    pub fn define_template(
        &mut self,
        atoms: &mut AtomTable,
        template: Template,
    ) -> Result<TemplateId, DefineError> {
        let key = (template.module, template.name);
        if self.template_names.contains_key(&key) {
            let name = atoms.text(template.name).unwrap_or_default().to_string();
            return Err(DefineError::DuplicateName(name));
        }
        atoms.install(template.name);
        for slot in &template.slots {
            atoms.install(slot.name);
            for atom in slot.constraint.referenced_atoms() {
                atoms.install(atom);
            }
            if let crate::template::DefaultSpec::Static(value) = &slot.default {
                install_value(atoms, value);
            }
        }
        let id = self.templates.insert(template);
        self.template_names.insert(key, id);
        self.by_template.insert(id, Vec::new());
        Ok(id)
    }

    /// Removes a template with no remaining facts. Network reference
    /// checks are the caller's responsibility.
    pub fn remove_template(
        &mut self,
        atoms: &mut AtomTable,
        id: TemplateId,
    ) -> Result<(), DefineError> {
        let has_facts = self
            .by_template
            .get(&id)
            .is_some_and(|facts| facts.iter().any(|f| !self.facts[*f].garbage));
        if has_facts {
            let name = atoms.text(self.templates[id].name).unwrap_or_default().to_string();
            return Err(DefineError::InUse(name));
        }
        let template = self.templates.remove(id).expect("template is live");
        self.template_names.remove(&(template.module, template.name));
        self.by_template.remove(&id);
        atoms.deinstall(template.name);
        for slot in &template.slots {
            atoms.deinstall(slot.name);
            for atom in slot.constraint.referenced_atoms() {
                atoms.deinstall(atom);
            }
            if let crate::template::DefaultSpec::Static(value) = &slot.default {
                deinstall_value(atoms, value);
            }
        }
        Ok(())
    }

    pub fn template_id(&self, module: ModuleId, name: AtomId) -> Option<TemplateId> {
        self.template_names.get(&(module, name)).copied()
    }

    /// Defines a class, resolving slots across the superclass chain.
    pub fn define_class(
        &mut self,
        atoms: &mut AtomTable,
        name: AtomId,
        module: ModuleId,
        supers: Vec<ClassId>,
        own_slots: Vec<SlotSpec>,
        reactive: bool,
    ) -> Result<ClassId, DefineError> {
        let key = (module, name);
        if self.class_names.contains_key(&key) {
            let text = atoms.text(name).unwrap_or_default().to_string();
            return Err(DefineError::DuplicateName(text));
        }
        let precedence = linearize(&self.classes, &supers);
        let slots = resolve_slots(&self.classes, &own_slots, &precedence);
        atoms.install(name);
        for slot in &slots {
            atoms.install(slot.name);
            for atom in slot.constraint.referenced_atoms() {
                atoms.install(atom);
            }
        }
        let id = self.classes.insert(Class {
            name,
            module,
            supers,
            precedence,
            slots,
            reactive,
            subclasses: Default::default(),
        });
        register_subclass(&mut self.classes, id);
        self.class_names.insert(key, id);
        self.by_class.insert(id, Vec::new());
        Ok(id)
    }

    pub fn class_id(&self, module: ModuleId, name: AtomId) -> Option<ClassId> {
        self.class_names.get(&(module, name)).copied()
    }

    // ------------------------------------------------------------------
    // Facts
    // ------------------------------------------------------------------

    /// Canonicalizes, checks, timestamps, and links a fact.
    ///
    /// `slots` must already be defaulted (one value per template slot);
    /// the engine evaluates dynamic defaults before calling in.
    pub fn assert_fact(
        &mut self,
        atoms: &mut AtomTable,
        template: TemplateId,
        slots: Vec<Value>,
        allow_duplicates: bool,
    ) -> Result<FactId, AssertError> {
        let spec = &self.templates[template];
        debug_assert_eq!(slots.len(), spec.slot_count());
        for (i, value) in slots.iter().enumerate() {
            let slot = &spec.slots[i];
            if slot.multi != value.is_multi() {
                return Err(AssertError::CardinalityMismatch {
                    slot: atoms.text(slot.name).unwrap_or_default().to_string(),
                });
            }
            match slot.constraint.check(atoms, value) {
                ConstraintCheck::Ok => {}
                violation => {
                    return Err(AssertError::ConstraintViolation {
                        slot: atoms.text(slot.name).unwrap_or_default().to_string(),
                        violation,
                    })
                }
            }
        }

        let content_hash = fact_content_hash(atoms, template, &slots);
        if !allow_duplicates {
            if let Some(candidates) = self.dup_index.get(&content_hash) {
                for &candidate in candidates {
                    let existing = &self.facts[candidate];
                    if !existing.garbage
                        && existing.template == template
                        && existing.slots == slots
                    {
                        return Err(AssertError::Duplicate(candidate));
                    }
                }
            }
        }

        for value in &slots {
            install_value(atoms, value);
        }
        let time_tag = self.next_time_tag();
        let id = self.facts.insert(Fact {
            template,
            slots,
            time_tag,
            garbage: false,
            basis: None,
            busy: 0,
            content_hash,
        });
        self.by_template.entry(template).or_default().push(id);
        self.dup_index.entry(content_hash).or_default().push(id);
        Ok(id)
    }

    /// Marks a fact retracted and unlinks it from duplicate detection.
    /// Storage is released separately, after propagation.
    pub fn retract_fact(&mut self, id: FactId) -> Result<(), AssertError> {
        let fact = self.facts.get_mut(id).ok_or(AssertError::Gone)?;
        if fact.garbage {
            return Err(AssertError::Gone);
        }
        fact.garbage = true;
        let hash = fact.content_hash;
        if let Some(bucket) = self.dup_index.get_mut(&hash) {
            bucket.retain(|f| *f != id);
            if bucket.is_empty() {
                self.dup_index.remove(&hash);
            }
        }
        Ok(())
    }

    /// Frees a retracted fact once nothing references it.
    pub fn release_fact(&mut self, atoms: &mut AtomTable, id: FactId) {
        let fact = match self.facts.get(id) {
            Some(f) => f,
            None => return,
        };
        debug_assert!(fact.garbage && fact.busy == 0);
        let fact = self.facts.remove(id).expect("fact is live");
        if let Some(bucket) = self.by_template.get_mut(&fact.template) {
            bucket.retain(|f| *f != id);
        }
        for value in &fact.slots {
            deinstall_value(atoms, value);
        }
        if let Some(basis) = &fact.basis {
            for value in basis {
                deinstall_value(atoms, value);
            }
        }
    }

    /// Live (non-garbage) facts of a template, in assertion order.
    pub fn facts_of_template(&self, template: TemplateId) -> impl Iterator<Item = FactId> + '_ {
        self.by_template
            .get(&template)
            .into_iter()
            .flatten()
            .copied()
            .filter(move |id| !self.facts[*id].garbage)
    }

    /// Every live fact, in assertion (time tag) order.
    pub fn all_facts(&self) -> Vec<FactId> {
        let mut out: Vec<FactId> = self
            .facts
            .iter()
            .filter(|(_, f)| !f.garbage)
            .map(|(id, _)| id)
            .collect();
        out.sort_by_key(|id| self.facts[*id].time_tag);
        out
    }

    /// Looks up a live fact by its external number.
    pub fn fact_by_number(&self, number: usize) -> Option<FactId> {
        let id = FactId::from_index(number);
        match self.facts.get(id) {
            Some(fact) if !fact.garbage => Some(id),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Creates an instance with a unique name.
    pub fn make_instance(
        &mut self,
        atoms: &mut AtomTable,
        name: AtomId,
        class: ClassId,
        slots: Vec<Value>,
    ) -> Result<InstanceId, AssertError> {
        if self.instance_names.contains_key(&name) {
            return Err(AssertError::NameInUse(
                atoms.text(name).unwrap_or_default().to_string(),
            ));
        }
        let spec = &self.classes[class];
        debug_assert_eq!(slots.len(), spec.slots.len());
        for (i, value) in slots.iter().enumerate() {
            let slot = &spec.slots[i];
            if slot.multi != value.is_multi() {
                return Err(AssertError::CardinalityMismatch {
                    slot: atoms.text(slot.name).unwrap_or_default().to_string(),
                });
            }
            match slot.constraint.check(atoms, value) {
                ConstraintCheck::Ok => {}
                violation => {
                    return Err(AssertError::ConstraintViolation {
                        slot: atoms.text(slot.name).unwrap_or_default().to_string(),
                        violation,
                    })
                }
            }
        }
        atoms.install(name);
        for value in &slots {
            install_value(atoms, value);
        }
        let time_tag = self.next_time_tag();
        let id = self.instances.insert(Instance {
            name,
            class,
            slots,
            time_tag,
            garbage: false,
            basis: None,
            busy: 0,
        });
        self.instance_names.insert(name, id);
        self.by_class.entry(class).or_default().push(id);
        Ok(id)
    }

    pub fn retract_instance(&mut self, id: InstanceId) -> Result<(), AssertError> {
        let instance = self.instances.get_mut(id).ok_or(AssertError::Gone)?;
        if instance.garbage {
            return Err(AssertError::Gone);
        }
        instance.garbage = true;
        let name = instance.name;
        self.instance_names.remove(&name);
        Ok(())
    }

    pub fn release_instance(&mut self, atoms: &mut AtomTable, id: InstanceId) {
        let instance = match self.instances.get(id) {
            Some(i) => i,
            None => return,
        };
        debug_assert!(instance.garbage && instance.busy == 0);
        let instance = self.instances.remove(id).expect("instance is live");
        if let Some(bucket) = self.by_class.get_mut(&instance.class) {
            bucket.retain(|i| *i != id);
        }
        atoms.deinstall(instance.name);
        for value in &instance.slots {
            deinstall_value(atoms, value);
        }
        if let Some(basis) = &instance.basis {
            for value in basis {
                deinstall_value(atoms, value);
            }
        }
    }

    pub fn instance_by_name(&self, name: AtomId) -> Option<InstanceId> {
        self.instance_names.get(&name).copied()
    }

    /// Live instances of a class, subclasses included.
    pub fn instances_of_class(&self, class: ClassId) -> Vec<InstanceId> {
        let mut out = Vec::new();
        let subclasses = &self.classes[class].subclasses;
        let mut members: Vec<ClassId> = subclasses.iter().copied().collect();
        members.sort();
        for member in members {
            if let Some(bucket) = self.by_class.get(&member) {
                out.extend(bucket.iter().copied().filter(|i| !self.instances[*i].garbage));
            }
        }
        out
    }

    /// True when no live facts or instances remain.
    pub fn is_empty(&self) -> bool {
        self.facts.iter().all(|(_, f)| f.garbage)
            && self.instances.iter().all(|(_, i)| i.garbage)
    }
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// Content hash over (template, slot values) for duplicate detection.
pub fn fact_content_hash(atoms: &AtomTable, template: TemplateId, slots: &[Value]) -> u64 {
    let mut h = template.index() as u64 ^ 0xc3a5_c85c_97cb_3127;
    for value in slots {
        h = h.rotate_left(7) ^ value.hash_with(atoms);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::SlotSpec;

    fn point_template(atoms: &mut AtomTable, wm: &mut WorkingMemory) -> TemplateId {
        let name = atoms.intern_symbol("point");
        let x = atoms.intern_symbol("x");
        let y = atoms.intern_symbol("y");
        let t = Template::new(name, ModuleId(0), vec![SlotSpec::single(x), SlotSpec::single(y)]);
        wm.define_template(atoms, t).unwrap()
    }

    #[test]
    fn duplicate_assert_is_rejected() {
        let mut atoms = AtomTable::new();
        let mut wm = WorkingMemory::new();
        let t = point_template(&mut atoms, &mut wm);
        let slots = vec![
            Value::Atom(atoms.integer(1)),
            Value::Atom(atoms.integer(2)),
        ];
        let first = wm.assert_fact(&mut atoms, t, slots.clone(), false).unwrap();
        let err = wm.assert_fact(&mut atoms, t, slots, false).unwrap_err();
        assert_eq!(err, AssertError::Duplicate(first));
    }

    #[test]
    fn duplicates_allowed_when_enabled() {
        let mut atoms = AtomTable::new();
        let mut wm = WorkingMemory::new();
        let t = point_template(&mut atoms, &mut wm);
        let slots = vec![
            Value::Atom(atoms.integer(1)),
            Value::Atom(atoms.integer(2)),
        ];
        let a = wm.assert_fact(&mut atoms, t, slots.clone(), true).unwrap();
        let b = wm.assert_fact(&mut atoms, t, slots, true).unwrap();
        assert_ne!(a, b);
        assert_eq!(wm.facts_of_template(t).count(), 2);
    }

    #[test]
    fn retract_then_assert_is_not_a_duplicate() {
        let mut atoms = AtomTable::new();
        let mut wm = WorkingMemory::new();
        let t = point_template(&mut atoms, &mut wm);
        let slots = vec![
            Value::Atom(atoms.integer(1)),
            Value::Atom(atoms.integer(2)),
        ];
        let first = wm.assert_fact(&mut atoms, t, slots.clone(), false).unwrap();
        wm.retract_fact(first).unwrap();
        wm.release_fact(&mut atoms, first);
        assert!(wm.assert_fact(&mut atoms, t, slots, false).is_ok());
    }

    #[test]
    fn time_tags_increase_monotonically() {
        let mut atoms = AtomTable::new();
        let mut wm = WorkingMemory::new();
        let t = point_template(&mut atoms, &mut wm);
        let one = atoms.integer(1);
        let a = wm
            .assert_fact(&mut atoms, t, vec![
                Value::Atom(one),
                Value::Atom(one),
            ], false)
            .unwrap();
        let two = atoms.integer(2);
        let b = wm
            .assert_fact(&mut atoms, t, vec![
                Value::Atom(two),
                Value::Atom(two),
            ], false)
            .unwrap();
        assert!(wm.facts[a].time_tag < wm.facts[b].time_tag);
    }

    #[test]
    fn release_restores_atom_counts() {
        let mut atoms = AtomTable::new();
        let mut wm = WorkingMemory::new();
        let t = point_template(&mut atoms, &mut wm);
        let live_before = atoms.live_count();
        let v = atoms.integer(777);
        let id = wm
            .assert_fact(&mut atoms, t, vec![
                Value::Atom(v),
                Value::Atom(v),
            ], false)
            .unwrap();
        wm.retract_fact(id).unwrap();
        wm.release_fact(&mut atoms, id);
        assert_eq!(atoms.live_count(), live_before);
    }

    #[test]
    fn constraint_violation_names_the_slot() {
        let mut atoms = AtomTable::new();
        let mut wm = WorkingMemory::new();
        let name = atoms.intern_symbol("reading");
        let temp = atoms.intern_symbol("celsius");
        let slot = SlotSpec::single(temp).with_constraint(crate::constraint::ConstraintRecord::of_types(
            crate::constraint::TypeMask::NUMBER,
        ));
        let t = wm
            .define_template(&mut atoms, Template::new(name, ModuleId(0), vec![slot]))
            .unwrap();
        let bad = vec![Value::Atom(atoms.intern_symbol("hot"))];
        match wm.assert_fact(&mut atoms, t, bad, false) {
            Err(AssertError::ConstraintViolation { slot, .. }) => assert_eq!(slot, "celsius"),
            other => panic!("expected constraint violation, got {:?}", other),
        }
    }
}
