//! Engine-level named globals.
//!
//! Globals are readable from any expression (salience, join predicates,
//! RHS actions) and settable by the host or by actions through the
//! external dispatch. `reset` restores each global to its defining
//! value.

use cascara_base::{deinstall_value, install_value, AtomId, AtomTable, Value};
use cascara_data::{Bindings, FetchDesc};
use rustc_hash::FxHashMap;

#[derive(Default)]
pub struct Globals {
    values: FxHashMap<AtomId, Value>,
    initial: FxHashMap<AtomId, Value>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines (or redefines) a global and its reset value.
    pub fn define(&mut self, atoms: &mut AtomTable, name: AtomId, value: Value) {
        atoms.install(name);
        install_value(atoms, &value);
        install_value(atoms, &value);
        if let Some(old) = self.values.insert(name, value.clone()) {
            deinstall_value(atoms, &old);
            atoms.deinstall(name);
        }
        if let Some(old) = self.initial.insert(name, value) {
            deinstall_value(atoms, &old);
        }
    }

    /// Updates a defined global's current value.
    pub fn set(&mut self, atoms: &mut AtomTable, name: AtomId, value: Value) -> bool {
        match self.values.get_mut(&name) {
            Some(slot) => {
                install_value(atoms, &value);
                let old = std::mem::replace(slot, value);
                deinstall_value(atoms, &old);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: AtomId) -> Option<&Value> {
        self.values.get(&name)
    }

    /// Restores every global to its defining value.
    pub fn reset(&mut self, atoms: &mut AtomTable) {
        for (name, initial) in &self.initial {
            if let Some(slot) = self.values.get_mut(name) {
                install_value(atoms, initial);
                let old = std::mem::replace(slot, initial.clone());
                deinstall_value(atoms, &old);
            }
        }
    }

    pub fn names(&self) -> impl Iterator<Item = AtomId> + '_ {
        self.values.keys().copied()
    }
}

/// Bindings exposing only globals (salience and default expressions).
pub struct GlobalBindings<'a>(pub &'a Globals);

impl Bindings for GlobalBindings<'_> {
    fn fetch(&self, _desc: &FetchDesc) -> Option<Value> {
        None
    }

    fn global(&self, name: AtomId) -> Option<Value> {
        self.0.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_restores_defining_values() {
        let mut atoms = AtomTable::new();
        let mut globals = Globals::new();
        let name = atoms.intern_symbol("*count*");
        let zero = atoms.integer(0);
        globals.define(&mut atoms, name, Value::Atom(zero));
        let five = atoms.integer(5);
        assert!(globals.set(&mut atoms, name, Value::Atom(five)));
        globals.reset(&mut atoms);
        assert_eq!(
            globals.get(name).and_then(|v| v.as_atom()),
            Some(atoms.integer(0))
        );
    }

    #[test]
    fn set_of_undefined_global_fails() {
        let mut atoms = AtomTable::new();
        let mut globals = Globals::new();
        let name = atoms.intern_symbol("*missing*");
        assert!(!globals.set(&mut atoms, name, Value::Atom(cascara_base::NIL_ATOM)));
    }
}
