//! Tagged values and multifield sequences.
//!
//! A [`Value`] is what a fact or instance slot holds: a single interned
//! atom, a [`Multifield`] sequence of atoms, or an opaque working-memory
//! [`Handle`]. Multifields are flat (never nested) and shared: a subrange
//! is an O(1) view onto the same backing storage, addressed by a begin
//! index and length.

use crate::intern::{AtomId, AtomTable};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// What a working-memory handle designates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum HandleKind {
    /// A fact address.
    Fact,
    /// An instance address.
    Instance,
    /// A host-provided external object.
    External,
}

/// An opaque address-like value: a fact, instance, or external object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Handle {
    pub kind: HandleKind,
    pub index: u64,
}

/// A finite ordered sequence of atoms.
///
/// Cloning and slicing are O(1): the field storage is shared and a
/// multifield is a `(begin, len)` window onto it.
#[derive(Clone, Debug)]
pub struct Multifield {
    fields: Rc<[AtomId]>,
    begin: u32,
    len: u32,
}

impl Multifield {
    /// The empty multifield.
    pub fn empty() -> Self {
        Multifield {
            fields: Rc::from([]),
            begin: 0,
            len: 0,
        }
    }

    /// Builds a multifield owning the given atoms.
    pub fn from_atoms(atoms: Vec<AtomId>) -> Self {
        let len = atoms.len() as u32;
        Multifield {
            fields: Rc::from(atoms),
            begin: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The atoms visible through this window.
    pub fn as_slice(&self) -> &[AtomId] {
        let begin = self.begin as usize;
        &self.fields[begin..begin + self.len as usize]
    }

    pub fn get(&self, index: usize) -> Option<AtomId> {
        self.as_slice().get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = AtomId> + '_ {
        self.as_slice().iter().copied()
    }

    /// O(1) subrange sharing the backing storage.
    ///
    /// # Panics
    ///
    /// Panics if `begin + len` exceeds this multifield's length.
    pub fn sub(&self, begin: usize, len: usize) -> Multifield {
        assert!(begin + len <= self.len(), "multifield subrange out of bounds");
        Multifield {
            fields: Rc::clone(&self.fields),
            begin: self.begin + begin as u32,
            len: len as u32,
        }
    }
}

impl PartialEq for Multifield {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Multifield {}

impl Hash for Multifield {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state);
    }
}

/// A tagged slot value.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Value {
    /// A single interned atom.
    Atom(AtomId),
    /// A multifield sequence, possibly empty.
    Multi(Multifield),
    /// A working-memory or external handle.
    Handle(Handle),
}

impl Value {
    pub fn is_multi(&self) -> bool {
        matches!(self, Value::Multi(_))
    }

    pub fn as_atom(&self) -> Option<AtomId> {
        match self {
            Value::Atom(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_multi(&self) -> Option<&Multifield> {
        match self {
            Value::Multi(mf) => Some(mf),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            Value::Handle(h) => Some(*h),
            _ => None,
        }
    }

    /// Content hash agreeing with [`AtomTable::hash_atom`] for atoms and
    /// combining element hashes for multifields. Used by hashed join
    /// memories and duplicate detection.
    pub fn hash_with(&self, atoms: &AtomTable) -> u64 {
        match self {
            Value::Atom(id) => atoms.hash_atom(*id),
            Value::Multi(mf) => {
                let mut h: u64 = 0x9e37_79b9_7f4a_7c15;
                for atom in mf.iter() {
                    h = h
                        .rotate_left(5)
                        .wrapping_mul(0x100_0000_01b3)
                        ^ atoms.hash_atom(atom);
                }
                h ^ mf.len() as u64
            }
            Value::Handle(h) => {
                let mut hasher = rustc_hash::FxHasher::default();
                h.hash(&mut hasher);
                hasher.finish()
            }
        }
    }

    /// Display adapter resolving atoms through the table.
    pub fn display<'a>(&'a self, atoms: &'a AtomTable) -> DisplayValue<'a> {
        DisplayValue { value: self, atoms }
    }
}

impl From<AtomId> for Value {
    fn from(id: AtomId) -> Self {
        Value::Atom(id)
    }
}

impl From<Multifield> for Value {
    fn from(mf: Multifield) -> Self {
        Value::Multi(mf)
    }
}

/// Ordered comparison of values: atoms via [`AtomTable::compare`],
/// multifields element-wise then by length, mixed shapes with single
/// atoms ordering before multifields and multifields before handles.
pub fn compare_values(atoms: &AtomTable, a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Atom(x), Value::Atom(y)) => atoms.compare(*x, *y),
        (Value::Multi(x), Value::Multi(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                match atoms.compare(ex, ey) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Atom(_), _) => Ordering::Less,
        (_, Value::Atom(_)) => Ordering::Greater,
        (Value::Multi(_), Value::Handle(_)) => Ordering::Less,
        (Value::Handle(_), Value::Multi(_)) => Ordering::Greater,
        (Value::Handle(x), Value::Handle(y)) => (x.kind as u8, x.index).cmp(&(y.kind as u8, y.index)),
    }
}

/// Installs every atom a value references.
pub fn install_value(atoms: &mut AtomTable, value: &Value) {
    match value {
        Value::Atom(id) => atoms.install(*id),
        Value::Multi(mf) => {
            for atom in mf.iter() {
                atoms.install(atom);
            }
        }
        Value::Handle(_) => {}
    }
}

/// Deinstalls every atom a value references.
pub fn deinstall_value(atoms: &mut AtomTable, value: &Value) {
    match value {
        Value::Atom(id) => atoms.deinstall(*id),
        Value::Multi(mf) => {
            for atom in mf.iter() {
                atoms.deinstall(atom);
            }
        }
        Value::Handle(_) => {}
    }
}

/// Borrowed display adapter returned by [`Value::display`].
pub struct DisplayValue<'a> {
    value: &'a Value,
    atoms: &'a AtomTable,
}

impl fmt::Display for DisplayValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Value::Atom(id) => write!(f, "{}", self.atoms.display(*id)),
            Value::Multi(mf) => {
                write!(f, "(")?;
                for (i, atom) in mf.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", self.atoms.display(atom))?;
                }
                write!(f, ")")
            }
            Value::Handle(h) => match h.kind {
                HandleKind::Fact => write!(f, "<Fact-{}>", h.index),
                HandleKind::Instance => write!(f, "<Instance-{}>", h.index),
                HandleKind::External => write!(f, "<External-{}>", h.index),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subrange_is_a_view() {
        let mut atoms = AtomTable::new();
        let ids: Vec<AtomId> = ["a", "b", "c", "d"]
            .iter()
            .map(|s| atoms.intern_symbol(s))
            .collect();
        let mf = Multifield::from_atoms(ids.clone());
        let mid = mf.sub(1, 2);
        assert_eq!(mid.as_slice(), &ids[1..3]);
        let inner = mid.sub(1, 1);
        assert_eq!(inner.as_slice(), &ids[2..3]);
    }

    #[test]
    fn empty_subrange_is_allowed() {
        let mut atoms = AtomTable::new();
        let mf = Multifield::from_atoms(vec![atoms.intern_symbol("x")]);
        assert!(mf.sub(1, 0).is_empty());
        assert!(mf.sub(0, 0).is_empty());
    }

    #[test]
    fn multifield_equality_is_elementwise() {
        let mut atoms = AtomTable::new();
        let a = atoms.intern_symbol("a");
        let b = atoms.intern_symbol("b");
        let one = Multifield::from_atoms(vec![a, b]);
        let two = Multifield::from_atoms(vec![a, b]);
        assert_eq!(one, two);
        assert_eq!(one.sub(0, 1), Multifield::from_atoms(vec![a]));
    }

    #[test]
    fn compare_orders_multifields_lexicographically() {
        let mut atoms = AtomTable::new();
        let one = Value::Multi(Multifield::from_atoms(vec![atoms.integer(1)]));
        let two = Value::Multi(Multifield::from_atoms(vec![atoms.integer(1), atoms.integer(2)]));
        assert_eq!(compare_values(&atoms, &one, &two), Ordering::Less);
    }

    #[test]
    fn install_counts_every_element() {
        let mut atoms = AtomTable::new();
        let a = atoms.intern_symbol("a");
        let v = Value::Multi(Multifield::from_atoms(vec![a, a]));
        install_value(&mut atoms, &v);
        assert_eq!(atoms.use_count(a), 2);
        deinstall_value(&mut atoms, &v);
    }

    #[test]
    fn display_wraps_multifields_in_parens() {
        let mut atoms = AtomTable::new();
        let v = Value::Multi(Multifield::from_atoms(vec![
            atoms.intern_symbol("a"),
            atoms.integer(2),
        ]));
        assert_eq!(v.display(&atoms).to_string(), "(a 2)");
    }
}
