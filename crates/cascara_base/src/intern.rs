//! Interned, reference-counted atoms.
//!
//! Every primitive value that flows through the match network is an atom:
//! a symbol, string, instance name, integer, or float stored exactly once
//! in an [`AtomTable`] and addressed by a lightweight [`AtomId`] handle.
//! Two atoms are equal iff their handles are equal, so equality checks are
//! O(1) regardless of content.
//!
//! ## Reference counting
//!
//! Atoms are use-counted. Everything that stores an atom durably (a fact
//! slot, an alpha memory, a compiled rule constant) calls [`AtomTable::install`]
//! on store and [`AtomTable::deinstall`] on drop. When the count reaches
//! zero the slot is recycled and the content may be reused for a different
//! atom later. The handful of atoms the engine itself needs (`TRUE`,
//! `FALSE`, `nil`, the empty symbol) are permanent and never expire.
//!
//! ## Example
//!
//! ```
//! use cascara_base::{AtomTable, AtomKind};
//!
//! let mut atoms = AtomTable::new();
//!
//! let a = atoms.intern_symbol("red");
//! let b = atoms.intern_symbol("red");
//! assert_eq!(a, b);
//!
//! let n = atoms.integer(42);
//! assert_eq!(atoms.kind(n), AtomKind::Integer);
//! assert_eq!(atoms.as_integer(n), Some(42));
//! ```

use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A lightweight handle to an interned atom.
///
/// Handles are `Copy` and compare in O(1). Identity equality after
/// interning: the same content always yields the same handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct AtomId(u32);

impl AtomId {
    /// Returns the internal index of this atom.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The empty symbol, always interned at index 0.
pub const EMPTY_SYMBOL: AtomId = AtomId(0);
/// The boolean truth symbol `TRUE`.
pub const TRUE_ATOM: AtomId = AtomId(1);
/// The boolean falsity symbol `FALSE`.
pub const FALSE_ATOM: AtomId = AtomId(2);
/// The distinguished symbol `nil`.
pub const NIL_ATOM: AtomId = AtomId(3);

/// The primitive tag of an atom.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AtomKind {
    Symbol,
    Str,
    InstanceName,
    Integer,
    Float,
}

impl AtomKind {
    /// True for integer and float atoms.
    pub fn is_numeric(self) -> bool {
        matches!(self, AtomKind::Integer | AtomKind::Float)
    }

    fn rank(self) -> u8 {
        match self {
            AtomKind::Integer => 0,
            AtomKind::Float => 1,
            AtomKind::Symbol => 2,
            AtomKind::Str => 3,
            AtomKind::InstanceName => 4,
        }
    }
}

#[derive(Clone, Debug)]
enum AtomData {
    Symbol(Box<str>),
    Str(Box<str>),
    InstanceName(Box<str>),
    Integer(i64),
    Float(f64),
}

impl AtomData {
    fn kind(&self) -> AtomKind {
        match self {
            AtomData::Symbol(_) => AtomKind::Symbol,
            AtomData::Str(_) => AtomKind::Str,
            AtomData::InstanceName(_) => AtomKind::InstanceName,
            AtomData::Integer(_) => AtomKind::Integer,
            AtomData::Float(_) => AtomKind::Float,
        }
    }
}

#[derive(Debug)]
struct AtomEntry {
    data: AtomData,
    uses: u32,
    permanent: bool,
}

/// The interning table for all primitive values.
///
/// Symbol-like atoms are keyed by (kind, content); numeric atoms by their
/// bit pattern, so `0.0` and `-0.0` are distinct float atoms while every
/// occurrence of `42` shares one integer atom.
pub struct AtomTable {
    entries: Vec<Option<AtomEntry>>,
    free: Vec<u32>,
    symbol_index: FxHashMap<Box<str>, AtomId>,
    str_index: FxHashMap<Box<str>, AtomId>,
    iname_index: FxHashMap<Box<str>, AtomId>,
    int_index: FxHashMap<i64, AtomId>,
    float_index: FxHashMap<u64, AtomId>,
}

impl AtomTable {
    /// Creates a table with the permanent atoms pre-interned.
    pub fn new() -> Self {
        let mut table = AtomTable {
            entries: Vec::new(),
            free: Vec::new(),
            symbol_index: FxHashMap::default(),
            str_index: FxHashMap::default(),
            iname_index: FxHashMap::default(),
            int_index: FxHashMap::default(),
            float_index: FxHashMap::default(),
        };
        let empty = table.intern_text(AtomKind::Symbol, "");
        let t = table.intern_text(AtomKind::Symbol, "TRUE");
        let f = table.intern_text(AtomKind::Symbol, "FALSE");
        let nil = table.intern_text(AtomKind::Symbol, "nil");
        debug_assert_eq!(empty, EMPTY_SYMBOL);
        debug_assert_eq!(t, TRUE_ATOM);
        debug_assert_eq!(f, FALSE_ATOM);
        debug_assert_eq!(nil, NIL_ATOM);
        for id in [empty, t, f, nil] {
            table.entry_mut(id).permanent = true;
        }
        table
    }

    fn entry(&self, id: AtomId) -> &AtomEntry {
        self.entries[id.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("atom {:?} is not live", id))
    }

    fn entry_mut(&mut self, id: AtomId) -> &mut AtomEntry {
        self.entries[id.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("atom {:?} is not live", id))
    }

    fn allocate(&mut self, data: AtomData) -> AtomId {
        let entry = AtomEntry {
            data,
            uses: 0,
            permanent: false,
        };
        match self.free.pop() {
            Some(slot) => {
                self.entries[slot as usize] = Some(entry);
                AtomId(slot)
            }
            None => {
                self.entries.push(Some(entry));
                AtomId((self.entries.len() - 1) as u32)
            }
        }
    }

    fn intern_text(&mut self, kind: AtomKind, text: &str) -> AtomId {
        let index = match kind {
            AtomKind::Symbol => &self.symbol_index,
            AtomKind::Str => &self.str_index,
            AtomKind::InstanceName => &self.iname_index,
            _ => unreachable!("numeric atoms are not text-keyed"),
        };
        if let Some(&id) = index.get(text) {
            return id;
        }
        let data = match kind {
            AtomKind::Symbol => AtomData::Symbol(Box::from(text)),
            AtomKind::Str => AtomData::Str(Box::from(text)),
            AtomKind::InstanceName => AtomData::InstanceName(Box::from(text)),
            _ => unreachable!(),
        };
        let id = self.allocate(data);
        let index = match kind {
            AtomKind::Symbol => &mut self.symbol_index,
            AtomKind::Str => &mut self.str_index,
            AtomKind::InstanceName => &mut self.iname_index,
            _ => unreachable!(),
        };
        index.insert(Box::from(text), id);
        id
    }

    /// Interns a symbol, returning the existing handle if present.
    pub fn intern_symbol(&mut self, text: &str) -> AtomId {
        self.intern_text(AtomKind::Symbol, text)
    }

    /// Interns a string atom.
    pub fn intern_string(&mut self, text: &str) -> AtomId {
        self.intern_text(AtomKind::Str, text)
    }

    /// Interns an instance name atom.
    pub fn intern_instance_name(&mut self, text: &str) -> AtomId {
        self.intern_text(AtomKind::InstanceName, text)
    }

    /// Interns an integer atom keyed by value.
    pub fn integer(&mut self, value: i64) -> AtomId {
        if let Some(&id) = self.int_index.get(&value) {
            return id;
        }
        let id = self.allocate(AtomData::Integer(value));
        self.int_index.insert(value, id);
        id
    }

    /// Interns a float atom keyed by bit pattern.
    pub fn float(&mut self, value: f64) -> AtomId {
        let bits = value.to_bits();
        if let Some(&id) = self.float_index.get(&bits) {
            return id;
        }
        let id = self.allocate(AtomData::Float(value));
        self.float_index.insert(bits, id);
        id
    }

    /// Interns the boolean symbol for `value`.
    pub fn boolean(&self, value: bool) -> AtomId {
        if value {
            TRUE_ATOM
        } else {
            FALSE_ATOM
        }
    }

    /// Returns the primitive tag of a live atom.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not live in this table.
    pub fn kind(&self, id: AtomId) -> AtomKind {
        self.entry(id).data.kind()
    }

    /// Returns the text of a symbol-like atom, `None` for numeric atoms.
    pub fn text(&self, id: AtomId) -> Option<&str> {
        match &self.entry(id).data {
            AtomData::Symbol(s) | AtomData::Str(s) | AtomData::InstanceName(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value of an integer atom.
    pub fn as_integer(&self, id: AtomId) -> Option<i64> {
        match self.entry(id).data {
            AtomData::Integer(n) => Some(n),
            _ => None,
        }
    }

    /// Returns the value of a float atom.
    pub fn as_float(&self, id: AtomId) -> Option<f64> {
        match self.entry(id).data {
            AtomData::Float(x) => Some(x),
            _ => None,
        }
    }

    /// Returns the numeric value of an integer or float atom.
    pub fn numeric(&self, id: AtomId) -> Option<f64> {
        match self.entry(id).data {
            AtomData::Integer(n) => Some(n as f64),
            AtomData::Float(x) => Some(x),
            _ => None,
        }
    }

    /// Increments the use count of an atom.
    pub fn install(&mut self, id: AtomId) {
        let entry = self.entry_mut(id);
        entry.uses += 1;
    }

    /// Decrements the use count; a non-permanent atom reaching zero is
    /// unlinked from the table and its slot recycled.
    pub fn deinstall(&mut self, id: AtomId) {
        let entry = self.entry_mut(id);
        debug_assert!(entry.uses > 0, "deinstall of atom with zero uses");
        entry.uses = entry.uses.saturating_sub(1);
        if entry.uses == 0 && !entry.permanent {
            self.release(id);
        }
    }

    fn release(&mut self, id: AtomId) {
        let entry = self.entries[id.index()].take().expect("release of dead atom");
        match entry.data {
            AtomData::Symbol(s) => {
                self.symbol_index.remove(&s);
            }
            AtomData::Str(s) => {
                self.str_index.remove(&s);
            }
            AtomData::InstanceName(s) => {
                self.iname_index.remove(&s);
            }
            AtomData::Integer(n) => {
                self.int_index.remove(&n);
            }
            AtomData::Float(x) => {
                self.float_index.remove(&x.to_bits());
            }
        }
        self.free.push(id.index() as u32);
    }

    /// Current use count of an atom. Zero for an interned-but-unstored atom.
    pub fn use_count(&self, id: AtomId) -> u32 {
        self.entry(id).uses
    }

    /// Number of live atoms, permanent ones included.
    pub fn live_count(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    /// Ordered comparison used by hashed memories and sorted output.
    ///
    /// Numeric atoms compare numerically across integer/float. Mixed
    /// kinds order numbers first, then symbols, strings, and instance
    /// names. Within one symbol-like kind, interning order stands in for
    /// the original's stable pointer order.
    pub fn compare(&self, a: AtomId, b: AtomId) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let ka = self.kind(a);
        let kb = self.kind(b);
        if ka.is_numeric() && kb.is_numeric() {
            let (x, y) = (self.numeric(a).unwrap(), self.numeric(b).unwrap());
            return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
        }
        match ka.rank().cmp(&kb.rank()) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        }
    }

    /// Content-based hash of an atom, stable for the atom's lifetime.
    pub fn hash_atom(&self, id: AtomId) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        match &self.entry(id).data {
            AtomData::Symbol(s) => {
                0u8.hash(&mut hasher);
                s.hash(&mut hasher);
            }
            AtomData::Str(s) => {
                1u8.hash(&mut hasher);
                s.hash(&mut hasher);
            }
            AtomData::InstanceName(s) => {
                2u8.hash(&mut hasher);
                s.hash(&mut hasher);
            }
            AtomData::Integer(n) => {
                3u8.hash(&mut hasher);
                n.hash(&mut hasher);
            }
            AtomData::Float(x) => {
                // An integral float hashes like the equal integer so
                // equi-join keys agree across numeric kinds.
                if x.fract() == 0.0 && *x >= i64::MIN as f64 && *x <= i64::MAX as f64 {
                    3u8.hash(&mut hasher);
                    (*x as i64).hash(&mut hasher);
                } else {
                    4u8.hash(&mut hasher);
                    x.to_bits().hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }

    /// Display wrapper for an atom: strings quoted, instance names in
    /// brackets, everything else bare.
    pub fn display(&self, id: AtomId) -> DisplayAtom<'_> {
        DisplayAtom { table: self, id }
    }
}

impl Default for AtomTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed display adapter returned by [`AtomTable::display`].
pub struct DisplayAtom<'a> {
    table: &'a AtomTable,
    id: AtomId,
}

impl fmt::Display for DisplayAtom<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table.entry(self.id).data {
            AtomData::Symbol(s) => write!(f, "{}", s),
            AtomData::Str(s) => write!(f, "{:?}", s),
            AtomData::InstanceName(s) => write!(f, "[{}]", s),
            AtomData::Integer(n) => write!(f, "{}", n),
            AtomData::Float(x) => write!(f, "{}", x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_returns_same_id_for_same_content() {
        let mut atoms = AtomTable::new();
        assert_eq!(atoms.intern_symbol("red"), atoms.intern_symbol("red"));
        assert_eq!(atoms.integer(7), atoms.integer(7));
        assert_eq!(atoms.float(2.5), atoms.float(2.5));
    }

    #[test]
    fn symbol_and_string_of_same_text_differ() {
        let mut atoms = AtomTable::new();
        let sym = atoms.intern_symbol("red");
        let s = atoms.intern_string("red");
        assert_ne!(sym, s);
        assert_eq!(atoms.kind(sym), AtomKind::Symbol);
        assert_eq!(atoms.kind(s), AtomKind::Str);
    }

    #[test]
    fn permanent_atoms_are_preinterned() {
        let mut atoms = AtomTable::new();
        assert_eq!(atoms.intern_symbol("TRUE"), TRUE_ATOM);
        assert_eq!(atoms.intern_symbol("FALSE"), FALSE_ATOM);
        assert_eq!(atoms.intern_symbol("nil"), NIL_ATOM);
        assert_eq!(atoms.intern_symbol(""), EMPTY_SYMBOL);
    }

    #[test]
    fn deinstall_to_zero_releases_slot() {
        let mut atoms = AtomTable::new();
        let a = atoms.intern_symbol("transient");
        atoms.install(a);
        let live = atoms.live_count();
        atoms.deinstall(a);
        assert_eq!(atoms.live_count(), live - 1);
        // Re-interning produces a fresh, live atom.
        let b = atoms.intern_symbol("transient");
        assert_eq!(atoms.text(b), Some("transient"));
    }

    #[test]
    fn permanent_atoms_survive_deinstall() {
        let mut atoms = AtomTable::new();
        atoms.install(TRUE_ATOM);
        atoms.deinstall(TRUE_ATOM);
        assert_eq!(atoms.text(TRUE_ATOM), Some("TRUE"));
    }

    #[test]
    fn numeric_comparison_crosses_kinds() {
        let mut atoms = AtomTable::new();
        let i = atoms.integer(3);
        let x = atoms.float(3.5);
        assert_eq!(atoms.compare(i, x), Ordering::Less);
        assert_eq!(atoms.compare(x, i), Ordering::Greater);
        let same = atoms.float(3.0);
        assert_eq!(atoms.compare(i, same), Ordering::Equal);
    }

    #[test]
    fn numbers_order_before_symbols() {
        let mut atoms = AtomTable::new();
        let n = atoms.integer(1000);
        let s = atoms.intern_symbol("aardvark");
        assert_eq!(atoms.compare(n, s), Ordering::Less);
    }

    #[test]
    fn integral_float_hashes_like_integer() {
        let mut atoms = AtomTable::new();
        let i = atoms.integer(4);
        let x = atoms.float(4.0);
        assert_eq!(atoms.hash_atom(i), atoms.hash_atom(x));
    }

    #[test]
    fn display_quotes_strings_only() {
        let mut atoms = AtomTable::new();
        let sym = atoms.intern_symbol("red");
        let s = atoms.intern_string("red");
        let inst = atoms.intern_instance_name("box1");
        assert_eq!(atoms.display(sym).to_string(), "red");
        assert_eq!(atoms.display(s).to_string(), "\"red\"");
        assert_eq!(atoms.display(inst).to_string(), "[box1]");
    }
}
