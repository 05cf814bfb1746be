//! Per-slot constraint records.
//!
//! A [`ConstraintRecord`] describes what a slot (or a variable position
//! derived from one) may hold: which primitive tags are allowed, an
//! optional explicit value set, a numeric range, and a cardinality range
//! for multifield slots.
//!
//! Records form a lattice: [`ConstraintRecord::intersect`] produces the
//! strictest record allowing what both operands allow and is the engine of
//! type propagation during rule analysis, while [`ConstraintRecord::union`]
//! produces the loosest record allowing either. An intersection may come
//! out unsatisfiable; callers check [`ConstraintRecord::is_unmatchable`].

use bitflags::bitflags;
use cascara_base::{AtomId, AtomKind, AtomTable, Value};

bitflags! {
    /// The set of primitive tags a slot position admits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TypeMask: u8 {
        const SYMBOL = 1 << 0;
        const STRING = 1 << 1;
        const INSTANCE_NAME = 1 << 2;
        const INTEGER = 1 << 3;
        const FLOAT = 1 << 4;
        const EXTERNAL = 1 << 5;
        /// The position may hold a multifield (cardinality applies).
        const MULTIFIELD = 1 << 6;
    }
}

impl TypeMask {
    /// Every single-field tag.
    pub const ANY_SINGLE: TypeMask = TypeMask::SYMBOL
        .union(TypeMask::STRING)
        .union(TypeMask::INSTANCE_NAME)
        .union(TypeMask::INTEGER)
        .union(TypeMask::FLOAT)
        .union(TypeMask::EXTERNAL);

    /// Integer or float.
    pub const NUMBER: TypeMask = TypeMask::INTEGER.union(TypeMask::FLOAT);

    /// The tag bit for one atom kind.
    pub fn of_kind(kind: AtomKind) -> TypeMask {
        match kind {
            AtomKind::Symbol => TypeMask::SYMBOL,
            AtomKind::Str => TypeMask::STRING,
            AtomKind::InstanceName => TypeMask::INSTANCE_NAME,
            AtomKind::Integer => TypeMask::INTEGER,
            AtomKind::Float => TypeMask::FLOAT,
        }
    }
}

/// Inclusive numeric bounds; `None` is unbounded on that side.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct NumericRange {
    pub low: Option<f64>,
    pub high: Option<f64>,
}

impl NumericRange {
    fn is_inverted(&self) -> bool {
        matches!((self.low, self.high), (Some(lo), Some(hi)) if lo > hi)
    }

    fn contains(&self, x: f64) -> bool {
        self.low.map_or(true, |lo| x >= lo) && self.high.map_or(true, |hi| x <= hi)
    }

    fn intersect(&self, other: &NumericRange) -> NumericRange {
        NumericRange {
            low: max_opt(self.low, other.low),
            high: min_opt(self.high, other.high),
        }
    }

    fn union(&self, other: &NumericRange) -> NumericRange {
        NumericRange {
            low: match (self.low, other.low) {
                (Some(a), Some(b)) => Some(a.min(b)),
                _ => None,
            },
            high: match (self.high, other.high) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            },
        }
    }
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (x, None) | (None, x) => x,
    }
}

fn min_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (x, None) | (None, x) => x,
    }
}

/// Inclusive cardinality bounds for multifield positions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Cardinality {
    pub min: u32,
    /// `None` is unbounded.
    pub max: Option<u32>,
}

impl Default for Cardinality {
    fn default() -> Self {
        Cardinality { min: 0, max: None }
    }
}

/// The verdict of checking a value against a record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConstraintCheck {
    Ok,
    TypeViolation,
    RangeViolation,
    CardinalityViolation,
    AllowedValuesViolation,
}

/// Allowed tags, values, numeric range, and cardinality for one position.
#[derive(Clone, PartialEq, Debug)]
pub struct ConstraintRecord {
    pub types: TypeMask,
    /// Explicit allowed atoms; `None` means any value of an allowed type
    /// (the record's "any allowed" state).
    pub allowed_values: Option<Vec<AtomId>>,
    pub range: NumericRange,
    pub cardinality: Cardinality,
}

impl ConstraintRecord {
    /// A record allowing any single-field value.
    pub fn any_single() -> Self {
        ConstraintRecord {
            types: TypeMask::ANY_SINGLE,
            allowed_values: None,
            range: NumericRange::default(),
            cardinality: Cardinality::default(),
        }
    }

    /// A record allowing any multifield of any length.
    pub fn any_multi() -> Self {
        ConstraintRecord {
            types: TypeMask::ANY_SINGLE | TypeMask::MULTIFIELD,
            allowed_values: None,
            range: NumericRange::default(),
            cardinality: Cardinality::default(),
        }
    }

    /// A record restricted to the given tags.
    pub fn of_types(types: TypeMask) -> Self {
        ConstraintRecord {
            types,
            allowed_values: None,
            range: NumericRange::default(),
            cardinality: Cardinality::default(),
        }
    }

    /// A record matching exactly one atom.
    pub fn exactly(atoms: &AtomTable, atom: AtomId) -> Self {
        ConstraintRecord {
            types: TypeMask::of_kind(atoms.kind(atom)),
            allowed_values: Some(vec![atom]),
            range: NumericRange::default(),
            cardinality: Cardinality::default(),
        }
    }

    /// True when no value can satisfy this record.
    pub fn is_unmatchable(&self) -> bool {
        if self.types.is_empty() {
            return true;
        }
        if matches!(&self.allowed_values, Some(v) if v.is_empty()) {
            return true;
        }
        if self.range.is_inverted() && self.types.intersects(TypeMask::NUMBER) {
            // A numeric-only record with an empty range admits nothing.
            if !self.types.intersects(TypeMask::ANY_SINGLE.difference(TypeMask::NUMBER)) {
                return true;
            }
        }
        if let Some(max) = self.cardinality.max {
            if self.cardinality.min > max && self.types == TypeMask::MULTIFIELD {
                return true;
            }
        }
        false
    }

    /// The strictest record allowing what both `self` and `other` allow.
    pub fn intersect(&self, other: &ConstraintRecord) -> ConstraintRecord {
        let allowed_values = match (&self.allowed_values, &other.allowed_values) {
            (None, None) => None,
            (Some(v), None) | (None, Some(v)) => Some(v.clone()),
            (Some(a), Some(b)) => Some(a.iter().copied().filter(|x| b.contains(x)).collect()),
        };
        ConstraintRecord {
            types: self.types & other.types,
            allowed_values,
            range: self.range.intersect(&other.range),
            cardinality: Cardinality {
                min: self.cardinality.min.max(other.cardinality.min),
                max: min_opt_u32(self.cardinality.max, other.cardinality.max),
            },
        }
    }

    /// The loosest record allowing what either `self` or `other` allows.
    pub fn union(&self, other: &ConstraintRecord) -> ConstraintRecord {
        let allowed_values = match (&self.allowed_values, &other.allowed_values) {
            (Some(a), Some(b)) => {
                let mut merged = a.clone();
                for x in b {
                    if !merged.contains(x) {
                        merged.push(*x);
                    }
                }
                Some(merged)
            }
            _ => None,
        };
        ConstraintRecord {
            types: self.types | other.types,
            allowed_values,
            range: self.range.union(&other.range),
            cardinality: Cardinality {
                min: self.cardinality.min.min(other.cardinality.min),
                max: match (self.cardinality.max, other.cardinality.max) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                },
            },
        }
    }

    /// Checks one value against this record.
    pub fn check(&self, atoms: &AtomTable, value: &Value) -> ConstraintCheck {
        match value {
            Value::Multi(mf) => {
                if !self.types.contains(TypeMask::MULTIFIELD) {
                    return ConstraintCheck::TypeViolation;
                }
                let len = mf.len() as u32;
                if len < self.cardinality.min
                    || self.cardinality.max.is_some_and(|max| len > max)
                {
                    return ConstraintCheck::CardinalityViolation;
                }
                for atom in mf.iter() {
                    match self.check_atom(atoms, atom) {
                        ConstraintCheck::Ok => {}
                        bad => return bad,
                    }
                }
                ConstraintCheck::Ok
            }
            Value::Atom(atom) => {
                if !self.types.intersects(TypeMask::ANY_SINGLE) {
                    return ConstraintCheck::TypeViolation;
                }
                self.check_atom(atoms, *atom)
            }
            Value::Handle(_) => {
                if self.types.contains(TypeMask::EXTERNAL) {
                    ConstraintCheck::Ok
                } else {
                    ConstraintCheck::TypeViolation
                }
            }
        }
    }

    fn check_atom(&self, atoms: &AtomTable, atom: AtomId) -> ConstraintCheck {
        let kind = atoms.kind(atom);
        if !self.types.contains(TypeMask::of_kind(kind)) {
            return ConstraintCheck::TypeViolation;
        }
        if let Some(values) = &self.allowed_values {
            if !values.contains(&atom) {
                return ConstraintCheck::AllowedValuesViolation;
            }
        }
        if kind.is_numeric() {
            if let Some(x) = atoms.numeric(atom) {
                if !self.range.contains(x) {
                    return ConstraintCheck::RangeViolation;
                }
            }
        }
        ConstraintCheck::Ok
    }

    /// Every atom this record references, for install bookkeeping.
    pub fn referenced_atoms(&self) -> impl Iterator<Item = AtomId> + '_ {
        self.allowed_values.iter().flatten().copied()
    }
}

impl Default for ConstraintRecord {
    fn default() -> Self {
        Self::any_single()
    }
}

fn min_opt_u32(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (x, None) | (None, x) => x,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersect_narrows_types() {
        let a = ConstraintRecord::of_types(TypeMask::SYMBOL | TypeMask::INTEGER);
        let b = ConstraintRecord::of_types(TypeMask::INTEGER | TypeMask::FLOAT);
        assert_eq!(a.intersect(&b).types, TypeMask::INTEGER);
    }

    #[test]
    fn disjoint_types_are_unmatchable() {
        let a = ConstraintRecord::of_types(TypeMask::SYMBOL);
        let b = ConstraintRecord::of_types(TypeMask::INTEGER);
        assert!(a.intersect(&b).is_unmatchable());
    }

    #[test]
    fn value_sets_intersect_by_membership() {
        let mut atoms = AtomTable::new();
        let red = atoms.intern_symbol("red");
        let green = atoms.intern_symbol("green");
        let blue = atoms.intern_symbol("blue");
        let mut a = ConstraintRecord::any_single();
        a.allowed_values = Some(vec![red, green]);
        let mut b = ConstraintRecord::any_single();
        b.allowed_values = Some(vec![green, blue]);
        assert_eq!(a.intersect(&b).allowed_values, Some(vec![green]));
        let mut c = ConstraintRecord::any_single();
        c.allowed_values = Some(vec![blue]);
        assert!(a.intersect(&c).is_unmatchable());
    }

    #[test]
    fn union_loosens_everything() {
        let mut a = ConstraintRecord::of_types(TypeMask::INTEGER);
        a.range = NumericRange { low: Some(0.0), high: Some(10.0) };
        let mut b = ConstraintRecord::of_types(TypeMask::FLOAT);
        b.range = NumericRange { low: Some(5.0), high: Some(20.0) };
        let u = a.union(&b);
        assert_eq!(u.types, TypeMask::NUMBER);
        assert_eq!(u.range, NumericRange { low: Some(0.0), high: Some(20.0) });
    }

    #[test]
    fn check_reports_each_violation_kind() {
        let mut atoms = AtomTable::new();
        let mut record = ConstraintRecord::of_types(TypeMask::INTEGER);
        record.range = NumericRange { low: Some(0.0), high: Some(100.0) };

        let sym = Value::Atom(atoms.intern_symbol("oops"));
        assert_eq!(record.check(&atoms, &sym), ConstraintCheck::TypeViolation);

        let big = Value::Atom(atoms.integer(1000));
        assert_eq!(record.check(&atoms, &big), ConstraintCheck::RangeViolation);

        let ok = Value::Atom(atoms.integer(50));
        assert_eq!(record.check(&atoms, &ok), ConstraintCheck::Ok);
    }

    #[test]
    fn cardinality_bounds_multifields() {
        let mut atoms = AtomTable::new();
        let mut record = ConstraintRecord::any_multi();
        record.cardinality = Cardinality { min: 1, max: Some(2) };
        let a = atoms.intern_symbol("a");

        use cascara_base::Multifield;
        let empty = Value::Multi(Multifield::empty());
        assert_eq!(record.check(&atoms, &empty), ConstraintCheck::CardinalityViolation);
        let two = Value::Multi(Multifield::from_atoms(vec![a, a]));
        assert_eq!(record.check(&atoms, &two), ConstraintCheck::Ok);
        let three = Value::Multi(Multifield::from_atoms(vec![a, a, a]));
        assert_eq!(record.check(&atoms, &three), ConstraintCheck::CardinalityViolation);
    }
}
