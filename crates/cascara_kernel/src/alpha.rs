//! The alpha side of the network: per-pattern discrimination trees.
//!
//! Each template (and each pattern class) roots a tree of single-entity
//! tests. A node's children split two ways: a hash table keyed by
//! `(slot, constant)` for equality-against-atom selectors, looked up in
//! O(1), and a linear list for general tests, evaluated in order. Leaves
//! own an [`AlphaMemory`] holding one [`AlphaMatch`] per surviving
//! (entity, multifield segmentation) pair.
//!
//! Multifield patterns are matched by a [`FieldChain`] at the bottom of
//! the tree: the chain enumerates every segmentation of the slot's
//! fields over the pattern's items, and each segmentation becomes its own
//! alpha match carrying [`ChainMarkers`] so later joins and the RHS can
//! address the spans a multifield variable covered.

use crate::beta::{JoinId, TokenId};
use crate::entity::EntityRef;
use cascara_base::{Arena, ArenaId, AtomId, AtomTable};
use cascara_data::{ClassId, Expr, SlotId, TemplateId, TypeMask};
use rustc_hash::FxHashMap;

pub type AlphaNodeId = ArenaId<AlphaNode>;
pub type AlphaMemId = ArenaId<AlphaMemory>;
pub type AlphaMatchId = ArenaId<AlphaMatch>;

/// What a pattern matches against: a template's facts or a class's
/// instances (subclasses included).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PatternTarget {
    Template(TemplateId),
    Class(ClassId),
}

/// One item of a multifield pattern chain.
#[derive(Clone, PartialEq, Debug)]
pub struct ChainItem {
    /// A multifield item absorbs zero or more fields; a single item
    /// absorbs exactly one.
    pub multi: bool,
    /// Single item must equal this atom.
    pub constant: Option<AtomId>,
    /// Single item must carry one of these tags.
    pub types: Option<TypeMask>,
}

impl ChainItem {
    pub fn single() -> Self {
        ChainItem {
            multi: false,
            constant: None,
            types: None,
        }
    }

    pub fn multi() -> Self {
        ChainItem {
            multi: true,
            constant: None,
            types: None,
        }
    }

    pub fn constant(atom: AtomId) -> Self {
        ChainItem {
            multi: false,
            constant: Some(atom),
            types: None,
        }
    }

    fn admits(&self, atoms: &AtomTable, field: AtomId) -> bool {
        if let Some(expected) = self.constant {
            if field != expected {
                return false;
            }
        }
        if let Some(types) = self.types {
            if !types.contains(TypeMask::of_kind(atoms.kind(field))) {
                return false;
            }
        }
        true
    }
}

/// An ordered sequence of chain items matched against a multifield slot.
#[derive(Clone, PartialEq, Debug)]
pub struct FieldChain {
    pub items: Vec<ChainItem>,
}

impl FieldChain {
    /// Minimum number of fields any match needs.
    pub fn min_len(&self) -> usize {
        self.items.iter().filter(|i| !i.multi).count()
    }

    /// True when no multifield item is present, fixing the length.
    pub fn fixed_len(&self) -> bool {
        self.items.iter().all(|i| !i.multi)
    }

    /// Enumerates every segmentation of `fields` over the chain's items,
    /// in left-to-right greedy-shortest order. Each result assigns one
    /// `(begin, len)` span per item; single items always have `len == 1`.
    pub fn segmentations(&self, atoms: &AtomTable, fields: &[AtomId]) -> Vec<Vec<(u32, u32)>> {
        let mut out = Vec::new();
        let mut spans = Vec::with_capacity(self.items.len());
        self.segment_from(atoms, fields, 0, 0, &mut spans, &mut out);
        out
    }

    fn segment_from(
        &self,
        atoms: &AtomTable,
        fields: &[AtomId],
        item: usize,
        pos: usize,
        spans: &mut Vec<(u32, u32)>,
        out: &mut Vec<Vec<(u32, u32)>>,
    ) {
        if item == self.items.len() {
            if pos == fields.len() {
                out.push(spans.clone());
            }
            return;
        }
        let rest_min: usize = self.items[item + 1..].iter().filter(|i| !i.multi).count();
        let this = &self.items[item];
        if this.multi {
            let available = fields.len().saturating_sub(pos + rest_min);
            for take in 0..=available {
                spans.push((pos as u32, take as u32));
                self.segment_from(atoms, fields, item + 1, pos + take, spans, out);
                spans.pop();
            }
        } else {
            if pos + 1 + rest_min > fields.len() {
                return;
            }
            if !this.admits(atoms, fields[pos]) {
                return;
            }
            spans.push((pos as u32, 1));
            self.segment_from(atoms, fields, item + 1, pos + 1, spans, out);
            spans.pop();
        }
    }
}

/// Span assignments for one chain-matched slot of a pattern.
#[derive(Clone, PartialEq, Debug)]
pub struct ChainMarkers {
    pub slot: SlotId,
    /// One `(begin, len)` per chain item.
    pub spans: Vec<(u32, u32)>,
}

/// A discrimination test carried by one alpha node.
#[derive(Clone, PartialEq, Debug)]
pub enum AlphaTest {
    /// The per-target root; always passes.
    Root(PatternTarget),
    /// Single-field slot equals an interned atom. Nodes with this test
    /// live in their parent's hashed child table.
    SlotConstant { slot: SlotId, atom: AtomId },
    /// Single-field slot carries one of these tags.
    SlotType { slot: SlotId, types: TypeMask },
    /// Multifield slot length precheck.
    Length {
        slot: SlotId,
        min: u32,
        exact: Option<u32>,
    },
    /// Segment a multifield slot over a field chain, producing markers.
    Chain { slot: SlotId, chain: FieldChain },
    /// General pattern-local residual (slot-local variable consistency,
    /// predicate constraints). Fetches use the self-pattern convention.
    Predicate(Expr),
}

/// One node of a discrimination tree.
#[derive(Debug)]
pub struct AlphaNode {
    pub parent: Option<AlphaNodeId>,
    pub test: AlphaTest,
    /// Children whose test is `SlotConstant`, keyed by (slot, atom).
    pub hashed: FxHashMap<(SlotId, AtomId), AlphaNodeId>,
    /// Distinct slots appearing in `hashed`, probed in insertion order.
    pub hashed_slots: Vec<SlotId>,
    /// Children with general tests, evaluated in order.
    pub linear: Vec<AlphaNodeId>,
    /// Present on leaves.
    pub memory: Option<AlphaMemId>,
    /// Patterns sharing this node.
    pub use_count: u32,
}

impl AlphaNode {
    pub fn new(parent: Option<AlphaNodeId>, test: AlphaTest) -> Self {
        AlphaNode {
            parent,
            test,
            hashed: FxHashMap::default(),
            hashed_slots: Vec::new(),
            linear: Vec::new(),
            memory: None,
            use_count: 0,
        }
    }
}

/// The filtered entity set for one pattern in isolation.
#[derive(Debug)]
pub struct AlphaMemory {
    /// Matches in arrival order.
    pub matches: Vec<AlphaMatchId>,
    /// Joins reading this memory, in registration order.
    pub readers: Vec<JoinId>,
    pub use_count: u32,
    /// The leaf node owning this memory, for detachment walks.
    pub node: AlphaNodeId,
}

/// One entity (plus one multifield segmentation) surviving a pattern.
#[derive(Debug)]
pub struct AlphaMatch {
    pub entity: EntityRef,
    /// Marker sets in discrimination-path order; `FieldRef::Item.chain`
    /// indexes this list.
    pub markers: Vec<ChainMarkers>,
    pub memory: AlphaMemId,
    /// Positive-join output tokens whose right bind is this match.
    pub dependents: Vec<TokenId>,
    /// Negated joins where this match blocks a left token.
    pub blocking: Vec<(JoinId, TokenId)>,
}

/// Alpha arenas grouped for the network facade.
#[derive(Default)]
pub struct AlphaNet {
    pub nodes: Arena<AlphaNode>,
    pub memories: Arena<AlphaMemory>,
    pub matches: Arena<AlphaMatch>,
    pub template_roots: FxHashMap<TemplateId, AlphaNodeId>,
    pub class_roots: FxHashMap<ClassId, AlphaNodeId>,
    /// Every live alpha match of an entity, across all memories.
    pub entity_matches: FxHashMap<EntityRef, Vec<AlphaMatchId>>,
}

impl AlphaNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The root node for a target, creating it on first use.
    pub fn root_for(&mut self, target: PatternTarget) -> AlphaNodeId {
        match target {
            PatternTarget::Template(t) => {
                if let Some(&node) = self.template_roots.get(&t) {
                    return node;
                }
                let node = self.nodes.insert(AlphaNode::new(None, AlphaTest::Root(target)));
                self.template_roots.insert(t, node);
                node
            }
            PatternTarget::Class(c) => {
                if let Some(&node) = self.class_roots.get(&c) {
                    return node;
                }
                let node = self.nodes.insert(AlphaNode::new(None, AlphaTest::Root(target)));
                self.class_roots.insert(c, node);
                node
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syms(atoms: &mut AtomTable, names: &[&str]) -> Vec<AtomId> {
        names.iter().map(|n| atoms.intern_symbol(n)).collect()
    }

    #[test]
    fn fixed_chain_matches_exact_length_only() {
        let mut atoms = AtomTable::new();
        let fields = syms(&mut atoms, &["a", "b"]);
        let chain = FieldChain {
            items: vec![ChainItem::single(), ChainItem::single()],
        };
        assert_eq!(chain.segmentations(&atoms, &fields).len(), 1);
        assert!(chain.segmentations(&atoms, &fields[..1]).is_empty());
    }

    #[test]
    fn multifield_item_absorbs_any_span() {
        let mut atoms = AtomTable::new();
        let fields = syms(&mut atoms, &["a", "b", "c"]);
        let chain = FieldChain {
            items: vec![ChainItem::multi()],
        };
        let segs = chain.segmentations(&atoms, &fields);
        assert_eq!(segs, vec![vec![(0, 3)]]);
    }

    #[test]
    fn two_multifields_enumerate_every_split() {
        let mut atoms = AtomTable::new();
        let fields = syms(&mut atoms, &["a", "b"]);
        let chain = FieldChain {
            items: vec![ChainItem::multi(), ChainItem::multi()],
        };
        let segs = chain.segmentations(&atoms, &fields);
        assert_eq!(
            segs,
            vec![
                vec![(0, 0), (0, 2)],
                vec![(0, 1), (1, 1)],
                vec![(0, 2), (2, 0)],
            ]
        );
    }

    #[test]
    fn constants_anchor_segmentation() {
        let mut atoms = AtomTable::new();
        let b = atoms.intern_symbol("b");
        let fields = syms(&mut atoms, &["a", "b", "c"]);
        // ($?front b $?back) pins the middle item.
        let chain = FieldChain {
            items: vec![
                ChainItem::multi(),
                ChainItem::constant(b),
                ChainItem::multi(),
            ],
        };
        let segs = chain.segmentations(&atoms, &fields);
        assert_eq!(segs, vec![vec![(0, 1), (1, 1), (2, 1)]]);
    }

    #[test]
    fn type_restrictions_prune_singles() {
        let mut atoms = AtomTable::new();
        let n = atoms.integer(5);
        let s = atoms.intern_symbol("x");
        let chain = FieldChain {
            items: vec![ChainItem {
                multi: false,
                constant: None,
                types: Some(TypeMask::INTEGER),
            }],
        };
        assert_eq!(chain.segmentations(&atoms, &[n]).len(), 1);
        assert!(chain.segmentations(&atoms, &[s]).is_empty());
    }
}
