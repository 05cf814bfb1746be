//! Compiled rules and their actions.

use crate::beta::JoinId;
use cascara_base::{ArenaId, AtomId};
use cascara_data::{Expr, ModuleId, SlotId, TemplateId};

/// Stable handle to an installed rule.
pub type RuleId = ArenaId<CompiledRule>;

/// One slot's worth of RHS values. Multifield slots flatten the
/// evaluated list; single slots require exactly one resulting value.
#[derive(Clone, PartialEq, Debug)]
pub struct ActionSlot {
    pub slot: SlotId,
    pub values: Vec<Expr>,
}

/// A compiled RHS action.
#[derive(Clone, PartialEq, Debug)]
pub enum Action {
    /// Assert a fact; registers logical support when the rule has a
    /// logical group.
    Assert {
        template: TemplateId,
        slots: Vec<ActionSlot>,
    },
    /// Retract the fact a handle expression designates.
    Retract(Expr),
    /// Retract-then-assert with updated slots; unnamed slots carry over.
    Modify {
        target: Expr,
        template: TemplateId,
        sets: Vec<ActionSlot>,
    },
    /// Assert a copy of the target with the given slots replaced.
    Duplicate {
        target: Expr,
        template: TemplateId,
        sets: Vec<ActionSlot>,
    },
    /// Bind an RHS-local variable.
    Bind { index: u16, value: Expr },
    /// Stop the firing loop after this action returns.
    Halt,
    /// Evaluate for effect (host function calls).
    Eval(Expr),
}

/// One disjunct of a rule: a top-level `or` expands into independent
/// disjuncts sharing a rule record, each with its own join chain and its
/// own compiled actions (fetch descriptors differ between disjuncts).
#[derive(Debug)]
pub struct Disjunct {
    pub terminal: JoinId,
    /// Boundary join of the disjunct's logical group, if any.
    pub logical_join: Option<JoinId>,
    pub actions: Vec<Action>,
    /// Number of RHS-local bindings the actions use.
    pub local_count: u16,
    /// Static complexity score for the simplicity/complexity strategies.
    pub complexity: u32,
}

/// A rule as the network knows it.
#[derive(Debug)]
pub struct CompiledRule {
    pub name: AtomId,
    pub module: ModuleId,
    pub salience: i32,
    /// Re-evaluated according to the salience evaluation mode.
    pub dynamic_salience: Option<Expr>,
    pub auto_focus: bool,
    pub disjuncts: Vec<Disjunct>,
    /// Atoms installed on behalf of this rule's constants, released when
    /// the rule is removed.
    pub installed_atoms: Vec<AtomId>,
}
