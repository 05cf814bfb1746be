//! LHS analysis: or-expansion, nand scopes, variables, constraints.
//!
//! Analysis turns a [`RuleDef`] into one plan per disjunct (a top-level
//! `or` multiplies out into independent disjuncts). Each plan fixes:
//!
//! - the absolute pattern position of every pattern CE, groups included;
//! - the single binding occurrence of every variable and a rewritten
//!   [`FetchDesc`] for every use site, with uses escaping their binder's
//!   not/exists scope rejected;
//! - which equality tests factor into equi-join hash keys, which remain
//!   residual join conditions, and which collapse into pattern-local
//!   alpha tests;
//! - the routing of conditions that cross a group boundary to the
//!   group's outer join (where both sides are in view);
//! - constraint propagation by intersection from each binding occurrence
//!   through its uses, rejecting unmatchable intersections;
//! - compiled RHS actions with variable references replaced by fetches.
//!
//! Nothing touches the network here: analysis either produces a complete
//! plan or an [`AnalysisError`], leaving the engine unchanged.

use crate::ast::{
    CondElem, FieldBinding, FieldPattern, Literal, Pattern, PatternExpr, RhsAction, RuleDef,
    SlotPattern, TargetRef,
};
use crate::error::{AnalysisError, AnalysisResult};
use cascara_base::{AtomId, AtomTable, Value};
use cascara_data::{
    CmpOp, ConstraintRecord, Expr, FetchDesc, FieldRef, ModuleId, SlotId, SlotSpec, TypeMask,
    WorkingMemory,
};
use cascara_kernel::{
    Action, ActionSlot, AlphaTest, ChainItem, FieldChain, JoinCond, PatternTarget, SELF_PATTERN,
};
use rustc_hash::FxHashMap;

/// A factorable equality between a binding (left) and a use (right).
pub(crate) type KeyPair = (FetchDesc, FetchDesc);

#[derive(Debug)]
pub(crate) struct PatternPlan {
    pub position: u16,
    pub target: PatternTarget,
    pub alpha_tests: Vec<AlphaTest>,
    pub keys: Vec<KeyPair>,
    pub residuals: Vec<JoinCond>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum GroupKind {
    Negated,
    Exists,
}

#[derive(Debug)]
pub(crate) struct GroupPlan {
    pub kind: GroupKind,
    pub content: Vec<UnitNode>,
    pub first_position: u16,
    pub last_position: u16,
    pub outer_keys: Vec<KeyPair>,
    pub outer_residuals: Vec<JoinCond>,
}

#[derive(Debug)]
pub(crate) enum UnitNode {
    Pattern(PatternPlan),
    Group(GroupPlan),
}

impl UnitNode {
    fn last_position(&self) -> u16 {
        match self {
            UnitNode::Pattern(p) => p.position,
            UnitNode::Group(g) => g.last_position,
        }
    }
}

#[derive(Debug)]
pub(crate) struct DisjunctPlan {
    pub nodes: Vec<UnitNode>,
    /// Join depth of the logical boundary, when the disjunct has a
    /// logical group.
    pub logical_depth: Option<u16>,
    pub actions: Vec<Action>,
    pub local_count: u16,
    pub complexity: u32,
}

#[derive(Debug)]
pub(crate) struct RulePlan {
    pub name: AtomId,
    pub salience: i32,
    pub dynamic_salience: Option<Expr>,
    pub auto_focus: bool,
    pub disjuncts: Vec<DisjunctPlan>,
}

// ----------------------------------------------------------------------
// Or-expansion
// ----------------------------------------------------------------------

/// Expands every `or` into a cross product of or-free disjuncts. An
/// `and` splices its variants inline; `or` under not/exists/logical is
/// rejected.
fn expand_or(ces: &[CondElem]) -> AnalysisResult<Vec<Vec<CondElem>>> {
    let mut variants: Vec<Vec<CondElem>> = vec![Vec::new()];
    for ce in ces {
        let alternatives: Vec<Vec<CondElem>> = match ce {
            CondElem::Or(items) => {
                let mut alts = Vec::new();
                for item in items {
                    match item {
                        CondElem::And(inner) => alts.extend(expand_or(inner)?),
                        other => alts.extend(expand_or(std::slice::from_ref(other))?),
                    }
                }
                alts
            }
            CondElem::And(inner) => expand_or(inner)?,
            CondElem::Not(inner) => {
                reject_or(inner)?;
                vec![vec![CondElem::Not(inner.clone())]]
            }
            CondElem::Exists(inner) => {
                reject_or(inner)?;
                vec![vec![CondElem::Exists(inner.clone())]]
            }
            CondElem::Logical(inner) => {
                let expanded = expand_or(inner)?;
                expanded
                    .into_iter()
                    .map(|seq| vec![CondElem::Logical(seq)])
                    .collect()
            }
            other => vec![vec![other.clone()]],
        };
        let mut next = Vec::with_capacity(variants.len() * alternatives.len());
        for variant in &variants {
            for alt in &alternatives {
                let mut combined = variant.clone();
                combined.extend(alt.iter().cloned());
                next.push(combined);
            }
        }
        variants = next;
    }
    Ok(variants)
}

fn reject_or(ces: &[CondElem]) -> AnalysisResult<()> {
    for ce in ces {
        match ce {
            CondElem::Or(_) => return Err(AnalysisError::OrInsideGroup),
            CondElem::And(inner) | CondElem::Not(inner) | CondElem::Exists(inner)
            | CondElem::Logical(inner) => reject_or(inner)?,
            _ => {}
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// The analyzer
// ----------------------------------------------------------------------

#[derive(Clone, Debug)]
struct VarInfo {
    multi: bool,
    desc: FetchDesc,
    scope: usize,
    constraint: ConstraintRecord,
    is_address: bool,
}

#[derive(Default)]
struct RoutedConds {
    keys: Vec<KeyPair>,
    residuals: Vec<JoinCond>,
}

struct Analyzer<'a> {
    atoms: &'a mut AtomTable,
    wm: &'a WorkingMemory,
    /// Modules searched for template/class names: the rule's own
    /// module first, then its exporting imports.
    search: &'a [ModuleId],
    vars: FxHashMap<String, VarInfo>,
    /// Scope 0 is the rule's top level; each not/exists group pushes a
    /// child scope.
    scope_parents: Vec<Option<usize>>,
    /// Conditions waiting for the group node of a scope to finish.
    routed: FxHashMap<usize, RoutedConds>,
    position: u16,
    targets: Vec<PatternTarget>,
    complexity: u32,
}

impl<'a> Analyzer<'a> {
    fn new(atoms: &'a mut AtomTable, wm: &'a WorkingMemory, search: &'a [ModuleId]) -> Self {
        Analyzer {
            atoms,
            wm,
            search,
            vars: FxHashMap::default(),
            scope_parents: vec![None],
            routed: FxHashMap::default(),
            position: 0,
            targets: Vec::new(),
            complexity: 0,
        }
    }

    fn push_scope(&mut self, parent: usize) -> usize {
        self.scope_parents.push(Some(parent));
        self.scope_parents.len() - 1
    }

    fn scope_visible(&self, binder: usize, user: usize) -> bool {
        let mut current = Some(user);
        while let Some(s) = current {
            if s == binder {
                return true;
            }
            current = self.scope_parents[s];
        }
        false
    }

    /// Where a condition between a binding and a use belongs: `None`
    /// for the use's own pattern/chain, `Some(scope)` for the outer
    /// join of the group opened by `scope`.
    fn route(&self, binder: usize, user: usize) -> Option<usize> {
        if binder == user {
            return None;
        }
        let mut current = user;
        while let Some(parent) = self.scope_parents[current] {
            if parent == binder {
                return Some(current);
            }
            current = parent;
        }
        None
    }

    fn literal_atom(&mut self, lit: &Literal) -> AtomId {
        match lit {
            Literal::Int(n) => self.atoms.integer(*n),
            Literal::Float(x) => self.atoms.float(*x),
            Literal::Symbol(s) => self.atoms.intern_symbol(s),
            Literal::Str(s) => self.atoms.intern_string(s),
            Literal::InstanceName(s) => self.atoms.intern_instance_name(s),
        }
    }

    fn resolve_target(&mut self, target: &TargetRef) -> AnalysisResult<PatternTarget> {
        match target {
            TargetRef::Template(name) => self
                .find_template(name)
                .map(PatternTarget::Template),
            TargetRef::Class(name) => {
                let atom = self.atoms.intern_symbol(name);
                self.search
                    .iter()
                    .find_map(|&m| self.wm.class_id(m, atom))
                    .map(PatternTarget::Class)
                    .ok_or_else(|| AnalysisError::NoSuchClass(name.clone()))
            }
        }
    }

    fn find_template(&mut self, name: &str) -> AnalysisResult<cascara_data::TemplateId> {
        let atom = self.atoms.intern_symbol(name);
        self.search
            .iter()
            .find_map(|&m| self.wm.template_id(m, atom))
            .ok_or_else(|| AnalysisError::NoSuchTemplate(name.to_string()))
    }

    fn slot_spec(&self, target: PatternTarget, slot: SlotId) -> &SlotSpec {
        match target {
            PatternTarget::Template(t) => self.wm.templates[t].slot(slot),
            PatternTarget::Class(c) => self.wm.classes[c].slot(slot),
        }
    }

    fn slot_id(&mut self, target: PatternTarget, name: &str) -> AnalysisResult<SlotId> {
        let atom = self.atoms.intern_symbol(name);
        let (found, target_name) = match target {
            PatternTarget::Template(t) => {
                let template = &self.wm.templates[t];
                (template.slot_id(atom), template.name)
            }
            PatternTarget::Class(c) => {
                let class = &self.wm.classes[c];
                (class.slot_id(atom), class.name)
            }
        };
        found.ok_or_else(|| AnalysisError::NoSuchSlot {
            target: self.atoms.text(target_name).unwrap_or_default().to_string(),
            slot: name.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Patterns
    // ------------------------------------------------------------------

    fn analyze_pattern(&mut self, pattern: &Pattern, scope: usize) -> AnalysisResult<PatternPlan> {
        let position = self.position;
        self.position += 1;
        let target = self.resolve_target(&pattern.target)?;
        self.targets.push(target);
        self.complexity += 1;

        let mut plan = PatternPlan {
            position,
            target,
            alpha_tests: Vec::new(),
            keys: Vec::new(),
            residuals: Vec::new(),
        };
        let mut late_alpha: Vec<AlphaTest> = Vec::new();
        let mut chain_count: u16 = 0;

        if let Some(var) = &pattern.address_var {
            if self.vars.contains_key(var) {
                return Err(AnalysisError::DuplicatePatternVariable(var.clone()));
            }
            self.vars.insert(
                var.clone(),
                VarInfo {
                    multi: false,
                    desc: FetchDesc {
                        pattern: position,
                        slot: SlotId(0),
                        which: FieldRef::Entity,
                    },
                    scope,
                    constraint: ConstraintRecord::any_single(),
                    is_address: true,
                },
            );
        }

        for slot_pattern in &pattern.slots {
            let slot = self.slot_id(target, &slot_pattern.slot)?;
            let spec = self.slot_spec(target, slot).clone();
            if spec.multi {
                self.analyze_chain(
                    &mut plan,
                    &mut late_alpha,
                    &mut chain_count,
                    slot_pattern,
                    slot,
                    &spec,
                    scope,
                )?;
            } else {
                self.analyze_single(&mut plan, &mut late_alpha, slot_pattern, slot, &spec, scope)?;
            }
        }
        plan.alpha_tests.extend(late_alpha);
        self.complexity += plan.alpha_tests.len() as u32;
        Ok(plan)
    }

    fn analyze_single(
        &mut self,
        plan: &mut PatternPlan,
        late_alpha: &mut Vec<AlphaTest>,
        slot_pattern: &SlotPattern,
        slot: SlotId,
        spec: &SlotSpec,
        scope: usize,
    ) -> AnalysisResult<()> {
        if slot_pattern.fields.len() != 1 {
            return Err(AnalysisError::SlotCardinality {
                slot: slot_pattern.slot.clone(),
            });
        }
        let field = &slot_pattern.fields[0];
        let desc = FetchDesc {
            pattern: plan.position,
            slot,
            which: FieldRef::Slot,
        };
        match &field.binding {
            FieldBinding::Literal(lit) => {
                let atom = self.literal_atom(lit);
                if spec.constraint.check(self.atoms, &Value::Atom(atom))
                    != cascara_data::ConstraintCheck::Ok
                {
                    return Err(AnalysisError::LiteralConstraintViolation {
                        slot: slot_pattern.slot.clone(),
                    });
                }
                plan.alpha_tests.push(AlphaTest::SlotConstant { slot, atom });
            }
            FieldBinding::Var(name) => {
                self.bind_or_use(plan, late_alpha, name, desc, false, spec, scope)?;
            }
            FieldBinding::Wildcard => {}
            FieldBinding::MultiVar(_) | FieldBinding::MultiWildcard => {
                return Err(AnalysisError::SlotCardinality {
                    slot: slot_pattern.slot.clone(),
                });
            }
        }
        self.field_extras(plan, late_alpha, field, desc, spec, &slot_pattern.slot, scope)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_chain(
        &mut self,
        plan: &mut PatternPlan,
        late_alpha: &mut Vec<AlphaTest>,
        chain_count: &mut u16,
        slot_pattern: &SlotPattern,
        slot: SlotId,
        spec: &SlotSpec,
        scope: usize,
    ) -> AnalysisResult<()> {
        let chain_index = *chain_count;
        *chain_count += 1;
        let mut items = Vec::with_capacity(slot_pattern.fields.len());
        let mut extras: Vec<(FieldPattern, FetchDesc)> = Vec::new();

        for (item_index, field) in slot_pattern.fields.iter().enumerate() {
            let multi = matches!(
                field.binding,
                FieldBinding::MultiVar(_) | FieldBinding::MultiWildcard
            );
            let desc = FetchDesc {
                pattern: plan.position,
                slot,
                which: FieldRef::Item {
                    chain: chain_index,
                    item: item_index as u16,
                    multi,
                },
            };
            let mut item = if multi { ChainItem::multi() } else { ChainItem::single() };
            match &field.binding {
                FieldBinding::Literal(lit) => {
                    let atom = self.literal_atom(lit);
                    if spec.constraint.check(self.atoms, &Value::Atom(atom))
                        != cascara_data::ConstraintCheck::Ok
                    {
                        return Err(AnalysisError::LiteralConstraintViolation {
                            slot: slot_pattern.slot.clone(),
                        });
                    }
                    item.constant = Some(atom);
                }
                FieldBinding::Var(name) | FieldBinding::MultiVar(name) => {
                    self.bind_or_use(plan, late_alpha, name, desc, multi, spec, scope)?;
                }
                FieldBinding::Wildcard | FieldBinding::MultiWildcard => {}
            }
            if let Some(types) = field.types {
                if !multi {
                    if types.contains(spec.constraint.types & TypeMask::ANY_SINGLE) {
                        return Err(AnalysisError::RedundantTypeRestriction {
                            slot: slot_pattern.slot.clone(),
                        });
                    }
                    item.types = Some(types);
                }
            }
            items.push(item);
            if !field.not_values.is_empty() || !field.tests.is_empty() {
                extras.push((field.clone(), desc));
            }
        }

        let chain = FieldChain { items };
        let min = chain.min_len() as u32;
        let exact = chain.fixed_len().then(|| chain.items.len() as u32);
        if min > 0 || exact.is_some() {
            plan.alpha_tests.push(AlphaTest::Length { slot, min, exact });
        }
        plan.alpha_tests.push(AlphaTest::Chain { slot, chain });

        for (field, desc) in extras {
            self.field_extras(plan, late_alpha, &field, desc, spec, &slot_pattern.slot, scope)?;
        }
        Ok(())
    }

    /// Exclusions and predicate tests shared by single fields and chain
    /// items.
    #[allow(clippy::too_many_arguments)]
    fn field_extras(
        &mut self,
        plan: &mut PatternPlan,
        late_alpha: &mut Vec<AlphaTest>,
        field: &FieldPattern,
        desc: FetchDesc,
        spec: &SlotSpec,
        slot_name: &str,
        scope: usize,
    ) -> AnalysisResult<()> {
        if matches!(desc.which, FieldRef::Slot) {
            if let Some(types) = field.types {
                if types.contains(spec.constraint.types & TypeMask::ANY_SINGLE) {
                    return Err(AnalysisError::RedundantTypeRestriction {
                        slot: slot_name.to_string(),
                    });
                }
                plan.alpha_tests.push(AlphaTest::SlotType {
                    slot: desc.slot,
                    types,
                });
            }
        }
        for lit in &field.not_values {
            let atom = self.literal_atom(lit);
            late_alpha.push(AlphaTest::Predicate(Expr::Cmp(
                CmpOp::Neq,
                Box::new(Expr::Fetch(to_self(desc))),
                Box::new(Expr::Const(Value::Atom(atom))),
            )));
        }
        let position = plan.position;
        for test in &field.tests {
            self.place_expr(plan, late_alpha, test, scope, position)?;
        }
        Ok(())
    }

    /// Binding occurrence or use site for a named variable.
    #[allow(clippy::too_many_arguments)]
    fn bind_or_use(
        &mut self,
        plan: &mut PatternPlan,
        late_alpha: &mut Vec<AlphaTest>,
        name: &str,
        desc: FetchDesc,
        multi: bool,
        spec: &SlotSpec,
        scope: usize,
    ) -> AnalysisResult<()> {
        if let Some(info) = self.vars.get(name).cloned() {
            if !self.scope_visible(info.scope, scope) {
                return Err(AnalysisError::CrossScopeVariable(name.to_string()));
            }
            if info.multi != multi {
                return Err(AnalysisError::MixedCardinality(name.to_string()));
            }
            if !info.is_address {
                let narrowed = info.constraint.intersect(&spec.constraint);
                if narrowed.is_unmatchable() {
                    return Err(AnalysisError::UnmatchableConstraint {
                        variable: name.to_string(),
                    });
                }
                self.vars.get_mut(name).expect("var exists").constraint = narrowed;
            }
            if info.desc.pattern == desc.pattern {
                // Slot-local consistency stays in the alpha network.
                late_alpha.push(AlphaTest::Predicate(Expr::Cmp(
                    CmpOp::Eq,
                    Box::new(Expr::Fetch(to_self(info.desc))),
                    Box::new(Expr::Fetch(to_self(desc))),
                )));
            } else {
                match self.route(info.scope, scope) {
                    None => plan.keys.push((info.desc, desc)),
                    Some(group_scope) => self
                        .routed
                        .entry(group_scope)
                        .or_default()
                        .keys
                        .push((info.desc, desc)),
                }
            }
        } else {
            self.vars.insert(
                name.to_string(),
                VarInfo {
                    multi,
                    desc,
                    scope,
                    constraint: spec.constraint.clone(),
                    is_address: false,
                },
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Rewrites a pattern expression to fetches, reporting the binding
    /// scopes and pattern positions it references.
    fn rewrite_expr(
        &mut self,
        expr: &PatternExpr,
        refs: &mut Vec<(String, VarInfo)>,
        use_scope: usize,
    ) -> AnalysisResult<Expr> {
        Ok(match expr {
            PatternExpr::Lit(lit) => {
                let atom = self.literal_atom(lit);
                Expr::Const(Value::Atom(atom))
            }
            PatternExpr::Var(name) => {
                let info = self
                    .vars
                    .get(name)
                    .cloned()
                    .ok_or_else(|| AnalysisError::UnboundVariable(name.clone()))?;
                if !self.scope_visible(info.scope, use_scope) {
                    return Err(AnalysisError::CrossScopeVariable(name.clone()));
                }
                let desc = info.desc;
                refs.push((name.clone(), info));
                Expr::Fetch(desc)
            }
            PatternExpr::Global(name) => {
                let atom = self.atoms.intern_symbol(name);
                Expr::Global(atom)
            }
            PatternExpr::Not(inner) => {
                Expr::Not(Box::new(self.rewrite_expr(inner, refs, use_scope)?))
            }
            PatternExpr::And(items) => Expr::And(
                items
                    .iter()
                    .map(|e| self.rewrite_expr(e, refs, use_scope))
                    .collect::<AnalysisResult<_>>()?,
            ),
            PatternExpr::Or(items) => Expr::Or(
                items
                    .iter()
                    .map(|e| self.rewrite_expr(e, refs, use_scope))
                    .collect::<AnalysisResult<_>>()?,
            ),
            PatternExpr::Cmp(op, a, b) => Expr::Cmp(
                *op,
                Box::new(self.rewrite_expr(a, refs, use_scope)?),
                Box::new(self.rewrite_expr(b, refs, use_scope)?),
            ),
            PatternExpr::Arith(op, a, b) => Expr::Arith(
                *op,
                Box::new(self.rewrite_expr(a, refs, use_scope)?),
                Box::new(self.rewrite_expr(b, refs, use_scope)?),
            ),
            PatternExpr::Length(inner) => {
                Expr::Length(Box::new(self.rewrite_expr(inner, refs, use_scope)?))
            }
            PatternExpr::Call { name, args } => Expr::Call {
                name: self.atoms.intern_symbol(name),
                args: args
                    .iter()
                    .map(|e| self.rewrite_expr(e, refs, use_scope))
                    .collect::<AnalysisResult<_>>()?,
            },
        })
    }

    /// Places a predicate: pattern-local expressions become alpha tests
    /// (self-pattern fetches); anything touching earlier patterns
    /// becomes a join residual, routed outward across group boundaries
    /// as needed.
    fn place_expr(
        &mut self,
        plan: &mut PatternPlan,
        late_alpha: &mut Vec<AlphaTest>,
        expr: &PatternExpr,
        scope: usize,
        position: u16,
    ) -> AnalysisResult<()> {
        let mut refs = Vec::new();
        let rewritten = self.rewrite_expr(expr, &mut refs, scope)?;
        self.complexity += 1;
        if refs.iter().all(|(_, info)| info.desc.pattern == position) {
            late_alpha.push(AlphaTest::Predicate(map_to_self(rewritten)));
            return Ok(());
        }
        // Route by the shallowest binder referenced.
        let mut destination = None;
        for (_, info) in &refs {
            if info.desc.pattern == position {
                continue;
            }
            match self.route(info.scope, scope) {
                None => {}
                Some(group_scope) => {
                    // The shallowest binder wins; its route encloses the
                    // routes of deeper binders.
                    destination = Some(match destination {
                        None => group_scope,
                        Some(existing) => self.outermost(existing, group_scope),
                    });
                }
            }
        }
        match destination {
            None => plan.residuals.push(JoinCond::Expr(rewritten)),
            Some(group_scope) => self
                .routed
                .entry(group_scope)
                .or_default()
                .residuals
                .push(JoinCond::Expr(rewritten)),
        }
        Ok(())
    }

    /// Of two scopes on one ancestor chain, the one closer to the root.
    fn outermost(&self, a: usize, b: usize) -> usize {
        if self.scope_visible(a, b) {
            a
        } else {
            b
        }
    }

    // ------------------------------------------------------------------
    // Walking conditional elements
    // ------------------------------------------------------------------

    fn walk(
        &mut self,
        ces: &[CondElem],
        scope: usize,
        nodes: &mut Vec<UnitNode>,
    ) -> AnalysisResult<()> {
        for ce in ces {
            match ce {
                CondElem::Pattern(p) => {
                    let plan = self.analyze_pattern(p, scope)?;
                    nodes.push(UnitNode::Pattern(plan));
                }
                CondElem::And(inner) => self.walk(inner, scope, nodes)?,
                CondElem::Test(expr) => self.attach_test(expr, scope, nodes)?,
                CondElem::Not(inner) => {
                    let group = self.analyze_group(inner, scope, GroupKind::Negated)?;
                    nodes.push(UnitNode::Group(group));
                }
                CondElem::Exists(inner) => {
                    let group = self.analyze_group(inner, scope, GroupKind::Exists)?;
                    nodes.push(UnitNode::Group(group));
                }
                CondElem::Logical(_) => {
                    // Logical placement is validated by the top-level
                    // driver; nested logical is flattened there.
                    return Err(AnalysisError::LogicalOutOfOrder);
                }
                CondElem::Or(_) => unreachable!("or is expanded before analysis"),
            }
        }
        Ok(())
    }

    fn attach_test(
        &mut self,
        expr: &PatternExpr,
        scope: usize,
        nodes: &mut Vec<UnitNode>,
    ) -> AnalysisResult<()> {
        let has_pattern = nodes
            .iter()
            .any(|n| matches!(n, UnitNode::Pattern(_)));
        if !has_pattern {
            // A test CE needs a preceding pattern to hang its join on.
            return Err(AnalysisError::EmptyLhs);
        }
        let mut refs = Vec::new();
        let rewritten = self.rewrite_expr(expr, &mut refs, scope)?;
        self.complexity += 1;
        let plan = nodes
            .iter_mut()
            .rev()
            .find_map(|n| match n {
                UnitNode::Pattern(p) => Some(p),
                UnitNode::Group(_) => None,
            })
            .expect("a pattern exists");
        plan.residuals.push(JoinCond::Expr(rewritten));
        Ok(())
    }

    fn analyze_group(
        &mut self,
        ces: &[CondElem],
        parent_scope: usize,
        kind: GroupKind,
    ) -> AnalysisResult<GroupPlan> {
        let scope = self.push_scope(parent_scope);
        let first_position = self.position;
        let mut content = Vec::new();
        self.walk(ces, scope, &mut content)?;
        if content.is_empty() {
            return Err(AnalysisError::EmptyLhs);
        }
        let last_position = content
            .iter()
            .map(|n| n.last_position())
            .max()
            .expect("group is non-empty");
        let routed = self.routed.remove(&scope).unwrap_or_default();
        Ok(GroupPlan {
            kind,
            content,
            first_position,
            last_position,
            outer_keys: routed.keys,
            outer_residuals: routed.residuals,
        })
    }

    // ------------------------------------------------------------------
    // RHS
    // ------------------------------------------------------------------

    fn compile_actions(
        &mut self,
        rhs: &[RhsAction],
    ) -> AnalysisResult<(Vec<Action>, u16)> {
        let mut locals: FxHashMap<String, u16> = FxHashMap::default();
        let mut actions = Vec::with_capacity(rhs.len());
        for action in rhs {
            actions.push(self.compile_action(action, &mut locals)?);
        }
        Ok((actions, locals.len() as u16))
    }

    fn compile_action(
        &mut self,
        action: &RhsAction,
        locals: &mut FxHashMap<String, u16>,
    ) -> AnalysisResult<Action> {
        match action {
            RhsAction::Assert { template, slots } => {
                let template = self.find_template(template)?;
                let mut compiled = Vec::with_capacity(slots.len());
                for (slot_name, exprs) in slots {
                    let slot = self.rhs_slot(template, slot_name)?;
                    compiled.push(ActionSlot {
                        slot,
                        values: exprs
                            .iter()
                            .map(|e| self.rhs_expr(e, locals))
                            .collect::<AnalysisResult<_>>()?,
                    });
                }
                Ok(Action::Assert {
                    template,
                    slots: compiled,
                })
            }
            RhsAction::Retract(target) => Ok(Action::Retract(self.rhs_expr(target, locals)?)),
            RhsAction::Modify { target, sets } => {
                let (target_expr, template) = self.modify_target(target)?;
                let sets = self.rhs_sets(template, sets, locals)?;
                Ok(Action::Modify {
                    target: target_expr,
                    template,
                    sets,
                })
            }
            RhsAction::Duplicate { target, sets } => {
                let (target_expr, template) = self.modify_target(target)?;
                let sets = self.rhs_sets(template, sets, locals)?;
                Ok(Action::Duplicate {
                    target: target_expr,
                    template,
                    sets,
                })
            }
            RhsAction::Bind { var, value } => {
                let value = self.rhs_expr(value, locals)?;
                let index = match locals.get(var) {
                    Some(&i) => i,
                    None => {
                        let i = locals.len() as u16;
                        locals.insert(var.clone(), i);
                        i
                    }
                };
                Ok(Action::Bind { index, value })
            }
            RhsAction::Halt => Ok(Action::Halt),
            RhsAction::Eval(expr) => Ok(Action::Eval(self.rhs_expr(expr, locals)?)),
        }
    }

    fn rhs_slot(&mut self, template: cascara_data::TemplateId, name: &str) -> AnalysisResult<SlotId> {
        let atom = self.atoms.intern_symbol(name);
        let spec = &self.wm.templates[template];
        spec.slot_id(atom).ok_or_else(|| AnalysisError::NoSuchSlot {
            target: self.atoms.text(spec.name).unwrap_or_default().to_string(),
            slot: name.to_string(),
        })
    }

    fn rhs_sets(
        &mut self,
        template: cascara_data::TemplateId,
        sets: &[(String, Vec<PatternExpr>)],
        locals: &mut FxHashMap<String, u16>,
    ) -> AnalysisResult<Vec<ActionSlot>> {
        sets.iter()
            .map(|(slot_name, exprs)| {
                let slot = self.rhs_slot(template, slot_name)?;
                Ok(ActionSlot {
                    slot,
                    values: exprs
                        .iter()
                        .map(|e| self.rhs_expr(e, locals))
                        .collect::<AnalysisResult<_>>()?,
                })
            })
            .collect()
    }

    fn modify_target(
        &mut self,
        target: &PatternExpr,
    ) -> AnalysisResult<(Expr, cascara_data::TemplateId)> {
        if let PatternExpr::Var(name) = target {
            if let Some(info) = self.vars.get(name).cloned() {
                if info.is_address && info.scope == 0 {
                    if let PatternTarget::Template(t) = self.targets[info.desc.pattern as usize] {
                        return Ok((Expr::Fetch(info.desc), t));
                    }
                }
            }
        }
        Err(AnalysisError::BadModifyTarget)
    }

    /// RHS expressions: locals shadow LHS bindings; everything must be
    /// visible at top scope.
    fn rhs_expr(
        &mut self,
        expr: &PatternExpr,
        locals: &FxHashMap<String, u16>,
    ) -> AnalysisResult<Expr> {
        Ok(match expr {
            PatternExpr::Var(name) => {
                if let Some(&index) = locals.get(name) {
                    Expr::Local(index)
                } else {
                    let info = self
                        .vars
                        .get(name)
                        .cloned()
                        .ok_or_else(|| AnalysisError::UnboundVariable(name.clone()))?;
                    if info.scope != 0 {
                        return Err(AnalysisError::CrossScopeVariable(name.clone()));
                    }
                    Expr::Fetch(info.desc)
                }
            }
            PatternExpr::Lit(lit) => {
                let atom = self.literal_atom(lit);
                Expr::Const(Value::Atom(atom))
            }
            PatternExpr::Global(name) => Expr::Global(self.atoms.intern_symbol(name)),
            PatternExpr::Not(inner) => Expr::Not(Box::new(self.rhs_expr(inner, locals)?)),
            PatternExpr::And(items) => Expr::And(
                items
                    .iter()
                    .map(|e| self.rhs_expr(e, locals))
                    .collect::<AnalysisResult<_>>()?,
            ),
            PatternExpr::Or(items) => Expr::Or(
                items
                    .iter()
                    .map(|e| self.rhs_expr(e, locals))
                    .collect::<AnalysisResult<_>>()?,
            ),
            PatternExpr::Cmp(op, a, b) => Expr::Cmp(
                *op,
                Box::new(self.rhs_expr(a, locals)?),
                Box::new(self.rhs_expr(b, locals)?),
            ),
            PatternExpr::Arith(op, a, b) => Expr::Arith(
                *op,
                Box::new(self.rhs_expr(a, locals)?),
                Box::new(self.rhs_expr(b, locals)?),
            ),
            PatternExpr::Length(inner) => Expr::Length(Box::new(self.rhs_expr(inner, locals)?)),
            PatternExpr::Call { name, args } => Expr::Call {
                name: self.atoms.intern_symbol(name),
                args: args
                    .iter()
                    .map(|e| self.rhs_expr(e, locals))
                    .collect::<AnalysisResult<_>>()?,
            },
        })
    }
}

fn to_self(desc: FetchDesc) -> FetchDesc {
    FetchDesc {
        pattern: SELF_PATTERN,
        ..desc
    }
}

/// Rewrites every fetch in a pattern-local expression to the
/// self-pattern convention so shared alpha nodes compare equal across
/// rules.
fn map_to_self(expr: Expr) -> Expr {
    match expr {
        Expr::Fetch(desc) => Expr::Fetch(to_self(desc)),
        Expr::Not(inner) => Expr::Not(Box::new(map_to_self(*inner))),
        Expr::Length(inner) => Expr::Length(Box::new(map_to_self(*inner))),
        Expr::And(items) => Expr::And(items.into_iter().map(map_to_self).collect()),
        Expr::Or(items) => Expr::Or(items.into_iter().map(map_to_self).collect()),
        Expr::Cmp(op, a, b) => Expr::Cmp(op, Box::new(map_to_self(*a)), Box::new(map_to_self(*b))),
        Expr::Arith(op, a, b) => {
            Expr::Arith(op, Box::new(map_to_self(*a)), Box::new(map_to_self(*b)))
        }
        Expr::Call { name, args } => Expr::Call {
            name,
            args: args.into_iter().map(map_to_self).collect(),
        },
        other => other,
    }
}

/// Analyzes a rule definition into per-disjunct plans.
pub(crate) fn analyze(
    atoms: &mut AtomTable,
    wm: &WorkingMemory,
    search: &[ModuleId],
    def: &RuleDef,
) -> AnalysisResult<RulePlan> {
    let disjunct_sources = expand_or(&def.lhs)?;
    let name = atoms.intern_symbol(&def.name);

    let mut disjuncts = Vec::with_capacity(disjunct_sources.len());
    for source in &disjunct_sources {
        let mut analyzer = Analyzer::new(atoms, wm, search);
        let mut nodes = Vec::new();

        // Logical groups must lead; their contents are ordinary CEs
        // marked only by the boundary depth.
        let mut logical_depth: Option<u16> = None;
        let mut seen_non_logical = false;
        for ce in source {
            match ce {
                CondElem::Logical(inner) => {
                    if seen_non_logical {
                        return Err(AnalysisError::LogicalOutOfOrder);
                    }
                    analyzer.walk(inner, 0, &mut nodes)?;
                    let last = nodes
                        .iter()
                        .map(|n| n.last_position())
                        .max()
                        .ok_or(AnalysisError::EmptyLhs)?;
                    logical_depth = Some(last + 1);
                }
                other => {
                    seen_non_logical = true;
                    analyzer.walk(std::slice::from_ref(other), 0, &mut nodes)?;
                }
            }
        }
        if analyzer.position == 0 {
            return Err(AnalysisError::EmptyLhs);
        }
        let (actions, local_count) = analyzer.compile_actions(&def.rhs)?;
        disjuncts.push(DisjunctPlan {
            nodes,
            logical_depth,
            actions,
            local_count,
            complexity: analyzer.complexity,
        });
    }

    let dynamic_salience = match &def.dynamic_salience {
        Some(expr) => {
            let mut analyzer = Analyzer::new(atoms, wm, search);
            Some(analyzer.rhs_expr(expr, &FxHashMap::default())?)
        }
        None => None,
    };

    Ok(RulePlan {
        name,
        salience: def.salience,
        dynamic_salience,
        auto_focus: def.auto_focus,
        disjuncts,
    })
}
