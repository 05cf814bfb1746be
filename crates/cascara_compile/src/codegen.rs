//! Network codegen: attaching analyzed rules to the match network.
//!
//! Codegen walks a disjunct's unit nodes left to right, attaching (or
//! reusing) the alpha path for each pattern and chaining one join per
//! unit. Groups recurse: a multi-pattern not/exists builds its own
//! subchain and joins it from the right. Everything that can fail
//! failed during analysis; this stage only builds.
//!
//! Atom bookkeeping: every atom a rule's compiled form references is
//! installed once per rule and recorded on the rule, so removal can
//! release exactly what installation claimed — shared network nodes
//! keep their constants alive through the other rules still using them.

use crate::analysis::{self, DisjunctPlan, GroupKind, GroupPlan, RulePlan, UnitNode};
use crate::ast::RuleDef;
use crate::error::{AnalysisError, AnalysisResult};
use cascara_base::{AtomId, AtomTable};
use cascara_data::{ExternalDispatch, ModuleId, WorkingMemory};
use cascara_kernel::{
    Action, AlphaTest, CompiledRule, Disjunct, JoinCond, JoinId, JoinSpec, Network, RightInput,
    RuleId,
};

/// Analyzes and installs a rule. On any analysis error the engine is
/// left unchanged.
pub fn install_rule(
    atoms: &mut AtomTable,
    wm: &WorkingMemory,
    net: &mut Network,
    externals: &mut dyn ExternalDispatch,
    module: ModuleId,
    search: &[ModuleId],
    def: &RuleDef,
) -> AnalysisResult<RuleId> {
    let name = atoms.intern_symbol(&def.name);
    if net.rule_id(module, name).is_some() {
        return Err(AnalysisError::DuplicateRuleName(def.name.clone()));
    }
    let plan = analysis::analyze(atoms, wm, search, def)?;

    let mut installed_atoms = vec![plan.name];
    collect_plan_atoms(&plan, &mut installed_atoms);
    for &atom in &installed_atoms {
        atoms.install(atom);
    }

    let rule = net.insert_rule(CompiledRule {
        name: plan.name,
        module,
        salience: plan.salience,
        dynamic_salience: plan.dynamic_salience.clone(),
        auto_focus: plan.auto_focus,
        disjuncts: Vec::new(),
        installed_atoms,
    });

    let mut disjuncts = Vec::with_capacity(plan.disjuncts.len());
    for (index, dplan) in plan.disjuncts.iter().enumerate() {
        disjuncts.push(build_disjunct(
            atoms,
            wm,
            net,
            externals,
            dplan,
            rule,
            index as u16,
        ));
    }
    net.rules[rule].disjuncts = disjuncts;
    Ok(rule)
}

/// Removes a rule, detaching its joins and releasing its atoms.
pub fn remove_rule(atoms: &mut AtomTable, net: &mut Network, rule: RuleId) -> bool {
    match net.remove_rule(rule) {
        Some(removed) => {
            for atom in &removed.installed_atoms {
                atoms.deinstall(*atom);
            }
            true
        }
        None => false,
    }
}

fn build_disjunct(
    atoms: &mut AtomTable,
    wm: &WorkingMemory,
    net: &mut Network,
    externals: &mut dyn ExternalDispatch,
    dplan: &DisjunctPlan,
    rule: RuleId,
    disjunct: u16,
) -> Disjunct {
    let mut logical_join = None;
    let terminal = build_nodes(
        atoms,
        wm,
        net,
        externals,
        &dplan.nodes,
        None,
        rule,
        disjunct,
        true,
        dplan.logical_depth,
        &mut logical_join,
    );
    Disjunct {
        terminal,
        logical_join,
        actions: dplan.actions.clone(),
        local_count: dplan.local_count,
        complexity: dplan.complexity,
    }
}

#[allow(clippy::too_many_arguments)]
fn build_nodes(
    atoms: &mut AtomTable,
    wm: &WorkingMemory,
    net: &mut Network,
    externals: &mut dyn ExternalDispatch,
    nodes: &[UnitNode],
    mut parent: Option<JoinId>,
    rule: RuleId,
    disjunct: u16,
    terminal_for_last: bool,
    logical_depth: Option<u16>,
    logical_join: &mut Option<JoinId>,
) -> JoinId {
    let mut last = None;
    for (index, node) in nodes.iter().enumerate() {
        let is_last = index == nodes.len() - 1;
        let terminal = (is_last && terminal_for_last).then_some((rule, disjunct));
        let join = match node {
            UnitNode::Pattern(p) => {
                let mem = net.attach_pattern(atoms, wm, externals, p.target, &p.alpha_tests);
                let depth = p.position + 1;
                let spec = JoinSpec {
                    parent,
                    right: RightInput::Alpha(mem),
                    depth,
                    right_pattern: p.position,
                    left_key: p.keys.iter().map(|k| k.0).collect(),
                    right_key: p.keys.iter().map(|k| k.1).collect(),
                    tests: p.residuals.clone(),
                    negated: false,
                    exists: false,
                    from_right: false,
                    has_logical: logical_depth == Some(depth),
                };
                net.attach_join(atoms, wm, externals, spec, terminal)
            }
            UnitNode::Group(g) => {
                build_group(
                    atoms, wm, net, externals, g, parent, rule, disjunct, terminal,
                    logical_depth,
                )
            }
        };
        if logical_depth == Some(net.joins[join].depth) {
            *logical_join = Some(join);
        }
        parent = Some(join);
        last = Some(join);
    }
    last.expect("a disjunct has at least one unit")
}

#[allow(clippy::too_many_arguments)]
fn build_group(
    atoms: &mut AtomTable,
    wm: &WorkingMemory,
    net: &mut Network,
    externals: &mut dyn ExternalDispatch,
    group: &GroupPlan,
    parent: Option<JoinId>,
    rule: RuleId,
    disjunct: u16,
    terminal: Option<(RuleId, u16)>,
    logical_depth: Option<u16>,
) -> JoinId {
    let negated = group.kind == GroupKind::Negated;
    let exists = group.kind == GroupKind::Exists;
    let depth = group.last_position + 1;

    // A single negated/exists pattern joins its alpha memory directly;
    // a deeper group builds a subchain and joins it from the right.
    if let [UnitNode::Pattern(p)] = group.content.as_slice() {
        let mem = net.attach_pattern(atoms, wm, externals, p.target, &p.alpha_tests);
        let mut left_key: Vec<_> = p.keys.iter().map(|k| k.0).collect();
        let mut right_key: Vec<_> = p.keys.iter().map(|k| k.1).collect();
        left_key.extend(group.outer_keys.iter().map(|k| k.0));
        right_key.extend(group.outer_keys.iter().map(|k| k.1));
        let mut tests = p.residuals.clone();
        tests.extend(group.outer_residuals.iter().cloned());
        let spec = JoinSpec {
            parent,
            right: RightInput::Alpha(mem),
            depth,
            right_pattern: p.position,
            left_key,
            right_key,
            tests,
            negated,
            exists,
            from_right: false,
            has_logical: logical_depth == Some(depth),
        };
        return net.attach_join(atoms, wm, externals, spec, terminal);
    }

    let mut sub_logical = None;
    let sub_terminal = build_nodes(
        atoms,
        wm,
        net,
        externals,
        &group.content,
        None,
        rule,
        disjunct,
        false,
        None,
        &mut sub_logical,
    );
    let spec = JoinSpec {
        parent,
        right: RightInput::Join(sub_terminal),
        depth,
        right_pattern: group.first_position,
        left_key: group.outer_keys.iter().map(|k| k.0).collect(),
        right_key: group.outer_keys.iter().map(|k| k.1).collect(),
        tests: group.outer_residuals.clone(),
        negated,
        exists,
        from_right: true,
        has_logical: logical_depth == Some(depth),
    };
    net.attach_join(atoms, wm, externals, spec, terminal)
}

// ----------------------------------------------------------------------
// Atom bookkeeping
// ----------------------------------------------------------------------

fn collect_plan_atoms(plan: &RulePlan, out: &mut Vec<AtomId>) {
    if let Some(expr) = &plan.dynamic_salience {
        expr.each_atom(&mut |a| out.push(a));
    }
    for dplan in &plan.disjuncts {
        collect_nodes(&dplan.nodes, out);
        for action in &dplan.actions {
            collect_action_atoms(action, out);
        }
    }
}

fn collect_nodes(nodes: &[UnitNode], out: &mut Vec<AtomId>) {
    for node in nodes {
        match node {
            UnitNode::Pattern(p) => {
                collect_alpha_atoms(&p.alpha_tests, out);
                collect_cond_atoms(&p.residuals, out);
            }
            UnitNode::Group(g) => {
                collect_nodes(&g.content, out);
                collect_cond_atoms(&g.outer_residuals, out);
            }
        }
    }
}

fn collect_alpha_atoms(tests: &[AlphaTest], out: &mut Vec<AtomId>) {
    for test in tests {
        match test {
            AlphaTest::SlotConstant { atom, .. } => out.push(*atom),
            AlphaTest::Chain { chain, .. } => {
                for item in &chain.items {
                    if let Some(atom) = item.constant {
                        out.push(atom);
                    }
                }
            }
            AlphaTest::Predicate(expr) => expr.each_atom(&mut |a| out.push(a)),
            AlphaTest::Root(_) | AlphaTest::SlotType { .. } | AlphaTest::Length { .. } => {}
        }
    }
}

fn collect_cond_atoms(conds: &[JoinCond], out: &mut Vec<AtomId>) {
    for cond in conds {
        if let JoinCond::Expr(expr) = cond {
            expr.each_atom(&mut |a| out.push(a));
        }
    }
}

fn collect_action_atoms(action: &Action, out: &mut Vec<AtomId>) {
    match action {
        Action::Assert { slots, .. } => {
            for slot in slots {
                for expr in &slot.values {
                    expr.each_atom(&mut |a| out.push(a));
                }
            }
        }
        Action::Retract(expr) | Action::Bind { value: expr, .. } | Action::Eval(expr) => {
            expr.each_atom(&mut |a| out.push(a));
        }
        Action::Modify { target, sets, .. } | Action::Duplicate { target, sets, .. } => {
            target.each_atom(&mut |a| out.push(a));
            for slot in sets {
                for expr in &slot.values {
                    expr.each_atom(&mut |a| out.push(a));
                }
            }
        }
        Action::Halt => {}
    }
}
